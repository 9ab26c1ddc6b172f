//! TikTok accounts, scraped from the embedded SIGI_STATE JSON.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::LazyLock;

use chrono::DateTime;
use scraper::{Html, Selector};
use serde::Deserialize;

use crate::domain::{Post, Search};
use crate::error::{Error, Result};
use crate::feed::{Feed, FetchContext, Static};

static ACCOUNT_DATA_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("script#SIGI_STATE").expect("account data selector"));

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct AccountData {
    sharing_meta: SharingMeta,
    item_list: ItemList,
    item_module: HashMap<String, ItemData>,
    user_page: UserPage,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SharingMeta {
    value: SharingMetaValue,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SharingMetaValue {
    #[serde(rename = "og:description")]
    description: String,
    #[serde(rename = "og:image")]
    image: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ItemList {
    #[serde(rename = "user-post")]
    user_post: UserPost,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UserPost {
    list: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ItemData {
    #[serde(rename = "desc")]
    description: String,
    create_time: String,
    video: Video,
    author: String,
    music: Music,
    stats: Stats,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Video {
    width: u32,
    height: u32,
    cover: String,
    play_addr: String,
    subtitle_infos: Vec<SubtitleInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct SubtitleInfo {
    #[serde(rename = "LanguageID")]
    language_id: String,
    language_code_name: String,
    #[serde(rename = "Url")]
    url: String,
    source: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Music {
    title: String,
    play_url: String,
    author_name: String,
    album: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Stats {
    digg_count: u64,
    share_count: u64,
    comment_count: u64,
    play_count: u64,
}

/// Open the feed of `account@tiktok` or a `www.tiktok.com` profile URL.
pub async fn open(ctx: FetchContext, name: String, _search: Search) -> Result<Box<dyn Feed>> {
    let mut page_url = name.clone();
    if !name.contains("https://") {
        if let Some(idx) = name.find('@') {
            page_url = format!("https://www.tiktok.com/@{}", &name[..idx]);
        }
    }

    let resp = ctx
        .get(&page_url)
        .header("Accept", "*/*")
        .header("Referer", "https://www.tiktok.com/")
        .send()
        .await?;
    let status = resp.status();
    if status != reqwest::StatusCode::OK {
        return Err(Error::Status(status.as_u16()));
    }
    let body = resp.text().await?;

    let account_json = {
        let document = Html::parse_document(&body);
        let mut scripts = document.select(&ACCOUNT_DATA_SELECTOR);
        let script = scripts
            .next()
            .ok_or_else(|| Error::FeedParse("could not find account data".into()))?;
        if scripts.next().is_some() {
            return Err(Error::FeedParse("could not find account data".into()));
        }
        script.text().collect::<String>()
    };

    let account: AccountData = serde_json::from_str(&account_json)
        .map_err(|err| Error::FeedParse(format!("parse account data: {err}")))?;

    let name = if account.user_page.unique_id.is_empty() {
        name
    } else {
        format!("{}@tiktok", account.user_page.unique_id)
    };

    let posts = account
        .item_list
        .user_post
        .list
        .iter()
        .map(|id| item_to_post(id, &account))
        .collect::<Result<Vec<Post>>>()?;

    let mut feed = Static::new(name.clone(), posts);
    feed.feed_url = name;
    feed.feed_description = account.sharing_meta.value.description.clone();
    Ok(Box::new(feed))
}

fn item_to_post(id: &str, account: &AccountData) -> Result<Post> {
    let item = account
        .item_module
        .get(id)
        .ok_or_else(|| Error::FeedParse(format!("missing post details for post {id:?}")))?;

    let seconds: i64 = item
        .create_time
        .parse()
        .map_err(|err| Error::FeedParse(format!("invalid timestamp {:?}: {err}", item.create_time)))?;
    let date = DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| Error::FeedParse(format!("invalid timestamp {:?}", item.create_time)))?;

    let mut html = String::new();
    let _ = write!(
        html,
        r#"<video preload="none" controls muted loading="lazy" poster="{}" src="{}" width="{}" height="{}">"#,
        item.video.cover, item.video.play_addr, item.video.width, item.video.height
    );
    let mut subtitles = item.video.subtitle_infos.iter().collect::<Vec<_>>();
    subtitles.sort_by(|a, b| a.language_id.cmp(&b.language_id));
    for subtitle in subtitles {
        let mut label = subtitle.language_code_name.clone();
        if subtitle.source == "MT" {
            label.push_str(" 🤖");
        } else {
            let _ = write!(label, " ({})", subtitle.source);
        }

        // subtitle tracks must be same-origin, route them through /proxy
        let src = format!("/proxy?url={}", subtitle.url);
        if subtitle.language_code_name == "eng-US" {
            let _ = write!(
                html,
                r#"	<track default kind="captions" srclang="en" label="{label}" src="{src}" />"#
            );
        } else {
            let _ = write!(html, r#"	<track kind="captions" label="{label}" src="{src}" />"#);
        }
        html.push('\n');
    }
    html.push_str("</video>\n");

    let _ = write!(html, "<p>{}</p>", item.description);

    if !item.music.play_url.is_empty() {
        let _ = write!(
            html,
            "<p>Music: {} from {} by {}: ",
            item.music.title, item.music.album, item.music.author_name
        );
        let _ = write!(
            html,
            r#"<br /><audio preload="none" controls loading="lazy" src="{}"></audio>"#,
            item.music.play_url
        );
        html.push_str("</p>");
    }

    let _ = write!(
        html,
        "<p>{} ❤, {} 📮, {} 💬, {} 🎶",
        item.stats.digg_count, item.stats.share_count, item.stats.comment_count, item.stats.play_count
    );
    html.push('\n');

    let tags: Vec<String> = item
        .description
        .split_whitespace()
        .filter(|word| word.len() > 2 && word.starts_with('#'))
        .map(|word| word[1..].to_string())
        .collect();

    Ok(Post {
        source: "tiktok".to_string(),
        id: id.to_string(),
        url: format!("https://www.tiktok.com/@{}/video/{id}", item.author),
        title: String::new(),
        author: format!("{}@tiktok", item.author),
        avatar_url: account.sharing_meta.value.image.clone(),
        description_html: html,
        tags,
        date_string: date.to_rfc3339(),
        date,
        ..Post::default()
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct UserPage {
    unique_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountData {
        let json = r#"{
            "SharingMeta": {"value": {"og:description": "some creator", "og:image": "https://p16.example/avatar.jpg"}},
            "ItemList": {"user-post": {"list": ["7100000000000000001"]}},
            "ItemModule": {
                "7100000000000000001": {
                    "id": "7100000000000000001",
                    "desc": "dance video #dance #fun #a",
                    "createTime": "1700000000",
                    "video": {
                        "width": 576, "height": 1024,
                        "cover": "https://p16.example/cover.jpg",
                        "playAddr": "https://v16.example/video.mp4",
                        "subtitleInfos": [
                            {"LanguageID": "2", "LanguageCodeName": "deu-DE", "Url": "https://v16.example/deu.vtt", "Format": "webvtt", "Source": "MT"},
                            {"LanguageID": "1", "LanguageCodeName": "eng-US", "Url": "https://v16.example/eng.vtt", "Format": "webvtt", "Source": "ASR"}
                        ]
                    },
                    "author": "someone",
                    "music": {"title": "original sound", "playUrl": "https://sf16.example/music.mp3", "authorName": "someone", "album": ""},
                    "stats": {"diggCount": 12, "shareCount": 3, "commentCount": 4, "playCount": 567}
                }
            },
            "UserPage": {"uniqueId": "someone"}
        }"#;
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_item_becomes_video_post() {
        let account = account();
        let post = item_to_post("7100000000000000001", &account).unwrap();

        assert_eq!(post.source, "tiktok");
        assert_eq!(post.author, "someone@tiktok");
        assert_eq!(
            post.url,
            "https://www.tiktok.com/@someone/video/7100000000000000001"
        );
        assert_eq!(post.avatar_url, "https://p16.example/avatar.jpg");
        assert_eq!(post.date, DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        assert!(post.description_html.contains("<video"), "{}", post.description_html);
        assert!(
            post.description_html.contains("dance video"),
            "{}",
            post.description_html
        );
        assert!(
            post.description_html.contains("12 ❤"),
            "{}",
            post.description_html
        );
    }

    #[test]
    fn test_tags_come_from_description_hashtags() {
        let account = account();
        let post = item_to_post("7100000000000000001", &account).unwrap();
        // `#a` is too short to count as a tag
        assert_eq!(post.tags, vec!["dance", "fun"]);
    }

    #[test]
    fn test_subtitles_sorted_and_english_is_default() {
        let account = account();
        let post = item_to_post("7100000000000000001", &account).unwrap();

        let eng = post.description_html.find("eng-US").unwrap();
        let deu = post.description_html.find("deu-DE").unwrap();
        assert!(eng < deu, "subtitles not sorted by language id");
        assert!(post.description_html.contains("track default kind"));
        assert!(post.description_html.contains("deu-DE 🤖"));
        // tracks go through the proxy to stay same-origin
        assert!(post.description_html.contains("/proxy?url=https://v16.example/eng.vtt"));
    }

    #[test]
    fn test_missing_item_details() {
        let account = account();
        let err = item_to_post("unknown", &account).unwrap_err();
        assert!(err.to_string().contains("missing post details"), "{err}");
    }
}

//! YouTube channels: videos from the RSS feed plus community posts
//! scraped from the channel page, found via the site search.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::domain::{Post, Search};
use crate::error::{Error, Result};
use crate::feed::{Feed, FetchContext, Static};
use crate::sources::{account_of, fetch_text};

/// Start of the embedded JSON with search results on the results page.
const SEARCH_RESULTS_START: &str = r#"{"primaryContents":{"sectionListRenderer":{"contents":[{"itemSectionRenderer":{"contents":"#;

/// Start of the embedded JSON with community posts on the channel page.
const COMMUNITY_POSTS_START: &str = r#"{"itemSectionRenderer":{"contents":"#;

/// Open the feed of `channel@youtube` (or `channel@yt`).
pub async fn open(ctx: FetchContext, name: String, _search: Search) -> Result<Box<dyn Feed>> {
    let channel = account_of(&name).to_string();

    // search for the channel to find its id
    let search_url = format!(
        "https://www.youtube.com/results?search_query={}&sp=EgIQAg%253D%253D",
        urlencode(&channel)
    );
    let body = fetch_text(&ctx, &search_url).await?;
    let results: Vec<YoutubeChannel> = decode_embedded(&body, SEARCH_RESULTS_START)?;

    let first = results
        .iter()
        .find(|result| !result.channel_renderer.channel_id.is_empty())
        .ok_or_else(|| Error::Other(format!("no channel {channel:?} found")))?;
    let channel_id = first.channel_renderer.channel_id.clone();

    let base_url = url::Url::parse("https://www.youtube.com").expect("base url");
    let channel_url = base_url
        .join(&first.channel_renderer.navigation_endpoint.browse_endpoint.canonical_base_url)
        .map_err(|err| Error::Other(format!("invalid channel url: {err}")))?;

    let avatar_url = first
        .channel_renderer
        .thumbnail
        .thumbnails
        .last()
        .and_then(|thumbnail| base_url.join(&thumbnail.url).ok())
        .map(|url| url.to_string())
        .unwrap_or_default();

    // community posts only show up on the channel page
    let community_url = format!(
        "https://youtube.com/channel/{}/community",
        urlencode(&channel_id)
    );
    let community_body = fetch_text(&ctx, &community_url).await?;
    let mut posts = community_posts(&community_body).unwrap_or_else(|err| {
        tracing::debug!("no community posts for {channel:?}: {err}");
        Vec::new()
    });

    let feed_url = format!(
        "https://www.youtube.com/feeds/videos.xml?channel_id={}",
        urlencode(&channel_id)
    );
    let feed_body = fetch_text(&ctx, &feed_url).await?;
    let parsed = feed_rs::parser::parse(feed_body.as_bytes())
        .map_err(|err| Error::FeedParse(format!("{name}: {err}")))?;

    for entry in parsed.entries {
        // the entry description is the video page, rebuild it from the
        // media metadata: thumbnail first, then the text
        let media = entry.media.first().cloned();
        let mut post = super::rss::entry_to_post(entry, &channel, &avatar_url, "youtube");

        let mut description = String::new();
        if let Some(thumbnail) = media
            .as_ref()
            .and_then(|media| media.thumbnails.first())
        {
            description.push_str(&format!(
                r#"<p><a href="{}"><img src="{}" /></a></p>"#,
                post.url, thumbnail.image.uri
            ));
        }
        if let Some(text) = media.and_then(|media| media.description) {
            description.push_str(
                &text
                    .content
                    .replace("\n\n", "<p>")
                    .replace('\n', "<br />"),
            );
        }
        post.description_html = description;
        posts.push(post);
    }

    for post in &mut posts {
        post.source = "youtube".to_string();
        post.author = channel.clone();
        post.avatar_url = avatar_url.clone();
    }
    // community posts and videos come from different pages, restore a
    // single newest-first order
    posts.sort_by(|a, b| b.date.cmp(&a.date));

    let mut feed = Static::new(format!("{channel}@youtube"), posts);
    feed.feed_url = channel_url.to_string();
    Ok(Box::new(feed))
}

fn urlencode(s: &str) -> String {
    percent_encoding::utf8_percent_encode(s, percent_encoding::NON_ALPHANUMERIC).to_string()
}

/// Decode a JSON value embedded somewhere in an HTML page, anchored at
/// `start`. Trailing page content after the value is ignored.
fn decode_embedded<T: serde::de::DeserializeOwned>(body: &str, start: &str) -> Result<T> {
    let idx = body
        .find(start)
        .ok_or_else(|| Error::FeedParse(format!("invalid search results: {start:?} not found")))?;
    let json = &body[idx + start.len()..];

    let mut stream = serde_json::Deserializer::from_str(json).into_iter::<T>();
    match stream.next() {
        Some(Ok(value)) => Ok(value),
        Some(Err(err)) => Err(Error::FeedParse(format!("parsing search results: {err}"))),
        None => Err(Error::FeedParse("empty search results".into())),
    }
}

fn community_posts(body: &str) -> Result<Vec<Post>> {
    let results: Vec<YoutubeCommunityPost> = decode_embedded(body, COMMUNITY_POSTS_START)?;

    let mut posts = Vec::with_capacity(results.len());
    for result in results {
        let data = result.backstage_post_thread_renderer.post.backstage_post_renderer;
        if data.post_id.is_empty() {
            continue; // not a community post renderer
        }

        let date_string = data
            .published_time_text
            .runs
            .first()
            .map(|run| run.text.clone())
            .unwrap_or_default();
        let date = parse_relative_time(&date_string, Utc::now())
            .map_err(|err| Error::FeedParse(format!("invalid timestamp: {err}")))?;

        let description: String = data
            .content_text
            .runs
            .iter()
            .map(|run| run.text.as_str())
            .collect();

        posts.push(Post {
            id: data.post_id.clone(),
            url: format!("https://youtube.com/post/{}", urlencode(&data.post_id)),
            description_html: description,
            date_string,
            date,
            ..Post::default()
        });
    }

    Ok(posts)
}

/// Parse YouTube's relative timestamps, e.g. "3 days ago".
fn parse_relative_time(s: &str, now: DateTime<Utc>) -> std::result::Result<DateTime<Utc>, String> {
    let parts: Vec<&str> = s.splitn(4, ' ').collect();
    if parts.len() < 3 {
        return Err(format!("unexpected time format {s:?} ({} parts)", parts.len()));
    }

    let num: i64 = parts[0]
        .parse()
        .map_err(|err| format!("unexpected time format {s:?} (invalid number): {err}"))?;

    if parts[2] != "ago" {
        return Err(format!("unexpected time format {s:?} (\"ago\" not found)"));
    }

    let date = match parts[1] {
        "minute" | "minutes" => now - Duration::minutes(num),
        "hour" | "hours" => now - Duration::hours(num),
        "day" | "days" => now - Duration::days(num),
        "week" | "weeks" => now - Duration::days(num * 7),
        "month" | "months" => now - Duration::days(num * 30),
        "year" | "years" => now - Duration::days(num * 365),
        unit => return Err(format!("unexpected time format {s:?} (can't parse {unit:?})")),
    };

    Ok(date)
}

// The internal JSON format that YouTube uses to render channels on their
// website; only the fields we read are declared.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct YoutubeChannel {
    channel_renderer: ChannelRenderer,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ChannelRenderer {
    channel_id: String,
    navigation_endpoint: NavigationEndpoint,
    thumbnail: Thumbnails,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct NavigationEndpoint {
    browse_endpoint: BrowseEndpoint,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BrowseEndpoint {
    canonical_base_url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Thumbnails {
    thumbnails: Vec<Thumbnail>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Thumbnail {
    url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct YoutubeCommunityPost {
    backstage_post_thread_renderer: BackstagePostThread,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BackstagePostThread {
    post: BackstagePost,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BackstagePost {
    backstage_post_renderer: BackstagePostRenderer,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BackstagePostRenderer {
    post_id: String,
    content_text: Runs,
    published_time_text: Runs,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Runs {
    runs: Vec<Run>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Run {
    text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_embedded_ignores_trailing_page() {
        let body = format!(
            r#"<html>junk{}[{{"channelRenderer":{{"channelId":"UC123","navigationEndpoint":{{"browseEndpoint":{{"canonicalBaseUrl":"/channel/UC123"}}}}}}}}];more page junk</html>"#,
            SEARCH_RESULTS_START
        );
        let results: Vec<YoutubeChannel> = decode_embedded(&body, SEARCH_RESULTS_START).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].channel_renderer.channel_id, "UC123");
        assert_eq!(
            results[0]
                .channel_renderer
                .navigation_endpoint
                .browse_endpoint
                .canonical_base_url,
            "/channel/UC123"
        );
    }

    #[test]
    fn test_decode_embedded_missing_anchor() {
        let err = decode_embedded::<Vec<YoutubeChannel>>("<html></html>", SEARCH_RESULTS_START)
            .unwrap_err();
        assert!(err.to_string().contains("not found"), "{err}");
    }

    #[test]
    fn test_parse_relative_time() {
        let now = "2024-06-15T12:00:00Z".parse::<DateTime<Utc>>().unwrap();

        let cases = [
            ("5 minutes ago", now - Duration::minutes(5)),
            ("1 hour ago", now - Duration::hours(1)),
            ("3 days ago", now - Duration::days(3)),
            ("2 weeks ago", now - Duration::days(14)),
            ("1 month ago", now - Duration::days(30)),
            ("2 years ago", now - Duration::days(730)),
        ];
        for (text, expected) in cases {
            assert_eq!(parse_relative_time(text, now).unwrap(), expected, "{text}");
        }

        assert!(parse_relative_time("gestern", now).is_err());
        assert!(parse_relative_time("3 days until", now).is_err());
        assert!(parse_relative_time("x days ago", now).is_err());
    }

    #[test]
    fn test_community_posts_skip_non_post_renderers() {
        let body = format!(
            r#"{}[{{"somethingElse":{{}}}},{{"backstagePostThreadRenderer":{{"post":{{"backstagePostRenderer":{{"postId":"Ug123","contentText":{{"runs":[{{"text":"hello "}},{{"text":"world"}}]}},"publishedTimeText":{{"runs":[{{"text":"3 days ago"}}]}}}}}}}}}}]"#,
            COMMUNITY_POSTS_START
        );
        let posts = community_posts(&body).unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, "Ug123");
        assert_eq!(posts[0].description_html, "hello world");
        assert_eq!(posts[0].date_string, "3 days ago");
    }
}

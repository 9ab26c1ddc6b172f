//! Generic RSS/ATOM feeds, including feed discovery on plain HTML pages.

use std::sync::LazyLock;

use chrono::Utc;
use scraper::{Html, Selector};
use url::Url;

use crate::domain::{Post, Search};
use crate::error::{Error, Result};
use crate::feed::{Feed, FetchContext, Static};
use crate::sources::fetch_text;

static ALTERNATE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"link[rel="alternate"]"#).expect("alternate selector"));

/// Open a generic feed. `name` is either a feed URL or `user@host`, which
/// resolves to `host/@user` (the fediverse convention).
pub async fn open(ctx: FetchContext, name: String, _search: Search) -> Result<Box<dyn Feed>> {
    let mut feed_url = name.clone();
    if let Some((user, host)) = name.split_once('@') {
        feed_url = format!("{host}/@{user}");
    }
    if !feed_url.starts_with("http") {
        feed_url = format!("http://{feed_url}");
    }

    let base_url = Url::parse(&feed_url)?;
    let body = fetch_text(&ctx, &feed_url).await?;

    let parsed = match feed_rs::parser::parse(body.as_bytes()) {
        Ok(parsed) => parsed,
        Err(_) => {
            // not a feed: look for an alternate link on the HTML page
            let alternate = discover_feed_url(&body, &base_url)
                .ok_or_else(|| Error::FeedParse(format!("no feed found at {feed_url}")))?;
            let body = fetch_text(&ctx, alternate.as_str()).await?;
            feed_rs::parser::parse(body.as_bytes())
                .map_err(|err| Error::FeedParse(err.to_string()))?
        }
    };

    Ok(Box::new(from_parsed(name, "web", parsed)))
}

fn discover_feed_url(body: &str, base_url: &Url) -> Option<Url> {
    let document = Html::parse_document(body);
    for link in document.select(&ALTERNATE_SELECTOR) {
        let mime = link.value().attr("type").unwrap_or_default();
        if mime != "application/atom+xml" && mime != "application/rss+xml" {
            continue;
        }
        if let Some(href) = link.value().attr("href") {
            return base_url.join(href).ok();
        }
    }
    None
}

/// Build a replayable feed from a parsed RSS/ATOM document.
pub(crate) fn from_parsed(name: String, source: &str, parsed: feed_rs::model::Feed) -> Static {
    let avatar_url = parsed
        .logo
        .as_ref()
        .or(parsed.icon.as_ref())
        .map(|image| image.uri.clone())
        .unwrap_or_default();

    let posts = parsed
        .entries
        .into_iter()
        .map(|entry| entry_to_post(entry, &name, &avatar_url, source))
        .collect();

    let mut feed = Static::new(name, posts);
    feed.feed_url = parsed
        .links
        .first()
        .map(|link| link.href.clone())
        .unwrap_or_default();
    feed.feed_description = parsed
        .description
        .map(|text| text.content)
        .unwrap_or_default();
    feed
}

pub(crate) fn entry_to_post(
    entry: feed_rs::model::Entry,
    author: &str,
    avatar_url: &str,
    source: &str,
) -> Post {
    let link = entry
        .links
        .first()
        .map(|link| link.href.clone())
        .unwrap_or_default();
    let id = if entry.id.is_empty() {
        link.clone()
    } else {
        entry.id.clone()
    };

    let date = entry.published.or(entry.updated).unwrap_or_else(Utc::now);

    let mut content = entry
        .content
        .and_then(|content| content.body)
        .unwrap_or_default();
    if content.is_empty() {
        content = entry
            .summary
            .as_ref()
            .map(|summary| summary.content.clone())
            .unwrap_or_default();
    }
    // image enclosures become inline images
    for media in &entry.media {
        for item in &media.content {
            let is_image = item
                .content_type
                .as_ref()
                .map(|mime| mime.to_string().starts_with("image"))
                .unwrap_or(false);
            if let (true, Some(url)) = (is_image, item.url.as_ref()) {
                content.push_str(&format!(r#"<img src="{url}" />"#));
            }
        }
    }

    let title = entry
        .title
        .map(|title| format!("<h1>{}</h1>", title.content))
        .unwrap_or_default();

    Post {
        source: source.to_string(),
        id,
        author: author.to_string(),
        avatar_url: avatar_url.to_string(),
        url: link,
        title,
        description_html: content,
        tags: entry
            .categories
            .into_iter()
            .map(|category| category.term)
            .collect(),
        date_string: date.to_rfc2822(),
        date,
    }
}

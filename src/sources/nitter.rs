//! Twitter accounts, proxied through a nitter instance.
//!
//! See https://github.com/zedeus/nitter.

use std::sync::OnceLock;

use crate::domain::Search;
use crate::error::{Error, Result};
use crate::feed::{Feed, FetchContext};
use crate::sources::{account_of, fetch_text};

static NITTER_URL: OnceLock<String> = OnceLock::new();

/// Set the nitter instance to use. Called once at startup.
pub fn set_nitter_url(url: String) {
    let _ = NITTER_URL.set(url);
}

fn nitter_url() -> &'static str {
    NITTER_URL
        .get()
        .map(String::as_str)
        .unwrap_or("https://nitter.net")
}

/// Open the feed of `account@twitter` (or `account@t`).
pub async fn open(ctx: FetchContext, name: String, _search: Search) -> Result<Box<dyn Feed>> {
    let account = account_of(&name);
    let rss_url = format!("{}/{account}/rss", nitter_url());

    let body = fetch_text(&ctx, &rss_url).await?;
    let parsed = feed_rs::parser::parse(body.as_bytes())
        .map_err(|err| Error::FeedParse(format!("{name}: {err}")))?;

    let mut feed = super::rss::from_parsed(name, "twitter", parsed);
    feed.feed_url = rss_url;
    Ok(Box::new(feed))
}

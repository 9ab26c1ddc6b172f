//! Source adapters and the name-based dispatcher that picks between them.

pub mod ao3;
pub mod bibliogram;
pub mod nitter;
pub mod rss;
pub mod tiktok;
pub mod tumblr;
pub mod youtube;

use crate::cache::FeedCache;
use crate::domain::Search;
use crate::error::{Error, Result};
use crate::feed::{Feed, FetchContext};

/// Which adapter serves a feed name.
///
/// Suffixes select proxied services (`@twitter`, `@instagram`, ...), URLs
/// select the matching scraper, anything else with an `@` or `.` is
/// treated as a generic RSS/ATOM feed, and bare names are tumblr blogs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Tumblr,
    Nitter,
    Bibliogram,
    Youtube,
    Tiktok,
    Ao3,
    Rss,
}

impl Route {
    pub fn for_name(name: &str) -> Route {
        if name.ends_with("@twitter") || name.ends_with("@t") {
            Route::Nitter
        } else if name.ends_with("@instagram") || name.ends_with("@ig") {
            Route::Bibliogram
        } else if name.ends_with("@youtube") || name.ends_with("@yt") {
            Route::Youtube
        } else if name.ends_with("@tumblr") {
            Route::Tumblr
        } else if name.contains("www.tiktok.com") || name.ends_with("@tiktok") {
            Route::Tiktok
        } else if name.contains("archiveofourown.org") || name.ends_with("@ao3") {
            Route::Ao3
        } else if name.contains('@') || name.contains('.') {
            Route::Rss
        } else {
            Route::Tumblr
        }
    }

    pub async fn open(
        self,
        ctx: FetchContext,
        name: String,
        search: Search,
    ) -> Result<Box<dyn Feed>> {
        match self {
            Route::Tumblr => tumblr::open(ctx, name, search).await,
            Route::Nitter => nitter::open(ctx, name, search).await,
            Route::Bibliogram => bibliogram::open(ctx, name, search).await,
            Route::Youtube => youtube::open(ctx, name, search).await,
            Route::Tiktok => tiktok::open(ctx, name, search).await,
            Route::Ao3 => ao3::open(ctx, name, search).await,
            Route::Rss => rss::open(ctx, name, search).await,
        }
    }
}

/// Open the feed `name` with the matching adapter, through the cache.
pub async fn open_any(
    ctx: &FetchContext,
    name: &str,
    cache: &FeedCache,
    search: &Search,
) -> Result<Box<dyn Feed>> {
    let route = Route::for_name(name);
    cache
        .open(
            ctx,
            name,
            move |ctx, name, search| route.open(ctx, name, search),
            search,
        )
        .await
}

/// The part of a feed name before the first `@`, e.g. the account of
/// `account@twitter`.
pub(crate) fn account_of(name: &str) -> &str {
    match name.find('@') {
        Some(idx) => &name[..idx],
        None => name,
    }
}

pub(crate) async fn fetch_text(ctx: &FetchContext, url: &str) -> Result<String> {
    let resp = ctx.get(url).send().await?;
    let status = resp.status();
    if status != reqwest::StatusCode::OK {
        return Err(Error::Status(status.as_u16()));
    }
    Ok(resp.text().await?)
}

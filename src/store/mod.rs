//! The durable cache engine.
//!
//! Feeds opened through [`open_cached`] are backed by the sqlite store:
//! fresh (or error-sticky) entries are served straight from the `posts`
//! table with predicate pushdown, everything else goes to the upstream
//! adapter wrapped in a caching feed that persists what was read on close.
//! Upstream timeouts and 404s degrade to stale cached content instead of
//! failing the request.

pub mod sqlite;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{CACHED_FETCH_DEADLINE, CACHE_TIME, WRITE_RETRIES, WRITE_RETRY_BACKOFF};
use crate::domain::{Post, Search};
use crate::error::{Error, Result};
use crate::feed::{Feed, FetchContext};

pub use sqlite::{is_busy, FeedInfo, Store};

/// Synthetic tag added to posts served from an out-of-date cache. A
/// display hint only, never persisted.
pub const OUT_OF_DATE_TAG: &str = "numblr:out-of-date";

/// Open the feed `name`, serving from and filling the durable cache.
///
/// The upstream is only consulted when the cached copy is missing, stale
/// and error-free, or explicitly bypassed with `force_fresh`. When the
/// request carries no deadline but a cached copy exists, the upstream
/// fetch gets a short derived deadline: a cache hit beats slow freshness.
pub async fn open_cached<F, Fut>(
    store: Arc<Store>,
    ctx: &FetchContext,
    name: &str,
    open_fn: F,
    search: &Search,
) -> Result<Box<dyn Feed>>
where
    F: FnOnce(FetchContext, String, Search) -> Fut + Send,
    Fut: Future<Output = Result<Box<dyn Feed>>> + Send,
{
    let info = store.feed_info(name)?;
    let is_cached = info.is_some();
    let (url, description, error) = match &info {
        Some(info) => (
            info.url.clone(),
            info.description.clone(),
            info.error.clone(),
        ),
        None => Default::default(),
    };
    let error_sticky = is_cached && !error.is_empty();
    let is_fresh = info
        .as_ref()
        .map(|info| {
            error.is_empty()
                && Utc::now().signed_duration_since(info.cached_at)
                    < chrono::Duration::from_std(CACHE_TIME).expect("cache time")
        })
        .unwrap_or(false);

    if !search.force_fresh && (is_fresh || error_sticky) {
        let (posts, predicate_notes) = store.cached_posts(name, search)?;
        let mut notes = vec![if error_sticky {
            format!("cached-by-error: {error}")
        } else {
            "cached".to_string()
        }];
        notes.extend(predicate_notes.iter().map(|note| note.to_string()));
        return Ok(Box::new(DatabaseCached::new(
            name,
            url,
            description,
            posts,
            false,
            notes,
        )));
    }

    if name == "random" {
        let posts = store.random_posts()?;
        return Ok(Box::new(DatabaseCached::new(
            name,
            url,
            description,
            posts,
            false,
            Vec::new(),
        )));
    }

    let fetch_ctx = if !ctx.has_deadline() && is_cached {
        // if we have the feed cached and the upstream takes too long,
        // return the cached copy instead
        ctx.with_deadline(CACHED_FETCH_DEADLINE)
    } else {
        ctx.clone()
    };

    let opened = open_with_deadline(&fetch_ctx, name, search, open_fn).await;

    let err = match opened {
        Ok(feed) => {
            return Ok(Box::new(DatabaseCaching {
                store,
                inner: feed,
                cached_at: Utc::now(),
                posts: Vec::new(),
            }))
        }
        Err(err) => err,
    };

    if !search.force_fresh && is_cached && err.is_timeout() {
        tracing::warn!("returning out-of-date feed {name:?}, caused by {err}");
        let posts = store.fallback_posts(name, search)?;
        return Ok(Box::new(DatabaseCached::new(
            name,
            url,
            description,
            posts,
            true,
            vec!["timeout".to_string()],
        )));
    }

    if err.status() == Some(404) && is_cached {
        let posts = store.fallback_posts(name, search)?;
        return Ok(Box::new(DatabaseCached::new(
            name,
            url,
            description,
            posts,
            true,
            vec!["not-found".to_string()],
        )));
    }

    // memoise the failure so broken upstreams are not hammered, but keep
    // it off the request path and skip unreachable hosts that were never
    // cached (a typo should not populate the table)
    if is_cached || !err.is_timeout() {
        let store = Arc::clone(&store);
        let memo_name = name.to_string();
        let message = err.to_string();
        tokio::spawn(async move {
            if let Err(memo_err) = store.record_error(&memo_name, &url, &message) {
                tracing::error!("update feed_infos after error: {memo_err}");
            }
        });
    }

    Err(Error::for_feed(name, err))
}

async fn open_with_deadline<F, Fut>(
    ctx: &FetchContext,
    name: &str,
    search: &Search,
    open_fn: F,
) -> Result<Box<dyn Feed>>
where
    F: FnOnce(FetchContext, String, Search) -> Fut + Send,
    Fut: Future<Output = Result<Box<dyn Feed>>> + Send,
{
    let fut = open_fn(ctx.clone(), name.to_string(), search.clone());
    match ctx.remaining() {
        Some(remaining) => match tokio::time::timeout(remaining, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded),
        },
        None => fut.await,
    }
}

/// List feeds whose cache has gone stale.
pub fn stale_feeds(store: &Store, limit: usize) -> Result<Vec<String>> {
    let cutoff = Utc::now() - chrono::Duration::from_std(CACHE_TIME).expect("cache time");
    store.list_older_than(cutoff, limit)
}

/// Periodic storage upkeep: reclaim free pages every minute, truncate the
/// WAL every ten.
pub fn spawn_maintenance(store: Arc<Store>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(Duration::from_secs(60));
        timer.tick().await; // the first tick is immediate
        let mut ticks: u64 = 0;
        loop {
            timer.tick().await;
            ticks += 1;

            if let Err(err) = store.incremental_vacuum() {
                tracing::warn!("incremental vacuum: {err}");
            }
            if ticks % 10 == 0 {
                if let Err(err) = store.wal_checkpoint() {
                    tracing::warn!("wal checkpoint: {err}");
                }
            }
        }
    })
}

/// Wraps a live upstream feed, buffering every post it emits; on close the
/// buffer is written to the store in one transaction.
struct DatabaseCaching {
    store: Arc<Store>,
    inner: Box<dyn Feed>,
    cached_at: DateTime<Utc>,
    posts: Vec<Post>,
}

#[async_trait]
impl Feed for DatabaseCaching {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn description(&self) -> String {
        self.inner.description()
    }

    fn url(&self) -> String {
        self.inner.url()
    }

    fn notes(&self) -> String {
        self.inner.notes()
    }

    async fn next(&mut self) -> Result<Option<Post>> {
        let post = self.inner.next().await?;
        if let Some(post) = &post {
            self.posts.push(post.clone());
        }
        Ok(post)
    }

    async fn close(&mut self) -> Result<()> {
        let mut attempt = 0;
        let saved = loop {
            let result = self.store.save_feed(
                &self.inner.name(),
                &self.inner.url(),
                &self.inner.description(),
                self.cached_at,
                &self.posts,
            );
            match result {
                Err(err) if is_busy(&err) && attempt < WRITE_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(WRITE_RETRY_BACKOFF).await;
                }
                other => break other,
            }
        };

        // the upstream is closed even when saving failed
        let closed = self.inner.close().await;
        saved.and(closed)
    }
}

/// Replays rows read from the store.
struct DatabaseCached {
    requested_name: String,
    url: String,
    description: String,
    out_of_date: bool,
    notes: Vec<String>,
    posts: std::vec::IntoIter<Post>,
    last_author: String,
}

impl DatabaseCached {
    fn new(
        name: &str,
        url: String,
        description: String,
        posts: Vec<Post>,
        out_of_date: bool,
        notes: Vec<String>,
    ) -> Self {
        DatabaseCached {
            requested_name: name.to_string(),
            url,
            description,
            out_of_date,
            notes,
            posts: posts.into_iter(),
            last_author: String::new(),
        }
    }
}

#[async_trait]
impl Feed for DatabaseCached {
    /// The canonical name once iteration has started, so that aliases like
    /// `foo@tumblr` resolve to the stored `foo`.
    fn name(&self) -> String {
        if !self.last_author.is_empty() {
            return self.last_author.clone();
        }
        self.requested_name.clone()
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn notes(&self) -> String {
        self.notes.join(",")
    }

    async fn next(&mut self) -> Result<Option<Post>> {
        let Some(mut post) = self.posts.next() else {
            return Ok(None);
        };

        if self.out_of_date {
            post.tags.push(OUT_OF_DATE_TAG.to_string());
        }

        self.last_author = post.author.clone();
        Ok(Some(post))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::feed::Static;

    fn post(id: &str, author: &str, date: &str) -> Post {
        Post {
            source: "tumblr".into(),
            id: id.into(),
            author: author.into(),
            date: format!("{date}T00:00:00Z").parse().expect("test date"),
            ..Post::default()
        }
    }

    fn ctx() -> FetchContext {
        FetchContext::new(reqwest::Client::new())
    }

    async fn drain_and_close(mut feed: Box<dyn Feed>) -> Vec<Post> {
        let mut posts = Vec::new();
        while let Some(post) = feed.next().await.unwrap() {
            posts.push(post);
        }
        feed.close().await.unwrap();
        posts
    }

    #[tokio::test]
    async fn test_cache_idempotence() {
        let store = Arc::new(Store::in_memory().unwrap());
        let opens = AtomicUsize::new(0);

        let feed = open_cached(
            Arc::clone(&store),
            &ctx(),
            "staff",
            |_, name, _| {
                opens.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok(Box::new(Static::new(
                        name,
                        vec![post("p1", "staff", "2024-01-01")],
                    )) as Box<dyn Feed>)
                }
            },
            &Search::default(),
        )
        .await
        .unwrap();
        let first = drain_and_close(feed).await;
        assert_eq!(first.len(), 1);
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        let info = store.feed_info("staff").unwrap().unwrap();
        assert!(Utc::now().signed_duration_since(info.cached_at) < chrono::Duration::minutes(1));

        // within the cache time the upstream must not be consulted again
        let feed = open_cached(
            Arc::clone(&store),
            &ctx(),
            "staff",
            |_, _, _| async move { panic!("upstream must not be opened") },
            &Search::default(),
        )
        .await
        .unwrap();
        assert_eq!(feed.notes(), "cached");
        let second = drain_and_close(feed).await;
        assert_eq!(
            second.iter().map(|p| &p.id).collect::<Vec<_>>(),
            first.iter().map(|p| &p.id).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_force_fresh_bypasses_cache() {
        let store = Arc::new(Store::in_memory().unwrap());
        store
            .save_feed(
                "staff",
                "",
                "",
                Utc::now(),
                &[post("old", "staff", "2024-01-01")],
            )
            .unwrap();

        let search = Search {
            force_fresh: true,
            ..Search::default()
        };
        let feed = open_cached(
            Arc::clone(&store),
            &ctx(),
            "staff",
            |_, name, _| async move {
                Ok(Box::new(Static::new(
                    name,
                    vec![post("new", "staff", "2024-02-01")],
                )) as Box<dyn Feed>)
            },
            &search,
        )
        .await
        .unwrap();
        let posts = drain_and_close(feed).await;
        assert_eq!(posts[0].id, "new");
    }

    #[tokio::test]
    async fn test_timeout_falls_back_to_cached_posts() {
        let store = Arc::new(Store::in_memory().unwrap());
        let cached_at = Utc::now() - chrono::Duration::minutes(15);
        store
            .save_feed(
                "staff",
                "",
                "",
                cached_at,
                &[post("p0", "staff", "2024-01-01")],
            )
            .unwrap();

        // the entry is stale, so the upstream is tried with the derived
        // 150 ms deadline; it sleeps for a second
        let feed = open_cached(
            Arc::clone(&store),
            &ctx(),
            "staff",
            |_, name, _| async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(Box::new(Static::new(name, Vec::new())) as Box<dyn Feed>)
            },
            &Search::default(),
        )
        .await
        .unwrap();

        assert_eq!(feed.notes(), "timeout");
        let posts = drain_and_close(feed).await;
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, "p0");
        assert!(posts[0].tags.iter().any(|t| t == OUT_OF_DATE_TAG));
    }

    #[tokio::test]
    async fn test_404_falls_back_to_cached_posts() {
        let store = Arc::new(Store::in_memory().unwrap());
        store
            .save_feed(
                "gone",
                "",
                "",
                Utc::now() - chrono::Duration::hours(1),
                &[post("p0", "gone", "2024-01-01")],
            )
            .unwrap();

        let feed = open_cached(
            Arc::clone(&store),
            &ctx(),
            "gone",
            |_, _, _| async move { Err(Error::Status(404)) },
            &Search::default(),
        )
        .await
        .unwrap();

        assert_eq!(feed.notes(), "not-found");
        let posts = drain_and_close(feed).await;
        assert_eq!(posts.len(), 1);
        assert!(posts[0].tags.iter().any(|t| t == OUT_OF_DATE_TAG));

        // the prior cache had content, so no error was memoised
        tokio::time::sleep(Duration::from_millis(50)).await;
        let info = store.feed_info("gone").unwrap().unwrap();
        assert_eq!(info.error, "");
    }

    #[tokio::test]
    async fn test_error_is_memoised_and_sticky() {
        let store = Arc::new(Store::in_memory().unwrap());
        store
            .save_feed(
                "flaky",
                "",
                "",
                Utc::now() - chrono::Duration::hours(1),
                &[post("p0", "flaky", "2024-01-01")],
            )
            .unwrap();

        let result = open_cached(
            Arc::clone(&store),
            &ctx(),
            "flaky",
            |_, _, _| async move { Err(Error::Other("parse failure".into())) },
            &Search::default(),
        )
        .await;
        assert!(result.is_err());

        // the memo write is asynchronous
        tokio::time::sleep(Duration::from_millis(50)).await;
        let info = store.feed_info("flaky").unwrap().unwrap();
        assert!(info.error.contains("parse failure"), "{}", info.error);

        // with the error recorded the cached copy is served regardless of age
        let feed = open_cached(
            Arc::clone(&store),
            &ctx(),
            "flaky",
            |_, _, _| async move { panic!("error-sticky cache must not refetch") },
            &Search::default(),
        )
        .await
        .unwrap();
        assert!(feed.notes().starts_with("cached-by-error: "), "{}", feed.notes());
        let posts = drain_and_close(feed).await;
        assert_eq!(posts.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_host_without_cache_is_not_memoised() {
        let store = Arc::new(Store::in_memory().unwrap());

        let result = open_cached(
            Arc::clone(&store),
            &ctx(),
            "tpyo",
            |_, _, _| async move {
                Err(Error::Other(
                    "lookup tpyo: Temporary failure in name resolution".into(),
                ))
            },
            &Search::default(),
        )
        .await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.feed_info("tpyo").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_post_id_fails_close_and_discards() {
        let store = Arc::new(Store::in_memory().unwrap());

        let mut feed = open_cached(
            Arc::clone(&store),
            &ctx(),
            "broken",
            |_, name, _| async move {
                Ok(Box::new(Static::new(
                    name,
                    vec![post("", "broken", "2024-01-01")],
                )) as Box<dyn Feed>)
            },
            &Search::default(),
        )
        .await
        .unwrap();

        while feed.next().await.unwrap().is_some() {}
        let err = feed.close().await.unwrap_err();
        assert!(err.to_string().contains("empty post id"), "{err}");

        assert!(store.feed_info("broken").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_random_pseudo_feed() {
        let store = Arc::new(Store::in_memory().unwrap());
        for name in ["a", "b", "c"] {
            store
                .save_feed(
                    name,
                    "",
                    "",
                    Utc::now(),
                    &[post(&format!("{name}1"), name, "2024-01-01")],
                )
                .unwrap();
        }

        let feed = open_cached(
            Arc::clone(&store),
            &ctx(),
            "random",
            |_, _, _| async move { panic!("random never consults an upstream") },
            &Search {
                force_fresh: true,
                ..Search::default()
            },
        )
        .await
        .unwrap();
        let posts = drain_and_close(feed).await;
        assert_eq!(posts.len(), 3);
    }

    #[tokio::test]
    async fn test_cached_feed_resolves_canonical_name() {
        let store = Arc::new(Store::in_memory().unwrap());
        store
            .save_feed(
                "staff@tumblr",
                "",
                "",
                Utc::now(),
                &[post("1", "staff", "2024-01-01")],
            )
            .unwrap();

        // posts are keyed by author in the query, match the stored author
        let mut feed = DatabaseCached::new(
            "staff@tumblr",
            String::new(),
            String::new(),
            vec![post("1", "staff", "2024-01-01")],
            false,
            Vec::new(),
        );
        assert_eq!(feed.name(), "staff@tumblr");
        feed.next().await.unwrap();
        assert_eq!(feed.name(), "staff");
    }

    #[tokio::test]
    async fn test_next_after_close_is_safe() {
        let mut feed = DatabaseCached::new(
            "staff",
            String::new(),
            String::new(),
            Vec::new(),
            false,
            Vec::new(),
        );
        feed.close().await.unwrap();
        assert!(feed.next().await.unwrap().is_none());
    }
}

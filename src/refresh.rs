//! Background refresher: keeps stale cache entries warm so requests are
//! served from cache instead of waiting on upstreams.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::cache::FeedCache;
use crate::config::{REFRESH_CONCURRENCY, REFRESH_DEADLINE, REFRESH_INTERVAL};
use crate::domain::Search;
use crate::error::Result;
use crate::feed::FetchContext;
use crate::sources;
use crate::store;

/// Run the refresh loop forever. Each tick lists feeds whose cache has
/// expired and re-fetches them through the regular dispatcher with
/// `force_fresh`, bounded by a global semaphore. Failures are logged and
/// never stop the loop.
pub fn spawn(cache: FeedCache, ctx: FetchContext) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(REFRESH_CONCURRENCY));
        let mut timer = tokio::time::interval(REFRESH_INTERVAL);

        loop {
            timer.tick().await;

            let stale = match store::stale_feeds(cache.store(), REFRESH_CONCURRENCY) {
                Ok(stale) => stale,
                Err(err) => {
                    tracing::error!("listing feeds in background: {err}");
                    continue;
                }
            };
            if stale.is_empty() {
                continue;
            }

            let mut tasks = Vec::with_capacity(stale.len());
            for name in stale {
                let semaphore = Arc::clone(&semaphore);
                let cache = cache.clone();
                let ctx = ctx.clone();

                tasks.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire().await.expect("semaphore closed");
                    refresh_one(&cache, &ctx, &name).await.map_err(|err| (name, err))
                }));
            }

            let total = tasks.len();
            let mut successful = 0;
            for task in tasks {
                match task.await {
                    Ok(Ok(())) => successful += 1,
                    Ok(Err((name, err))) => {
                        tracing::warn!("background refresh of {name:?}: {err}")
                    }
                    Err(err) => tracing::error!("background refresh task: {err}"),
                }
            }
            tracing::info!("refreshed {successful}/{total} feeds");
        }
    })
}

async fn refresh_one(cache: &FeedCache, ctx: &FetchContext, name: &str) -> Result<()> {
    let ctx = ctx.with_deadline(REFRESH_DEADLINE);
    let search = Search {
        force_fresh: true,
        ..Search::default()
    };

    let mut feed = sources::open_any(&ctx, name, cache, &search).await?;

    // drain; persisting happens on close
    let result = async {
        while feed.next().await?.is_some() {}
        Ok(())
    }
    .await;

    let closed = feed.close().await;
    result.and(closed)
}

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tributary::cache::{FeedCache, MemoryCache};
use tributary::config::Config;
use tributary::feed::FetchContext;
use tributary::server::{self, AppState};
use tributary::sources::{bibliogram, nitter};
use tributary::store::{self, Store};
use tributary::refresh;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::parse();

    nitter::set_nitter_url(config.nitter_url.clone());
    bibliogram::set_instances_url(config.bibliogram_instances_url.clone());
    if config.stats {
        tracing::warn!("stats collection is not implemented, ignoring --stats");
    }

    let store = Arc::new(Store::open(&config.db)?);
    let cache = FeedCache::new(Arc::new(MemoryCache::new()), Arc::clone(&store));
    let client = FetchContext::default_client();

    store::spawn_maintenance(Arc::clone(&store));
    refresh::spawn(cache.clone(), FetchContext::new(client.clone()));

    if !config.debug_addr.is_empty() {
        let debug_addr = config.debug_addr.clone();
        tokio::spawn(async move {
            let router = axum::Router::new()
                .route("/debug/health", axum::routing::get(|| async { "ok" }));
            match tokio::net::TcpListener::bind(&debug_addr).await {
                Ok(listener) => {
                    tracing::info!("debug interface listening on http://{debug_addr}");
                    if let Err(err) = axum::serve(listener, router).await {
                        tracing::error!("debug server: {err}");
                    }
                }
                Err(err) => tracing::error!("bind debug interface: {err}"),
            }
        });
    }

    let state = AppState {
        cache,
        client,
        config: Arc::new(config),
    };
    let addr = state.config.addr.clone();
    let router = server::router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on http://{addr}");
    axum::serve(listener, router).await?;

    Ok(())
}

use std::time::Duration;

use clap::Parser;

/// How long a cached feed counts as fresh.
pub const CACHE_TIME: Duration = Duration::from_secs(10 * 60);

/// Capacity of the in-memory feed cache.
pub const MEMORY_CACHE_SIZE: usize = 100;

/// How often the background refresher scans for stale feeds.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Deadline for a single background refresh fetch.
pub const REFRESH_DEADLINE: Duration = Duration::from_secs(10);

/// Maximum number of concurrent background refreshes.
pub const REFRESH_CONCURRENCY: usize = 100;

/// Deadline derived for an upstream fetch when the feed is already cached:
/// a cache hit beats slow freshness.
pub const CACHED_FETCH_DEADLINE: Duration = Duration::from_millis(150);

/// How many times a busy commit is retried, and the pause between tries.
pub const WRITE_RETRIES: usize = 3;
pub const WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Default number of posts shown per page.
pub const DISPLAY_LIMIT: usize = 25;

/// Name of the settings cookie (lists use `numbl-list-<name>`).
pub const COOKIE_NAME: &str = "numbl";

pub const USER_AGENT: &str = concat!("tributary/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Parser)]
#[command(name = "tributary", version, about = "Read-only mirror of tumblr-like feeds, twitter, instagram, AO3, youtube, tiktok and RSS")]
pub struct Config {
    /// Address to listen on
    #[arg(long, default_value = "localhost:5555")]
    pub addr: String,

    /// Database path to use (empty for an in-memory database)
    #[arg(long, default_value = "")]
    pub db: String,

    /// Address to listen on for the debug interface (disabled by default)
    #[arg(long = "debug-addr", default_value = "")]
    pub debug_addr: String,

    /// Default feeds to view
    #[arg(long = "default", default_value = "staff,engineering")]
    pub default_feeds: String,

    /// Display mode to use when installed as an app
    #[arg(long = "app-display", default_value = "browser")]
    pub app_display: String,

    /// Whether to collect anonymized stats
    #[arg(long, default_value_t = false)]
    pub stats: bool,

    /// Nitter instance to use
    #[arg(long = "nitter-url", default_value = "https://nitter.net")]
    pub nitter_url: String,

    /// The bibliogram url to use to fetch possible instances from
    #[arg(
        long = "bibliogram-instances-url",
        default_value = "https://bibliogram.snopyta.org/api/instances"
    )]
    pub bibliogram_instances_url: String,
}

impl Config {
    pub fn default_feeds(&self) -> Vec<String> {
        self.default_feeds
            .split(',')
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect()
    }
}

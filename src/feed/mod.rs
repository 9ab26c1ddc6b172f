//! The feed contract every source adapter and cache layer implements.

pub mod merge;

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::USER_AGENT;
use crate::domain::Post;
use crate::error::Result;

pub use merge::merge;

/// A feed of posts from a given source.
///
/// A feed typically models an existing resource, e.g. posts from an RSS
/// feed or posts from a database that is then iterated over with `next`.
/// Posts are emitted newest-first; an empty feed returns `None` on the
/// first call, and `next` keeps returning `None` once the feed has ended.
///
/// The owner calls `close` exactly once when done; for caching feeds this
/// is what triggers write-back of the posts observed during iteration.
#[async_trait]
pub trait Feed: Send {
    fn name(&self) -> String;

    fn description(&self) -> String {
        String::new()
    }

    fn url(&self) -> String;

    /// Short human-readable annotations, e.g. `cached` or `timeout`.
    fn notes(&self) -> String {
        String::new()
    }

    /// The next post in the feed, or `None` when there are no more posts.
    async fn next(&mut self) -> Result<Option<Post>>;

    async fn close(&mut self) -> Result<()>;
}

/// Carries the shared HTTP client and an optional deadline through feed
/// opens. Deriving a child deadline clones the context; the parent stays
/// untouched so caller cancellation still propagates through fallbacks.
#[derive(Debug, Clone)]
pub struct FetchContext {
    client: reqwest::Client,
    deadline: Option<Instant>,
}

impl FetchContext {
    pub fn new(client: reqwest::Client) -> Self {
        FetchContext {
            client,
            deadline: None,
        }
    }

    /// A default client configured like the rest of the crate expects:
    /// compressed transfer, our user agent, 10 s overall timeout.
    pub fn default_client() -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .gzip(true)
            .brotli(true)
            .user_agent(USER_AGENT)
            .build()
            .expect("build http client")
    }

    pub fn has_deadline(&self) -> bool {
        self.deadline.is_some()
    }

    /// Derive a child context whose deadline is at most `timeout` from now
    /// (and never later than the parent's own deadline).
    pub fn with_deadline(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) => existing.min(candidate),
            None => candidate,
        };
        FetchContext {
            client: self.client.clone(),
            deadline: Some(deadline),
        }
    }

    /// Time left until the deadline. `None` means unbounded, zero means
    /// the deadline has already passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// A GET request builder with the context deadline applied as the
    /// request timeout.
    pub fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(remaining) = self.remaining() {
            req = req.timeout(remaining);
        }
        req
    }
}

/// A feed that contains exactly the posts specified. Used for tests and
/// for replaying cached post lists.
pub struct Static {
    pub feed_name: String,
    pub feed_url: String,
    pub feed_description: String,
    posts: VecDeque<Post>,
}

impl Static {
    pub fn new(name: impl Into<String>, posts: Vec<Post>) -> Self {
        Static {
            feed_name: name.into(),
            feed_url: String::new(),
            feed_description: String::new(),
            posts: posts.into(),
        }
    }

    /// Mutable access to the remaining posts, for adapters that
    /// post-process parsed entries.
    pub(crate) fn posts_mut(&mut self) -> impl Iterator<Item = &mut Post> {
        self.posts.iter_mut()
    }
}

#[async_trait]
impl Feed for Static {
    fn name(&self) -> String {
        self.feed_name.clone()
    }

    fn description(&self) -> String {
        self.feed_description.clone()
    }

    fn url(&self) -> String {
        self.feed_url.clone()
    }

    async fn next(&mut self) -> Result<Option<Post>> {
        Ok(self.posts.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

//! In-memory feed cache: a bounded LRU of fully-iterated feeds by name.
//!
//! A fresh hit replays the remembered posts without touching the layers
//! below; a miss (or stale entry) returns a recording wrapper that
//! remembers every post the reader actually consumed.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use lru::LruCache;

use crate::config::{CACHE_TIME, MEMORY_CACHE_SIZE};
use crate::domain::{Post, Search};
use crate::error::Result;
use crate::feed::{Feed, FetchContext};

struct Entry {
    cached_at: Instant,
    url: String,
    description: String,
    posts: Vec<Post>,
}

pub struct MemoryCache {
    entries: Mutex<LruCache<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_capacity(MEMORY_CACHE_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).expect("cache capacity");
        MemoryCache {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Open `name` through the cache: replay a fresh entry, otherwise defer
    /// to `open_fn` and record what gets read.
    pub async fn open_cached<F, Fut>(
        self: &Arc<Self>,
        ctx: &FetchContext,
        name: &str,
        open_fn: F,
        search: &Search,
    ) -> Result<Box<dyn Feed>>
    where
        F: FnOnce(FetchContext, String, Search) -> Fut + Send,
        Fut: Future<Output = Result<Box<dyn Feed>>> + Send,
    {
        if !search.force_fresh {
            let mut entries = self.entries.lock().expect("cache lock");
            if let Some(entry) = entries.get(name) {
                if entry.cached_at.elapsed() < CACHE_TIME {
                    return Ok(Box::new(Replay {
                        name: name.to_string(),
                        url: entry.url.clone(),
                        description: entry.description.clone(),
                        posts: entry.posts.clone().into_iter(),
                    }));
                }
            }
        }

        let inner = open_fn(ctx.clone(), name.to_string(), search.clone()).await?;
        Ok(Box::new(Recording {
            cache: Arc::clone(self),
            name: name.to_string(),
            inner,
            seen: Vec::new(),
        }))
    }

    fn insert(&self, name: String, entry: Entry) {
        self.entries.lock().expect("cache lock").put(name, entry);
    }

    #[cfg(test)]
    fn insert_aged(&self, name: &str, posts: Vec<Post>, age: std::time::Duration) {
        let cached_at = Instant::now().checked_sub(age).expect("test age");
        self.insert(
            name.to_string(),
            Entry {
                cached_at,
                url: String::new(),
                description: String::new(),
                posts,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Both cache tiers composed: the in-memory LRU first, then the durable
/// store, then the adapter itself. One full iteration warms both tiers.
#[derive(Clone)]
pub struct FeedCache {
    memory: Arc<MemoryCache>,
    store: Arc<crate::store::Store>,
}

impl FeedCache {
    pub fn new(memory: Arc<MemoryCache>, store: Arc<crate::store::Store>) -> Self {
        FeedCache { memory, store }
    }

    pub fn store(&self) -> &Arc<crate::store::Store> {
        &self.store
    }

    pub async fn open<F, Fut>(
        &self,
        ctx: &FetchContext,
        name: &str,
        open_fn: F,
        search: &Search,
    ) -> Result<Box<dyn Feed>>
    where
        F: FnOnce(FetchContext, String, Search) -> Fut + Send,
        Fut: Future<Output = Result<Box<dyn Feed>>> + Send,
    {
        let store = Arc::clone(&self.store);
        self.memory
            .open_cached(
                ctx,
                name,
                move |ctx, name, search| async move {
                    crate::store::open_cached(store, &ctx, &name, open_fn, &search).await
                },
                search,
            )
            .await
    }
}

/// Replays a remembered feed.
struct Replay {
    name: String,
    url: String,
    description: String,
    posts: std::vec::IntoIter<Post>,
}

#[async_trait]
impl Feed for Replay {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn notes(&self) -> String {
        "cached".into()
    }

    async fn next(&mut self) -> Result<Option<Post>> {
        Ok(self.posts.next())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Forwards to the wrapped feed and remembers every post read; the buffer
/// is inserted into the cache on close, even after a partial iteration
/// (the most recent window is what readers ask for again).
struct Recording {
    cache: Arc<MemoryCache>,
    name: String,
    inner: Box<dyn Feed>,
    seen: Vec<Post>,
}

#[async_trait]
impl Feed for Recording {
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
            self.seen.push(post.clone());
        }
        Ok(post)
    }

    async fn close(&mut self) -> Result<()> {
        // a degraded feed (stale fallback) must not pass for a fresh entry
        let degraded = self
            .inner
            .notes()
            .split(',')
            .any(|note| note == "timeout" || note == "not-found");
        if !self.seen.is_empty() && !degraded {
            self.cache.insert(
                self.name.clone(),
                Entry {
                    cached_at: Instant::now(),
                    url: self.inner.url(),
                    description: self.inner.description(),
                    posts: std::mem::take(&mut self.seen),
                },
            );
        }
        self.inner.close().await
    }
}

//! Merging several feeds into a single time-ordered one.

use async_trait::async_trait;

use crate::domain::Post;
use crate::error::{Error, Result};
use crate::feed::Feed;

/// Returns a feed that merges the posts from the given feeds and presents
/// them as a single feed to iterate over.
///
/// Each feed is assumed to be sorted already (by date descending); the
/// merger only preserves the order that exists. Ties are broken by the
/// position of the feed in `feeds`.
pub fn merge(feeds: Vec<Box<dyn Feed>>) -> Merged {
    let len = feeds.len();
    Merged {
        feeds,
        heads: (0..len).map(|_| None).collect(),
        slots: vec![Slot::Active; len],
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Active,
    Ended,
    Failed(String),
}

pub struct Merged {
    feeds: Vec<Box<dyn Feed>>,
    heads: Vec<Option<Post>>,
    slots: Vec<Slot>,
}

#[async_trait]
impl Feed for Merged {
    fn name(&self) -> String {
        let mut name = String::new();
        let mut seen: Vec<String> = Vec::with_capacity(self.feeds.len());
        for feed in &self.feeds {
            let feed_name = feed.name();
            if seen.contains(&feed_name) {
                continue;
            }
            if !name.is_empty() {
                name.push(' ');
            }
            name.push_str(&feed_name);
            seen.push(feed_name);
        }
        name
    }

    fn url(&self) -> String {
        String::new()
    }

    async fn next(&mut self) -> Result<Option<Post>> {
        if !self.slots.is_empty()
            && self.slots.iter().all(|s| matches!(s, Slot::Failed(_)))
        {
            if let Some(Slot::Failed(msg)) = self.slots.first() {
                return Err(Error::Other(msg.clone()));
            }
        }

        // refill empty head slots, advancing all pending feeds concurrently
        let refills: Vec<_> = self
            .feeds
            .iter_mut()
            .zip(self.heads.iter_mut())
            .zip(self.slots.iter_mut())
            .filter(|((_, head), slot)| head.is_none() && !matches!(slot, Slot::Ended))
            .map(|((feed, head), slot)| async move {
                match feed.next().await {
                    Ok(Some(post)) => *head = Some(post),
                    Ok(None) => *slot = Slot::Ended,
                    Err(err) => *slot = Slot::Failed(err.to_string()),
                }
            })
            .collect();
        futures::future::join_all(refills).await;

        let mut latest: Option<(usize, chrono::DateTime<chrono::Utc>)> = None;
        for (i, head) in self.heads.iter().enumerate() {
            let Some(post) = head else { continue };
            if latest.map_or(true, |(_, date)| post.date > date) {
                latest = Some((i, post.date));
            }
        }

        let Some((idx, _)) = latest else {
            return Ok(None);
        };

        let mut post = self.heads[idx].take().expect("picked head");
        post.author = self.feeds[idx].name();
        Ok(Some(post))
    }

    async fn close(&mut self) -> Result<()> {
        let mut result = Ok(());
        for feed in &mut self.feeds {
            if let Err(err) = feed.close().await {
                result = Err(err);
            }
        }
        result
    }
}

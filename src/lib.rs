//! Aggregating read-only frontend for tumblr-like blogs, twitter and
//! instagram proxies, AO3, youtube, tiktok and generic RSS/ATOM feeds.
//!
//! Feeds are merged newest-first and served from a two-tier cache: a
//! bounded in-memory LRU in front of a sqlite store that degrades to
//! stale content when upstreams are slow, missing or broken.

pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod feed;
pub mod refresh;
pub mod server;
pub mod sources;
pub mod store;

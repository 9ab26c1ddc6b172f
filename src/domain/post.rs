use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

static REBLOG_TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-\w]+:").expect("reblog regex"));

/// A single post, e.g. a blog post or a tweet.
///
/// Posts are uniquely keyed by `(source, feed name, id)` once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    /// Tag of the adapter the post came from, e.g. `tumblr` or `twitter`.
    pub source: String,
    pub id: String,
    /// Canonical name of the feed the post belongs to.
    pub author: String,
    pub avatar_url: String,
    pub url: String,
    /// HTML fragment.
    pub title: String,
    /// HTML fragment.
    pub description_html: String,
    pub tags: Vec<String>,
    /// Original textual timestamp from the source.
    pub date_string: String,
    pub date: DateTime<Utc>,
}

impl Default for Post {
    fn default() -> Self {
        Post {
            source: String::new(),
            id: String::new(),
            author: String::new(),
            avatar_url: String::new(),
            url: String::new(),
            title: String::new(),
            description_html: String::new(),
            tags: Vec::new(),
            date_string: String::new(),
            date: DateTime::UNIX_EPOCH,
        }
    }
}

impl Post {
    /// True if the post is a repost of another post, likely from another
    /// source.
    pub fn is_reblog(&self) -> bool {
        REBLOG_TITLE_RE.is_match(&self.title)
            || self.description_html.contains(r#"class="tumblr_blog""#)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(title: &str, description_html: &str) -> Post {
        Post {
            title: title.into(),
            description_html: description_html.into(),
            ..Post::default()
        }
    }

    #[test]
    fn test_reblog_by_title() {
        assert!(post("someblog:", "").is_reblog());
        assert!(post("  some-blog: reblogged", "").is_reblog());
        assert!(!post("just a title", "").is_reblog());
    }

    #[test]
    fn test_reblog_by_marker_class() {
        assert!(post("", r#"<a class="tumblr_blog" href="x">someblog</a>:"#).is_reblog());
        assert!(!post("", "<p>plain post</p>").is_reblog());
    }

    #[test]
    fn test_title_colon_needs_single_word() {
        assert!(!post("two words: not a reblog", "").is_reblog());
        assert!(post("hyphen-ated: reblog", "").is_reblog());
    }
}

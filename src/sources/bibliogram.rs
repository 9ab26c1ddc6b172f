//! Instagram accounts, proxied through bibliogram instances.
//!
//! See https://git.sr.ht/~cadence/bibliogram. Instances are discovered
//! once from the configured instance list and picked at random per
//! request, retrying other instances on server errors.

use std::sync::OnceLock;

use rand::Rng;
use serde::Deserialize;
use url::Url;

use crate::domain::Search;
use crate::error::{Error, Result};
use crate::feed::{Feed, FetchContext};
use crate::sources::{account_of, fetch_text};

static INSTANCES_URL: OnceLock<String> = OnceLock::new();
static INSTANCES: tokio::sync::OnceCell<Vec<String>> = tokio::sync::OnceCell::const_new();

/// Set the instance-list endpoint. Called once at startup.
pub fn set_instances_url(url: String) {
    let _ = INSTANCES_URL.set(url);
}

fn instances_url() -> &'static str {
    INSTANCES_URL
        .get()
        .map(String::as_str)
        .unwrap_or("https://bibliogram.snopyta.org/api/instances")
}

#[derive(Debug, Deserialize)]
struct InstanceInfo {
    data: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
struct Instance {
    address: String,
    #[serde(default)]
    rss_enabled: bool,
}

async fn instances(ctx: &FetchContext) -> Result<&'static [String]> {
    let instances = INSTANCES
        .get_or_try_init(|| async {
            let body = fetch_text(ctx, instances_url())
                .await
                .map_err(|err| Error::Other(format!("initializing bibliogram: {err}")))?;
            let info: InstanceInfo = serde_json::from_str(&body)?;

            let instances: Vec<String> = info
                .data
                .into_iter()
                .filter(|instance| instance.rss_enabled)
                .map(|instance| instance.address)
                .collect();
            if instances.is_empty() {
                return Err(Error::Other("no bibliogram instances with rss".into()));
            }
            Ok(instances)
        })
        .await?;
    Ok(instances)
}

/// Open the feed of `account@instagram` (or `account@ig`).
pub async fn open(ctx: FetchContext, name: String, _search: Search) -> Result<Box<dyn Feed>> {
    let instances = instances(&ctx).await?;
    let account = account_of(&name);

    let mut last_err = Error::Other("no bibliogram instances".into());
    for _ in 0..instances.len() {
        let instance = &instances[rand::thread_rng().gen_range(0..instances.len())];
        let rss_url = format!("{instance}/u/{account}/rss.xml");

        match fetch_text(&ctx, &rss_url).await {
            Ok(body) => {
                let parsed = feed_rs::parser::parse(body.as_bytes())
                    .map_err(|err| Error::FeedParse(format!("{name}: {err}")))?;

                let base_url = Url::parse(&rss_url)?;
                let mut feed = super::rss::from_parsed(name, "instagram", parsed);
                feed.feed_url = rss_url.clone();
                for post in feed.posts_mut() {
                    // instagram posts have no titles worth keeping
                    post.title = String::new();
                    if let Ok(absolute) = base_url.join(&post.url) {
                        post.url = absolute.to_string();
                    }
                }
                return Ok(Box::new(feed));
            }
            // instance-side errors are worth retrying elsewhere, anything
            // below 500 is about the account itself
            Err(err @ Error::Status(code)) if code < 500 => return Err(err),
            Err(err) => last_err = err,
        }
    }

    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_list_parsing() {
        let body = r#"{"data": [
            {"address": "https://bibliogram.example", "rss_enabled": true},
            {"address": "https://nope.example", "rss_enabled": false},
            {"address": "https://other.example", "rss_enabled": true}
        ]}"#;
        let info: InstanceInfo = serde_json::from_str(body).unwrap();
        let instances: Vec<String> = info
            .data
            .into_iter()
            .filter(|instance| instance.rss_enabled)
            .map(|instance| instance.address)
            .collect();
        assert_eq!(
            instances,
            vec!["https://bibliogram.example", "https://other.example"]
        );
    }

    #[tokio::test]
    async fn test_posts_lose_their_titles() {
        let feed = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel>
  <title>someone</title>
  <link>https://bibliogram.example/u/someone</link>
  <item>
    <title>ignored title</title>
    <link>/p/abc</link>
    <guid>abc</guid>
    <pubDate>Mon, 01 Jan 2024 10:00:00 GMT</pubDate>
    <description>pic</description>
  </item>
</channel></rss>"#;
        let parsed = feed_rs::parser::parse(feed.as_bytes()).unwrap();
        let base_url = Url::parse("https://bibliogram.example/u/someone/rss.xml").unwrap();

        let mut feed = super::super::rss::from_parsed("someone@instagram".into(), "instagram", parsed);
        for post in feed.posts_mut() {
            post.title = String::new();
            if let Ok(absolute) = base_url.join(&post.url) {
                post.url = absolute.to_string();
            }
        }

        use crate::feed::Feed as _;
        let post = feed.next().await.unwrap().unwrap();
        assert_eq!(post.title, "");
        assert_eq!(post.source, "instagram");
        assert_eq!(post.url, "https://bibliogram.example/p/abc");
    }
}

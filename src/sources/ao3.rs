//! Archive of Our Own work listings, scraped from the HTML.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::domain::{Post, Search};
use crate::error::{Error, Result};
use crate::feed::{Feed, FetchContext, Static};
use crate::sources::fetch_text;

static WORK_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("li.work").expect("work selector"));
static DATE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".datetime").expect("date selector"));
static TITLE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".header .heading a").expect("title selector"));
static AUTHOR_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#".header .heading a[rel="author"]"#).expect("author selector"));
static SUMMARY_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".summary").expect("summary selector"));
static FANDOM_TAGS_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".fandoms a.tag").expect("fandom tags selector"));
static REQUIRED_TAGS_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".required-tags li span.text").expect("required tags selector"));
static TAGS_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("ul.tags li .tag").expect("tags selector"));

static RELATIVE_HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href="/"#).expect("href regex"));

const BASE_URL: &str = "https://archiveofourown.org";

/// Open an AO3 listing; `name` is the listing URL (works of a user, a
/// fandom, a search, ...).
pub async fn open(ctx: FetchContext, name: String, _search: Search) -> Result<Box<dyn Feed>> {
    let mut url = Url::parse(&name).map_err(|err| Error::Other(format!("invalid feed url {name:?}: {err}")))?;

    // remove noise from the url so equivalent listings share a cache entry
    let query: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, value)| key != "commit" && key != "utf8" && !value.is_empty())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    url.set_query(None);
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &query {
            pairs.append_pair(key, value);
        }
    }

    let name = percent_encoding::percent_decode_str(url.as_str())
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| url.to_string());

    let body = fetch_text(&ctx, url.as_str()).await?;

    let posts = {
        let document = Html::parse_document(&body);
        document
            .select(&WORK_SELECTOR)
            .map(work_to_post)
            .collect::<Result<Vec<Post>>>()?
    };

    let mut feed = Static::new(name.clone(), posts);
    feed.feed_url = name;
    Ok(Box::new(feed))
}

fn work_to_post(work: ElementRef) -> Result<Post> {
    let id = work
        .value()
        .attr("id")
        .and_then(|id| id.strip_prefix("work_"))
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::FeedParse(format!("invalid id {:?}", work.value().attr("id"))))?;
    let post_url = format!("{BASE_URL}/works/{id}");

    let title = work
        .select(&TITLE_SELECTOR)
        .next()
        .map(element_text)
        .filter(|title| !title.is_empty())
        .ok_or_else(|| Error::FeedParse("no title".into()))?;
    let author = work
        .select(&AUTHOR_SELECTOR)
        .next()
        .map(element_text)
        .filter(|author| !author.is_empty())
        .ok_or_else(|| Error::FeedParse("no author".into()))?;

    let date_string = work
        .select(&DATE_SELECTOR)
        .next()
        .map(element_text)
        .ok_or_else(|| Error::FeedParse("no date".into()))?;
    let date = NaiveDate::parse_from_str(date_string.trim(), "%e %b %Y")
        .map_err(|err| Error::FeedParse(format!("invalid date {date_string:?}: {err}")))?
        .and_hms_opt(0, 0, 0)
        .expect("midnight")
        .and_utc();

    let description_html = work
        .select(&SUMMARY_SELECTOR)
        .next()
        .map(|summary| {
            RELATIVE_HREF_RE
                .replace_all(&summary.html(), format!(r#"href="{BASE_URL}/"#).as_str())
                .into_owned()
        })
        .unwrap_or_default();

    let mut tags: Vec<String> = Vec::new();
    for tag in work.select(&FANDOM_TAGS_SELECTOR) {
        tags.push(element_text(tag));
    }
    if tags.is_empty() {
        return Err(Error::FeedParse("no fandom tags".into()));
    }

    // required tags come as comma-joined groups; dedup against the
    // freeform tags that repeat them
    let mut seen: Vec<String> = Vec::new();
    let mut required = 0;
    for group in work.select(&REQUIRED_TAGS_SELECTOR) {
        required += 1;
        for tag in element_text(group).split(", ") {
            seen.push(tag.to_string());
            tags.push(tag.to_string());
        }
    }
    if required == 0 {
        return Err(Error::FeedParse("no required tags".into()));
    }

    let mut freeform = 0;
    for tag in work.select(&TAGS_SELECTOR) {
        freeform += 1;
        let tag = element_text(tag);
        if seen.contains(&tag) {
            continue;
        }
        tags.push(tag);
    }
    if freeform == 0 {
        return Err(Error::FeedParse("no tags".into()));
    }

    Ok(Post {
        source: "ao3".to_string(),
        id: id.to_string(),
        url: post_url.clone(),
        title: format!(r#"<h1><a href="{post_url}">{title}</a> by {author}</h1>"#),
        author,
        description_html,
        tags,
        date_string: date_string.trim().to_string(),
        date,
        ..Post::default()
    })
}

fn element_text(element: ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORK: &str = r#"<ol>
      <li id="work_7756009" class="work blurb group">
        <div class="header module">
          <h4 class="heading">
            <a href="/works/7756009">[VID] You Are A Runner And I Am My Father's Son</a>
            by <a rel="author" href="/users/astolat/pseuds/astolat">astolat</a>
          </h4>
          <h5 class="fandoms heading">
            <a class="tag" href="/tags/f1">Harry Potter - J. K. Rowling</a>
          </h5>
          <ul class="required-tags">
            <li><a><span class="text">Teen And Up Audiences</span></a></li>
            <li><a><span class="text">Choose Not To Use Archive Warnings</span></a></li>
            <li><a><span class="text">M/M</span></a></li>
            <li><a><span class="text">Complete Work</span></a></li>
          </ul>
          <p class="datetime">13 Aug 2016</p>
        </div>
        <h6 class="landmark heading">Tags</h6>
        <ul class="tags commas">
          <li><a class="tag">Creator Chose Not To Use Archive Warnings</a></li>
          <li><a class="tag">Draco Malfoy/Harry Potter</a></li>
          <li><a class="tag">M/M</a></li>
        </ul>
        <blockquote class="userstuff summary">
          <p>I&#39;ll draw three figures on your heart.</p>
          <p><a href="/collections/vividcon">for vividcon</a></p>
        </blockquote>
      </li>
    </ol>"#;

    #[test]
    fn test_work_blurb_becomes_post() {
        let document = Html::parse_document(WORK);
        let work = document.select(&WORK_SELECTOR).next().unwrap();

        let post = work_to_post(work).unwrap();
        assert_eq!(post.id, "7756009");
        assert_eq!(post.source, "ao3");
        assert_eq!(post.url, "https://archiveofourown.org/works/7756009");
        assert_eq!(post.author, "astolat");
        assert_eq!(post.date_string, "13 Aug 2016");
        assert_eq!(post.date, "2016-08-13T00:00:00Z".parse::<chrono::DateTime<chrono::Utc>>().unwrap());
        assert!(post.title.contains("[VID] You Are A Runner"), "{}", post.title);
        assert!(post.title.contains("by astolat"), "{}", post.title);
        assert!(
            post.description_html.contains("three figures on your heart"),
            "{}",
            post.description_html
        );
        // relative links become absolute
        assert!(
            post.description_html
                .contains(r#"href="https://archiveofourown.org/collections/vividcon""#),
            "{}",
            post.description_html
        );
    }

    #[test]
    fn test_tags_keep_order_and_dedup() {
        let document = Html::parse_document(WORK);
        let work = document.select(&WORK_SELECTOR).next().unwrap();

        let post = work_to_post(work).unwrap();
        assert_eq!(
            post.tags,
            vec![
                "Harry Potter - J. K. Rowling",
                "Teen And Up Audiences",
                "Choose Not To Use Archive Warnings",
                "M/M",
                "Complete Work",
                "Creator Chose Not To Use Archive Warnings",
                "Draco Malfoy/Harry Potter",
            ]
        );
    }

    #[test]
    fn test_work_without_id_is_an_error() {
        let document = Html::parse_document(r#"<ol><li class="work"></li></ol>"#);
        let work = document.select(&WORK_SELECTOR).next().unwrap();
        assert!(work_to_post(work).is_err());
    }
}

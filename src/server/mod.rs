//! HTTP surface: routes feed pages, the settings cookie and little else.
//!
//! The interesting work happens in the dispatcher, cache and merger; the
//! HTML emitted here is a deliberately plain article list.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::{COOKIE, LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use serde::Deserialize;

use crate::cache::FeedCache;
use crate::config::{Config, COOKIE_NAME, DISPLAY_LIMIT};
use crate::domain::{parse_terms, Post, Search};
use crate::error::Result;
use crate::feed::{merge, Feed, FetchContext};
use crate::sources;

#[derive(Clone)]
pub struct AppState {
    pub cache: FeedCache,
    pub client: reqwest::Client,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/robots.txt", get(robots))
        .route("/settings", post(save_settings))
        .route("/settings/clear", post(clear_settings))
        .route("/list/{list}", get(list_page))
        .route("/{feeds}", get(feeds_page))
        .route("/{feeds}/tagged/{tag}", get(tagged_page))
        .with_state(state)
}

/// Feeds that are explicitly selected, plus the searches that filter them.
#[derive(Debug, Default)]
pub struct Settings {
    pub selected_feeds: Vec<String>,
    /// Feed-specific filters, e.g. `somefeed noreblogs` in the feed list.
    pub searches: HashMap<String, Search>,
    /// A persistent search (`* ...` in the feed list) applied to all feeds.
    pub global_search: Search,
}

/// Parse the feed list entries. Each entry is a feed name, optionally
/// followed by search terms; `*` addresses all feeds.
pub fn parse_settings(feeds: &[String]) -> Settings {
    let mut settings = Settings::default();

    for entry in feeds {
        // a search starts after the first space past the routing suffix
        let split_at = entry.find('@').unwrap_or(0);
        let (name, search) = match entry[split_at..].find(' ') {
            Some(space) => {
                let (name, rest) = entry.split_at(split_at + space);
                (name, &rest[1..])
            }
            None => (entry.as_str(), ""),
        };

        if !search.is_empty() {
            let search = parse_terms(search);
            if name == "*" {
                settings.global_search = search;
                continue;
            }
            settings.searches.insert(name.to_string(), search);
        }

        settings.selected_feeds.push(name.to_string());
    }

    settings
}

/// Parse the search from query parameters (`search`, `before`, `fresh`).
pub fn search_from_query(query: &[(String, String)]) -> Search {
    let get = |key: &str| {
        query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    };

    let force_fresh = !get("fresh").is_empty();
    let before = get("before");
    let raw_search = get("search");

    if before.is_empty() && raw_search.is_empty() {
        return Search {
            force_fresh,
            ..Search::default()
        };
    }

    let mut search = parse_terms(raw_search);
    search.before_id = before.to_string();
    search.force_fresh = force_fresh;
    search
}

fn query_pairs(uri: &Uri) -> Vec<(String, String)> {
    url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(COOKIE)?.to_str().ok()?;
    for cookie in cookies.split(';') {
        let (key, value) = cookie.trim().split_once('=')?;
        if key == name {
            return Some(value.to_string());
        }
    }
    None
}

/// The feed names for this request: query > path > cookie > defaults.
fn selected_feed_names(
    state: &AppState,
    headers: &HeaderMap,
    query: &[(String, String)],
    path_feeds: Option<&str>,
    list: Option<&str>,
) -> Vec<String> {
    let from_query: Vec<String> = query
        .iter()
        .filter(|(k, _)| k == "feeds")
        .map(|(_, v)| v.clone())
        .collect();
    if !from_query.is_empty() {
        return from_query;
    }

    if let Some(feeds) = path_feeds {
        if !feeds.is_empty() {
            return feeds.split(',').map(str::to_string).collect();
        }
    }

    let cookie_name = match list {
        Some(list) => format!("{COOKIE_NAME}-list-{list}"),
        None => COOKIE_NAME.to_string(),
    };
    if let Some(value) = cookie_value(headers, &cookie_name) {
        if !value.is_empty() {
            return value.split(',').map(str::to_string).collect();
        }
    }

    state.config.default_feeds()
}

async fn index(State(state): State<AppState>, headers: HeaderMap, uri: Uri) -> Response {
    serve_feeds(state, headers, uri, None, None, None).await
}

async fn feeds_page(
    State(state): State<AppState>,
    Path(feeds): Path<String>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    serve_feeds(state, headers, uri, Some(feeds), None, None).await
}

async fn tagged_page(
    State(state): State<AppState>,
    Path((feeds, tag)): Path<(String, String)>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    serve_feeds(state, headers, uri, Some(feeds), Some(tag), None).await
}

async fn list_page(
    State(state): State<AppState>,
    Path(list): Path<String>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    serve_feeds(state, headers, uri, None, None, Some(list)).await
}

async fn serve_feeds(
    state: AppState,
    headers: HeaderMap,
    uri: Uri,
    path_feeds: Option<String>,
    tag: Option<String>,
    list: Option<String>,
) -> Response {
    let query = query_pairs(&uri);

    // ?feed=name redirects to the feed page itself
    if let Some((_, feed)) = query.iter().find(|(k, v)| k == "feed" && !v.is_empty()) {
        return Redirect::to(&format!("/{feed}")).into_response();
    }

    let names = selected_feed_names(
        &state,
        &headers,
        &query,
        path_feeds.as_deref(),
        list.as_deref(),
    );
    let settings = parse_settings(&names);

    let mut search = search_from_query(&query);
    if let Some(tag) = &tag {
        search.active = true;
        search.tags.push(tag.to_lowercase());
    }

    let limit = query
        .iter()
        .find(|(k, _)| k == "limit")
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(DISPLAY_LIMIT);

    let ctx = FetchContext::new(state.client.clone());

    // open all selected feeds concurrently
    let opens = settings.selected_feeds.iter().map(|name| {
        let ctx = ctx.clone();
        let cache = state.cache.clone();
        let search = search.clone();
        async move {
            if name.starts_with(':') {
                return None;
            }
            match sources::open_any(&ctx, name, &cache, &search).await {
                Ok(feed) => Some(Ok(feed)),
                Err(err) => Some(Err(err)),
            }
        }
    });
    let opened = futures::future::join_all(opens).await;

    let mut feeds: Vec<Box<dyn Feed>> = Vec::with_capacity(opened.len());
    let mut open_errors = Vec::new();
    for result in opened.into_iter().flatten() {
        match result {
            Ok(feed) => feeds.push(feed),
            Err(err) => {
                tracing::warn!("open: {err}");
                open_errors.push(err.to_string());
            }
        }
    }

    // per-feed annotations (cached, timeout, not-found) for the footer
    let notes = feeds
        .iter()
        .filter(|feed| !feed.notes().is_empty())
        .map(|feed| format!("{} ({})", feed.name(), feed.notes()))
        .collect::<Vec<_>>()
        .join(", ");

    let mut merged = merge(feeds);
    let page = match select_posts(&mut merged, &search, &settings, limit).await {
        Ok(page) => page,
        Err(err) => {
            tracing::error!("iterating feeds: {err}");
            open_errors.push(err.to_string());
            Selection::default()
        }
    };
    let title = page_title(&settings, path_feeds.as_deref(), list.as_deref());
    if let Err(err) = merged.close().await {
        tracing::error!("closing {:?}: {err}", settings.selected_feeds);
    }

    let body = render_page(&title, &page, &open_errors, &notes, &query, &settings);
    Html(body).into_response()
}

#[derive(Debug, Default)]
pub struct Selection {
    pub posts: Vec<PostView>,
    pub last_id: Option<String>,
}

#[derive(Debug)]
pub struct PostView {
    pub post: Post,
    /// The search that hid this post, if any; hidden posts stay in the
    /// stream but render collapsed.
    pub hidden_by: Option<String>,
}

/// Pull posts from the merged feed: skip past the pagination cursor,
/// apply the searches, stop at the display limit.
pub async fn select_posts(
    feed: &mut dyn Feed,
    search: &Search,
    settings: &Settings,
    limit: usize,
) -> Result<Selection> {
    let mut selection = Selection::default();

    let next_visible = |post: &Post| {
        // feeds searched with `skip` elide non-matching posts entirely
        if settings.global_search.skip && !settings.global_search.matches(post) {
            return false;
        }
        if let Some(filter) = settings.searches.get(&post.author) {
            if filter.skip && !filter.matches(post) {
                return false;
            }
        }
        true
    };

    // skip ahead to the pagination cursor
    if !search.before_id.is_empty() {
        while let Some(post) = feed.next().await? {
            if post.id <= search.before_id {
                break;
            }
        }
    }

    while let Some(post) = feed.next().await? {
        if !next_visible(&post) {
            continue;
        }
        if !search.matches(&post) {
            continue;
        }

        let hidden_by = if !settings.global_search.matches(&post) {
            Some(settings.global_search.to_string())
        } else {
            settings
                .searches
                .get(&post.author)
                .filter(|filter| !filter.matches(&post))
                .map(|filter| filter.to_string())
        };

        selection.last_id = Some(post.id.clone());
        selection.posts.push(PostView { post, hidden_by });

        if selection.posts.len() >= limit {
            break;
        }
    }

    Ok(selection)
}

fn page_title(settings: &Settings, path_feeds: Option<&str>, list: Option<&str>) -> String {
    if let Some(list) = list {
        return list.to_string();
    }
    if path_feeds.is_none() {
        return "everything".to_string();
    }
    settings.selected_feeds.join(",")
}

fn render_page(
    title: &str,
    page: &Selection,
    errors: &[String],
    notes: &str,
    query: &[(String, String)],
    settings: &Settings,
) -> String {
    let mut body = String::with_capacity(16 * 1024);

    let _ = write!(
        body,
        r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8" />
<meta name="viewport" content="width=device-width,minimum-scale=1,initial-scale=1" />
<title>{title}</title>
</head>
<body>
<header><h1>{title}</h1></header>
"#,
        title = html_escape::encode_text(title)
    );

    for error in errors {
        let _ = write!(
            body,
            "<code style=\"color: red; font-weight: bold;\">could not load feed: {}</code>\n",
            html_escape::encode_text(error)
        );
    }

    let raw_search = query
        .iter()
        .find(|(k, _)| k == "search")
        .map(|(_, v)| v.as_str())
        .unwrap_or("");
    let _ = write!(
        body,
        r#"<form method="GET"><input aria-label="search posts" name="search" type="search" value="{}" placeholder="noreblog #art ..." /></form>
"#,
        html_escape::encode_double_quoted_attribute(raw_search)
    );

    for view in &page.posts {
        let post = &view.post;
        let mut classes = Vec::with_capacity(3);
        if post.is_reblog() {
            classes.push("reblog");
        }
        classes.push(post.source.as_str());
        if view.hidden_by.is_some() {
            classes.push("hidden");
        }

        let _ = write!(body, "<article class=\"{}\">\n", classes.join(" "));
        let _ = write!(
            body,
            "<p><a class=\"author\" href=\"/{author}\">{author}</a>:</p>\n",
            author = html_escape::encode_text(&post.author)
        );

        match &view.hidden_by {
            Some(hidden_by) => {
                let _ = write!(
                    body,
                    "<section class=\"post-content\"><p>hidden by \"{}\"</p></section>\n",
                    html_escape::encode_text(hidden_by.trim())
                );
            }
            None => {
                // title and description are sanitized upstream fragments
                let _ = write!(
                    body,
                    "<section class=\"post-content\">{}{}</section>\n",
                    post.title, post.description_html
                );
            }
        }

        body.push_str("<footer>");
        if !post.tags.is_empty() {
            body.push_str("<ul class=\"tags\">");
            for tag in &post.tags {
                let _ = write!(
                    body,
                    "<li><a href=\"/{author}/tagged/{tag}\">#{tag}</a></li> ",
                    author = html_escape::encode_text(&post.author),
                    tag = html_escape::encode_text(tag)
                );
            }
            body.push_str("</ul>");
        }
        let _ = write!(
            body,
            "<time datetime=\"{}\">{}</time> by <a href=\"/{author}\">{author}</a>, <a href=\"{url}\">post</a>",
            post.date.to_rfc3339(),
            html_escape::encode_text(&post.date_string),
            author = html_escape::encode_text(&post.author),
            url = html_escape::encode_double_quoted_attribute(&post.url)
        );
        body.push_str("</footer>\n</article>\n");
    }

    if let Some(last_id) = &page.last_id {
        let mut next = format!("?before={}", last_id);
        if !raw_search.is_empty() {
            let _ = write!(
                next,
                "&search={}",
                url::form_urlencoded::byte_serialize(raw_search.as_bytes()).collect::<String>()
            );
        }
        let _ = write!(
            body,
            "<div class=\"next-page\"><a href=\"{}\">next page</a></div>\n",
            html_escape::encode_double_quoted_attribute(&next)
        );
    }

    let _ = write!(
        body,
        r#"<form method="POST" action="/settings">
<label for="feeds">Feeds to view by default</label>:
<div class="field"><textarea rows="{}" cols="30" name="feeds">{}</textarea></div>
<input type="submit" value="Save" />
</form>
"#,
        settings.selected_feeds.len() + 1,
        html_escape::encode_text(&settings.selected_feeds.join("\n"))
    );

    if !notes.is_empty() {
        let _ = write!(
            body,
            "<footer><details><summary>Feed notes</summary><code>{}</code></details></footer>\n",
            html_escape::encode_text(notes)
        );
    }

    body.push_str("</body>\n</html>\n");
    body
}

async fn robots() -> &'static str {
    "User-agent: *\nDisallow: /\n"
}

#[derive(Debug, Deserialize)]
struct SettingsForm {
    #[serde(default)]
    list: String,
    #[serde(default)]
    feeds: String,
}

async fn save_settings(Form(form): Form<SettingsForm>) -> Response {
    let cookie_value = form
        .feeds
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(",");

    let (redirect, cookie_name) = if form.list.is_empty() {
        ("/".to_string(), COOKIE_NAME.to_string())
    } else {
        (
            format!("/list/{}", form.list),
            format!("{COOKIE_NAME}-list-{}", form.list),
        )
    };

    if cookie_value.is_empty() {
        return Redirect::temporary(&redirect).into_response();
    }

    let cookie = format!(
        "{cookie_name}={cookie_value}; Max-Age={}; SameSite=Lax; HttpOnly; Path=/",
        365 * 24 * 60 * 60
    );
    (
        StatusCode::SEE_OTHER,
        [(SET_COOKIE, cookie), (LOCATION, redirect)],
    )
        .into_response()
}

async fn clear_settings() -> Response {
    let cookie = format!("{COOKIE_NAME}=; Max-Age=0; SameSite=Lax; HttpOnly; Path=/");
    (
        StatusCode::SEE_OTHER,
        [(SET_COOKIE, cookie), (LOCATION, "/".to_string())],
    )
        .into_response()
}

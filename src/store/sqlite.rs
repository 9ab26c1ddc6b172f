use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::domain::{Post, Search};
use crate::error::{Error, Result};

/// Metadata row for a cached feed.
#[derive(Debug, Clone)]
pub struct FeedInfo {
    pub name: String,
    pub url: String,
    pub cached_at: DateTime<Utc>,
    pub description: String,
    /// Last error seen when fetching the feed, empty if the last fetch
    /// succeeded.
    pub error: String,
}

const POST_COLUMNS: &str =
    "source, id, author, avatar_url, url, title, description_html, tags, date_string, date";

/// The on-disk post store.
///
/// A single connection guarded by a mutex; all transactions are short, so
/// writers never starve readers for long.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open the database at `path`. The empty path maps to an in-memory
    /// database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path.is_empty() {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        let store = Store {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        Self::open("")
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn()?;
        // journal_mode, busy_timeout and journal_size_limit report their
        // new value as a row, read it off instead of using execute
        conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;
        conn.query_row("PRAGMA busy_timeout = 50", [], |_row| Ok(()))?;
        conn.execute_batch("PRAGMA auto_vacuum = INCREMENTAL")?;
        conn.query_row("PRAGMA journal_size_limit = 1073741824", [], |_row| Ok(()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS feed_infos ( name TEXT PRIMARY KEY, url TEXT, cached_at DATE, description TEXT, error TEXT )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS posts ( source TEXT, name TEXT, id TEXT, author TEXT, avatar_url TEXT, url TEXT, title TEXT, description_html TEXT, tags TEXT, date_string TEXT, date DATE, PRIMARY KEY (source, name, id))",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS posts_by_author_and_date ON posts (author, date)",
            [],
        )?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|err| Error::Other(format!("database lock poisoned: {err}")))
    }

    /// Look up the cache metadata for `name`.
    pub fn feed_info(&self, name: &str) -> Result<Option<FeedInfo>> {
        let conn = self.conn()?;
        let info = conn
            .query_row(
                "SELECT name, url, cached_at, description, error FROM feed_infos WHERE name = ?1",
                params![name],
                |row| {
                    Ok(FeedInfo {
                        name: row.get(0)?,
                        url: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        cached_at: row.get(2)?,
                        description: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                        error: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(info)
    }

    fn post_from_row(row: &Row) -> rusqlite::Result<Post> {
        let tags: String = row.get(7)?;
        Ok(Post {
            source: row.get(0)?,
            id: row.get(1)?,
            author: row.get(2)?,
            avatar_url: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            url: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            title: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            description_html: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
            tags: serde_json::from_str(&tags).unwrap_or_default(),
            date_string: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
            date: row.get(9)?,
        })
    }

    fn query_posts(&self, sql: &str, args: Vec<Value>) -> Result<Vec<Post>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let posts = stmt
            .query_map(params_from_iter(args), Self::post_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(posts)
    }

    /// Read cached posts for `name`, pushing the cheapest prefix of the
    /// search down into the query. The full predicate is re-checked in
    /// memory by the consumer, so pushdown only ever narrows the scan.
    ///
    /// Returns the posts and the predicate tags for the feed notes.
    pub fn cached_posts(
        &self,
        name: &str,
        search: &Search,
    ) -> Result<(Vec<Post>, Vec<&'static str>)> {
        const NO_REBLOGS: &str = r#"description_html NOT LIKE '%class="tumblr_blog"%'"#;

        let (sql, args, note): (String, Vec<Value>, Option<&'static str>) =
            if !search.before_id.is_empty() {
                if search.no_reblogs {
                    (
                        format!("SELECT {POST_COLUMNS} FROM posts WHERE author = ?1 AND id < ?2 AND {NO_REBLOGS} ORDER BY id DESC LIMIT 20"),
                        vec![name.to_string().into(), search.before_id.clone().into()],
                        Some("before"),
                    )
                } else {
                    (
                        format!("SELECT {POST_COLUMNS} FROM posts WHERE author = ?1 AND id < ?2 ORDER BY date DESC LIMIT 20"),
                        vec![name.to_string().into(), search.before_id.clone().into()],
                        Some("before"),
                    )
                }
            } else if let Some(term) = search.terms.first() {
                let like = format!("%{term}%");
                (
                    format!("SELECT {POST_COLUMNS} FROM posts WHERE author = ?1 AND (title LIKE ?2 OR description_html LIKE ?2 OR tags LIKE ?2) ORDER BY date DESC LIMIT 20"),
                    vec![name.to_string().into(), like.into()],
                    Some("terms"),
                )
            } else if let Some(tag) = search.tags.first() {
                let like = format!("%{tag}%");
                (
                    format!("SELECT {POST_COLUMNS} FROM posts WHERE author = ?1 AND tags LIKE ?2 ORDER BY date DESC LIMIT 20"),
                    vec![name.to_string().into(), like.into()],
                    Some("tags"),
                )
            } else if search.no_reblogs {
                (
                    format!("SELECT {POST_COLUMNS} FROM posts WHERE author = ?1 AND {NO_REBLOGS} ORDER BY date DESC LIMIT 20"),
                    vec![name.to_string().into()],
                    Some("no-reblogs"),
                )
            } else {
                (
                    format!("SELECT {POST_COLUMNS} FROM posts WHERE author = ?1 ORDER BY date DESC LIMIT 20"),
                    vec![name.to_string().into()],
                    None,
                )
            };

        let posts = self.query_posts(&sql, args)?;
        Ok((posts, note.into_iter().collect()))
    }

    /// Cached posts for the degraded path after an upstream failure; only
    /// the pagination cursor is honoured here.
    pub fn fallback_posts(&self, name: &str, search: &Search) -> Result<Vec<Post>> {
        if !search.before_id.is_empty() {
            self.query_posts(
                &format!("SELECT {POST_COLUMNS} FROM posts WHERE author = ?1 AND id < ?2 ORDER BY date DESC LIMIT 20"),
                vec![name.to_string().into(), search.before_id.clone().into()],
            )
        } else {
            self.query_posts(
                &format!("SELECT {POST_COLUMNS} FROM posts WHERE author = ?1 ORDER BY date DESC LIMIT 20"),
                vec![name.to_string().into()],
            )
        }
    }

    /// Posts for the `random` pseudo-feed: 20 random authors, one random
    /// post each, in random order. Not uniform over posts, but cheap.
    pub fn random_posts(&self) -> Result<Vec<Post>> {
        self.query_posts(
            &format!("SELECT {POST_COLUMNS} FROM posts WHERE author IN (SELECT name FROM feed_infos ORDER BY RANDOM() LIMIT 20) GROUP BY author ORDER BY RANDOM() LIMIT 20"),
            Vec::new(),
        )
    }

    /// Persist one full iteration of a feed: all posts in a single
    /// multi-row upsert plus the feed_infos row, atomically.
    ///
    /// A post with an empty id or source fails the whole save.
    pub fn save_feed(
        &self,
        name: &str,
        url: &str,
        description: &str,
        cached_at: DateTime<Utc>,
        posts: &[Post],
    ) -> Result<()> {
        if posts.is_empty() {
            return Ok(());
        }

        let mut values = String::with_capacity(posts.len() * 36);
        let mut args: Vec<Value> = Vec::with_capacity(posts.len() * 11);
        for (i, post) in posts.iter().enumerate() {
            if post.id.is_empty() {
                return Err(Error::Other(format!("empty post id: {post:?}")));
            }
            if post.source.is_empty() {
                return Err(Error::Other(format!("empty post source: {post:?}")));
            }

            if i > 0 {
                values.push_str(", ");
            }
            values.push_str("(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)");

            args.push(post.source.clone().into());
            args.push(name.to_string().into());
            args.push(post.id.clone().into());
            args.push(post.author.clone().into());
            args.push(post.avatar_url.clone().into());
            args.push(post.url.clone().into());
            args.push(post.title.clone().into());
            args.push(post.description_html.clone().into());
            args.push(serde_json::to_string(&post.tags)?.into());
            args.push(post.date_string.clone().into());
            args.push(post.date.to_rfc3339().into());
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            &format!("INSERT OR REPLACE INTO posts VALUES {values}"),
            params_from_iter(args),
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO feed_infos VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, url, cached_at, description, ""],
        )?;
        tx.commit()?;

        Ok(())
    }

    /// Remember that fetching `name` failed. The error-sticky cache serves
    /// the stored copy regardless of age until a fetch succeeds again.
    pub fn record_error(&self, name: &str, url: &str, error: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO feed_infos VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, url, Utc::now(), "", error],
        )?;
        Ok(())
    }

    /// Names of feeds whose cache is older than `older_than`, in random
    /// order, at most `limit` of them.
    pub fn list_older_than(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM feed_infos WHERE ?1 > cached_at ORDER BY RANDOM() LIMIT ?2",
        )?;
        let names = stmt
            .query_map(params![older_than, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    pub fn incremental_vacuum(&self) -> Result<()> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("PRAGMA incremental_vacuum")?;
        let mut rows = stmt.query([])?;
        while rows.next()?.is_some() {}
        Ok(())
    }

    pub fn wal_checkpoint(&self) -> Result<()> {
        self.conn()?
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_row| Ok(()))?;
        Ok(())
    }
}

/// True for the transient lock errors that are worth retrying a commit on.
pub fn is_busy(err: &Error) -> bool {
    match err {
        Error::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status code: {0}")]
    Status(u16),

    #[error("feed parse error: {0}")]
    FeedParse(String),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("{name}: {source}")]
    Feed {
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap an error with the name of the feed it came from.
    pub fn for_feed(name: &str, err: Error) -> Error {
        Error::Feed {
            name: name.to_string(),
            source: Box::new(err),
        }
    }

    /// The HTTP status code carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Status(code) => Some(*code),
            Error::Http(err) => err.status().map(|s| s.as_u16()),
            Error::Feed { source, .. } => source.status(),
            _ => None,
        }
    }

    /// True if the upstream was unreachable or too slow, including DNS
    /// failures. Used to decide whether stale cached content should be
    /// served instead of surfacing the error.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::DeadlineExceeded => true,
            Error::Http(err) => err.is_timeout() || err.is_connect(),
            Error::Feed { source, .. } => source.is_timeout(),
            // adapter errors that wrap an OS-level message lose their
            // structure, match the two known renderings
            Error::Other(msg) | Error::FeedParse(msg) => {
                msg.contains("Temporary failure in name resolution")
                    || msg.ends_with("i/o timeout")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_extraction() {
        assert_eq!(Error::Status(404).status(), Some(404));
        assert_eq!(
            Error::for_feed("staff", Error::Status(404)).status(),
            Some(404)
        );
        assert_eq!(Error::Other("nope".into()).status(), None);
    }

    #[test]
    fn test_timeout_classification() {
        assert!(Error::DeadlineExceeded.is_timeout());
        assert!(Error::for_feed("staff", Error::DeadlineExceeded).is_timeout());
        assert!(Error::Other("lookup host: Temporary failure in name resolution".into()).is_timeout());
        assert!(Error::Other("read tcp 1.2.3.4: i/o timeout".into()).is_timeout());
        assert!(!Error::Other("random error".into()).is_timeout());
        assert!(!Error::Status(500).is_timeout());
    }
}

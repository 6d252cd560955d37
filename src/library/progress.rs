//! Reading progress and timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point in time as written by either a client or a store.
///
/// Clients write epoch milliseconds, stores assign `{seconds, nanos}`, and
/// older records carry RFC 3339 strings. All of them compare through
/// [`Timestamp::millis`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    /// Client-assigned epoch milliseconds.
    Millis(i64),
    /// Client-assigned epoch milliseconds written as a float.
    FractionalMillis(f64),
    /// Server-assigned time.
    Server {
        /// Whole seconds since the epoch.
        #[serde(alias = "_seconds")]
        seconds: i64,
        /// Sub-second part.
        #[serde(default, alias = "_nanoseconds")]
        nanos: u32,
    },
    /// RFC 3339 text.
    Text(String),
}

impl Timestamp {
    /// Client time now.
    pub fn now() -> Self {
        Timestamp::Millis(Utc::now().timestamp_millis())
    }

    /// Epoch milliseconds, or `None` for unparseable text.
    pub fn to_millis(&self) -> Option<i64> {
        match self {
            Timestamp::Millis(ms) => Some(*ms),
            Timestamp::FractionalMillis(ms) => Some(*ms as i64),
            Timestamp::Server { seconds, nanos } => {
                Some(seconds * 1000 + i64::from(*nanos / 1_000_000))
            }
            Timestamp::Text(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.timestamp_millis()),
        }
    }

    /// Epoch milliseconds for ordering. Unparseable values sort oldest.
    pub fn millis(&self) -> i64 {
        self.to_millis().unwrap_or(i64::MIN)
    }
}

/// Where a reader stopped in one book, with display fields cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingProgress {
    /// Book being read.
    pub book_id: String,

    /// Last chapter opened.
    pub last_read_chapter: u32,

    /// When it was opened.
    pub last_read_at: Timestamp,

    /// Book title.
    #[serde(default)]
    pub title: Option<String>,

    /// Book author.
    #[serde(default)]
    pub author: Option<String>,

    /// Cover URL.
    #[serde(default)]
    pub cover_ref: Option<String>,

    /// Primary genre.
    #[serde(default)]
    pub genre: Option<String>,

    /// Whether the record came from the remote store. Set on load.
    #[serde(default, skip_deserializing)]
    pub is_remote: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_representations_normalize() {
        let client: Timestamp = serde_json::from_str("1700000000123").unwrap();
        let server: Timestamp =
            serde_json::from_str(r#"{"seconds":1700000000,"nanos":123000000}"#).unwrap();
        let exported: Timestamp =
            serde_json::from_str(r#"{"_seconds":1700000000,"_nanoseconds":123000000}"#).unwrap();
        let text: Timestamp = serde_json::from_str(r#""2023-11-14T22:13:20.123Z""#).unwrap();

        assert_eq!(client.millis(), 1_700_000_000_123);
        assert_eq!(server.millis(), 1_700_000_000_123);
        assert_eq!(exported.millis(), 1_700_000_000_123);
        assert_eq!(text.millis(), 1_700_000_000_123);
    }

    #[test]
    fn test_unparseable_text_sorts_oldest() {
        let ts = Timestamp::Text("yesterday".into());
        assert_eq!(ts.to_millis(), None);
        assert_eq!(ts.millis(), i64::MIN);
    }

    #[test]
    fn test_is_remote_not_read_from_documents() {
        let progress: ReadingProgress = serde_json::from_str(
            r#"{"bookId":"b","lastReadChapter":3,"lastReadAt":5,"isRemote":true}"#,
        )
        .unwrap();
        assert!(!progress.is_remote);
        assert_eq!(progress.last_read_chapter, 3);
    }
}

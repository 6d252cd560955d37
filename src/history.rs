//! Reading history: progress writes and the merged timeline.

use crate::error::Result;
use crate::library::{Book, ReadingProgress, device_history_path, remote_history_path};
use crate::store::{Document, DocumentStore, SetOptions, from_document, server_timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Who is reading, and on which device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderIdentity {
    /// This device.
    pub device_id: String,
    /// Signed-in reader, if any.
    pub user_id: Option<String>,
}

impl ReaderIdentity {
    /// Anonymous reader on a device.
    pub fn anonymous(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            user_id: None,
        }
    }

    /// Signed-in reader on a device.
    pub fn signed_in(device_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            user_id: Some(user_id.into()),
        }
    }

    /// Signed-in reader id, ignoring blank values.
    pub fn user(&self) -> Option<&str> {
        self.user_id
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }
}

/// Book fields cached on progress records for display without a book lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayFields {
    /// Title.
    pub title: Option<String>,
    /// Author.
    pub author: Option<String>,
    /// Cover URL.
    pub cover_ref: Option<String>,
    /// Primary genre.
    pub genre: Option<String>,
}

impl From<&Book> for DisplayFields {
    fn from(book: &Book) -> Self {
        Self {
            title: Some(book.title.clone()),
            author: Some(book.author_display().to_string()),
            cover_ref: book.cover_ref.clone(),
            genre: book.primary_genre().map(String::from),
        }
    }
}

/// Merge remote and device history into one timeline, newest first.
///
/// A remote entry replaces any local entry for the same book. Equal
/// timestamps keep remote entries ahead of local ones.
pub fn merge(remote: Vec<ReadingProgress>, local: Vec<ReadingProgress>) -> Vec<ReadingProgress> {
    let remote_ids: HashSet<String> = remote.iter().map(|p| p.book_id.clone()).collect();

    let mut merged: Vec<ReadingProgress> = remote
        .into_iter()
        .map(|mut p| {
            p.is_remote = true;
            p
        })
        .chain(
            local
                .into_iter()
                .filter(|p| !remote_ids.contains(&p.book_id))
                .map(|mut p| {
                    p.is_remote = false;
                    p
                }),
        )
        .collect();

    // stable: ties keep remote-then-local order
    merged.sort_by(|a, b| b.last_read_at.millis().cmp(&a.last_read_at.millis()));
    merged
}

/// Writes and reads progress records for readers.
#[derive(Clone)]
pub struct HistoryRecorder {
    remote: Arc<dyn DocumentStore>,
    local: Arc<dyn DocumentStore>,
}

impl HistoryRecorder {
    /// Create a recorder over the shared and device stores.
    pub fn new(remote: Arc<dyn DocumentStore>, local: Arc<dyn DocumentStore>) -> Self {
        Self { remote, local }
    }

    /// Store and collection a reader's progress is written to.
    fn destination(&self, reader: &ReaderIdentity) -> (&dyn DocumentStore, String, bool) {
        match reader.user() {
            Some(user) => (self.remote.as_ref(), remote_history_path(user), true),
            None => (
                self.local.as_ref(),
                device_history_path(&reader.device_id),
                false,
            ),
        }
    }

    /// Upsert the reader's progress for a book.
    pub async fn record(
        &self,
        reader: &ReaderIdentity,
        book_id: &str,
        chapter_number: u32,
        display: &DisplayFields,
    ) -> Result<()> {
        let (store, collection, remote) = self.destination(reader);

        let mut doc = Document::new();
        doc.insert("bookId".into(), Value::from(book_id));
        doc.insert("lastReadChapter".into(), Value::from(chapter_number));
        let read_at = if remote {
            server_timestamp()
        } else {
            Value::from(chrono::Utc::now().timestamp_millis())
        };
        doc.insert("lastReadAt".into(), read_at);

        // absent fields leave the stored values alone
        for (field, value) in [
            ("title", &display.title),
            ("author", &display.author),
            ("coverRef", &display.cover_ref),
            ("genre", &display.genre),
        ] {
            if let Some(value) = value {
                doc.insert(field.into(), Value::from(value.as_str()));
            }
        }

        store
            .set(&collection, book_id, doc, SetOptions::merge())
            .await?;

        tracing::debug!(
            book_id = %book_id,
            chapter = chapter_number,
            remote,
            "Recorded reading progress"
        );
        Ok(())
    }

    /// Merged history for a reader. Remote history is read only when signed in.
    pub async fn load(&self, reader: &ReaderIdentity) -> Result<Vec<ReadingProgress>> {
        let remote = match reader.user() {
            Some(user) => Self::read_all(self.remote.as_ref(), &remote_history_path(user)).await?,
            None => Vec::new(),
        };
        let local =
            Self::read_all(self.local.as_ref(), &device_history_path(&reader.device_id)).await?;

        Ok(merge(remote, local))
    }

    /// Remove the reader's record for a book. Returns whether one existed.
    pub async fn forget(&self, reader: &ReaderIdentity, book_id: &str) -> Result<bool> {
        let (store, collection, _) = self.destination(reader);
        let removed = store.delete(&collection, book_id).await?;
        if removed {
            tracing::info!(book_id = %book_id, "Removed reading progress");
        }
        Ok(removed)
    }

    async fn read_all(store: &dyn DocumentStore, collection: &str) -> Result<Vec<ReadingProgress>> {
        let docs = store.query(collection, &[], None).await?;

        Ok(docs
            .into_iter()
            .filter_map(|(id, mut doc)| {
                doc.entry("bookId").or_insert_with(|| Value::from(id.as_str()));
                match from_document::<ReadingProgress>(doc) {
                    Ok(progress) => Some(progress),
                    Err(e) => {
                        tracing::warn!(collection, id = %id, error = %e, "Skipping malformed progress record");
                        None
                    }
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::Timestamp;
    use crate::store::SqliteDocumentStore;

    fn progress(book_id: &str, at: Timestamp) -> ReadingProgress {
        ReadingProgress {
            book_id: book_id.into(),
            last_read_chapter: 1,
            last_read_at: at,
            title: Some(book_id.to_uppercase()),
            author: None,
            cover_ref: None,
            genre: None,
            is_remote: false,
        }
    }

    fn ids(list: &[ReadingProgress]) -> Vec<(&str, bool)> {
        list.iter().map(|p| (p.book_id.as_str(), p.is_remote)).collect()
    }

    #[test]
    fn test_remote_wins_over_local() {
        let remote = vec![progress("x", Timestamp::Millis(1_000))];
        let local = vec![
            progress("x", Timestamp::Millis(500)),
            progress("y", Timestamp::Millis(2_000)),
        ];

        let merged = merge(remote, local);
        assert_eq!(ids(&merged), vec![("y", false), ("x", true)]);
    }

    #[test]
    fn test_remote_wins_even_when_local_is_newer() {
        let merged = merge(
            vec![progress("x", Timestamp::Millis(1))],
            vec![progress("x", Timestamp::Millis(9))],
        );
        assert_eq!(merged.len(), 1);
        assert!(merged[0].is_remote);
        assert_eq!(merged[0].last_read_at, Timestamp::Millis(1));
    }

    #[test]
    fn test_heterogeneous_timestamps_and_ties() {
        let remote = vec![
            progress("a", Timestamp::Server {
                seconds: 2,
                nanos: 0,
            }),
            progress("b", Timestamp::Text("1970-01-01T00:00:03Z".into())),
        ];
        let local = vec![
            progress("c", Timestamp::Millis(2_000)),
            progress("d", Timestamp::FractionalMillis(2_500.0)),
        ];

        let merged = merge(remote, local);
        assert_eq!(
            ids(&merged),
            vec![("b", true), ("d", false), ("a", true), ("c", false)]
        );
    }

    #[tokio::test]
    async fn test_anonymous_writes_stay_on_device() {
        let remote = Arc::new(SqliteDocumentStore::open_memory().unwrap());
        let local = Arc::new(SqliteDocumentStore::open_memory().unwrap());
        let recorder = HistoryRecorder::new(remote.clone(), local.clone());
        let reader = ReaderIdentity::anonymous("dev-1");

        recorder
            .record(&reader, "book", 3, &DisplayFields::default())
            .await
            .unwrap();
        recorder
            .record(&reader, "book", 4, &DisplayFields::default())
            .await
            .unwrap();

        assert_eq!(local.count(&device_history_path("dev-1")).unwrap(), 1);
        assert_eq!(remote.count(&remote_history_path("dev-1")).unwrap(), 0);

        let history = recorder.load(&reader).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].last_read_chapter, 4);
        assert!(!history[0].is_remote);
    }

    #[tokio::test]
    async fn test_signed_in_writes_remote_with_server_time() {
        let remote = Arc::new(SqliteDocumentStore::open_memory().unwrap());
        let local = Arc::new(SqliteDocumentStore::open_memory().unwrap());
        let recorder = HistoryRecorder::new(remote.clone(), local.clone());
        let reader = ReaderIdentity::signed_in("dev-1", "reader-9");

        let display = DisplayFields {
            title: Some("Test Saga".into()),
            ..DisplayFields::default()
        };
        recorder.record(&reader, "saga", 2, &display).await.unwrap();
        recorder
            .record(&reader, "saga", 3, &DisplayFields::default())
            .await
            .unwrap();

        let doc = remote
            .get(&remote_history_path("reader-9"), "saga")
            .await
            .unwrap()
            .unwrap();
        assert!(doc["lastReadAt"]["seconds"].is_i64());
        assert_eq!(doc["lastReadChapter"], 3);
        assert_eq!(doc["title"], "Test Saga");
        assert_eq!(local.count(&device_history_path("dev-1")).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_load_merges_device_history_after_sign_in() {
        let remote = Arc::new(SqliteDocumentStore::open_memory().unwrap());
        let local = Arc::new(SqliteDocumentStore::open_memory().unwrap());
        let recorder = HistoryRecorder::new(remote.clone(), local.clone());

        let anonymous = ReaderIdentity::anonymous("dev-1");
        recorder
            .record(&anonymous, "old", 1, &DisplayFields::default())
            .await
            .unwrap();
        recorder
            .record(&anonymous, "shared", 1, &DisplayFields::default())
            .await
            .unwrap();

        let signed_in = ReaderIdentity::signed_in("dev-1", "reader-9");
        recorder
            .record(&signed_in, "shared", 7, &DisplayFields::default())
            .await
            .unwrap();

        let history = recorder.load(&signed_in).await.unwrap();
        let shared: Vec<_> = history.iter().filter(|p| p.book_id == "shared").collect();
        assert_eq!(history.len(), 2);
        assert_eq!(shared.len(), 1);
        assert!(shared[0].is_remote);
        assert_eq!(shared[0].last_read_chapter, 7);

        assert!(recorder.forget(&anonymous, "old").await.unwrap());
        assert!(!recorder.forget(&anonymous, "old").await.unwrap());
    }
}

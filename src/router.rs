//! Decide where an upload is stored and write it there.
//!
//! Routing is a pure function of the caller's tier and preference. The two
//! write paths are [`CloudWriter`] and [`LocalWriter`], both reached through
//! [`PersistenceRouter`], which re-checks authorization on every call.

use crate::auth::ContributorTier;
use crate::cover::NormalizedAsset;
use crate::error::{AppError, Result};
use crate::library::{BOOKS, Book, Chapter, StorageTarget, Timestamp, chapters_path};
use crate::store::{BlobStore, DocumentStore, SetOptions, server_timestamp, to_document};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Where the uploader asked the book to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetPreference {
    /// Shared catalog.
    Cloud,
    /// This device only.
    Local,
}

/// Why a routing decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoutingReason {
    /// The caller may publish and asked to.
    CloudPermitted,
    /// The caller asked for local storage.
    LocalRequested,
    /// The caller asked for cloud storage but may not publish.
    UnapprovedTier,
}

/// Effective target of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    /// Store the upload goes to.
    pub target: StorageTarget,
    /// Why.
    pub reason: RoutingReason,
}

/// Route an upload. Unapproved callers always land in local storage.
pub fn route(tier: ContributorTier, preference: TargetPreference) -> RoutingDecision {
    match (preference, tier.may_publish()) {
        (TargetPreference::Cloud, true) => RoutingDecision {
            target: StorageTarget::Remote,
            reason: RoutingReason::CloudPermitted,
        },
        (TargetPreference::Cloud, false) => RoutingDecision {
            target: StorageTarget::Local,
            reason: RoutingReason::UnapprovedTier,
        },
        (TargetPreference::Local, _) => RoutingDecision {
            target: StorageTarget::Local,
            reason: RoutingReason::LocalRequested,
        },
    }
}

/// Reject a cloud write from a caller that may not publish.
pub fn authorize(target: StorageTarget, tier: ContributorTier) -> Result<()> {
    if target == StorageTarget::Remote && !tier.may_publish() {
        return Err(AppError::AuthorizationViolation);
    }
    Ok(())
}

/// Result of a complete persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistReport {
    /// Identifier the book was stored under.
    pub book_id: String,
    /// Store written to.
    pub target: StorageTarget,
    /// Chapters written in this call.
    pub chapters_written: usize,
    /// Cover URL stored on the book, if any.
    pub cover_ref: Option<String>,
}

/// One storage target's write path.
#[async_trait]
pub trait PersistStrategy: Send + Sync {
    /// Store this strategy writes to.
    fn target(&self) -> StorageTarget;

    /// Write cover, book record and chapters.
    async fn persist(
        &self,
        book: Book,
        chapters: Vec<Chapter>,
        cover: Option<NormalizedAsset>,
    ) -> Result<PersistReport>;

    /// Upsert chapters of an existing book, returning how many were written.
    async fn write_chapters(&self, book_id: &str, chapters: &[Chapter]) -> Result<usize>;
}

/// Stores and retry policy shared by both write paths.
#[derive(Clone)]
struct Stores {
    docs: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    write_attempts: u32,
}

impl Stores {
    /// Upload the cover. Failure leaves the book without one.
    async fn upload_cover(&self, book: &mut Book, cover: Option<NormalizedAsset>) {
        let Some(cover) = cover else {
            return;
        };

        let path = format!("covers/{}.{}", book.id, cover.extension);
        match self
            .blobs
            .upload(&path, cover.bytes, &cover.content_type)
            .await
        {
            Ok(url) => {
                book.cover_ref = Some(url);
                book.cover_media_type = Some(cover.media_type);
            }
            Err(e) => {
                tracing::warn!(book_id = %book.id, error = %e, "Cover upload failed, continuing without cover");
                book.cover_ref = None;
                book.cover_media_type = None;
            }
        }
    }

    /// Book record as written. The view counter is only ever incremented.
    fn book_document(book: &Book) -> Result<crate::store::Document> {
        let mut doc = to_document(book)?;
        doc.remove("views");
        Ok(doc)
    }

    async fn write_chapter(&self, collection: &str, chapter: &Chapter) -> Result<()> {
        let doc = to_document(chapter)?;
        let key = Chapter::key(chapter.chapter_number);
        let attempts = self.write_attempts.max(1);

        let mut attempt = 1;
        loop {
            match self
                .docs
                .set(collection, &key, doc.clone(), SetOptions::replace())
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    tracing::debug!(
                        chapter = chapter.chapter_number,
                        attempt,
                        error = %e,
                        "Chapter write failed, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write chapters concurrently, collecting every failure.
    async fn write_chapters(
        &self,
        target: StorageTarget,
        book_id: &str,
        chapters: &[Chapter],
    ) -> Result<usize> {
        let collection = chapters_path(book_id);

        let writes = chapters.iter().map(|chapter| {
            let collection = collection.as_str();
            async move {
                let result = if chapter.book_id == book_id {
                    self.write_chapter(collection, chapter).await
                } else {
                    let mut owned = chapter.clone();
                    owned.book_id = book_id.to_string();
                    self.write_chapter(collection, &owned).await
                };
                (chapter.chapter_number, result)
            }
        });

        let mut saved = 0;
        let mut failed = Vec::new();
        for (chapter_number, result) in join_all(writes).await {
            match result {
                Ok(()) => saved += 1,
                Err(e) => {
                    tracing::warn!(book_id = %book_id, chapter = chapter_number, error = %e, "Chapter write failed");
                    failed.push(chapter_number);
                }
            }
        }

        if failed.is_empty() {
            tracing::info!(book_id = %book_id, target = %target, chapters = saved, "Chapters written");
            return Ok(saved);
        }

        failed.sort_unstable();
        Err(AppError::PartialWrite {
            book_id: book_id.to_string(),
            target,
            saved,
            failed,
        })
    }
}

fn highest_chapter(chapters: &[Chapter]) -> u32 {
    chapters.iter().map(|c| c.chapter_number).max().unwrap_or(0)
}

fn check_chapters(chapters: &[Chapter]) -> Result<()> {
    if chapters.is_empty() {
        return Err(AppError::EmptyManuscript);
    }
    if chapters.iter().any(|c| c.chapter_number == 0) {
        return Err(AppError::InvalidInput("Chapter numbers start at 1".into()));
    }
    Ok(())
}

/// Writes to the shared catalog.
#[derive(Clone)]
pub struct CloudWriter {
    stores: Stores,
}

impl CloudWriter {
    /// Create a writer over the shared document and blob stores.
    pub fn new(docs: Arc<dyn DocumentStore>, blobs: Arc<dyn BlobStore>, write_attempts: u32) -> Self {
        Self {
            stores: Stores {
                docs,
                blobs,
                write_attempts,
            },
        }
    }
}

#[async_trait]
impl PersistStrategy for CloudWriter {
    fn target(&self) -> StorageTarget {
        StorageTarget::Remote
    }

    async fn persist(
        &self,
        mut book: Book,
        chapters: Vec<Chapter>,
        cover: Option<NormalizedAsset>,
    ) -> Result<PersistReport> {
        check_chapters(&chapters)?;
        book.storage_target = StorageTarget::Remote;
        book.total_chapters = book.total_chapters.max(highest_chapter(&chapters));

        self.stores.upload_cover(&mut book, cover).await;

        let mut doc = Stores::book_document(&book)?;
        doc.insert("createdAt".into(), server_timestamp());
        self.stores
            .docs
            .set(BOOKS, &book.id, doc, SetOptions::merge())
            .await?;

        let written = self
            .stores
            .write_chapters(StorageTarget::Remote, &book.id, &chapters)
            .await?;

        Ok(PersistReport {
            book_id: book.id,
            target: StorageTarget::Remote,
            chapters_written: written,
            cover_ref: book.cover_ref,
        })
    }

    async fn write_chapters(&self, book_id: &str, chapters: &[Chapter]) -> Result<usize> {
        self.stores
            .write_chapters(StorageTarget::Remote, book_id, chapters)
            .await
    }
}

/// Writes to the on-device store, merging into an existing book.
#[derive(Clone)]
pub struct LocalWriter {
    stores: Stores,
}

impl LocalWriter {
    /// Create a writer over the device's document and blob stores.
    pub fn new(docs: Arc<dyn DocumentStore>, blobs: Arc<dyn BlobStore>, write_attempts: u32) -> Self {
        Self {
            stores: Stores {
                docs,
                blobs,
                write_attempts,
            },
        }
    }
}

#[async_trait]
impl PersistStrategy for LocalWriter {
    fn target(&self) -> StorageTarget {
        StorageTarget::Local
    }

    async fn persist(
        &self,
        mut book: Book,
        chapters: Vec<Chapter>,
        cover: Option<NormalizedAsset>,
    ) -> Result<PersistReport> {
        check_chapters(&chapters)?;
        book.storage_target = StorageTarget::Local;
        book.total_chapters = book.total_chapters.max(highest_chapter(&chapters));

        let had_cover = cover.is_some();
        self.stores.upload_cover(&mut book, cover).await;

        let existing = self.stores.docs.get(BOOKS, &book.id).await?;
        if let Some(existing) = &existing {
            let stored_total = existing
                .get("totalChapters")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0);
            book.total_chapters = book.total_chapters.max(stored_total);

            if !had_cover && book.cover_ref.is_none() {
                book.cover_ref = existing
                    .get("coverRef")
                    .and_then(Value::as_str)
                    .map(String::from);
                book.cover_media_type = existing
                    .get("coverMediaType")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok());
            }

            tracing::info!(
                book_id = %book.id,
                stored_total,
                total = book.total_chapters,
                "Merging into existing local book"
            );
        }

        let mut doc = Stores::book_document(&book)?;
        match existing.as_ref().and_then(|e| e.get("createdAt")) {
            Some(created) if !created.is_null() => {
                doc.insert("createdAt".into(), created.clone());
            }
            _ => {
                let created = serde_json::to_value(Timestamp::now())
                    .map_err(|e| AppError::Internal(e.to_string()))?;
                doc.insert("createdAt".into(), created);
            }
        }
        self.stores
            .docs
            .set(BOOKS, &book.id, doc, SetOptions::merge())
            .await?;

        let written = self
            .stores
            .write_chapters(StorageTarget::Local, &book.id, &chapters)
            .await?;

        Ok(PersistReport {
            book_id: book.id,
            target: StorageTarget::Local,
            chapters_written: written,
            cover_ref: book.cover_ref,
        })
    }

    async fn write_chapters(&self, book_id: &str, chapters: &[Chapter]) -> Result<usize> {
        self.stores
            .write_chapters(StorageTarget::Local, book_id, chapters)
            .await
    }
}

/// Entry point for all writes. Enforces the publishing rule itself.
#[derive(Clone)]
pub struct PersistenceRouter {
    cloud: Arc<dyn PersistStrategy>,
    local: Arc<dyn PersistStrategy>,
}

impl PersistenceRouter {
    /// Create a router over both strategies.
    pub fn new(cloud: Arc<dyn PersistStrategy>, local: Arc<dyn PersistStrategy>) -> Self {
        Self { cloud, local }
    }

    /// Strategy for a target.
    pub fn strategy(&self, target: StorageTarget) -> &dyn PersistStrategy {
        match target {
            StorageTarget::Remote => self.cloud.as_ref(),
            StorageTarget::Local => self.local.as_ref(),
        }
    }

    /// Persist to an explicit target.
    pub async fn persist_to(
        &self,
        target: StorageTarget,
        tier: ContributorTier,
        book: Book,
        chapters: Vec<Chapter>,
        cover: Option<NormalizedAsset>,
    ) -> Result<PersistReport> {
        authorize(target, tier)?;

        tracing::info!(
            book_id = %book.id,
            target = %target,
            chapters = chapters.len(),
            "Persisting book"
        );
        self.strategy(target).persist(book, chapters, cover).await
    }

    /// Re-write only the chapters that failed previously.
    pub async fn retry_chapters(
        &self,
        target: StorageTarget,
        tier: ContributorTier,
        book_id: &str,
        chapters: &[Chapter],
    ) -> Result<usize> {
        authorize(target, tier)?;
        check_chapters(chapters)?;

        tracing::info!(book_id = %book_id, target = %target, chapters = chapters.len(), "Retrying chapters");
        self.strategy(target).write_chapters(book_id, chapters).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cover::MediaType;
    use crate::store::{FsBlobStore, SqliteDocumentStore};
    use crate::tests::FaultyStore;

    const TIERS: [ContributorTier; 3] = [
        ContributorTier::Admin,
        ContributorTier::ApprovedContributor,
        ContributorTier::Unapproved,
    ];

    fn chapter(book_id: &str, n: u32) -> Chapter {
        Chapter {
            book_id: book_id.into(),
            chapter_number: n,
            title: Some(format!("Chapter {}", n)),
            content: format!("<p>Content {}</p>", n),
        }
    }

    fn cover() -> NormalizedAsset {
        NormalizedAsset {
            bytes: vec![0xFF, 0xD8, 0xFF],
            media_type: MediaType::Image,
            content_type: "image/jpeg".into(),
            extension: "jpg",
            dimensions: Some((1, 1)),
        }
    }

    #[test]
    fn test_unapproved_always_routes_local() {
        for preference in [TargetPreference::Cloud, TargetPreference::Local] {
            let decision = route(ContributorTier::Unapproved, preference);
            assert_eq!(decision.target, StorageTarget::Local);
        }
        assert_eq!(
            route(ContributorTier::Unapproved, TargetPreference::Cloud).reason,
            RoutingReason::UnapprovedTier
        );
    }

    #[test]
    fn test_route_table() {
        for tier in TIERS {
            let decision = route(tier, TargetPreference::Local);
            assert_eq!(decision.target, StorageTarget::Local);
            assert_eq!(decision.reason, RoutingReason::LocalRequested);
        }
        for tier in [ContributorTier::Admin, ContributorTier::ApprovedContributor] {
            let decision = route(tier, TargetPreference::Cloud);
            assert_eq!(decision.target, StorageTarget::Remote);
            assert_eq!(decision.reason, RoutingReason::CloudPermitted);
        }
    }

    #[tokio::test]
    async fn test_cloud_write_for_unapproved_is_rejected() {
        let docs = Arc::new(SqliteDocumentStore::open_memory().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FsBlobStore::new(dir.path(), "/assets"));
        let cloud = Arc::new(CloudWriter::new(docs.clone(), blobs.clone(), 2));
        let local = Arc::new(LocalWriter::new(docs.clone(), blobs, 2));
        let router = PersistenceRouter::new(cloud, local);

        let book = Book::new("x_y_1", "Y", "X", StorageTarget::Remote);
        let result = router
            .persist_to(
                StorageTarget::Remote,
                ContributorTier::Unapproved,
                book,
                vec![chapter("x_y_1", 1)],
                None,
            )
            .await;

        assert!(matches!(result, Err(AppError::AuthorizationViolation)));
        assert_eq!(docs.count(BOOKS).unwrap(), 0);

        let retry = router
            .retry_chapters(
                StorageTarget::Remote,
                ContributorTier::Unapproved,
                "x_y_1",
                &[chapter("x_y_1", 1)],
            )
            .await;
        assert!(matches!(retry, Err(AppError::AuthorizationViolation)));
    }

    #[tokio::test]
    async fn test_cloud_persist_writes_cover_book_and_chapters() {
        let docs = Arc::new(SqliteDocumentStore::open_memory().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FsBlobStore::new(dir.path(), "/assets"));
        let writer = CloudWriter::new(docs.clone(), blobs, 2);

        let book = Book::new("a_b_7", "B", "A", StorageTarget::Remote);
        let report = writer
            .persist(book, vec![chapter("a_b_7", 1), chapter("a_b_7", 3)], Some(cover()))
            .await
            .unwrap();

        assert_eq!(report.chapters_written, 2);
        assert_eq!(report.cover_ref.as_deref(), Some("/assets/covers/a_b_7.jpg"));
        assert!(dir.path().join("covers/a_b_7.jpg").exists());

        let stored = docs.get(BOOKS, "a_b_7").await.unwrap().unwrap();
        assert_eq!(stored["totalChapters"], 3);
        assert_eq!(stored["storageTarget"], "remote");
        assert_eq!(stored["coverMediaType"], "image");
        assert!(stored["createdAt"]["seconds"].is_i64());
        assert!(stored.get("views").is_none());

        let ch3 = docs.get(&chapters_path("a_b_7"), "3").await.unwrap().unwrap();
        assert_eq!(ch3["chapterNumber"], 3);
        assert_eq!(ch3["bookId"], "a_b_7");
    }

    #[tokio::test]
    async fn test_local_merge_keeps_cover_created_at_and_max_total() {
        let docs = Arc::new(SqliteDocumentStore::open_memory().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FsBlobStore::new(dir.path(), "/local"));
        let writer = LocalWriter::new(docs.clone(), blobs, 2);

        let book = || Book::new("a_b", "B", "A", StorageTarget::Local);
        writer
            .persist(book(), vec![chapter("a_b", 5)], Some(cover()))
            .await
            .unwrap();
        let first = docs.get(BOOKS, "a_b").await.unwrap().unwrap();

        let report = writer
            .persist(book(), vec![chapter("a_b", 2)], None)
            .await
            .unwrap();
        let second = docs.get(BOOKS, "a_b").await.unwrap().unwrap();

        assert_eq!(report.cover_ref.as_deref(), Some("/local/covers/a_b.jpg"));
        assert_eq!(second["totalChapters"], 5);
        assert_eq!(second["coverRef"], first["coverRef"]);
        assert_eq!(second["createdAt"], first["createdAt"]);
        assert_eq!(docs.count(&chapters_path("a_b")).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let docs = Arc::new(FaultyStore::new());
        docs.fail_writes(&chapters_path("a_b"), "2", 1);
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FsBlobStore::new(dir.path(), "/local"));
        let writer = LocalWriter::new(docs.clone(), blobs, 2);

        let written = writer
            .persist(
                Book::new("a_b", "B", "A", StorageTarget::Local),
                vec![chapter("a_b", 1), chapter("a_b", 2)],
                None,
            )
            .await
            .unwrap()
            .chapters_written;

        assert_eq!(written, 2);
        assert!(docs.get(&chapters_path("a_b"), "2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_empty_chapter_list_writes_nothing() {
        let docs = Arc::new(SqliteDocumentStore::open_memory().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FsBlobStore::new(dir.path(), "/local"));
        let writer = LocalWriter::new(docs.clone(), blobs, 2);

        let result = writer
            .persist(Book::new("a_b", "B", "A", StorageTarget::Local), vec![], None)
            .await;

        assert!(matches!(result, Err(AppError::EmptyManuscript)));
        assert_eq!(docs.count(BOOKS).unwrap(), 0);
    }
}

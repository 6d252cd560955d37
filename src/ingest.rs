//! Upload orchestration: extract, route, identify, normalize, persist.

use crate::auth::ContributorTier;
use crate::cover::{AssetNormalizer, AssetProfile, NormalizedAsset};
use crate::error::{AppError, Result};
use crate::formats::{self, Manuscript, ManuscriptSource};
use crate::identity;
use crate::library::Book;
use crate::router::{PersistReport, PersistenceRouter, RoutingDecision, TargetPreference, route};
use serde::Serialize;

/// One upload as received from a contributor.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Manuscript file or pasted text.
    pub source: ManuscriptSource,
    /// Title; taken from the container when absent.
    pub title: Option<String>,
    /// Author; taken from the container when absent.
    pub author: Option<String>,
    /// Genres; taken from the container when empty.
    pub genres: Vec<String>,
    /// Raw cover image or clip.
    pub cover: Option<Vec<u8>>,
    /// Caller tier from the authorization collaborator.
    pub tier: ContributorTier,
    /// Where the caller asked the book to go.
    pub preference: TargetPreference,
}

/// Result of a successful upload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    /// Routing decision taken.
    pub decision: RoutingDecision,
    /// What was written.
    pub report: PersistReport,
    /// Chapters under the sparse-text threshold.
    pub sparse_chapters: usize,
}

/// Runs uploads end to end.
#[derive(Clone)]
pub struct Ingestor {
    router: PersistenceRouter,
    normalizer: AssetNormalizer,
    clock: fn() -> i64,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Ingestor {
    /// Create an ingestor.
    pub fn new(router: PersistenceRouter, normalizer: AssetNormalizer) -> Self {
        Self {
            router,
            normalizer,
            clock: now_millis,
        }
    }

    /// Replace the clock used for cloud identifiers.
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    /// Router used for writes and retries.
    pub fn router(&self) -> &PersistenceRouter {
        &self.router
    }

    /// Extract, route and persist one upload.
    ///
    /// Nothing is written when extraction or identity resolution fails.
    pub async fn upload(&self, request: UploadRequest) -> Result<UploadOutcome> {
        let UploadRequest {
            source,
            title,
            author,
            genres,
            cover,
            tier,
            preference,
        } = request;

        let manuscript = Self::extract(source).await?;
        let sparse_chapters = manuscript.sparse_count();
        if sparse_chapters > 0 {
            tracing::info!(
                sparse = sparse_chapters,
                total = manuscript.chapters.len(),
                "Manuscript has chapters under the text threshold"
            );
        }

        let highest_chapter = manuscript.highest_chapter_number();
        let Manuscript { chapters, metadata } = manuscript;

        let title = non_blank(title).or(metadata.title).unwrap_or_default();
        let author = non_blank(author)
            .or_else(|| (!metadata.authors.is_empty()).then(|| metadata.authors.join(", ")))
            .unwrap_or_default();
        let genres = if genres.is_empty() {
            metadata.genres
        } else {
            genres
        };

        let decision = route(tier, preference);
        let book_id = identity::resolve(&author, &title, decision.target, (self.clock)())?;

        tracing::info!(
            book_id = %book_id,
            target = %decision.target,
            reason = ?decision.reason,
            chapters = chapters.len(),
            highest_chapter,
            "Routing upload"
        );

        let cover = match cover.or(metadata.cover) {
            Some(bytes) => self.normalize_cover(bytes).await,
            None => None,
        };

        let book = Book::new(book_id.as_str(), title, author, decision.target).with_genres(genres);
        let chapters = chapters
            .into_iter()
            .map(|c| c.into_chapter(&book_id))
            .collect();

        let report = self
            .router
            .persist_to(decision.target, tier, book, chapters, cover)
            .await?;

        Ok(UploadOutcome {
            decision,
            report,
            sparse_chapters,
        })
    }

    /// Container parsing is CPU-bound, so it runs off the async workers.
    async fn extract(source: ManuscriptSource) -> Result<Manuscript> {
        tokio::task::spawn_blocking(move || formats::extract(&source))
            .await
            .map_err(|e| AppError::Internal(format!("Extraction task failed: {}", e)))?
    }

    /// Best effort. A cover that cannot be normalized is dropped.
    async fn normalize_cover(&self, bytes: Vec<u8>) -> Option<NormalizedAsset> {
        let normalizer = self.normalizer.clone();
        let result =
            tokio::task::spawn_blocking(move || normalizer.normalize(&bytes, AssetProfile::Cover))
                .await;

        match result {
            Ok(Ok(asset)) => Some(asset),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Cover could not be normalized, continuing without it");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cover task failed, continuing without it");
                None
            }
        }
    }
}

//! HTTP request handlers.

use crate::config::{ManuscriptFormat, SourceArg};
use crate::error::{AppError, Result, WriteError};
use crate::formats::ManuscriptSource;
use crate::history::ReaderIdentity;
use crate::ingest::{UploadOutcome, UploadRequest};
use crate::library::{Chapter, ReadingProgress, StorageTarget};
use crate::reader::PrefetchReport;
use crate::router::TargetPreference;
use crate::server::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

/// Header carrying the signed-in reader id.
pub const READER_HEADER: &str = "x-reader-id";

/// Header carrying the device id.
pub const DEVICE_HEADER: &str = "x-device-id";

// ============================================================================
// UPLOADS
// ============================================================================

/// Manuscript upload request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadBody {
    title: Option<String>,
    author: Option<String>,
    #[serde(default)]
    genres: Vec<String>,
    format: Option<ManuscriptFormat>,
    content_base64: Option<String>,
    text: Option<String>,
    chapter_number: Option<u32>,
    chapter_title: Option<String>,
    cover_base64: Option<String>,
    #[serde(default = "default_target")]
    target: TargetPreference,
}

fn default_target() -> TargetPreference {
    TargetPreference::Local
}

fn decode_base64(field: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value.trim())
        .map_err(|e| AppError::InvalidInput(format!("{} is not valid base64: {}", field, e)))
}

/// Upload a manuscript.
pub async fn upload_manuscript(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UploadBody>,
) -> std::result::Result<(StatusCode, Json<UploadOutcome>), WriteError> {
    let reader_id = header_value(&headers, READER_HEADER);
    let tier = state.authorizer.tier(reader_id.as_deref());

    let source = match (body.text, body.content_base64) {
        (Some(text), None) => ManuscriptSource::text(text),
        (None, Some(encoded)) => {
            let data = decode_base64("contentBase64", &encoded)?;
            match body.format.unwrap_or(ManuscriptFormat::Epub) {
                ManuscriptFormat::Epub => ManuscriptSource::epub(data),
                ManuscriptFormat::Txt => {
                    ManuscriptSource::text(String::from_utf8_lossy(&data).into_owned())
                }
            }
        }
        _ => {
            return Err(AppError::InvalidInput(
                "Provide exactly one of text or contentBase64".into(),
            )
            .into());
        }
    }
    .with_chapter_number(body.chapter_number)
    .with_chapter_title(body.chapter_title);

    let cover = body
        .cover_base64
        .as_deref()
        .map(|c| decode_base64("coverBase64", c))
        .transpose()?;

    tracing::info!(
        reader = ?reader_id,
        tier = ?tier,
        format = source.format.mime_type(),
        "Manuscript upload"
    );

    let outcome = state
        .ingestor
        .upload(UploadRequest {
            source,
            title: body.title,
            author: body.author,
            genres: body.genres,
            cover,
            tier,
            preference: body.target,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(outcome)))
}

/// Chapter retry request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryBody {
    target: StorageTarget,
    chapters: Vec<Chapter>,
}

/// Retry response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResponse {
    book_id: String,
    chapters_written: usize,
}

/// Re-write chapters that failed during an upload.
pub async fn retry_chapters(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(book_id): Path<String>,
    Json(body): Json<RetryBody>,
) -> std::result::Result<Json<RetryResponse>, WriteError> {
    let reader_id = header_value(&headers, READER_HEADER);
    let tier = state.authorizer.tier(reader_id.as_deref());

    let written = state
        .ingestor
        .router()
        .retry_chapters(body.target, tier, &book_id, &body.chapters)
        .await?;

    Ok(Json(RetryResponse {
        book_id,
        chapters_written: written,
    }))
}

// ============================================================================
// READING
// ============================================================================

/// Store selection for reads.
#[derive(Debug, Deserialize)]
pub struct SourceQuery {
    source: Option<SourceArg>,
}

/// Chapter response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterResponse {
    chapter: Chapter,
    preloaded: usize,
}

/// Read a chapter.
pub async fn get_chapter(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((book_id, chapter_number)): Path<(String, u32)>,
    Query(query): Query<SourceQuery>,
) -> Result<Json<ChapterResponse>> {
    let reader = reader_identity(&headers)?;
    let target = query.source.map(StorageTarget::from).unwrap_or(StorageTarget::Remote);
    let window = state.config.reader.prefetch_window;

    let shelf = state.shelf(&reader, target);
    let mut shelf = shelf.lock().await;
    let session = shelf.open(&book_id);
    let chapter = session.get(chapter_number).await?;
    let preloaded = session.preloaded_count(chapter_number.saturating_add(1), window);

    Ok(Json(ChapterResponse { chapter, preloaded }))
}

/// Prefetch query.
#[derive(Debug, Deserialize)]
pub struct PrefetchQuery {
    start: u32,
    count: Option<u32>,
    source: Option<SourceArg>,
}

/// Prefetch response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchResponse {
    #[serde(flatten)]
    report: PrefetchReport,
    preloaded: usize,
}

/// Prefetch a range of chapters into the reader's session.
pub async fn prefetch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(book_id): Path<String>,
    Query(query): Query<PrefetchQuery>,
) -> Result<Json<PrefetchResponse>> {
    let reader = reader_identity(&headers)?;
    let target = query.source.map(StorageTarget::from).unwrap_or(StorageTarget::Remote);
    let count = query.count.unwrap_or(state.config.reader.prefetch_window);

    let shelf = state.shelf(&reader, target);
    let mut shelf = shelf.lock().await;
    let session = shelf.open(&book_id);
    let report = session.prefetch_range(query.start, count).await;
    let preloaded = session.preloaded_count(query.start, count);

    Ok(Json(PrefetchResponse { report, preloaded }))
}

// ============================================================================
// HISTORY
// ============================================================================

/// Merged reading history.
pub async fn get_history(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ReadingProgress>>> {
    let reader = reader_identity(&headers)?;
    Ok(Json(state.history.load(&reader).await?))
}

/// Remove a book from the reader's history.
pub async fn forget_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(book_id): Path<String>,
) -> Result<StatusCode> {
    let reader = reader_identity(&headers)?;
    if state.history.forget(&reader, &book_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("No history for {}", book_id)))
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Non-blank header value.
fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Reader identity from the request headers. The device id is required.
fn reader_identity(headers: &HeaderMap) -> Result<ReaderIdentity> {
    let device_id = header_value(headers, DEVICE_HEADER)
        .ok_or_else(|| AppError::InvalidInput("Missing X-Device-Id header".to_string()))?;

    Ok(ReaderIdentity {
        device_id,
        user_id: header_value(headers, READER_HEADER),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_reader_identity_requires_device() {
        let mut headers = HeaderMap::new();
        assert!(reader_identity(&headers).is_err());

        headers.insert(DEVICE_HEADER, HeaderValue::from_static("dev-1"));
        headers.insert(READER_HEADER, HeaderValue::from_static("  "));
        let reader = reader_identity(&headers).unwrap();
        assert_eq!(reader, ReaderIdentity::anonymous("dev-1"));

        headers.insert(READER_HEADER, HeaderValue::from_static("reader-9"));
        let reader = reader_identity(&headers).unwrap();
        assert_eq!(reader, ReaderIdentity::signed_in("dev-1", "reader-9"));
    }

    #[test]
    fn test_upload_body_defaults_to_local() {
        let body: UploadBody =
            serde_json::from_str(r#"{"title":"T","text":"Once upon a time"}"#).unwrap();
        assert_eq!(body.target, TargetPreference::Local);
        assert!(body.genres.is_empty());
    }
}

//! Document and blob store abstractions.
//!
//! The pipeline only talks to storage through [`DocumentStore`] and
//! [`BlobStore`]. Both the device-local store and the shared catalog
//! implement the same traits; which one a write lands in is decided by the
//! persistence router, never by the store.

mod blob;
mod sqlite;

pub use blob::FsBlobStore;
pub use sqlite::SqliteDocumentStore;

use crate::error::{AppError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

/// A stored document: a JSON object.
pub type Document = Map<String, Value>;

/// Most ids a single `get_many` or `Filter::In` call may carry.
pub const MAX_KEYS_PER_CALL: usize = 10;

/// Field name marking a value the store replaces with its own write time.
const SERVER_TIMESTAMP_KEY: &str = "$serverTimestamp";

/// Placeholder value resolved to a server-assigned timestamp on write.
pub fn server_timestamp() -> Value {
    json!({ SERVER_TIMESTAMP_KEY: true })
}

fn is_server_timestamp(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|o| o.len() == 1 && o.get(SERVER_TIMESTAMP_KEY) == Some(&Value::Bool(true)))
}

/// Options for [`DocumentStore::set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Merge top-level fields into an existing document instead of replacing it.
    pub merge: bool,
}

impl SetOptions {
    /// Merge into an existing document.
    pub fn merge() -> Self {
        Self { merge: true }
    }

    /// Replace any existing document.
    pub fn replace() -> Self {
        Self { merge: false }
    }
}

/// Query filter on a top-level field.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Field equals value.
    Eq(String, Value),
    /// Field equals one of the values. At most [`MAX_KEYS_PER_CALL`] values.
    In(String, Vec<Value>),
}

impl Filter {
    /// Equality filter.
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    /// Membership filter.
    pub fn within<V: Into<Value>>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In(
            field.to_string(),
            values.into_iter().map(Into::into).collect(),
        )
    }

    /// Check whether a document passes this filter.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Eq(field, expected) => doc
                .get(field)
                .is_some_and(|actual| values_equal(actual, expected)),
            Filter::In(field, candidates) => doc
                .get(field)
                .is_some_and(|actual| candidates.iter().any(|c| values_equal(actual, c))),
        }
    }
}

/// Numbers compare by value, so `5` and `5.0` are equal.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Reject batch requests over the per-call key limit.
pub(crate) fn check_batch(len: usize) -> Result<()> {
    if len > MAX_KEYS_PER_CALL {
        return Err(AppError::Storage(format!(
            "Batch of {} keys exceeds the limit of {} per call",
            len, MAX_KEYS_PER_CALL
        )));
    }
    Ok(())
}

/// Validate filters before running a query.
pub(crate) fn check_filters(filters: &[Filter]) -> Result<()> {
    for filter in filters {
        if let Filter::In(_, values) = filter {
            check_batch(values.len())?;
        }
    }
    Ok(())
}

/// Document store operations the pipeline relies on.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read one document.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Write one document, merging or replacing.
    async fn set(&self, collection: &str, id: &str, data: Document, options: SetOptions)
    -> Result<()>;

    /// Documents in a collection matching every filter, ordered by id.
    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        limit: Option<usize>,
    ) -> Result<Vec<(String, Document)>>;

    /// Documents with the given ids. At most [`MAX_KEYS_PER_CALL`] ids.
    async fn get_many(&self, collection: &str, ids: &[String]) -> Result<Vec<(String, Document)>>;

    /// Add `by` to a numeric field, creating it at `by` when absent.
    async fn increment(&self, collection: &str, id: &str, field: &str, by: i64) -> Result<()>;

    /// Delete one document. Returns whether it existed.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;
}

/// Blob store operations the pipeline relies on.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes at `path`, returning a URL for them.
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;
}

/// Strictly increasing write clock for server timestamps.
#[derive(Debug, Default)]
pub(crate) struct ServerClock {
    last_nanos: Mutex<i64>,
}

impl ServerClock {
    /// Next timestamp, never equal to or before the previous one.
    pub(crate) fn next(&self) -> Value {
        let now = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX);
        let mut last = self.last_nanos.lock();
        let nanos = if now > *last { now } else { *last + 1 };
        *last = nanos;

        json!({
            "seconds": nanos.div_euclid(1_000_000_000),
            "nanos": nanos.rem_euclid(1_000_000_000),
        })
    }
}

/// Combine an incoming write with the stored document.
pub(crate) fn apply_set(
    existing: Option<Document>,
    mut data: Document,
    options: SetOptions,
    clock: &ServerClock,
) -> Document {
    for value in data.values_mut() {
        if is_server_timestamp(value) {
            *value = clock.next();
        }
    }

    match existing {
        Some(mut current) if options.merge => {
            current.extend(data);
            current
        }
        _ => data,
    }
}

/// Serialize a record into a document.
pub fn to_document<T: Serialize>(record: &T) -> Result<Document> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(AppError::Internal(format!(
            "Expected an object document, got {}",
            other
        ))),
        Err(e) => Err(AppError::Internal(format!("Failed to encode document: {}", e))),
    }
}

/// Deserialize a document into a record.
pub fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T> {
    serde_json::from_value(Value::Object(doc))
        .map_err(|e| AppError::Storage(format!("Malformed document: {}", e)))
}

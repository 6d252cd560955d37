//! Chapter delivery for one open book.
//!
//! A [`ReadingSession`] owns a bounded chapter cache for a single book and is
//! discarded when the reader moves to another book. [`Shelf`] holds the
//! current session and swaps it on book changes.

use crate::error::{AppError, Result};
use crate::history::{DisplayFields, HistoryRecorder, ReaderIdentity};
use crate::library::{BOOKS, Book, Chapter, chapters_path};
use crate::store::{Document, DocumentStore, Filter, MAX_KEYS_PER_CALL, from_document};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Numbers per fallback query. Each number is sent in two forms.
const FALLBACK_CHUNK: usize = MAX_KEYS_PER_CALL / 2;

/// A chapter number as a number and as a string, matching older records.
fn number_forms(numbers: &[u32]) -> Vec<Value> {
    numbers
        .iter()
        .flat_map(|&n| [Value::from(n), Value::from(n.to_string())])
        .collect()
}

/// Outcome of a prefetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchReport {
    /// Chapters newly placed in the cache.
    pub fetched: usize,
    /// Chapters that were already resident.
    pub already_cached: usize,
    /// Chapter numbers that do not exist in the store.
    pub missing: Vec<u32>,
    /// Chapter numbers whose batch failed.
    pub failed: Vec<u32>,
}

/// Per-book chapter cache with view and progress side effects.
pub struct ReadingSession {
    book_id: String,
    docs: Arc<dyn DocumentStore>,
    history: HistoryRecorder,
    reader: ReaderIdentity,
    cache: HashMap<u32, Chapter>,
    capacity: usize,
    last_requested: Option<u32>,
    view_counted: bool,
    display: Option<DisplayFields>,
}

impl ReadingSession {
    /// Open a session on a book.
    pub fn enter(
        book_id: impl Into<String>,
        docs: Arc<dyn DocumentStore>,
        history: HistoryRecorder,
        reader: ReaderIdentity,
        capacity: usize,
    ) -> Self {
        let book_id = book_id.into();
        tracing::debug!(book_id = %book_id, capacity, "Entering book");

        Self {
            book_id,
            docs,
            history,
            reader,
            cache: HashMap::new(),
            capacity: capacity.max(1),
            last_requested: None,
            view_counted: false,
            display: None,
        }
    }

    /// Book this session reads.
    pub fn book_id(&self) -> &str {
        &self.book_id
    }

    /// Reader this session records progress for.
    pub fn reader(&self) -> &ReaderIdentity {
        &self.reader
    }

    /// Whether a chapter is resident.
    pub fn is_cached(&self, chapter_number: u32) -> bool {
        self.cache.contains_key(&chapter_number)
    }

    /// Number of resident chapters.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// How many of `[from, from + window)` are resident.
    pub fn preloaded_count(&self, from: u32, window: u32) -> usize {
        (from..from.saturating_add(window))
            .filter(|n| self.cache.contains_key(n))
            .count()
    }

    /// Serve a chapter, fetching it on a cache miss.
    ///
    /// Every successful call records reading progress. The first one in the
    /// session also counts a view on the book.
    pub async fn get(&mut self, chapter_number: u32) -> Result<Chapter> {
        if chapter_number == 0 {
            return Err(AppError::InvalidInput("Chapter numbers start at 1".into()));
        }
        self.last_requested = Some(chapter_number);

        let chapter = match self.cache.get(&chapter_number) {
            Some(chapter) => chapter.clone(),
            None => {
                let chapter = self.fetch(chapter_number).await?;
                self.insert(chapter.clone());
                chapter
            }
        };

        self.on_load(chapter_number).await;
        Ok(chapter)
    }

    /// Direct key lookup, then a query on the chapter number.
    async fn fetch(&self, chapter_number: u32) -> Result<Chapter> {
        let collection = chapters_path(&self.book_id);

        // The key may hold a different chapter when keys and numbers drifted.
        if let Some(doc) = self
            .docs
            .get(&collection, &Chapter::key(chapter_number))
            .await?
        {
            match self.decode(doc) {
                Ok(chapter) if chapter.chapter_number == chapter_number => return Ok(chapter),
                Ok(other) => tracing::debug!(
                    book_id = %self.book_id,
                    key = chapter_number,
                    found = other.chapter_number,
                    "Chapter key holds another chapter"
                ),
                Err(e) => tracing::warn!(
                    book_id = %self.book_id,
                    chapter = chapter_number,
                    error = %e,
                    "Malformed chapter under key"
                ),
            }
        }

        tracing::debug!(
            book_id = %self.book_id,
            chapter = chapter_number,
            "Chapter key missed, querying by number"
        );

        let filters = [Filter::within(
            "chapterNumber",
            number_forms(&[chapter_number]),
        )];
        match self
            .docs
            .query(&collection, &filters, Some(1))
            .await?
            .into_iter()
            .next()
        {
            Some((_, doc)) => self.decode(doc),
            None => Err(AppError::NotFound(format!(
                "Chapter {} of {}",
                chapter_number, self.book_id
            ))),
        }
    }

    fn decode(&self, doc: Document) -> Result<Chapter> {
        let mut chapter: Chapter = from_document(doc)?;
        chapter.book_id = self.book_id.clone();
        Ok(chapter)
    }

    /// Cache a chapter, evicting the entry farthest from the last request.
    ///
    /// Returns false when the new chapter is itself the farthest one.
    fn insert(&mut self, chapter: Chapter) -> bool {
        let number = chapter.chapter_number;
        if self.cache.contains_key(&number) || self.cache.len() < self.capacity {
            self.cache.insert(number, chapter);
            return true;
        }

        let anchor = self.last_requested.unwrap_or(number);
        let distance = |n: u32| (n.abs_diff(anchor), n);
        let victim = self
            .cache
            .keys()
            .copied()
            .max_by_key(|&n| distance(n))
            .filter(|&n| distance(n) > distance(number));

        match victim {
            Some(victim) => {
                self.cache.remove(&victim);
                self.cache.insert(number, chapter);
                true
            }
            None => false,
        }
    }

    async fn on_load(&mut self, chapter_number: u32) {
        if self.display.is_none() {
            self.display = self.load_display().await;
        }

        if !self.view_counted && self.display.as_ref().is_some_and(|d| d.title.is_some()) {
            match self.docs.increment(BOOKS, &self.book_id, "views", 1).await {
                Ok(()) => self.view_counted = true,
                Err(e) => {
                    tracing::warn!(book_id = %self.book_id, error = %e, "Failed to count view")
                }
            }
        }

        let display = self.display.clone().unwrap_or_default();
        if let Err(e) = self
            .history
            .record(&self.reader, &self.book_id, chapter_number, &display)
            .await
        {
            tracing::warn!(
                book_id = %self.book_id,
                chapter = chapter_number,
                error = %e,
                "Failed to record reading progress"
            );
        }
    }

    /// Display fields from the book record. Empty when the book is unknown,
    /// `None` when the store could not be read so the next load tries again.
    async fn load_display(&self) -> Option<DisplayFields> {
        match self.docs.get(BOOKS, &self.book_id).await {
            Ok(Some(doc)) => match from_document::<Book>(doc) {
                Ok(book) => Some(DisplayFields::from(&book)),
                Err(e) => {
                    tracing::warn!(book_id = %self.book_id, error = %e, "Malformed book record");
                    Some(DisplayFields::default())
                }
            },
            Ok(None) => Some(DisplayFields::default()),
            Err(e) => {
                tracing::warn!(book_id = %self.book_id, error = %e, "Failed to load book record");
                None
            }
        }
    }

    /// Fetch `[start, start + count)` into the cache in batches.
    ///
    /// At most `MAX_KEYS_PER_CALL` keys go into one call. Batches run
    /// concurrently and a failed batch never stops the others.
    pub async fn prefetch_range(&mut self, start: u32, count: u32) -> PrefetchReport {
        let count = count.min(u32::try_from(self.capacity).unwrap_or(u32::MAX));
        let mut report = PrefetchReport::default();

        let wanted: Vec<u32> = (start.max(1)..start.max(1).saturating_add(count))
            .filter(|n| {
                let resident = self.cache.contains_key(n);
                if resident {
                    report.already_cached += 1;
                }
                !resident
            })
            .collect();
        if wanted.is_empty() {
            return report;
        }

        let collection = chapters_path(&self.book_id);
        let keys: Vec<String> = wanted.iter().copied().map(Chapter::key).collect();

        let docs = self.docs.as_ref();
        let batches = keys.chunks(MAX_KEYS_PER_CALL).map(|chunk| {
            let collection = collection.as_str();
            async move { (chunk, docs.get_many(collection, chunk).await) }
        });

        let mut found: Vec<Chapter> = Vec::new();
        let mut failed: BTreeSet<u32> = BTreeSet::new();
        for (chunk, result) in join_all(batches).await {
            match result {
                Ok(docs) => found.extend(docs.into_iter().filter_map(|(id, doc)| {
                    self.decode(doc)
                        .inspect_err(|e| tracing::warn!(id = %id, error = %e, "Skipping malformed chapter"))
                        .ok()
                })),
                Err(e) => {
                    tracing::warn!(book_id = %self.book_id, error = %e, "Prefetch batch failed");
                    failed.extend(chunk.iter().filter_map(|k| k.parse::<u32>().ok()));
                }
            }
        }

        let resolved: BTreeSet<u32> = found.iter().map(|c| c.chapter_number).collect();
        let unresolved: Vec<u32> = wanted
            .iter()
            .copied()
            .filter(|n| !resolved.contains(n) && !failed.contains(n))
            .collect();

        if !unresolved.is_empty() {
            let queries = unresolved.chunks(FALLBACK_CHUNK).map(|chunk| {
                let collection = collection.as_str();
                let filters = [Filter::within("chapterNumber", number_forms(chunk))];
                async move { (chunk, docs.query(collection, &filters, None).await) }
            });

            for (chunk, result) in join_all(queries).await {
                match result {
                    Ok(rows) => {
                        for (id, doc) in rows {
                            match self.decode(doc) {
                                Ok(chapter) if !found.iter().any(|c| c.chapter_number == chapter.chapter_number) => {
                                    found.push(chapter)
                                }
                                Ok(_) => {}
                                Err(e) => tracing::warn!(id = %id, error = %e, "Skipping malformed chapter"),
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(book_id = %self.book_id, error = %e, "Prefetch fallback query failed");
                        failed.extend(chunk.iter().copied());
                    }
                }
            }
        }

        let resolved: BTreeSet<u32> = found.iter().map(|c| c.chapter_number).collect();
        report.missing = wanted
            .iter()
            .copied()
            .filter(|n| !resolved.contains(n) && !failed.contains(n))
            .collect();
        report.failed = failed.into_iter().collect();

        if self.last_requested.is_none() {
            self.last_requested = Some(start.max(1));
        }
        for chapter in found {
            if wanted.contains(&chapter.chapter_number) && self.insert(chapter) {
                report.fetched += 1;
            }
        }

        tracing::debug!(
            book_id = %self.book_id,
            start,
            count,
            fetched = report.fetched,
            missing = report.missing.len(),
            failed = report.failed.len(),
            "Prefetched chapters"
        );
        report
    }

    /// Close the session, dropping the cache.
    pub fn leave(self) {
        tracing::debug!(
            book_id = %self.book_id,
            cached = self.cache.len(),
            "Leaving book"
        );
    }
}

/// Holds the one book a reader currently has open.
pub struct Shelf {
    docs: Arc<dyn DocumentStore>,
    history: HistoryRecorder,
    reader: ReaderIdentity,
    capacity: usize,
    session: Option<ReadingSession>,
}

impl Shelf {
    /// Create an empty shelf.
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        history: HistoryRecorder,
        reader: ReaderIdentity,
        capacity: usize,
    ) -> Self {
        Self {
            docs,
            history,
            reader,
            capacity,
            session: None,
        }
    }

    /// Session for a book, replacing the current one if it is a different book.
    pub fn open(&mut self, book_id: &str) -> &mut ReadingSession {
        if let Some(current) = self.session.take_if(|s| s.book_id() != book_id) {
            current.leave();
        }

        self.session.get_or_insert_with(|| {
            ReadingSession::enter(
                book_id,
                self.docs.clone(),
                self.history.clone(),
                self.reader.clone(),
                self.capacity,
            )
        })
    }

    /// Close the open book.
    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.leave();
        }
    }
}

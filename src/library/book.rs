//! Book metadata model.

use crate::cover::MediaType;
use crate::library::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Store that owns a book and its chapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTarget {
    /// On-device store.
    Local,
    /// Shared catalog.
    Remote,
}

impl fmt::Display for StorageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageTarget::Local => f.write_str("local"),
            StorageTarget::Remote => f.write_str("remote"),
        }
    }
}

/// A book record, without its chapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    /// Stable identifier (slug or synthetic).
    pub id: String,

    /// Book title.
    pub title: String,

    /// Author display name.
    pub author: String,

    /// Genre tags.
    #[serde(default)]
    pub genres: Vec<String>,

    /// URL of the stored cover asset.
    #[serde(default)]
    pub cover_ref: Option<String>,

    /// Whether the cover is a still image or a looping clip.
    #[serde(default)]
    pub cover_media_type: Option<MediaType>,

    /// Highest chapter number stored for this book.
    #[serde(default)]
    pub total_chapters: u32,

    /// Store that owns this book.
    pub storage_target: StorageTarget,

    /// Creation time.
    #[serde(default)]
    pub created_at: Option<Timestamp>,

    /// Reading sessions opened on this book.
    #[serde(default)]
    pub views: u64,
}

impl Book {
    /// Create a book record with no cover and no chapters yet.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        author: impl Into<String>,
        storage_target: StorageTarget,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            author: author.into(),
            genres: Vec::new(),
            cover_ref: None,
            cover_media_type: None,
            total_chapters: 0,
            storage_target,
            created_at: None,
            views: 0,
        }
    }

    /// Set genre tags.
    pub fn with_genres(mut self, genres: Vec<String>) -> Self {
        self.genres = genres;
        self
    }

    /// Primary genre, used for history display.
    pub fn primary_genre(&self) -> Option<&str> {
        self.genres.first().map(String::as_str)
    }

    /// Get display name for the author.
    pub fn author_display(&self) -> &str {
        if self.author.trim().is_empty() {
            "Unknown Author"
        } else {
            &self.author
        }
    }
}

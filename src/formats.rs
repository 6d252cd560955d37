//! Manuscript extraction: turn an uploaded file into ordered chapters.

mod epub;
mod text;

pub use epub::EpubHandler;
pub use text::TextHandler;

#[cfg(test)]
pub(crate) use epub::fixtures as epub_fixtures;

use crate::config::ManuscriptFormat;
use crate::error::{AppError, Result};
use crate::library::Chapter;
use std::path::Path;

/// Chapters with less visible text than this are considered sparse.
///
/// Sparse chapters are still persisted; the threshold only feeds the sparse
/// count reported for an upload.
pub const MIN_CHAPTER_TEXT_LEN: usize = 200;

/// Caller-supplied numbering for single-chapter sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Chapter number to assign instead of `1`.
    pub chapter_number: Option<u32>,
    /// Chapter title.
    pub chapter_title: Option<String>,
}

/// An uploaded manuscript before extraction.
#[derive(Debug, Clone)]
pub struct ManuscriptSource {
    /// Container format.
    pub format: ManuscriptFormat,
    /// Raw bytes.
    pub data: Vec<u8>,
    /// Explicit numbering.
    pub options: ExtractOptions,
}

impl ManuscriptSource {
    /// Pasted text, one chapter.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            format: ManuscriptFormat::Txt,
            data: body.into().into_bytes(),
            options: ExtractOptions::default(),
        }
    }

    /// EPUB container bytes.
    pub fn epub(data: Vec<u8>) -> Self {
        Self {
            format: ManuscriptFormat::Epub,
            data,
            options: ExtractOptions::default(),
        }
    }

    /// Read a manuscript file, detecting the format from its extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let format = ManuscriptFormat::from_path(path).ok_or_else(|| {
            AppError::InvalidInput(format!("Unsupported manuscript type: {}", path.display()))
        })?;
        let data = std::fs::read(path)?;

        Ok(Self {
            format,
            data,
            options: ExtractOptions::default(),
        })
    }

    /// Set an explicit chapter number.
    pub fn with_chapter_number(mut self, chapter_number: Option<u32>) -> Self {
        self.options.chapter_number = chapter_number;
        self
    }

    /// Set an explicit chapter title.
    pub fn with_chapter_title(mut self, title: Option<String>) -> Self {
        self.options.chapter_title = title;
        self
    }
}

/// One chapter as extracted, before it is bound to a book id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedChapter {
    /// Position, 1-based in reading order unless set explicitly.
    pub chapter_number: u32,
    /// Heading, if one was found.
    pub title: Option<String>,
    /// HTML fragment.
    pub content: String,
}

impl ExtractedChapter {
    /// Visible characters in the content, markup excluded.
    pub fn text_len(&self) -> usize {
        visible_text_len(&self.content)
    }

    /// Whether the chapter falls under [`MIN_CHAPTER_TEXT_LEN`].
    pub fn is_sparse(&self) -> bool {
        self.text_len() < MIN_CHAPTER_TEXT_LEN
    }

    /// Bind to a book.
    pub fn into_chapter(self, book_id: &str) -> Chapter {
        Chapter {
            book_id: book_id.to_string(),
            chapter_number: self.chapter_number,
            title: self.title,
            content: self.content,
        }
    }
}

/// Descriptive metadata found inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManuscriptMetadata {
    /// Title.
    pub title: Option<String>,
    /// Authors, in document order.
    pub authors: Vec<String>,
    /// Subjects.
    pub genres: Vec<String>,
    /// Raw cover image bytes.
    pub cover: Option<Vec<u8>>,
}

/// Extraction result.
#[derive(Debug, Clone, Default)]
pub struct Manuscript {
    /// Chapters in reading order.
    pub chapters: Vec<ExtractedChapter>,
    /// Container metadata.
    pub metadata: ManuscriptMetadata,
}

impl Manuscript {
    /// Highest chapter number, `0` when empty.
    pub fn highest_chapter_number(&self) -> u32 {
        self.chapters
            .iter()
            .map(|c| c.chapter_number)
            .max()
            .unwrap_or(0)
    }

    /// Chapters under the sparse threshold.
    pub fn sparse_count(&self) -> usize {
        self.chapters.iter().filter(|c| c.is_sparse()).count()
    }
}

/// Trait for format-specific manuscript handlers.
pub trait FormatHandler: Send + Sync {
    /// Extract chapters and metadata from raw bytes.
    fn extract(&self, data: &[u8], options: &ExtractOptions) -> Result<Manuscript>;
}

/// Get the appropriate handler for a manuscript format.
pub fn get_handler(format: ManuscriptFormat) -> Box<dyn FormatHandler> {
    match format {
        ManuscriptFormat::Epub => Box::new(EpubHandler),
        ManuscriptFormat::Txt => Box::new(TextHandler),
    }
}

/// Extract a manuscript, failing when it yields no chapters.
pub fn extract(source: &ManuscriptSource) -> Result<Manuscript> {
    let manuscript = get_handler(source.format).extract(&source.data, &source.options)?;

    if manuscript.chapters.is_empty() {
        return Err(AppError::EmptyManuscript);
    }

    Ok(manuscript)
}

/// Escape text for inclusion in HTML.
pub(crate) fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Text with tags removed and whitespace collapsed.
pub(crate) fn strip_tags(markup: &str) -> String {
    let mut text = String::with_capacity(markup.len());
    let mut in_tag = false;
    for c in markup.chars() {
        match c {
            '<' => {
                in_tag = true;
                text.push(' ');
            }
            '>' if in_tag => in_tag = false,
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Count visible characters of an HTML fragment.
pub(crate) fn visible_text_len(markup: &str) -> usize {
    strip_tags(markup).chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_tags() {
        assert_eq!(
            strip_tags("<p>Hello <em>there</em></p>\n<p>friend</p>"),
            "Hello there friend"
        );
        assert_eq!(visible_text_len("<br/>"), 0);
    }

    #[test]
    fn test_sparse_chapters_are_kept() {
        let manuscript = Manuscript {
            chapters: vec![
                ExtractedChapter {
                    chapter_number: 1,
                    title: None,
                    content: "<p>Short.</p>".into(),
                },
                ExtractedChapter {
                    chapter_number: 2,
                    title: None,
                    content: format!("<p>{}</p>", "word ".repeat(60)),
                },
            ],
            metadata: ManuscriptMetadata::default(),
        };

        assert_eq!(manuscript.chapters.len(), 2);
        assert_eq!(manuscript.sparse_count(), 1);
        assert_eq!(manuscript.highest_chapter_number(), 2);
    }

    #[test]
    fn test_empty_text_is_empty_manuscript() {
        let result = extract(&ManuscriptSource::text("  \n\n  "));
        assert!(matches!(result, Err(AppError::EmptyManuscript)));
    }

    #[test]
    fn test_source_from_unknown_extension() {
        let result = ManuscriptSource::from_file(Path::new("book.docx"));
        assert!(matches!(result, Err(AppError::InvalidInput(_))));
    }
}

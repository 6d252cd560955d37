//! Plain and pasted text handler.

use crate::error::{AppError, Result};
use crate::formats::{
    ExtractOptions, ExtractedChapter, FormatHandler, Manuscript, ManuscriptMetadata, escape_html,
};
use regex::Regex;
use std::sync::LazyLock;

static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n\s*").expect("valid blank-line pattern"));

/// Handler for plain text. The whole text becomes a single chapter.
pub struct TextHandler;

impl TextHandler {
    /// Convert blank-line separated blocks into `<p>` paragraphs.
    pub fn paragraphs(text: &str) -> String {
        let normalized = text.replace("\r\n", "\n").replace('\r', "\n");

        BLANK_LINES
            .split(normalized.trim())
            .map(str::trim)
            .filter(|block| !block.is_empty())
            .map(|block| {
                let lines = block
                    .lines()
                    .map(|line| escape_html(line.trim()))
                    .collect::<Vec<_>>()
                    .join("<br/>");
                format!("<p>{}</p>", lines)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl FormatHandler for TextHandler {
    fn extract(&self, data: &[u8], options: &ExtractOptions) -> Result<Manuscript> {
        let text = String::from_utf8_lossy(data);
        let text = text.trim_start_matches('\u{feff}');

        if text.trim().is_empty() {
            return Ok(Manuscript::default());
        }

        let chapter_number = options.chapter_number.unwrap_or(1);
        if chapter_number == 0 {
            return Err(AppError::InvalidInput(
                "Chapter numbers start at 1".to_string(),
            ));
        }

        let title = options
            .chapter_title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from);

        Ok(Manuscript {
            chapters: vec![ExtractedChapter {
                chapter_number,
                title,
                content: Self::paragraphs(text),
            }],
            metadata: ManuscriptMetadata::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_lines_split_paragraphs() {
        let html = TextHandler::paragraphs("First line\nstill first\n\n  \nSecond & <last>\r\n");
        assert_eq!(
            html,
            "<p>First line<br/>still first</p>\n<p>Second &amp; &lt;last&gt;</p>"
        );
    }

    #[test]
    fn test_whole_text_is_one_chapter() {
        let text = "Chapter 1\n\nOnce.\n\nChapter 2\n\nTwice.\n\nChapter 3\n\nThrice.";
        let manuscript = TextHandler
            .extract(text.as_bytes(), &ExtractOptions::default())
            .unwrap();

        assert_eq!(manuscript.chapters.len(), 1);
        assert_eq!(manuscript.chapters[0].chapter_number, 1);
        assert_eq!(manuscript.chapters[0].content.matches("<p>").count(), 6);
    }

    #[test]
    fn test_explicit_number_and_title() {
        let options = ExtractOptions {
            chapter_number: Some(4),
            chapter_title: Some("  The Return ".into()),
        };
        let manuscript = TextHandler.extract(b"Back again.", &options).unwrap();

        assert_eq!(manuscript.chapters[0].chapter_number, 4);
        assert_eq!(manuscript.chapters[0].title.as_deref(), Some("The Return"));
    }

    #[test]
    fn test_chapter_zero_rejected() {
        let options = ExtractOptions {
            chapter_number: Some(0),
            chapter_title: None,
        };
        assert!(TextHandler.extract(b"text", &options).is_err());
    }
}

//! Chapter record.

use serde::{Deserialize, Deserializer, Serialize};

/// A single stored chapter of a book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    /// Owning book. Older records omit it; readers fill it in.
    #[serde(default)]
    pub book_id: String,

    /// Position of the chapter, unique per book. Gaps are allowed.
    #[serde(deserialize_with = "lenient_chapter_number")]
    pub chapter_number: u32,

    /// Chapter heading.
    #[serde(default)]
    pub title: Option<String>,

    /// HTML fragment.
    #[serde(default)]
    pub content: String,
}

impl Chapter {
    /// Document id a chapter is written under.
    pub fn key(chapter_number: u32) -> String {
        chapter_number.to_string()
    }
}

/// Older records store the chapter number as a string.
fn lenient_chapter_number<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Float(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Float(f) if f >= 0.0 && f.fract() == 0.0 && f <= u32::MAX as f64 => Ok(f as u32),
        Raw::Float(f) => Err(serde::de::Error::custom(format!(
            "invalid chapter number {}",
            f
        ))),
        Raw::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid chapter number {:?}", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chapter_number_accepts_string() {
        let chapter: Chapter =
            serde_json::from_str(r#"{"bookId":"b","chapterNumber":"7","content":"<p>x</p>"}"#)
                .unwrap();
        assert_eq!(chapter.chapter_number, 7);
        assert!(chapter.title.is_none());
    }

    #[test]
    fn test_chapter_number_rejects_garbage() {
        let result: Result<Chapter, _> =
            serde_json::from_str(r#"{"bookId":"b","chapterNumber":"seven"}"#);
        assert!(result.is_err());
    }
}

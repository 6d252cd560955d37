//! Book identifiers derived from author and title.

use crate::error::{AppError, Result};
use crate::library::StorageTarget;
use regex::Regex;
use std::sync::LazyLock;

static NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s]").expect("valid non-word pattern"));

static SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s_]+").expect("valid separator pattern"));

/// Separator between words and between the author and title parts.
pub const SEPARATOR: char = '_';

/// Lowercase, strip punctuation, collapse whitespace and underscores to one `_`.
///
/// `"  The Quick, Brown Fox! "` becomes `"the_quick_brown_fox"`.
pub fn slugify(text: &str) -> String {
    let lower = text.to_lowercase();
    let stripped = NON_WORD.replace_all(&lower, "");
    let joined = SEPARATORS.replace_all(stripped.trim(), "_");
    joined.trim_matches(SEPARATOR).to_string()
}

/// Bare `{author}_{title}` slug. Deterministic; used as the local identifier.
///
/// Falls back to a synthetic id when neither part yields any word characters.
pub fn local_id(author: &str, title: &str) -> String {
    let author_slug = slugify(author);
    let title_slug = slugify(title);

    match (author_slug.is_empty(), title_slug.is_empty()) {
        (false, false) => format!("{}{}{}", author_slug, SEPARATOR, title_slug),
        (true, false) => title_slug,
        (false, true) => author_slug,
        (true, true) => synthetic_id(author, title),
    }
}

/// Slug with a millisecond suffix, unique across repeated uploads.
pub fn cloud_id(author: &str, title: &str, now_millis: i64) -> String {
    format!("{}{}{}", local_id(author, title), SEPARATOR, now_millis)
}

/// Identifier for books without usable author or title text.
///
/// Name-based, so the same raw author and title always map to the same id.
pub fn synthetic_id(author: &str, title: &str) -> String {
    let name = format!("{}\u{0}{}", author.trim(), title.trim());
    let id = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes());
    format!("book{}{}", SEPARATOR, id.simple())
}

/// Resolve the identifier a book gets in the given store.
pub fn resolve(author: &str, title: &str, target: StorageTarget, now_millis: i64) -> Result<String> {
    if title.trim().is_empty() {
        return Err(AppError::InvalidInput("A book needs a title".into()));
    }

    Ok(match target {
        StorageTarget::Local => local_id(author, title),
        StorageTarget::Remote => cloud_id(author, title, now_millis),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_examples() {
        assert_eq!(slugify("A. Writer"), "a_writer");
        assert_eq!(slugify("Test Saga"), "test_saga");
        assert_eq!(slugify("  The Quick,  Brown Fox! "), "the_quick_brown_fox");
        assert_eq!(slugify("Already_snake"), "already_snake");
        assert_eq!(slugify("¡Olé!"), "olé");
        assert_eq!(slugify("?!"), "");
        assert_eq!(slugify("A _ B"), "a_b");
        assert_eq!(slugify("__lead  and__trail__"), "lead_and_trail");
    }

    #[test]
    fn test_local_id_is_deterministic() {
        let a = local_id("A. Writer", "Test Saga");
        let b = local_id("A. Writer", "Test Saga");
        assert_eq!(a, "a_writer_test_saga");
        assert_eq!(a, b);
    }

    #[test]
    fn test_cloud_id_appends_timestamp() {
        assert_eq!(
            cloud_id("A. Writer", "Test Saga", 1_700_000_000_000),
            "a_writer_test_saga_1700000000000"
        );
        assert_ne!(
            cloud_id("A. Writer", "Test Saga", 1),
            cloud_id("A. Writer", "Test Saga", 2)
        );
    }

    #[test]
    fn test_missing_parts() {
        assert_eq!(local_id("", "Solo"), "solo");
        assert_eq!(local_id("Anon", "!!!"), "anon");
        let synthetic = local_id("...", "???");
        assert!(synthetic.starts_with("book_"));
        assert_eq!(synthetic.len(), "book_".len() + 32);
    }

    #[test]
    fn test_synthetic_id_is_stable() {
        assert_eq!(local_id("...", "???"), local_id("...", "???"));
        assert_ne!(local_id("...", "???"), local_id("...", "!!!"));
        assert_eq!(
            resolve("...", "???", StorageTarget::Local, 1).unwrap(),
            resolve("...", "???", StorageTarget::Local, 2).unwrap()
        );
    }

    #[test]
    fn test_resolve_rejects_blank_title() {
        assert!(resolve("A. Writer", "   ", StorageTarget::Local, 0).is_err());
        assert_eq!(
            resolve("A. Writer", "Test Saga", StorageTarget::Local, 5).unwrap(),
            "a_writer_test_saga"
        );
        assert_eq!(
            resolve("A. Writer", "Test Saga", StorageTarget::Remote, 5).unwrap(),
            "a_writer_test_saga_5"
        );
    }
}

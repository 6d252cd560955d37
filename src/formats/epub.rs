//! EPUB format handler.

use crate::error::{AppError, Result};
use crate::formats::{
    ExtractOptions, ExtractedChapter, FormatHandler, Manuscript, ManuscriptMetadata, strip_tags,
};
use rayon::prelude::*;
use regex::Regex;
use roxmltree::{Document, ParsingOptions};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::LazyLock;
use zip::ZipArchive;

static HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<h[1-3][^>]*>(.*?)</h[1-3]\s*>").expect("valid heading pattern")
});

static TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title\s*>").expect("valid title pattern"));

static BODY_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<body[^>]*>").expect("valid body pattern"));

static BODY_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)</body\s*>").expect("valid body pattern"));

type Archive<'a> = ZipArchive<Cursor<&'a [u8]>>;

/// Handler for EPUB files.
pub struct EpubHandler;

/// Manifest item.
#[derive(Debug, Clone)]
struct Item {
    href: String,
    media_type: String,
    properties: String,
}

/// What the OPF package document declares.
#[derive(Debug, Default)]
struct Package {
    manifest: HashMap<String, Item>,
    spine: Vec<String>,
    title: Option<String>,
    authors: Vec<String>,
    subjects: Vec<String>,
    cover_href: Option<String>,
}

/// A spine entry read from the archive, not yet parsed.
struct RawEntry {
    idref: String,
    markup: String,
}

fn zip_err(e: zip::result::ZipError) -> AppError {
    AppError::Parse(format!("Invalid EPUB archive: {}", e))
}

fn xml_err(e: roxmltree::Error) -> AppError {
    AppError::Parse(format!("Invalid XML: {}", e))
}

fn xml_options<'a>() -> ParsingOptions<'a> {
    ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    }
}

impl EpubHandler {
    /// Find the OPF file path from container.xml.
    fn find_opf_path(archive: &mut Archive<'_>) -> Result<String> {
        let content = Self::read_text(archive, "META-INF/container.xml")?;
        let doc = Document::parse_with_options(&content, xml_options()).map_err(xml_err)?;

        doc.descendants()
            .find(|n| n.has_tag_name("rootfile"))
            .and_then(|n| n.attribute("full-path"))
            .map(String::from)
            .ok_or_else(|| AppError::Parse("No rootfile in container.xml".into()))
    }

    fn read_bytes(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>> {
        let mut file = archive.by_name(name).map_err(zip_err)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    fn read_text(archive: &mut Archive<'_>, name: &str) -> Result<String> {
        let data = Self::read_bytes(archive, name)?;
        Ok(String::from_utf8_lossy(&data)
            .trim_start_matches('\u{feff}')
            .to_string())
    }

    /// Parse the OPF package document.
    fn parse_package(content: &str) -> Result<Package> {
        let doc = Document::parse_with_options(content, xml_options()).map_err(xml_err)?;
        let mut package = Package::default();
        let mut cover_id: Option<String> = None;

        for node in doc.descendants().filter(|n| n.is_element()) {
            let text = || {
                node.text()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
            };

            match node.tag_name().name() {
                "title" if package.title.is_none() => package.title = text(),
                "creator" => package.authors.extend(text()),
                "subject" => package.subjects.extend(text()),
                "meta" if node.attribute("name") == Some("cover") => {
                    cover_id = node.attribute("content").map(String::from);
                }
                "item" => {
                    if let (Some(id), Some(href)) = (node.attribute("id"), node.attribute("href")) {
                        package.manifest.insert(
                            id.to_string(),
                            Item {
                                href: href.to_string(),
                                media_type: node.attribute("media-type").unwrap_or("").to_string(),
                                properties: node.attribute("properties").unwrap_or("").to_string(),
                            },
                        );
                    }
                }
                "itemref" => {
                    if let Some(idref) = node.attribute("idref") {
                        package.spine.push(idref.to_string());
                    }
                }
                _ => {}
            }
        }

        package.cover_href = Self::cover_href(&package, cover_id.as_deref());
        Ok(package)
    }

    /// Cover from `meta name="cover"`, then the EPUB 3 property, then by name.
    fn cover_href(package: &Package, cover_id: Option<&str>) -> Option<String> {
        if let Some(item) = cover_id.and_then(|id| package.manifest.get(id)) {
            return Some(item.href.clone());
        }

        if let Some(item) = package
            .manifest
            .values()
            .find(|item| item.properties.split_whitespace().any(|p| p == "cover-image"))
        {
            return Some(item.href.clone());
        }

        let mut named: Vec<&Item> = package
            .manifest
            .values()
            .filter(|item| {
                let lower = item.href.to_lowercase();
                lower.contains("cover")
                    && (item.media_type.starts_with("image/")
                        || lower.ends_with(".jpg")
                        || lower.ends_with(".jpeg")
                        || lower.ends_with(".png")
                        || lower.ends_with(".webp"))
            })
            .collect();
        named.sort_by(|a, b| a.href.cmp(&b.href));
        named.first().map(|item| item.href.clone())
    }

    /// Resolve a manifest href against the OPF directory.
    fn resolve_href(opf_dir: &str, href: &str) -> String {
        let href = href.split('#').next().unwrap_or(href);
        let decoded = urlencoding::decode(href)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| href.to_string());

        let joined = if opf_dir.is_empty() {
            decoded
        } else {
            format!("{}/{}", opf_dir.trim_end_matches('/'), decoded)
        };

        let mut parts: Vec<&str> = Vec::new();
        for segment in joined.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                s => parts.push(s),
            }
        }
        parts.join("/")
    }

    /// Locate an archive entry for an href, trying the raw href as well.
    fn entry_name(archive: &Archive<'_>, opf_dir: &str, href: &str) -> Option<String> {
        let resolved = Self::resolve_href(opf_dir, href);
        let candidates = [resolved, Self::resolve_href("", href), href.to_string()];
        candidates
            .into_iter()
            .find(|name| archive.index_for_name(name).is_some())
    }

    /// Inner markup of `<body>`.
    fn body_markup(markup: &str) -> String {
        if let Ok(doc) = Document::parse_with_options(markup, xml_options())
            && let Some(body) = doc.descendants().find(|n| n.has_tag_name("body"))
        {
            let range = body.range();
            let outer = &markup[range];
            if let (Some(open_end), Some(close_start)) = (outer.find('>'), outer.rfind("</"))
                && open_end < close_start
            {
                return outer[open_end + 1..close_start].trim().to_string();
            }
            // self-closing <body/>
            return String::new();
        }

        Self::scan_body(markup)
    }

    /// Text scan for bodies that are not well-formed XML.
    fn scan_body(markup: &str) -> String {
        let start = BODY_OPEN.find(markup).map(|m| m.end()).unwrap_or(0);
        let end = BODY_CLOSE
            .find_at(markup, start)
            .map(|m| m.start())
            .unwrap_or(markup.len());
        markup[start..end].trim().to_string()
    }

    /// First h1-h3 heading, else the document title.
    fn chapter_title(markup: &str, body: &str) -> Option<String> {
        let heading = HEADING
            .captures(body)
            .map(|c| strip_tags(&c[1]))
            .filter(|t| !t.is_empty());
        heading.or_else(|| {
            TITLE
                .captures(markup)
                .map(|c| strip_tags(&c[1]))
                .filter(|t| !t.is_empty())
        })
    }

    fn parse_entry(entry: &RawEntry, chapter_number: u32) -> ExtractedChapter {
        let content = Self::body_markup(&entry.markup);
        let title = Self::chapter_title(&entry.markup, &content).or_else(|| Some(entry.idref.clone()));

        ExtractedChapter {
            chapter_number,
            title,
            content,
        }
    }

    fn is_content_document(item: &Item) -> bool {
        item.media_type.is_empty()
            || item.media_type.contains("html")
            || item.media_type.contains("xml")
    }
}

impl FormatHandler for EpubHandler {
    fn extract(&self, data: &[u8], _options: &ExtractOptions) -> Result<Manuscript> {
        let mut archive = ZipArchive::new(Cursor::new(data)).map_err(zip_err)?;

        let opf_path = Self::find_opf_path(&mut archive)?;
        let opf_content = Self::read_text(&mut archive, &opf_path)?;
        let package = Self::parse_package(&opf_content)?;

        let opf_dir = match opf_path.rfind('/') {
            Some(pos) => &opf_path[..pos],
            None => "",
        };

        let mut entries = Vec::with_capacity(package.spine.len());
        for idref in &package.spine {
            let Some(item) = package.manifest.get(idref) else {
                tracing::warn!(idref = %idref, "Spine entry missing from manifest, skipping");
                continue;
            };
            if !Self::is_content_document(item) {
                tracing::debug!(idref = %idref, media_type = %item.media_type, "Skipping non-document spine entry");
                continue;
            }
            let name = Self::entry_name(&archive, opf_dir, &item.href).ok_or_else(|| {
                AppError::Parse(format!("Spine entry {} not found in archive: {}", idref, item.href))
            })?;
            let markup = Self::read_text(&mut archive, &name)?;
            entries.push(RawEntry {
                idref: idref.clone(),
                markup,
            });
        }

        let chapters: Vec<ExtractedChapter> = entries
            .par_iter()
            .enumerate()
            .map(|(index, entry)| Self::parse_entry(entry, index as u32 + 1))
            .collect();

        let cover = package.cover_href.as_deref().and_then(|href| {
            let name = Self::entry_name(&archive, opf_dir, href)?;
            match Self::read_bytes(&mut archive, &name) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    tracing::warn!(href = %href, error = %e, "Failed to read EPUB cover");
                    None
                }
            }
        });

        tracing::debug!(
            chapters = chapters.len(),
            title = ?package.title,
            has_cover = cover.is_some(),
            "Extracted EPUB"
        );

        Ok(Manuscript {
            chapters,
            metadata: ManuscriptMetadata {
                title: package.title,
                authors: package.authors,
                genres: package.subjects,
                cover,
            },
        })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    /// Build an EPUB with one XHTML document per `(idref, markup)` pair.
    pub(crate) fn epub(docs: &[(&str, &str)], cover: Option<&[u8]>) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
            let options = SimpleFileOptions::default();

            zip.start_file("mimetype", options).unwrap();
            zip.write_all(b"application/epub+zip").unwrap();

            zip.start_file("META-INF/container.xml", options).unwrap();
            zip.write_all(
                br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#,
            )
            .unwrap();

            let mut manifest = String::new();
            let mut spine = String::new();
            for (id, _) in docs {
                manifest.push_str(&format!(
                    r#"<item id="{id}" href="text/{id}.xhtml" media-type="application/xhtml+xml"/>"#
                ));
                spine.push_str(&format!(r#"<itemref idref="{id}"/>"#));
            }
            let cover_meta = if cover.is_some() {
                manifest.push_str(
                    r#"<item id="cover-img" href="images/cover.png" media-type="image/png"/>"#,
                );
                r#"<meta name="cover" content="cover-img"/>"#
            } else {
                ""
            };

            zip.start_file("OEBPS/content.opf", options).unwrap();
            zip.write_all(
                format!(
                    r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>Test Saga</dc:title>
    <dc:creator>A. Writer</dc:creator>
    <dc:subject>Fantasy</dc:subject>
    {cover_meta}
  </metadata>
  <manifest>{manifest}</manifest>
  <spine>{spine}</spine>
</package>"#
                )
                .as_bytes(),
            )
            .unwrap();

            for (id, markup) in docs {
                zip.start_file(format!("OEBPS/text/{id}.xhtml"), options)
                    .unwrap();
                zip.write_all(markup.as_bytes()).unwrap();
            }

            if let Some(bytes) = cover {
                zip.start_file("OEBPS/images/cover.png", options).unwrap();
                zip.write_all(bytes).unwrap();
            }

            zip.finish().unwrap();
        }
        buf
    }

    /// A well-formed XHTML chapter document.
    pub(crate) fn xhtml(title: &str, body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml">
<head><title>{title}</title></head>
<body>{body}</body>
</html>"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{epub, xhtml};
    use super::*;

    #[test]
    fn test_spine_order_and_numbering() {
        let data = epub(
            &[
                ("ch-b", &xhtml("Doc B", "<h1>The Beginning</h1><p>One.</p>")),
                ("ch-a", &xhtml("Doc A", "<p>Two.</p>")),
                ("ch-c", &xhtml("", "<p>Three.</p>")),
            ],
            None,
        );

        let manuscript = EpubHandler.extract(&data, &ExtractOptions::default()).unwrap();
        let numbers: Vec<u32> = manuscript.chapters.iter().map(|c| c.chapter_number).collect();
        let titles: Vec<Option<&str>> = manuscript
            .chapters
            .iter()
            .map(|c| c.title.as_deref())
            .collect();

        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(titles, vec![Some("The Beginning"), Some("Doc A"), Some("ch-c")]);
        assert_eq!(
            manuscript.chapters[0].content,
            "<h1>The Beginning</h1><p>One.</p>"
        );
    }

    #[test]
    fn test_metadata_and_cover() {
        let data = epub(&[("one", &xhtml("One", "<p>Text</p>"))], Some(b"PNGDATA"));
        let manuscript = EpubHandler.extract(&data, &ExtractOptions::default()).unwrap();

        assert_eq!(manuscript.metadata.title.as_deref(), Some("Test Saga"));
        assert_eq!(manuscript.metadata.authors, vec!["A. Writer".to_string()]);
        assert_eq!(manuscript.metadata.genres, vec!["Fantasy".to_string()]);
        assert_eq!(manuscript.metadata.cover.as_deref(), Some(&b"PNGDATA"[..]));
    }

    #[test]
    fn test_malformed_body_falls_back_to_scan() {
        let broken = "<html><head><title>Loose</title></head><body><p>Unclosed<br></body></html>";
        let data = epub(&[("loose", broken)], None);
        let manuscript = EpubHandler.extract(&data, &ExtractOptions::default()).unwrap();

        assert_eq!(manuscript.chapters[0].content, "<p>Unclosed<br>");
        assert_eq!(manuscript.chapters[0].title.as_deref(), Some("Loose"));
    }

    #[test]
    fn test_not_a_zip_is_parse_error() {
        let result = EpubHandler.extract(b"plain bytes", &ExtractOptions::default());
        assert!(matches!(result, Err(AppError::Parse(_))));
    }

    #[test]
    fn test_resolve_href() {
        assert_eq!(
            EpubHandler::resolve_href("OEBPS", "text/ch%201.xhtml#top"),
            "OEBPS/text/ch 1.xhtml"
        );
        assert_eq!(
            EpubHandler::resolve_href("OEBPS/text", "../images/c.png"),
            "OEBPS/images/c.png"
        );
        assert_eq!(EpubHandler::resolve_href("", "a.xhtml"), "a.xhtml");
    }
}

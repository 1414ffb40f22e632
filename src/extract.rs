//! Document parsing: file bytes to plain UTF-8 text.
//!
//! The set of supported formats is closed ([`DocumentKind`]) and selected by
//! file extension. PDF support needs the `pdf` cargo feature; Word and slide
//! decks need `office`. A format whose feature is compiled out is reported as
//! [`RunIssue::MissingCapability`] rather than a hard error, so the pipeline
//! keeps going with the remaining files.

use std::path::Path;

use crate::error::RunIssue;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
#[cfg(feature = "office")]
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    PlainText,
    Pdf,
    Word,
    SlideDeck,
}

impl DocumentKind {
    /// `extension` is lowercase with its leading dot, as produced by [`extension_of`].
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension {
            ".txt" | ".md" | ".markdown" | ".rst" | ".py" | ".java" | ".rs" | ".toml"
            | ".json" | ".yaml" | ".yml" | ".csv" | ".log" => Some(DocumentKind::PlainText),
            ".pdf" => Some(DocumentKind::Pdf),
            ".docx" => Some(DocumentKind::Word),
            ".pptx" => Some(DocumentKind::SlideDeck),
            _ => None,
        }
    }
}

/// Text pulled out of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDocument {
    pub text: String,
    pub media_type: String,
}

#[derive(Debug, thiserror::Error)]
enum ExtractError {
    #[error("{0} support not compiled in")]
    Unsupported(&'static str),
    #[error("{0}")]
    Malformed(String),
}

/// Lowercase extension with leading dot, or empty.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

/// Media type recorded for a file, by extension.
pub fn media_type_for(extension: &str) -> &'static str {
    match extension {
        ".txt" | ".log" => "text/plain",
        ".md" | ".markdown" => "text/markdown",
        ".rst" => "text/x-rst",
        ".py" => "text/x-python",
        ".java" => "text/x-java",
        ".rs" => "text/x-rust",
        ".toml" => "application/toml",
        ".json" => "application/json",
        ".yaml" | ".yml" => "application/yaml",
        ".csv" => "text/csv",
        ".pdf" => MIME_PDF,
        ".docx" => MIME_DOCX,
        ".pptx" => MIME_PPTX,
        _ => "application/octet-stream",
    }
}

/// Reads and parses one file. Every failure is a per-file [`RunIssue`].
pub fn parse_document(path: &Path) -> Result<ParsedDocument, RunIssue> {
    let path_str = path.to_string_lossy().to_string();
    let extension = extension_of(path);

    let kind = DocumentKind::from_extension(&extension).ok_or_else(|| {
        RunIssue::MissingCapability {
            path: path_str.clone(),
            detail: format!("no parser for extension '{}'", extension),
        }
    })?;

    let bytes = std::fs::read(path).map_err(|e| RunIssue::ReadFailure {
        path: path_str.clone(),
        detail: e.to_string(),
    })?;

    let extracted = match kind {
        DocumentKind::PlainText => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        DocumentKind::Pdf => extract_pdf(&bytes),
        DocumentKind::Word => extract_docx(&bytes),
        DocumentKind::SlideDeck => extract_pptx(&bytes),
    };

    let text = extracted.map_err(|e| match e {
        ExtractError::Unsupported(_) => RunIssue::MissingCapability {
            path: path_str.clone(),
            detail: e.to_string(),
        },
        ExtractError::Malformed(detail) => RunIssue::ParseFailure {
            path: path_str.clone(),
            detail,
        },
    })?;

    if text.trim().is_empty() {
        return Err(RunIssue::EmptyContent { path: path_str });
    }

    Ok(ParsedDocument {
        text,
        media_type: media_type_for(&extension).to_string(),
    })
}

#[cfg(feature = "pdf")]
fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    // pdf-extract panics on some malformed inputs.
    match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(ExtractError::Malformed(format!("PDF extraction failed: {}", e))),
        Err(_) => Err(ExtractError::Malformed(
            "PDF extraction panicked".to_string(),
        )),
    }
}

#[cfg(not(feature = "pdf"))]
fn extract_pdf(_bytes: &[u8]) -> Result<String, ExtractError> {
    Err(ExtractError::Unsupported("pdf"))
}

#[cfg(not(feature = "office"))]
fn extract_docx(_bytes: &[u8]) -> Result<String, ExtractError> {
    Err(ExtractError::Unsupported("docx"))
}

#[cfg(not(feature = "office"))]
fn extract_pptx(_bytes: &[u8]) -> Result<String, ExtractError> {
    Err(ExtractError::Unsupported("pptx"))
}

#[cfg(feature = "office")]
use office::{extract_docx, extract_pptx};

#[cfg(feature = "office")]
mod office {
    use super::{ExtractError, MAX_XML_ENTRY_BYTES};
    use quick_xml::events::Event;
    use std::io::{Cursor, Read};

    type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

    fn malformed(e: impl std::fmt::Display) -> ExtractError {
        ExtractError::Malformed(format!("OOXML extraction failed: {}", e))
    }

    fn open(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(malformed)
    }

    fn read_entry_bounded(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
        let entry = archive.by_name(name).map_err(malformed)?;
        let mut out = Vec::new();
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut out)
            .map_err(malformed)?;
        if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(malformed(format!(
                "ZIP entry {} exceeds size limit ({} bytes)",
                name, MAX_XML_ENTRY_BYTES
            )));
        }
        Ok(out)
    }

    /// Collects the text of every `<*:t>` run. Paragraph ends become
    /// newlines and `<*:tab/>` becomes a tab. Table cells hold paragraphs of
    /// their own, so table text comes out one cell per line.
    fn paragraph_text(xml: &[u8]) -> Result<String, ExtractError> {
        let mut out = String::new();
        let mut reader = quick_xml::Reader::from_reader(xml);
        let mut buf = Vec::new();
        let mut in_text = false;
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
                Ok(Event::Text(te)) if in_text => {
                    out.push_str(te.unescape().map_err(malformed)?.as_ref());
                }
                Ok(Event::End(e)) => match e.local_name().as_ref() {
                    b"t" => in_text = false,
                    b"p" => out.push('\n'),
                    _ => {}
                },
                Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                    b"tab" => out.push('\t'),
                    b"br" => out.push('\n'),
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Err(e) => return Err(malformed(e)),
                _ => {}
            }
            buf.clear();
        }
        Ok(out)
    }

    pub(super) fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
        let mut archive = open(bytes)?;
        if archive.index_for_name("word/document.xml").is_none() {
            return Err(malformed("word/document.xml not found"));
        }
        let xml = read_entry_bounded(&mut archive, "word/document.xml")?;
        paragraph_text(&xml)
    }

    fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<(u32, String)> {
        let mut entries: Vec<(u32, String)> = archive
            .file_names()
            .filter_map(|name| {
                let n = name.strip_prefix(prefix)?.strip_suffix(".xml")?;
                Some((n.parse::<u32>().ok()?, name.to_string()))
            })
            .collect();
        entries.sort();
        entries
    }

    /// One `<Relationship>` of an OPC `.rels` part.
    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Relationship {
        id: String,
        kind: String,
        target: String,
    }

    fn relationships(xml: &[u8]) -> Result<Vec<Relationship>, ExtractError> {
        let mut out = Vec::new();
        let mut reader = quick_xml::Reader::from_reader(xml);
        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"Relationship" => {
                    let mut rel = Relationship {
                        id: String::new(),
                        kind: String::new(),
                        target: String::new(),
                    };
                    for attr in e.attributes() {
                        let attr = attr.map_err(malformed)?;
                        let value = String::from_utf8_lossy(&attr.value).into_owned();
                        match attr.key.as_ref() {
                            b"Id" => rel.id = value,
                            b"Type" => rel.kind = value,
                            b"Target" => rel.target = value,
                            _ => {}
                        }
                    }
                    out.push(rel);
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(malformed(e)),
                _ => {}
            }
            buf.clear();
        }
        Ok(out)
    }

    /// Resolves a relationship target against the directory of its source part.
    pub(super) fn resolve_part(base_dir: &str, target: &str) -> String {
        if let Some(absolute) = target.strip_prefix('/') {
            return absolute.to_string();
        }
        let mut segments: Vec<&str> = base_dir.split('/').filter(|s| !s.is_empty()).collect();
        for segment in target.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                other => segments.push(other),
            }
        }
        segments.join("/")
    }

    /// `.rels` part of `part`, e.g. `ppt/slides/_rels/slide1.xml.rels`.
    fn rels_name(part: &str) -> String {
        match part.rsplit_once('/') {
            Some((dir, file)) => format!("{}/_rels/{}.rels", dir, file),
            None => format!("_rels/{}.rels", part),
        }
    }

    fn part_dir(part: &str) -> &str {
        part.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
    }

    fn read_relationships(archive: &mut Archive<'_>, part: &str) -> Result<Vec<Relationship>, ExtractError> {
        let name = rels_name(part);
        if archive.index_for_name(&name).is_none() {
            return Ok(Vec::new());
        }
        relationships(&read_entry_bounded(archive, &name)?)
    }

    /// Slide parts in presentation order: the `sldIdLst` of
    /// `ppt/presentation.xml` when present, otherwise by file number.
    fn slide_order(archive: &mut Archive<'_>) -> Result<Vec<String>, ExtractError> {
        const PRESENTATION: &str = "ppt/presentation.xml";
        if archive.index_for_name(PRESENTATION).is_some() {
            let rels = read_relationships(archive, PRESENTATION)?;
            let xml = read_entry_bounded(archive, PRESENTATION)?;
            let mut ordered = Vec::new();
            let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
            let mut buf = Vec::new();
            loop {
                match reader.read_event_into(&mut buf) {
                    Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"sldId" => {
                        for attr in e.attributes() {
                            let attr = attr.map_err(malformed)?;
                            // r:id, namespaced to the relationships schema
                            if attr.key.local_name().as_ref() != b"id" || attr.key.prefix().is_none() {
                                continue;
                            }
                            let rid = String::from_utf8_lossy(&attr.value);
                            if let Some(rel) = rels.iter().find(|r| r.id == rid) {
                                let part = resolve_part(part_dir(PRESENTATION), &rel.target);
                                if archive.index_for_name(&part).is_some() {
                                    ordered.push(part);
                                }
                            }
                        }
                    }
                    Ok(Event::Eof) => break,
                    Err(e) => return Err(malformed(e)),
                    _ => {}
                }
                buf.clear();
            }
            if !ordered.is_empty() {
                return Ok(ordered);
            }
        }
        Ok(numbered_entries(archive, "ppt/slides/slide")
            .into_iter()
            .map(|(_, name)| name)
            .collect())
    }

    /// Notes part linked from `slide` through its relationships, if any.
    fn notes_for(archive: &mut Archive<'_>, slide: &str) -> Result<Option<String>, ExtractError> {
        let rels = read_relationships(archive, slide)?;
        Ok(rels
            .iter()
            .find(|r| r.kind.ends_with("/notesSlide"))
            .map(|r| resolve_part(part_dir(slide), &r.target))
            .filter(|part| archive.index_for_name(part).is_some()))
    }

    /// Slide text in presentation order, each slide followed by its speaker notes.
    pub(super) fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
        let mut archive = open(bytes)?;
        let slides = slide_order(&mut archive)?;
        if slides.is_empty() {
            return Err(malformed("no slides found"));
        }

        let mut out = String::new();
        for name in slides {
            let xml = read_entry_bounded(&mut archive, &name)?;
            let mut text = paragraph_text(&xml)?;
            if let Some(notes_name) = notes_for(&mut archive, &name)? {
                let notes_xml = read_entry_bounded(&mut archive, &notes_name)?;
                let notes_text = paragraph_text(&notes_xml)?;
                if !notes_text.trim().is_empty() {
                    text.push_str(&notes_text);
                }
            }
            if text.trim().is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&text);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn extension_is_lowercased_with_dot() {
        assert_eq!(extension_of(Path::new("/a/B.MD")), ".md");
        assert_eq!(extension_of(Path::new("/a/Makefile")), "");
        assert_eq!(media_type_for(".md"), "text/markdown");
        assert_eq!(media_type_for(".bin"), "application/octet-stream");
    }

    #[test]
    fn plain_text_is_decoded_lossily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, b"caf\xff ok").unwrap();
        let doc = parse_document(&path).unwrap();
        assert_eq!(doc.text, "caf\u{fffd} ok");
        assert_eq!(doc.media_type, "text/plain");
    }

    #[test]
    fn unknown_extension_is_missing_capability() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.png");
        fs::write(&path, b"\x89PNG").unwrap();
        let issue = parse_document(&path).unwrap_err();
        assert!(matches!(issue, RunIssue::MissingCapability { .. }));
        assert!(issue.to_string().starts_with("parse-missing-parser:"));
    }

    #[test]
    fn whitespace_only_is_empty_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blank.md");
        fs::write(&path, "  \n\t\n").unwrap();
        let issue = parse_document(&path).unwrap_err();
        assert_eq!(
            issue.to_string(),
            format!("parse-empty:{}", path.to_string_lossy())
        );
    }

    #[test]
    fn missing_file_is_read_failure() {
        let dir = tempfile::tempdir().unwrap();
        let issue = parse_document(&dir.path().join("gone.txt")).unwrap_err();
        assert!(matches!(issue, RunIssue::ReadFailure { .. }));
    }

    #[cfg(feature = "pdf")]
    #[test]
    fn corrupt_pdf_is_parse_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pdf");
        fs::write(&path, b"not a pdf").unwrap();
        let issue = parse_document(&path).unwrap_err();
        assert!(matches!(issue, RunIssue::ParseFailure { .. }));
    }

    #[cfg(not(feature = "pdf"))]
    #[test]
    fn pdf_without_feature_is_missing_capability() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.pdf");
        fs::write(&path, b"%PDF-1.4").unwrap();
        let issue = parse_document(&path).unwrap_err();
        assert!(matches!(issue, RunIssue::MissingCapability { .. }));
    }

    #[cfg(feature = "office")]
    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        use std::io::Write;
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            for (name, body) in entries {
                zip.start_file(*name, zip::write::SimpleFileOptions::default())
                    .unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[cfg(feature = "office")]
    #[test]
    fn docx_includes_paragraphs_and_table_cells() {
        let xml = concat!(
            "<?xml version=\"1.0\"?>",
            "<w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>",
            "<w:p><w:r><w:t>Quarterly</w:t></w:r><w:r><w:t xml:space=\"preserve\"> report &amp; plan</w:t></w:r></w:p>",
            "<w:tbl><w:tr>",
            "<w:tc><w:p><w:r><w:t>cell one</w:t></w:r></w:p></w:tc>",
            "<w:tc><w:p><w:r><w:t>cell two</w:t></w:r></w:p></w:tc>",
            "</w:tr></w:tbl>",
            "</w:body></w:document>"
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.docx");
        fs::write(&path, zip_with(&[("word/document.xml", xml)])).unwrap();

        let doc = parse_document(&path).unwrap();
        assert_eq!(doc.text, "Quarterly report & plan\ncell one\ncell two\n");
        assert_eq!(doc.media_type, MIME_DOCX);
    }

    #[cfg(feature = "office")]
    #[test]
    fn pptx_includes_slides_in_order_with_notes() {
        let slide = |t: &str| {
            format!(
                "<p:sld xmlns:p=\"p\" xmlns:a=\"a\"><p:cSld><p:spTree><p:sp><p:txBody><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:txBody></p:sp></p:spTree></p:cSld></p:sld>",
                t
            )
        };
        let s1 = slide("first slide");
        let s2 = slide("second slide");
        let s10 = slide("tenth slide");
        let n1 = slide("speaker note two");
        let rels = notes_rels("../notesSlides/notesSlide1.xml");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deck.pptx");
        fs::write(
            &path,
            zip_with(&[
                ("ppt/slides/slide10.xml", &s10),
                ("ppt/slides/slide2.xml", &s2),
                ("ppt/slides/slide1.xml", &s1),
                ("ppt/slides/_rels/slide2.xml.rels", &rels),
                ("ppt/notesSlides/notesSlide1.xml", &n1),
            ]),
        )
        .unwrap();

        let doc = parse_document(&path).unwrap();
        assert_eq!(
            doc.text,
            "first slide\n\nsecond slide\nspeaker note two\n\ntenth slide\n"
        );
    }

    #[cfg(feature = "office")]
    fn notes_rels(target: &str) -> String {
        format!(
            "<Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\"><Relationship Id=\"rId1\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/slideLayout\" Target=\"../slideLayouts/slideLayout1.xml\"/><Relationship Id=\"rId2\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/notesSlide\" Target=\"{}\"/></Relationships>",
            target
        )
    }

    #[cfg(feature = "office")]
    #[test]
    fn pptx_follows_presentation_order_and_note_links() {
        let slide = |t: &str| {
            format!(
                "<p:sld xmlns:p=\"p\" xmlns:a=\"a\"><p:cSld><p:spTree><p:sp><p:txBody><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:txBody></p:sp></p:spTree></p:cSld></p:sld>",
                t
            )
        };
        // slide2.xml was moved to the front; its notes keep their old file name.
        let presentation = "<p:presentation xmlns:p=\"p\" xmlns:r=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships\"><p:sldIdLst><p:sldId id=\"257\" r:id=\"rId3\"/><p:sldId id=\"256\" r:id=\"rId2\"/></p:sldIdLst></p:presentation>";
        let presentation_rels = "<Relationships><Relationship Id=\"rId2\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/slide\" Target=\"slides/slide1.xml\"/><Relationship Id=\"rId3\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/slide\" Target=\"slides/slide2.xml\"/></Relationships>";
        let opening = slide("opening slide");
        let agenda = slide("agenda slide");
        let opening_notes = slide("notes for opening");
        let agenda_notes = slide("notes for agenda");
        let opening_rels = notes_rels("../notesSlides/notesSlide2.xml");
        let agenda_rels = notes_rels("/ppt/notesSlides/notesSlide1.xml");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moved.pptx");
        fs::write(
            &path,
            zip_with(&[
                ("ppt/presentation.xml", presentation),
                ("ppt/_rels/presentation.xml.rels", presentation_rels),
                ("ppt/slides/slide1.xml", &agenda),
                ("ppt/slides/slide2.xml", &opening),
                ("ppt/slides/_rels/slide1.xml.rels", &agenda_rels),
                ("ppt/slides/_rels/slide2.xml.rels", &opening_rels),
                ("ppt/notesSlides/notesSlide1.xml", &agenda_notes),
                ("ppt/notesSlides/notesSlide2.xml", &opening_notes),
            ]),
        )
        .unwrap();

        let doc = parse_document(&path).unwrap();
        assert_eq!(
            doc.text,
            "opening slide\nnotes for opening\n\nagenda slide\nnotes for agenda\n"
        );
    }

    #[cfg(feature = "office")]
    #[test]
    fn relationship_targets_resolve_against_source_dir() {
        use super::office::resolve_part;
        assert_eq!(
            resolve_part("ppt/slides", "../notesSlides/notesSlide3.xml"),
            "ppt/notesSlides/notesSlide3.xml"
        );
        assert_eq!(resolve_part("ppt", "slides/slide1.xml"), "ppt/slides/slide1.xml");
        assert_eq!(resolve_part("ppt/slides", "/ppt/media/x.png"), "ppt/media/x.png");
    }

    #[cfg(feature = "office")]
    #[test]
    fn corrupt_docx_is_parse_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.docx");
        fs::write(&path, b"not a zip").unwrap();
        let issue = parse_document(&path).unwrap_err();
        assert!(matches!(issue, RunIssue::ParseFailure { .. }));
    }
}

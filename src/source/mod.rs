//! Text extraction collaborators: document file -> lines with formatting.
//!
//! OCR output arrives as plain text (form feeds mark page breaks) and is
//! treated as opaque input like any other plain-text source.

pub mod docx;
pub mod pdf;
pub mod plain;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Font-size bucket, as far as the container exposes one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    Small,
    Normal,
    Large,
    XLarge,
    Huge,
}

impl SizeClass {
    /// Bucket a run size given in half-points (WordprocessingML `w:sz`).
    pub fn from_half_points(half_points: u32) -> Self {
        match half_points {
            0..=18 => SizeClass::Small,
            19..=24 => SizeClass::Normal,
            25..=28 => SizeClass::Large,
            29..=36 => SizeClass::XLarge,
            _ => SizeClass::Huge,
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formatting {
    #[serde(default, skip_serializing_if = "is_false")]
    pub bold: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub italic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_class: Option<SizeClass>,
    /// Named paragraph style (e.g. "heading 2", "Title").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    /// Container-level list nesting (DOCX numbering), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_level: Option<u8>,
    /// Leading indentation in spaces.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub indent: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceLine {
    pub text: String,
    pub formatting: Formatting,
}

impl SourceLine {
    pub fn plain(text: impl Into<String>) -> Self {
        SourceLine {
            text: text.into(),
            formatting: Formatting::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractedText {
    pub lines: Vec<SourceLine>,
    /// Index into `lines` of the first line of every page after the first.
    pub page_breaks: Vec<usize>,
    /// Every line is a complete paragraph (no soft wrapping to rejoin).
    pub hard_line_breaks: bool,
}

impl ExtractedText {
    pub fn page_count(&self) -> usize {
        if self.lines.is_empty() {
            0
        } else {
            self.page_breaks.len() + 1
        }
    }

    /// Build from raw text, splitting pages on form feeds.
    pub fn from_raw(raw: &str) -> Self {
        let mut out = ExtractedText::default();
        for line in crate::normalize::raw_lines(raw) {
            let mut pages = line.split('\u{000C}');
            if let Some(first) = pages.next() {
                out.lines.push(SourceLine::plain(first));
            }
            for rest in pages {
                out.page_breaks.push(out.lines.len());
                out.lines.push(SourceLine::plain(rest));
            }
        }
        out
    }
}

/// `extract_text(path) -> (text, page_boundaries)` collaborator.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<ExtractedText>;
}

/// Pick an extractor by file extension.
pub fn extractor_for(path: &Path) -> Result<Box<dyn TextExtractor>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "text" | "md" => Ok(Box::new(plain::PlainTextExtractor)),
        "docx" => Ok(Box::new(docx::DocxExtractor)),
        "pdf" => Ok(Box::new(pdf::PdfExtractor)),
        "" => Err(PipelineError::unsupported(path, "missing file extension")),
        other => Err(PipelineError::unsupported(
            path,
            format!("unknown extension .{other}"),
        )),
    }
}

pub fn is_supported(path: &Path) -> bool {
    extractor_for(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_feed_splits_pages() {
        let t = ExtractedText::from_raw("a\nb\u{000C}c\nd");
        assert_eq!(t.lines.len(), 4);
        assert_eq!(t.page_breaks, vec![2]);
        assert_eq!(t.page_count(), 2);
        assert_eq!(t.lines[2].text, "c");
    }

    #[test]
    fn unknown_extension_rejected() {
        let err = extractor_for(Path::new("book.epub")).err().unwrap();
        assert_eq!(err.kind(), "unsupported_format");
        assert!(extractor_for(Path::new("Book.DOCX")).is_ok());
    }

    #[test]
    fn size_buckets() {
        assert_eq!(SizeClass::from_half_points(22), SizeClass::Normal);
        assert_eq!(SizeClass::from_half_points(32), SizeClass::XLarge);
        assert_eq!(SizeClass::from_half_points(48), SizeClass::Huge);
    }
}

use std::path::Path;

use tracing::debug;

use super::{ExtractedText, TextExtractor};
use crate::error::Result;

/// Plain text / markdown / OCR output.
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedText> {
        let bytes = std::fs::read(path)?;
        let raw = match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => {
                debug!(path = %path.display(), "non-UTF-8 input, decoding lossily");
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        };
        let mut text = ExtractedText::from_raw(&raw);
        for line in &mut text.lines {
            // **whole line bold** in markdown-ish OCR output
            let t = line.text.trim_end();
            let body = t.trim_start();
            if body.len() > 4 && body.starts_with("**") && body.ends_with("**") {
                let indent = t.len() - body.len();
                line.text = format!("{}{}", &t[..indent], &body[2..body.len() - 2]);
                line.formatting.bold = true;
            }
        }
        Ok(text)
    }
}

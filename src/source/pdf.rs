use std::io::Read;
use std::path::Path;

use tracing::debug;

use super::{ExtractedText, TextExtractor};
use crate::error::{PipelineError, Result};

/// Text layer of a PDF. Scanned pages without a text layer come back empty and
/// are expected to be OCR'd upstream and supplied as plain text instead.
pub struct PdfExtractor;

impl TextExtractor for PdfExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedText> {
        let mut magic = [0u8; 5];
        let mut file = std::fs::File::open(path)?;
        if file.read_exact(&mut magic).is_err() || &magic != b"%PDF-" {
            return Err(PipelineError::unsupported(path, "missing %PDF- header"));
        }

        let raw = pdf_extract::extract_text(path)
            .map_err(|e| PipelineError::corrupt(path, e.to_string()))?;
        debug!(path = %path.display(), chars = raw.len(), "pdf text layer extracted");
        Ok(ExtractedText::from_raw(&raw))
    }
}

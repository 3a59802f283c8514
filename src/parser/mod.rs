pub mod builder;
pub mod classify;
pub mod entries;
pub mod scratch;
pub mod tree;

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::digest::{sha256_bytes, sha256_file};
use crate::error::{PipelineError, PipelineWarning, Result};
use crate::normalize::{normalize_line, TextAccumulator};
use crate::source::{extractor_for, ExtractedText};
use builder::{BuildOutput, LineInput, TreeBuilder};
use classify::{classify, leading_spaces, Classification, ClassifierOptions, LineFeatures};
use scratch::{FlushMarker, MemorySink, NodeSink, ScratchFile};
use tree::{assemble, DocumentNode, NodeRecord};

#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub flush_every: usize,
    pub memory_budget_bytes: usize,
    pub classifier: ClassifierOptions,
    /// Where flushed nodes go. `None` keeps them in memory (no resume).
    pub scratch_path: Option<PathBuf>,
    pub resume: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions {
            flush_every: 256,
            memory_budget_bytes: 8 * 1024 * 1024,
            classifier: ClassifierOptions::default(),
            scratch_path: None,
            resume: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub page_count: usize,
    pub char_count: usize,
    pub line_count: usize,
    pub node_count: usize,
    pub flushes: usize,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from_line: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub document_id: String,
    pub source: PathBuf,
    /// Normalized full text; every `char_range` indexes into it.
    pub text: String,
    /// Byte offset of the first content line of every page after the first.
    pub page_boundaries: Vec<usize>,
    pub root: DocumentNode,
    pub metadata: DocumentMetadata,
    #[serde(default)]
    pub warnings: Vec<PipelineWarning>,
}

/// Position of one source line inside the normalized text.
struct LineSlot {
    span: Option<(usize, usize)>,
    blank_before: bool,
    len_after: usize,
    pending_after: bool,
}

struct Normalized {
    text: String,
    slots: Vec<LineSlot>,
    page_boundaries: Vec<usize>,
}

fn normalize_extracted(extracted: &ExtractedText) -> Normalized {
    let mut acc = TextAccumulator::new();
    let mut slots = Vec::with_capacity(extracted.lines.len());
    let mut page_boundaries = Vec::new();
    let mut page_pending = false;

    for (i, line) in extracted.lines.iter().enumerate() {
        if extracted.page_breaks.binary_search(&i).is_ok() {
            page_pending = true;
        }
        let normalized = normalize_line(&line.text);
        let blank_before = acc.pending_blank();
        let span = acc.push(&normalized).map(|start| (start, start + normalized.len()));
        if let (Some((start, _)), true) = (span, page_pending) {
            page_boundaries.push(start);
            page_pending = false;
        }
        slots.push(LineSlot {
            span,
            blank_before,
            len_after: acc.len(),
            pending_after: acc.pending_blank(),
        });
    }

    Normalized {
        text: acc.into_string(),
        slots,
        page_boundaries,
    }
}

/// A marker is usable only if replaying normalization lands on the same state.
fn marker_matches(marker: &FlushMarker, slots: &[LineSlot]) -> bool {
    match marker.lines_consumed {
        0 => marker.text_len == 0,
        n if n <= slots.len() => {
            let slot = &slots[n - 1];
            slot.len_after == marker.text_len && slot.pending_after == marker.pending_blank
        }
        _ => false,
    }
}

fn line_class(
    extracted: &ExtractedText,
    normalized: &Normalized,
    i: usize,
    opts: &ClassifierOptions,
) -> Option<(usize, usize, usize, Classification)> {
    let (start, end) = normalized.slots[i].span?;
    let text = &normalized.text[start..end];
    let formatting = &extracted.lines[i].formatting;
    let class = classify(&LineFeatures { text, formatting }, opts);
    let indent = leading_spaces(text).max(formatting.indent);
    Some((start, end, indent, class))
}

fn build_tree<S: NodeSink>(
    mut builder: TreeBuilder<S>,
    extracted: &ExtractedText,
    normalized: &Normalized,
    from_line: usize,
    opts: &ClassifierOptions,
) -> Result<BuildOutput<S>> {
    for i in from_line..normalized.slots.len() {
        if let Some((start, end, indent, class)) = line_class(extracted, normalized, i, opts) {
            builder.push(LineInput {
                text: &normalized.text[start..end],
                formatting: &extracted.lines[i].formatting,
                offset: start,
                indent,
                blank_before: normalized.slots[i].blank_before,
                class,
            });
        }
        let slot = &normalized.slots[i];
        builder.after_line(i + 1, slot.len_after, slot.pending_after)?;
    }
    let pending = normalized.slots.last().is_some_and(|s| s.pending_after);
    builder.finish(normalized.slots.len(), normalized.text.len(), pending)
}

/// Identity of a parse for scratch reuse: node records are only valid for the
/// same source bytes classified with the same settings.
fn scratch_digest(source: &Path, classifier: &ClassifierOptions) -> Result<String> {
    let source_digest = sha256_file(source)?;
    let settings = serde_json::to_string(classifier)?;
    Ok(sha256_bytes(format!("{source_digest}\n{settings}").as_bytes()))
}

struct TreeOutcome {
    records: Vec<NodeRecord>,
    node_count: usize,
    flushes: usize,
    warnings: Vec<PipelineWarning>,
    resumed_from_line: Option<usize>,
}

fn build_with_scratch(
    scratch_path: &Path,
    source: &Path,
    extracted: &ExtractedText,
    normalized: &Normalized,
    opts: &ParseOptions,
) -> Result<TreeOutcome> {
    let join = !extracted.hard_line_breaks;
    let digest = scratch_digest(source, &opts.classifier)?;
    let resumed = if opts.resume {
        ScratchFile::resume(scratch_path, &digest)?
    } else {
        None
    };

    let (builder, from_line) = match resumed {
        Some((_, marker)) if marker.complete && marker_matches(&marker, &normalized.slots) => {
            info!(path = %source.display(), "scratch store already complete, reassembling");
            let records = ScratchFile::read_records(scratch_path)?;
            return Ok(TreeOutcome {
                node_count: records.len(),
                records,
                flushes: 0,
                warnings: Vec::new(),
                resumed_from_line: Some(normalized.slots.len()),
            });
        }
        Some((file, marker)) if !marker.complete && marker_matches(&marker, &normalized.slots) => {
            let from = marker.lines_consumed;
            info!(path = %source.display(), from_line = from, "resuming parse from scratch marker");
            let builder = TreeBuilder::restore(file, marker, opts.flush_every, opts.memory_budget_bytes, join);
            (builder, Some(from))
        }
        _ => {
            let file = ScratchFile::create(scratch_path, &digest)?;
            (TreeBuilder::new(file, opts.flush_every, opts.memory_budget_bytes, join), None)
        }
    };

    let out = build_tree(builder, extracted, normalized, from_line.unwrap_or(0), &opts.classifier)?;
    Ok(TreeOutcome {
        records: out.sink.into_records()?,
        node_count: out.node_count,
        flushes: out.flushes,
        warnings: out.warnings,
        resumed_from_line: from_line,
    })
}

/// Extract, normalize and build the structure tree of one document.
pub fn parse_document(path: &Path, document_id: &str, opts: &ParseOptions) -> Result<ParsedDocument> {
    let started = Instant::now();
    if !path.exists() {
        return Err(PipelineError::MissingInput(path.to_path_buf()));
    }
    let extractor = extractor_for(path)?;
    let extracted = extractor.extract(path)?;
    let normalized = normalize_extracted(&extracted);
    debug!(
        document_id,
        lines = extracted.lines.len(),
        chars = normalized.text.len(),
        "text extracted and normalized"
    );

    let outcome = match &opts.scratch_path {
        Some(scratch_path) => build_with_scratch(scratch_path, path, &extracted, &normalized, opts)?,
        None => {
            let builder = TreeBuilder::new(
                MemorySink::default(),
                opts.flush_every,
                opts.memory_budget_bytes,
                !extracted.hard_line_breaks,
            );
            let out = build_tree(builder, &extracted, &normalized, 0, &opts.classifier)?;
            TreeOutcome {
                records: out.sink.into_records()?,
                node_count: out.node_count,
                flushes: out.flushes,
                warnings: out.warnings,
                resumed_from_line: None,
            }
        }
    };

    let root = assemble(outcome.records)
        .ok_or_else(|| PipelineError::corrupt(path, "node store holds no root"))?;
    let line_count = normalized.slots.iter().filter(|s| s.span.is_some()).count();

    let metadata = DocumentMetadata {
        page_count: extracted.page_count(),
        char_count: normalized.text.chars().count(),
        line_count,
        node_count: outcome.node_count,
        flushes: outcome.flushes,
        duration_ms: started.elapsed().as_millis() as u64,
        resumed_from_line: outcome.resumed_from_line,
    };
    info!(
        document_id,
        nodes = metadata.node_count,
        pages = metadata.page_count,
        duration_ms = metadata.duration_ms,
        "document parsed"
    );

    Ok(ParsedDocument {
        document_id: document_id.to_string(),
        source: path.to_path_buf(),
        text: normalized.text,
        page_boundaries: normalized.page_boundaries,
        root,
        metadata,
        warnings: outcome.warnings,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedLine {
    pub line: usize,
    pub text: String,
    pub kind: &'static str,
    pub confidence: f32,
}

/// Per-line classification without building a tree.
pub fn classify_document(path: &Path, opts: &ClassifierOptions) -> Result<Vec<ClassifiedLine>> {
    if !path.exists() {
        return Err(PipelineError::MissingInput(path.to_path_buf()));
    }
    let extracted = extractor_for(path)?.extract(path)?;
    let normalized = normalize_extracted(&extracted);
    Ok((0..normalized.slots.len())
        .filter_map(|i| {
            let (start, end, _, class) = line_class(&extracted, &normalized, i, opts)?;
            Some(ClassifiedLine {
                line: i + 1,
                text: normalized.text[start..end].to_string(),
                kind: class.kind.label(),
                confidence: class.confidence,
            })
        })
        .collect())
}

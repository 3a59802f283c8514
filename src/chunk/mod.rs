//! Bounded segmentation of normalized text.
//!
//! Sizes count chars. Structural, semantic and fixed chunks tile the input
//! exactly; sliding windows overlap by exactly `overlap` chars.

pub mod sentence;
mod split;
mod window;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineWarning, Result};
use crate::parser::tree::{DocumentNode, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    Semantic,
    Structural,
    Fixed,
    Sliding,
}

impl ChunkStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStrategy::Semantic => "semantic",
            ChunkStrategy::Structural => "structural",
            ChunkStrategy::Fixed => "fixed",
            ChunkStrategy::Sliding => "sliding",
        }
    }
}

impl fmt::Display for ChunkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkStrategy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "semantic" => Ok(ChunkStrategy::Semantic),
            "structural" | "structure" => Ok(ChunkStrategy::Structural),
            "fixed" | "fixed-size" | "fixed_size" => Ok(ChunkStrategy::Fixed),
            "sliding" | "sliding-window" | "sliding_window" => Ok(ChunkStrategy::Sliding),
            other => Err(PipelineError::InvalidConfig(format!(
                "unknown chunk strategy {other:?} (expected semantic, structural, fixed or sliding)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkOptions {
    pub strategy: ChunkStrategy,
    pub max_size: usize,
    /// Sliding only.
    pub overlap: usize,
    /// Fixed only: how far back from the hard limit to look for a boundary.
    /// Defaults to `max_size / 4`.
    pub lookback: Option<usize>,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        ChunkOptions {
            strategy: ChunkStrategy::Structural,
            max_size: 1000,
            overlap: 100,
            lookback: None,
        }
    }
}

impl ChunkOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(PipelineError::InvalidConfig("max_chunk_size must be at least 1".into()));
        }
        if self.strategy == ChunkStrategy::Sliding && self.overlap >= self.max_size {
            return Err(PipelineError::InvalidConfig(format!(
                "overlap ({}) must be smaller than max_chunk_size ({})",
                self.overlap, self.max_size
            )));
        }
        Ok(())
    }

    pub fn effective_lookback(&self) -> usize {
        self.lookback.unwrap_or(self.max_size / 4).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub strategy: ChunkStrategy,
    pub char_range: Span,
    pub char_count: usize,
    pub is_oversized: bool,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkSet {
    pub chunks: Vec<Chunk>,
    pub warnings: Vec<PipelineWarning>,
}

impl ChunkSet {
    pub fn oversized(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_oversized).count()
    }
}

/// A cut produced by a strategy before texts are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Piece {
    pub span: Span,
    pub oversized: bool,
}

pub(crate) fn char_len(text: &str, span: Span) -> usize {
    span.slice(text).chars().count()
}

/// Segment `text` with the configured strategy. `tree` is used by the
/// structural strategy only; without one it behaves like semantic.
pub fn chunk_text(text: &str, tree: Option<&DocumentNode>, opts: &ChunkOptions) -> Result<ChunkSet> {
    opts.validate()?;
    let pieces = match (opts.strategy, tree) {
        (ChunkStrategy::Structural, Some(root)) if !root.children.is_empty() => {
            split::structural(text, root, opts.max_size)
        }
        (ChunkStrategy::Structural, _) | (ChunkStrategy::Semantic, _) => {
            split::semantic(text, opts.max_size)
        }
        (ChunkStrategy::Fixed, _) => window::fixed(text, opts.max_size, opts.effective_lookback()),
        (ChunkStrategy::Sliding, _) => window::sliding(text, opts.max_size, opts.overlap),
    };

    let mut set = ChunkSet::default();
    for (index, piece) in pieces.into_iter().enumerate() {
        let chunk_text = piece.span.slice(text);
        let char_count = chunk_text.chars().count();
        if piece.oversized {
            warn!(index, chars = char_count, max_size = opts.max_size, "indivisible unit exceeds max chunk size");
            set.warnings.push(PipelineWarning::ChunkOversized {
                index,
                chars: char_count,
                max_size: opts.max_size,
            });
        }
        set.chunks.push(Chunk {
            index,
            strategy: opts.strategy,
            char_range: piece.span,
            char_count,
            is_oversized: piece.oversized,
            text: chunk_text.to_string(),
        });
    }
    debug!(
        strategy = %opts.strategy,
        chunks = set.chunks.len(),
        oversized = set.oversized(),
        "text chunked"
    );
    Ok(set)
}

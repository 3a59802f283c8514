use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::Category;
use crate::pipeline::Stage;

/// Per-document and configuration failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported format for {}: {reason}", path.display())]
    UnsupportedFormat { path: PathBuf, reason: String },

    #[error("corrupt document {}: {reason}", path.display())]
    CorruptDocument { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("input path does not exist: {}", .0.display())]
    MissingInput(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),
}

impl PipelineError {
    pub fn unsupported(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::UnsupportedFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::CorruptDocument {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable label used in reports and the run ledger.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::UnsupportedFormat { .. } => "unsupported_format",
            PipelineError::CorruptDocument { .. } => "corrupt_document",
            PipelineError::InvalidConfig(_) => "invalid_config",
            PipelineError::MissingInput(_) => "missing_input",
            PipelineError::Io(_) => "io",
            PipelineError::Json(_) => "json",
            PipelineError::Csv(_) => "csv",
            PipelineError::Database(_) => "database",
        }
    }

    /// Whether a failure still leaves usable partial output behind.
    pub fn is_partial(&self) -> bool {
        matches!(self, PipelineError::CorruptDocument { .. })
    }
}

/// Degraded-but-usable conditions. Recorded on artifacts and reports, never raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum PipelineWarning {
    MemoryBudgetExceeded {
        buffered_bytes: usize,
        budget_bytes: usize,
    },
    ChunkOversized {
        index: usize,
        chars: usize,
        max_size: usize,
    },
    QuotaUnachievable {
        category: Category,
        requested: usize,
        achievable: usize,
    },
    StageCheckpointMismatch {
        stage: Stage,
        reason: String,
    },
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

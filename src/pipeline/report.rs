use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Stage;
use crate::chunk::ChunkStrategy;
use crate::dataset::GenerationReport;
use crate::error::PipelineWarning;
use crate::parser::DocumentMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ran,
    /// Reused from a valid checkpoint.
    Skipped,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Ran => "ran",
            StageStatus::Skipped => "skipped",
            StageStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMetric {
    pub stage: Stage,
    pub status: StageStatus,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Completed,
    Failed,
    Cancelled,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
            DocumentStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentFailure {
    pub stage: Option<Stage>,
    pub kind: String,
    pub message: String,
    /// Earlier stages committed usable output before the failure.
    pub partial: bool,
}

/// Per-stage timings for one document, in the order stages were visited.
#[derive(Debug, Default)]
pub struct StageTracker {
    metrics: Vec<StageMetric>,
}

impl StageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, stage: Stage, status: StageStatus, started: Instant) {
        self.metrics.push(StageMetric {
            stage,
            status,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    pub fn metrics(&self) -> &[StageMetric] {
        &self.metrics
    }

    pub fn into_metrics(self) -> Vec<StageMetric> {
        self.metrics
    }
}

/// Summary of what the export stage wrote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub strategy: ChunkStrategy,
    pub max_size: usize,
    pub chunk_count: usize,
    pub oversized: usize,
    pub warnings: Vec<PipelineWarning>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingReport {
    pub document_id: String,
    pub source: PathBuf,
    pub source_digest: String,
    pub generated_at: DateTime<Utc>,
    pub metadata: DocumentMetadata,
    pub dictionary_entries: usize,
    pub chunks: ChunkSummary,
    pub generation: GenerationReport,
    pub stages: Vec<StageMetric>,
    pub warnings: Vec<PipelineWarning>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub document_id: String,
    pub source: PathBuf,
    pub status: DocumentStatus,
    pub stages: Vec<StageMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<DocumentFailure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<PipelineWarning>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub documents: Vec<DocumentSummary>,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchReport {
    pub fn new(run_id: String, started_at: DateTime<Utc>, documents: Vec<DocumentSummary>) -> Self {
        let count = |status: DocumentStatus| documents.iter().filter(|d| d.status == status).count();
        BatchReport {
            completed: count(DocumentStatus::Completed),
            failed: count(DocumentStatus::Failed),
            cancelled: count(DocumentStatus::Cancelled),
            run_id,
            started_at,
            finished_at: Utc::now(),
            documents,
        }
    }

    pub fn partial(&self) -> usize {
        self.documents
            .iter()
            .filter(|d| d.failure.as_ref().is_some_and(|f| f.partial))
            .count()
    }
}

pub fn new_run_id() -> String {
    format!("run-{}", Utc::now().format("%Y%m%dT%H%M%S%.3f"))
}

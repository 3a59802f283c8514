//! Checkpointed per-document stage machine and the batch worker pool.

pub mod artifacts;
pub mod batch;
pub mod checkpoint;
pub mod progress;
pub mod report;
pub mod runner;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::chunk::ChunkOptions;
use crate::dataset::GeneratorOptions;
use crate::error::Result;
use crate::parser::ParseOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parse,
    ExportRawArtifacts,
    ExtractDictionaryEntries,
    GenerateTrainingData,
    BuildReport,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Parse,
        Stage::ExportRawArtifacts,
        Stage::ExtractDictionaryEntries,
        Stage::GenerateTrainingData,
        Stage::BuildReport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Parse => "parse",
            Stage::ExportRawArtifacts => "export_raw_artifacts",
            Stage::ExtractDictionaryEntries => "extract_dictionary_entries",
            Stage::GenerateTrainingData => "generate_training_data",
            Stage::BuildReport => "build_report",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cooperative cancellation flag, checked between documents and stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub output_dir: PathBuf,
    /// `scratch_path` and `resume` are filled in per document.
    pub parse: ParseOptions,
    pub chunk: ChunkOptions,
    pub generator: GeneratorOptions,
    pub worker_count: usize,
    pub resume: bool,
}

impl PipelineOptions {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        PipelineOptions {
            output_dir: output_dir.into(),
            parse: ParseOptions::default(),
            chunk: ChunkOptions::default(),
            generator: GeneratorOptions::default(),
            worker_count: 4,
            resume: true,
        }
    }

    /// Configuration errors surface here, before any stage runs.
    pub fn validate(&self) -> Result<()> {
        self.chunk.validate()?;
        self.generator.category_quotas.validate()?;
        if self.worker_count == 0 {
            return Err(crate::error::PipelineError::InvalidConfig(
                "worker_count must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Stable document id from the file stem: lowercase, `[a-z0-9_-]` only.
pub fn document_id(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let id: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if id.is_empty() {
        "document".to_string()
    } else {
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_from_file_names() {
        assert_eq!(document_id(Path::new("/x/Big Glossary.v2.docx")), "big_glossary_v2");
        assert_eq!(document_id(Path::new("a-b_c.txt")), "a-b_c");
        assert_eq!(document_id(Path::new("Wörterbuch.txt")), "w_rterbuch");
        assert_eq!(document_id(Path::new("词典.pdf")), "__");
    }

    #[test]
    fn stage_labels_follow_serde() {
        for s in Stage::ALL {
            assert_eq!(serde_json::to_string(&s).unwrap(), format!("\"{}\"", s.as_str()));
        }
    }

    #[test]
    fn cancel_is_shared() {
        let a = CancelToken::new();
        let b = a.clone();
        b.cancel();
        assert!(a.is_cancelled());
    }

    #[test]
    fn zero_workers_rejected() {
        let mut opts = PipelineOptions::new("out");
        opts.worker_count = 0;
        assert_eq!(opts.validate().unwrap_err().kind(), "invalid_config");
    }
}

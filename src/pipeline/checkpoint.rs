use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::artifacts::{read_json, write_json_atomic, ArtifactLayout};
use super::Stage;
use crate::digest::sha256_files;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDigest {
    pub input_digest: String,
    pub output_digest: String,
    /// Output files relative to the output root, in digest order.
    pub outputs: Vec<PathBuf>,
}

/// Per-document record of committed stages. Rewritten atomically after
/// every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineCheckpoint {
    pub document_id: String,
    pub completed_stages: Vec<Stage>,
    pub stage_outputs_digest: BTreeMap<Stage, StageDigest>,
    pub timestamp: DateTime<Utc>,
}

/// Why a recorded stage can't be reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reuse {
    Valid,
    NotRecorded,
    InputChanged,
    OutputMismatch(String),
}

impl PipelineCheckpoint {
    pub fn new(document_id: &str) -> Self {
        PipelineCheckpoint {
            document_id: document_id.to_string(),
            completed_stages: Vec::new(),
            stage_outputs_digest: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// A missing or unreadable checkpoint means starting over.
    pub fn load(path: &Path, document_id: &str) -> Self {
        if !path.exists() {
            return Self::new(document_id);
        }
        match read_json::<PipelineCheckpoint>(path) {
            Ok(cp) if cp.document_id == document_id => cp,
            Ok(cp) => {
                warn!(expected = document_id, found = %cp.document_id, "checkpoint belongs to another document, ignoring");
                Self::new(document_id)
            }
            Err(e) => {
                warn!(path = %path.display(), "unreadable checkpoint, ignoring: {e}");
                Self::new(document_id)
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    pub fn is_completed(&self, stage: Stage) -> bool {
        self.completed_stages.contains(&stage)
    }

    pub fn check(&self, stage: Stage, input_digest: &str, layout: &ArtifactLayout) -> Reuse {
        let Some(record) = self.stage_outputs_digest.get(&stage) else {
            return Reuse::NotRecorded;
        };
        if !self.is_completed(stage) {
            return Reuse::NotRecorded;
        }
        if record.input_digest != input_digest {
            return Reuse::InputChanged;
        }
        let paths: Vec<PathBuf> = record.outputs.iter().map(|p| layout.resolve(p)).collect();
        if let Some(missing) = paths.iter().find(|p| !p.exists()) {
            return Reuse::OutputMismatch(format!("missing output {}", missing.display()));
        }
        match sha256_files(&paths) {
            Ok(digest) if digest == record.output_digest => Reuse::Valid,
            Ok(_) => Reuse::OutputMismatch("output digest differs from checkpoint".into()),
            Err(e) => Reuse::OutputMismatch(format!("outputs unreadable: {e}")),
        }
    }

    pub fn record(&self, stage: Stage) -> Option<&StageDigest> {
        self.stage_outputs_digest.get(&stage)
    }

    /// Record `stage` as committed, replacing any earlier record of it.
    /// Dependent stages notice through their own input digests.
    pub fn commit(&mut self, stage: Stage, digest: StageDigest) {
        if !self.is_completed(stage) {
            self.completed_stages.push(stage);
            self.completed_stages.sort();
        }
        self.stage_outputs_digest.insert(stage, digest);
        self.timestamp = Utc::now();
    }
}

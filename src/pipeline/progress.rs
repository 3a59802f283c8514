use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::Stage;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEvent {
    Started,
    Committed,
    Skipped,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub at: DateTime<Utc>,
    pub document_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub event: ProgressEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Append-only JSON-lines progress log shared by all workers.
pub struct ProgressSink {
    writer: Mutex<BufWriter<File>>,
}

impl ProgressSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(ProgressSink {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn record(&self, document_id: &str, stage: Option<Stage>, event: ProgressEvent, detail: Option<String>) {
        let record = ProgressRecord {
            at: Utc::now(),
            document_id: document_id.to_string(),
            stage,
            event,
            detail,
        };
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        // each line is flushed whole so a crash never leaves a torn record
        let result = serde_json::to_writer(&mut *writer, &record)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush());
        if let Err(e) = result {
            warn!(document_id, "progress log write failed: {e}");
        }
    }
}

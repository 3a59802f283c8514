//! Append-only JSONL scratch store for flushed nodes.
//!
//! Layout: one `header` line, then repeated batches of `node` lines each
//! followed by a `marker`. Anything after the last marker is a torn write and
//! is discarded on resume.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::tree::NodeRecord;
use crate::error::Result;

const SCRATCH_VERSION: u32 = 2;

/// Parser state at a flush boundary: enough to continue from `lines_consumed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushMarker {
    pub lines_consumed: usize,
    pub text_len: usize,
    pub pending_blank: bool,
    pub next_id: u32,
    pub nodes_closed: usize,
    pub stack: Vec<NodeRecord>,
    pub leaf: Option<NodeRecord>,
    pub leaf_indent: usize,
    pub complete: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ScratchLine {
    Header { input_digest: String, version: u32 },
    Node(NodeRecord),
    Marker(FlushMarker),
}

/// Destination for closed nodes. The builder calls `write_batch` at every flush.
pub trait NodeSink {
    fn write_batch(&mut self, records: &[NodeRecord], marker: &FlushMarker) -> Result<()>;

    /// All records written so far, in write order.
    fn into_records(self) -> Result<Vec<NodeRecord>>
    where
        Self: Sized;
}

/// In-memory sink for callers that don't need resumability.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<NodeRecord>,
}

impl NodeSink for MemorySink {
    fn write_batch(&mut self, records: &[NodeRecord], _marker: &FlushMarker) -> Result<()> {
        self.records.extend_from_slice(records);
        Ok(())
    }

    fn into_records(self) -> Result<Vec<NodeRecord>> {
        Ok(self.records)
    }
}

pub struct ScratchFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ScratchFile {
    pub fn create(path: &Path, input_digest: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        let header = ScratchLine::Header {
            input_digest: input_digest.to_string(),
            version: SCRATCH_VERSION,
        };
        serde_json::to_writer(&mut writer, &header)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(ScratchFile {
            path: path.to_path_buf(),
            writer,
        })
    }

    /// Reopen an interrupted scratch file. Returns `None` when there is nothing
    /// usable: no file, a different input digest, or no complete marker yet.
    pub fn resume(path: &Path, input_digest: &str) -> Result<Option<(Self, FlushMarker)>> {
        let Some(scan) = scan(path)? else {
            return Ok(None);
        };
        if scan.input_digest != input_digest {
            debug!(path = %path.display(), "scratch was built from different input, ignoring");
            return Ok(None);
        }
        let Some((marker, good_len)) = scan.last_marker else {
            return Ok(None);
        };

        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(good_len)?;
        drop(file);
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Some((
            ScratchFile {
                path: path.to_path_buf(),
                writer: BufWriter::new(file),
            },
            marker,
        )))
    }

    /// Node records up to the last complete marker.
    pub fn read_records(path: &Path) -> Result<Vec<NodeRecord>> {
        Ok(scan(path)?.map(|s| s.records).unwrap_or_default())
    }
}

impl NodeSink for ScratchFile {
    fn write_batch(&mut self, records: &[NodeRecord], marker: &FlushMarker) -> Result<()> {
        for record in records {
            serde_json::to_writer(&mut self.writer, &ScratchLine::Node(record.clone()))?;
            self.writer.write_all(b"\n")?;
        }
        serde_json::to_writer(&mut self.writer, &ScratchLine::Marker(marker.clone()))?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    fn into_records(mut self) -> Result<Vec<NodeRecord>> {
        self.writer.flush()?;
        let path = self.path.clone();
        drop(self);
        Self::read_records(&path)
    }
}

struct Scan {
    input_digest: String,
    records: Vec<NodeRecord>,
    /// Last marker and the byte length of the file up to and including it.
    last_marker: Option<(FlushMarker, u64)>,
}

fn scan(path: &Path) -> Result<Option<Scan>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    let mut offset: u64 = 0;
    let mut input_digest = None;
    let mut pending = Vec::new();
    let mut scan = Scan {
        input_digest: String::new(),
        records: Vec::new(),
        last_marker: None,
    };

    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        offset += n as u64;
        if !line.ends_with('\n') {
            warn!(path = %path.display(), "discarding torn scratch line");
            break;
        }
        let parsed: ScratchLine = match serde_json::from_str(line.trim_end()) {
            Ok(p) => p,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable scratch line, truncating");
                break;
            }
        };
        match parsed {
            ScratchLine::Header { input_digest: d, version } if input_digest.is_none() => {
                if version != SCRATCH_VERSION {
                    return Ok(None);
                }
                input_digest = Some(d);
            }
            ScratchLine::Header { .. } => break,
            ScratchLine::Node(r) => pending.push(r),
            ScratchLine::Marker(m) => {
                scan.records.append(&mut pending);
                scan.last_marker = Some((m, offset));
            }
        }
    }

    let Some(digest) = input_digest else {
        return Ok(None);
    };
    scan.input_digest = digest;
    Ok(Some(scan))
}

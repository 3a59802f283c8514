//! Output layout and atomic writes.
//!
//! Every artifact is written to `<name>.tmp` and renamed into place, so a
//! reader never observes a half-written file.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::chunk::ChunkStrategy;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
    document_id: String,
}

impl ArtifactLayout {
    pub fn new(output_dir: &Path, document_id: &str) -> Self {
        ArtifactLayout {
            root: output_dir.to_path_buf(),
            document_id: document_id.to_string(),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Intermediate state: checkpoint, parsed tree, parse scratch file.
    pub fn work_dir(&self) -> PathBuf {
        self.root.join(".work").join(&self.document_id)
    }

    pub fn checkpoint(&self) -> PathBuf {
        self.work_dir().join("checkpoint.json")
    }

    pub fn parsed(&self) -> PathBuf {
        self.work_dir().join("parsed.json")
    }

    pub fn scratch(&self) -> PathBuf {
        self.work_dir().join("parse.scratch.jsonl")
    }

    pub fn export_summary(&self) -> PathBuf {
        self.work_dir().join("export.json")
    }

    pub fn generation_report(&self) -> PathBuf {
        self.work_dir().join("generation.json")
    }

    pub fn structure(&self) -> PathBuf {
        self.named("structure.json")
    }

    pub fn extracted_text(&self) -> PathBuf {
        self.named("extracted_text.txt")
    }

    pub fn chunk_dir(&self, strategy: ChunkStrategy) -> PathBuf {
        self.root.join("chunks").join(strategy.as_str())
    }

    pub fn chunk_records(&self, strategy: ChunkStrategy) -> PathBuf {
        self.chunk_dir(strategy)
            .join(format!("{}_chunks.jsonl", self.document_id))
    }

    /// One-based, zero-padded so a directory listing sorts in chunk order.
    pub fn chunk_text(&self, strategy: ChunkStrategy, index: usize) -> PathBuf {
        self.chunk_dir(strategy)
            .join(format!("{}_chunk_{:04}.txt", self.document_id, index + 1))
    }

    pub fn dictionary(&self) -> PathBuf {
        self.named("dictionary.csv")
    }

    pub fn training_records(&self) -> PathBuf {
        self.root
            .join("training_data")
            .join(format!("{}_records.jsonl", self.document_id))
    }

    pub fn training_instructions(&self) -> PathBuf {
        self.root
            .join("training_data")
            .join(format!("{}_instructions.jsonl", self.document_id))
    }

    pub fn report(&self) -> PathBuf {
        self.named("processing_report.json")
    }

    /// Path relative to the output root, as stored in checkpoints.
    pub fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }

    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    /// Remove chunk text files of this document left by an earlier run.
    pub fn clear_chunk_texts(&self, strategy: ChunkStrategy) -> Result<usize> {
        let dir = self.chunk_dir(strategy);
        if !dir.exists() {
            return Ok(0);
        }
        let prefix = format!("{}_chunk_", self.document_id);
        let mut removed = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // `<doc>_chunk_NNNN.txt` only; `<doc>_chunk` is a valid id of another document
            let numbered = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".txt"))
                .is_some_and(|n| n.len() >= 4 && n.bytes().all(|b| b.is_ascii_digit()));
            if numbered {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn named(&self, suffix: &str) -> PathBuf {
        self.root.join(format!("{}_{}", self.document_id, suffix))
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write through a buffered temp file, fsync, then rename over `path`.
pub fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    if let Err(e) = write_tmp(&tmp, write) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn write_tmp<F>(tmp: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let mut writer = BufWriter::new(File::create(tmp)?);
    write(&mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, |w| {
        serde_json::to_writer_pretty(&mut *w, value)?;
        w.write_all(b"\n")?;
        Ok(())
    })
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_names() {
        let layout = ArtifactLayout::new(Path::new("/out"), "fruit");
        assert_eq!(layout.structure(), Path::new("/out/fruit_structure.json"));
        assert_eq!(
            layout.chunk_text(ChunkStrategy::Fixed, 0),
            Path::new("/out/chunks/fixed/fruit_chunk_0001.txt")
        );
        assert_eq!(
            layout.training_records(),
            Path::new("/out/training_data/fruit_records.jsonl")
        );
        assert_eq!(
            layout.relative(&layout.checkpoint()),
            Path::new(".work/fruit/checkpoint.json")
        );
    }

    #[test]
    fn failed_write_leaves_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.txt");
        write_atomic(&path, |w| Ok(w.write_all(b"first")?)).unwrap();

        let err = write_atomic(&path, |w| {
            w.write_all(b"second")?;
            Err(crate::error::PipelineError::InvalidConfig("boom".into()))
        });
        assert!(err.is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "first");
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn stale_chunk_files_are_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path(), "doc");
        let other = ArtifactLayout::new(dir.path(), "other");
        let lookalike = ArtifactLayout::new(dir.path(), "doc_chunk");
        for l in [&layout, &other, &lookalike] {
            for index in [0, 11] {
                let p = l.chunk_text(ChunkStrategy::Semantic, index);
                write_atomic(&p, |w| Ok(w.write_all(b"x")?)).unwrap();
            }
        }
        assert_eq!(layout.clear_chunk_texts(ChunkStrategy::Semantic).unwrap(), 2);
        assert!(!layout.chunk_text(ChunkStrategy::Semantic, 11).exists());
        assert!(other.chunk_text(ChunkStrategy::Semantic, 0).exists());
        assert!(lookalike.chunk_text(ChunkStrategy::Semantic, 0).exists());
        assert!(lookalike.chunk_text(ChunkStrategy::Semantic, 11).exists());
    }
}

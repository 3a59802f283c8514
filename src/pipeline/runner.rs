//! One document through the stage machine.
//!
//! Each stage reads its inputs, writes outputs atomically and only then
//! records itself in the checkpoint, so an interruption at any point
//! resumes at the first stage without a valid record.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::artifacts::{read_json, write_atomic, write_json_atomic, ArtifactLayout};
use super::checkpoint::{PipelineCheckpoint, Reuse, StageDigest};
use super::progress::{ProgressEvent, ProgressSink};
use super::report::{
    ChunkSummary, DocumentFailure, DocumentStatus, DocumentSummary, ProcessingReport, StageStatus,
    StageTracker,
};
use super::{CancelToken, PipelineOptions, Stage};
use crate::chunk::chunk_text;
use crate::dataset::export::{write_instructions, write_records};
use crate::dataset::{generate, GenerationReport};
use crate::digest::{sha256_bytes, sha256_file, sha256_files};
use crate::error::{PipelineError, PipelineWarning, Result};
use crate::parser::entries::{extract_entries, write_csv, DictionaryEntry};
use crate::parser::tree::DocumentNode;
use crate::parser::{parse_document, ParsedDocument};

/// Called after every committed stage with the document id.
pub type StageHook = Arc<dyn Fn(&str, Stage) + Send + Sync>;

#[derive(Debug)]
pub struct DocumentOutcome {
    pub summary: DocumentSummary,
    /// Present when the dictionary stage ran in this invocation.
    pub dictionary_entries: Option<Vec<DictionaryEntry>>,
}

#[derive(Serialize)]
struct StructureExport<'a> {
    document_id: &'a str,
    page_count: usize,
    char_count: usize,
    page_boundaries: &'a [usize],
    root: &'a DocumentNode,
}

#[derive(Default)]
struct RunState {
    source_digest: String,
    parsed: Option<ParsedDocument>,
    entries: Option<Vec<DictionaryEntry>>,
    tracker: StageTracker,
    /// Everything raised by stages run in this invocation.
    warnings: Vec<PipelineWarning>,
}

struct StageFailure {
    stage: Option<Stage>,
    error: PipelineError,
}

impl From<PipelineError> for StageFailure {
    fn from(error: PipelineError) -> Self {
        StageFailure { stage: None, error }
    }
}

impl From<std::io::Error> for StageFailure {
    fn from(error: std::io::Error) -> Self {
        PipelineError::from(error).into()
    }
}

pub struct DocumentRunner {
    source: PathBuf,
    layout: ArtifactLayout,
    opts: Arc<PipelineOptions>,
    cancel: CancelToken,
    progress: Option<Arc<ProgressSink>>,
    on_commit: Option<StageHook>,
}

impl DocumentRunner {
    pub fn new(source: &Path, document_id: &str, opts: Arc<PipelineOptions>, cancel: CancelToken) -> Self {
        DocumentRunner {
            source: source.to_path_buf(),
            layout: ArtifactLayout::new(&opts.output_dir, document_id),
            opts,
            cancel,
            progress: None,
            on_commit: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    #[cfg(test)]
    pub fn with_hook(mut self, hook: StageHook) -> Self {
        self.on_commit = Some(hook);
        self
    }

    pub fn document_id(&self) -> &str {
        self.layout.document_id()
    }

    /// Never fails: errors are captured in the outcome so one document
    /// can't take down the batch.
    pub fn run(&self) -> DocumentOutcome {
        let started = Instant::now();
        let mut st = RunState::default();
        let result = self.run_stages(&mut st);

        let (status, failure) = match result {
            Ok(status) => (status, None),
            Err(StageFailure { stage, error }) => {
                warn!(
                    document_id = self.document_id(),
                    stage = stage.map(|s| s.as_str()),
                    kind = error.kind(),
                    "document failed: {error}"
                );
                self.emit(stage, ProgressEvent::Failed, Some(error.to_string()));
                let failure = DocumentFailure {
                    stage,
                    kind: error.kind().to_string(),
                    message: error.to_string(),
                    partial: error.is_partial(),
                };
                (DocumentStatus::Failed, Some(failure))
            }
        };

        let summary = DocumentSummary {
            document_id: self.document_id().to_string(),
            source: self.source.clone(),
            status,
            stages: st.tracker.into_metrics(),
            failure,
            warnings: st.warnings,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        DocumentOutcome {
            summary,
            dictionary_entries: st.entries,
        }
    }

    fn run_stages(&self, st: &mut RunState) -> std::result::Result<DocumentStatus, StageFailure> {
        if self.cancel.is_cancelled() {
            self.emit(None, ProgressEvent::Cancelled, None);
            return Ok(DocumentStatus::Cancelled);
        }
        if !self.source.exists() {
            return Err(StageFailure {
                stage: Some(Stage::Parse),
                error: PipelineError::MissingInput(self.source.clone()),
            });
        }
        st.source_digest = sha256_file(&self.source)?;
        fs::create_dir_all(self.layout.work_dir())?;

        let mut checkpoint = if self.opts.resume {
            PipelineCheckpoint::load(&self.layout.checkpoint(), self.document_id())
        } else {
            for stale in [self.layout.checkpoint(), self.layout.scratch()] {
                if stale.exists() {
                    fs::remove_file(stale)?;
                }
            }
            PipelineCheckpoint::new(self.document_id())
        };

        for stage in Stage::ALL {
            if self.cancel.is_cancelled() {
                info!(document_id = self.document_id(), next = %stage, "cancelled between stages");
                self.emit(Some(stage), ProgressEvent::Cancelled, None);
                return Ok(DocumentStatus::Cancelled);
            }
            let started = Instant::now();
            let input_digest = self
                .input_digest(stage, &st.source_digest, &checkpoint)
                .map_err(|error| StageFailure { stage: Some(stage), error })?;

            match checkpoint.check(stage, &input_digest, &self.layout) {
                Reuse::Valid => {
                    debug!(document_id = self.document_id(), stage = %stage, "checkpoint valid, skipping");
                    st.tracker.record(stage, StageStatus::Skipped, started);
                    self.emit(Some(stage), ProgressEvent::Skipped, None);
                    continue;
                }
                Reuse::OutputMismatch(reason) => {
                    warn!(document_id = self.document_id(), stage = %stage, "re-running stage: {reason}");
                    st.warnings
                        .push(PipelineWarning::StageCheckpointMismatch { stage, reason });
                }
                Reuse::InputChanged => {
                    debug!(document_id = self.document_id(), stage = %stage, "inputs changed since checkpoint");
                }
                Reuse::NotRecorded => {}
            }

            self.emit(Some(stage), ProgressEvent::Started, None);
            let committed = self
                .execute(stage, st)
                .and_then(|outputs| self.commit(&mut checkpoint, stage, input_digest, &outputs));
            if let Err(error) = committed {
                st.tracker.record(stage, StageStatus::Failed, started);
                return Err(StageFailure { stage: Some(stage), error });
            }

            st.tracker.record(stage, StageStatus::Ran, started);
            info!(
                document_id = self.document_id(),
                stage = %stage,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "stage committed"
            );
            self.emit(Some(stage), ProgressEvent::Committed, None);
            if let Some(hook) = &self.on_commit {
                hook(self.document_id(), stage);
            }
        }
        Ok(DocumentStatus::Completed)
    }

    /// Digest of everything a stage's output depends on. Downstream stages
    /// chain off the parse input rather than `parsed.json`, which carries timings.
    fn input_digest(&self, stage: Stage, source_digest: &str, checkpoint: &PipelineCheckpoint) -> Result<String> {
        let parse = sha256_bytes(
            format!(
                "parse\n{source_digest}\n{}",
                serde_json::to_string(&self.opts.parse.classifier)?
            )
            .as_bytes(),
        );
        let material = match stage {
            Stage::Parse => return Ok(parse),
            Stage::ExportRawArtifacts => {
                format!("export\n{parse}\n{}", serde_json::to_string(&self.opts.chunk)?)
            }
            Stage::ExtractDictionaryEntries => format!("dictionary\n{parse}"),
            Stage::GenerateTrainingData => {
                format!("generate\n{parse}\n{}", serde_json::to_string(&self.opts.generator)?)
            }
            Stage::BuildReport => {
                let mut material = String::from("report");
                for upstream in &Stage::ALL[..4] {
                    let (input, output) = checkpoint
                        .record(*upstream)
                        .map(|r| (r.input_digest.as_str(), r.output_digest.as_str()))
                        .unwrap_or_default();
                    material.push_str(&format!("\n{upstream}:{input}:{output}"));
                }
                material
            }
        };
        Ok(sha256_bytes(material.as_bytes()))
    }

    fn commit(
        &self,
        checkpoint: &mut PipelineCheckpoint,
        stage: Stage,
        input_digest: String,
        outputs: &[PathBuf],
    ) -> Result<()> {
        let digest = StageDigest {
            input_digest,
            output_digest: sha256_files(outputs)?,
            outputs: outputs.iter().map(|p| self.layout.relative(p)).collect(),
        };
        checkpoint.commit(stage, digest);
        checkpoint.save(&self.layout.checkpoint())?;
        if stage == Stage::Parse {
            let scratch = self.layout.scratch();
            if scratch.exists() {
                fs::remove_file(scratch)?;
            }
        }
        Ok(())
    }

    /// Run one stage, returning the files it wrote.
    fn execute(&self, stage: Stage, st: &mut RunState) -> Result<Vec<PathBuf>> {
        match stage {
            Stage::Parse => self.parse(st),
            Stage::ExportRawArtifacts => self.export_raw(st),
            Stage::ExtractDictionaryEntries => self.extract_dictionary(st),
            Stage::GenerateTrainingData => self.generate_training(st),
            Stage::BuildReport => self.build_report(st),
        }
    }

    fn parse(&self, st: &mut RunState) -> Result<Vec<PathBuf>> {
        let mut opts = self.opts.parse.clone();
        opts.scratch_path = Some(self.layout.scratch());
        opts.resume = self.opts.resume;
        let parsed = parse_document(&self.source, self.document_id(), &opts)?;
        st.warnings.extend(parsed.warnings.iter().cloned());

        let path = self.layout.parsed();
        write_json_atomic(&path, &parsed)?;
        st.parsed = Some(parsed);
        Ok(vec![path])
    }

    fn export_raw(&self, st: &mut RunState) -> Result<Vec<PathBuf>> {
        let parsed = load_parsed(&self.layout, &mut st.parsed)?;
        let chunk_opts = &self.opts.chunk;

        let structure = self.layout.structure();
        write_json_atomic(
            &structure,
            &StructureExport {
                document_id: &parsed.document_id,
                page_count: parsed.metadata.page_count,
                char_count: parsed.metadata.char_count,
                page_boundaries: &parsed.page_boundaries,
                root: &parsed.root,
            },
        )?;

        let text_path = self.layout.extracted_text();
        write_atomic(&text_path, |w| Ok(w.write_all(parsed.text.as_bytes())?))?;

        let set = chunk_text(&parsed.text, Some(&parsed.root), chunk_opts)?;
        st.warnings.extend(set.warnings.iter().cloned());
        let records = self.layout.chunk_records(chunk_opts.strategy);
        write_atomic(&records, |w| {
            for chunk in &set.chunks {
                serde_json::to_writer(&mut *w, chunk)?;
                w.write_all(b"\n")?;
            }
            Ok(())
        })?;
        self.layout.clear_chunk_texts(chunk_opts.strategy)?;
        let mut chunk_files = Vec::with_capacity(set.chunks.len());
        for chunk in &set.chunks {
            let path = self.layout.chunk_text(chunk_opts.strategy, chunk.index);
            write_atomic(&path, |w| Ok(w.write_all(chunk.text.as_bytes())?))?;
            chunk_files.push(path);
        }

        let summary_path = self.layout.export_summary();
        write_json_atomic(
            &summary_path,
            &ChunkSummary {
                strategy: chunk_opts.strategy,
                max_size: chunk_opts.max_size,
                chunk_count: set.chunks.len(),
                oversized: set.oversized(),
                warnings: set.warnings.clone(),
            },
        )?;

        let mut outputs = vec![structure, text_path, summary_path, records];
        outputs.extend(chunk_files);
        Ok(outputs)
    }

    fn extract_dictionary(&self, st: &mut RunState) -> Result<Vec<PathBuf>> {
        let parsed = load_parsed(&self.layout, &mut st.parsed)?;
        let entries = extract_entries(&parsed.root);
        let path = self.layout.dictionary();
        write_atomic(&path, |w| write_csv(&entries, w))?;
        debug!(document_id = self.document_id(), entries = entries.len(), "dictionary written");
        st.entries = Some(entries);
        Ok(vec![path])
    }

    fn generate_training(&self, st: &mut RunState) -> Result<Vec<PathBuf>> {
        let parsed = load_parsed(&self.layout, &mut st.parsed)?;
        let dataset = generate(&parsed.root, &self.opts.generator)?;
        st.warnings.extend(dataset.report.warnings.iter().cloned());

        let records = self.layout.training_records();
        write_atomic(&records, |w| write_records(&dataset.examples, w))?;
        let instructions = self.layout.training_instructions();
        write_atomic(&instructions, |w| write_instructions(&dataset.examples, w))?;
        let report = self.layout.generation_report();
        write_json_atomic(&report, &dataset.report)?;
        Ok(vec![records, instructions, report])
    }

    fn build_report(&self, st: &mut RunState) -> Result<Vec<PathBuf>> {
        let parsed = load_parsed(&self.layout, &mut st.parsed)?;
        let chunks: ChunkSummary = read_json(&self.layout.export_summary())?;
        let generation: GenerationReport = read_json(&self.layout.generation_report())?;
        let dictionary_entries = match &st.entries {
            Some(entries) => entries.len(),
            None => extract_entries(&parsed.root).len(),
        };

        let mut warnings = parsed.warnings.clone();
        warnings.extend(chunks.warnings.iter().cloned());
        warnings.extend(generation.warnings.iter().cloned());
        warnings.extend(
            st.warnings
                .iter()
                .filter(|w| matches!(w, PipelineWarning::StageCheckpointMismatch { .. }))
                .cloned(),
        );

        let report = ProcessingReport {
            document_id: parsed.document_id.clone(),
            source: parsed.source.clone(),
            source_digest: st.source_digest.clone(),
            generated_at: Utc::now(),
            metadata: parsed.metadata.clone(),
            dictionary_entries,
            chunks,
            generation,
            stages: st.tracker.metrics().to_vec(),
            warnings,
        };
        let path = self.layout.report();
        write_json_atomic(&path, &report)?;
        Ok(vec![path])
    }

    fn emit(&self, stage: Option<Stage>, event: ProgressEvent, detail: Option<String>) {
        if let Some(progress) = &self.progress {
            progress.record(self.document_id(), stage, event, detail);
        }
    }
}

/// The parsed document from this run, or from `parsed.json` when parse was skipped.
fn load_parsed<'a>(layout: &ArtifactLayout, slot: &'a mut Option<ParsedDocument>) -> Result<&'a ParsedDocument> {
    let parsed = match slot.take() {
        Some(parsed) => parsed,
        None => read_json(&layout.parsed())?,
    };
    Ok(slot.insert(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkStrategy;
    use crate::pipeline::report::StageMetric;
    use std::collections::BTreeMap;

    fn fixture() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/glossary.txt")
    }

    fn options(out: &Path) -> PipelineOptions {
        let mut opts = PipelineOptions::new(out);
        opts.chunk.max_size = 300;
        opts.generator.target_count = 20;
        opts.parse.flush_every = 4;
        opts
    }

    fn run(opts: &PipelineOptions, hook: Option<StageHook>, cancel: CancelToken) -> DocumentOutcome {
        let mut runner = DocumentRunner::new(&fixture(), "glossary", Arc::new(opts.clone()), cancel);
        if let Some(hook) = hook {
            runner = runner.with_hook(hook);
        }
        runner.run()
    }

    fn statuses(stages: &[StageMetric]) -> Vec<(Stage, StageStatus)> {
        stages.iter().map(|m| (m.stage, m.status)).collect()
    }

    /// Every file under `root` except intermediate state and the report.
    fn final_artifacts(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
            for entry in fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                let rel = path.strip_prefix(root).unwrap().to_path_buf();
                if rel.starts_with(".work") || rel.to_string_lossy().ends_with("processing_report.json") {
                    continue;
                }
                if path.is_dir() {
                    walk(root, &path, out);
                } else {
                    out.insert(rel, fs::read(&path).unwrap());
                }
            }
        }
        let mut out = BTreeMap::new();
        walk(root, root, &mut out);
        out
    }

    #[test]
    fn full_run_writes_every_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());
        let outcome = run(&opts, None, CancelToken::new());
        assert_eq!(outcome.summary.status, DocumentStatus::Completed);
        assert!(outcome.summary.stages.iter().all(|m| m.status == StageStatus::Ran));

        let layout = ArtifactLayout::new(dir.path(), "glossary");
        for path in [
            layout.structure(),
            layout.extracted_text(),
            layout.chunk_records(ChunkStrategy::Structural),
            layout.chunk_text(ChunkStrategy::Structural, 0),
            layout.dictionary(),
            layout.training_records(),
            layout.training_instructions(),
            layout.report(),
        ] {
            assert!(path.exists(), "missing {}", path.display());
        }
        assert!(!layout.scratch().exists());

        let cp = PipelineCheckpoint::load(&layout.checkpoint(), "glossary");
        assert_eq!(cp.completed_stages, Stage::ALL.to_vec());

        let report: ProcessingReport = read_json(&layout.report()).unwrap();
        assert_eq!(report.document_id, "glossary");
        assert_eq!(report.dictionary_entries, 11);
        assert_eq!(report.stages.len(), 4);
        assert_eq!(outcome.dictionary_entries.map(|e| e.len()), Some(11));

        let csv = fs::read_to_string(layout.dictionary()).unwrap();
        assert!(csv.starts_with("term,definition,confidence,start,end\n"));
    }

    #[test]
    fn rerun_skips_committed_stages() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());
        run(&opts, None, CancelToken::new());
        let before = final_artifacts(dir.path());

        let again = run(&opts, None, CancelToken::new());
        assert_eq!(again.summary.status, DocumentStatus::Completed);
        assert!(again.summary.stages.iter().all(|m| m.status == StageStatus::Skipped));
        assert!(again.dictionary_entries.is_none());
        assert_eq!(final_artifacts(dir.path()), before);
    }

    #[test]
    fn interrupted_run_resumes_to_identical_artifacts() {
        let reference = tempfile::tempdir().unwrap();
        run(&options(reference.path()), None, CancelToken::new());
        let expected = final_artifacts(reference.path());

        for (n, stop_after) in Stage::ALL[..4].iter().copied().enumerate() {
            let dir = tempfile::tempdir().unwrap();
            let opts = options(dir.path());

            let cancel = CancelToken::new();
            let trip = cancel.clone();
            let hook: StageHook = Arc::new(move |_: &str, stage: Stage| {
                if stage == stop_after {
                    trip.cancel();
                }
            });
            let first = run(&opts, Some(hook), cancel);
            assert_eq!(first.summary.status, DocumentStatus::Cancelled);
            assert_eq!(first.summary.stages.len(), n + 1);

            let resumed = run(&opts, None, CancelToken::new());
            assert_eq!(resumed.summary.status, DocumentStatus::Completed);
            let skipped = resumed
                .summary
                .stages
                .iter()
                .filter(|m| m.status == StageStatus::Skipped)
                .count();
            assert_eq!(skipped, n + 1, "stopped after {stop_after}");
            assert_eq!(final_artifacts(dir.path()), expected, "stopped after {stop_after}");
        }
    }

    #[test]
    fn tampered_output_is_regenerated_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());
        run(&opts, None, CancelToken::new());
        let layout = ArtifactLayout::new(dir.path(), "glossary");
        let original = fs::read(layout.dictionary()).unwrap();
        fs::write(layout.dictionary(), "term,definition\nbogus,row\n").unwrap();

        let outcome = run(&opts, None, CancelToken::new());
        assert_eq!(
            statuses(&outcome.summary.stages),
            vec![
                (Stage::Parse, StageStatus::Skipped),
                (Stage::ExportRawArtifacts, StageStatus::Skipped),
                (Stage::ExtractDictionaryEntries, StageStatus::Ran),
                (Stage::GenerateTrainingData, StageStatus::Skipped),
                (Stage::BuildReport, StageStatus::Skipped),
            ]
        );
        assert!(matches!(
            outcome.summary.warnings.as_slice(),
            [PipelineWarning::StageCheckpointMismatch {
                stage: Stage::ExtractDictionaryEntries,
                ..
            }]
        ));
        assert_eq!(fs::read(layout.dictionary()).unwrap(), original);
    }

    #[test]
    fn changed_chunk_options_rerun_export_and_report_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        run(&opts, None, CancelToken::new());

        opts.chunk.strategy = ChunkStrategy::Fixed;
        let outcome = run(&opts, None, CancelToken::new());
        assert_eq!(
            statuses(&outcome.summary.stages),
            vec![
                (Stage::Parse, StageStatus::Skipped),
                (Stage::ExportRawArtifacts, StageStatus::Ran),
                (Stage::ExtractDictionaryEntries, StageStatus::Skipped),
                (Stage::GenerateTrainingData, StageStatus::Skipped),
                (Stage::BuildReport, StageStatus::Ran),
            ]
        );
        let layout = ArtifactLayout::new(dir.path(), "glossary");
        assert!(layout.chunk_records(ChunkStrategy::Fixed).exists());
        let report: ProcessingReport = read_json(&layout.report()).unwrap();
        assert_eq!(report.chunks.strategy, ChunkStrategy::Fixed);
    }

    #[test]
    fn no_resume_reruns_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        run(&opts, None, CancelToken::new());
        opts.resume = false;
        let outcome = run(&opts, None, CancelToken::new());
        assert!(outcome.summary.stages.iter().all(|m| m.status == StageStatus::Ran));
    }

    #[test]
    fn failures_are_captured_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let notes = dir.path().join("notes.xyz");
        fs::write(&notes, "whatever").unwrap();
        let opts = Arc::new(options(&dir.path().join("out")));

        let outcome = DocumentRunner::new(&notes, "notes", opts.clone(), CancelToken::new()).run();
        assert_eq!(outcome.summary.status, DocumentStatus::Failed);
        let failure = outcome.summary.failure.unwrap();
        assert_eq!(failure.kind, "unsupported_format");
        assert_eq!(failure.stage, Some(Stage::Parse));
        assert!(!failure.partial);

        let missing = dir.path().join("gone.txt");
        let outcome = DocumentRunner::new(&missing, "gone", opts, CancelToken::new()).run();
        assert_eq!(outcome.summary.failure.unwrap().kind, "missing_input");
    }

    #[test]
    fn cancelled_before_start_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = run(&options(dir.path()), None, cancel);
        assert_eq!(outcome.summary.status, DocumentStatus::Cancelled);
        assert!(outcome.summary.stages.is_empty());
        assert!(!dir.path().join("glossary_structure.json").exists());
    }
}

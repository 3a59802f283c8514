use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::artifacts::write_json_atomic;
use super::progress::ProgressSink;
use super::report::{new_run_id, BatchReport, DocumentFailure, DocumentStatus, DocumentSummary};
use super::runner::{DocumentOutcome, DocumentRunner};
use super::{document_id, CancelToken, PipelineOptions};
use crate::db;
use crate::error::PipelineError;
use crate::source::is_supported;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchInput {
    pub source: PathBuf,
    pub document_id: String,
}

/// Expand directories (supported files only, sorted) and assign unique ids.
/// Explicitly named files are kept even if unsupported so they fail visibly.
pub fn collect_inputs(paths: &[PathBuf]) -> Result<Vec<BatchInput>, PipelineError> {
    let mut files = Vec::new();
    for path in paths {
        if !path.exists() {
            return Err(PipelineError::MissingInput(path.clone()));
        }
        if path.is_dir() {
            let mut found: Vec<PathBuf> = fs::read_dir(path)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_supported(p))
                .collect();
            found.sort();
            files.extend(found);
        } else {
            files.push(path.clone());
        }
    }

    let mut seen: HashMap<String, usize> = HashMap::new();
    Ok(files
        .into_iter()
        .map(|source| {
            let base = document_id(&source);
            let n = seen.entry(base.clone()).or_insert(0);
            *n += 1;
            let document_id = if *n == 1 { base } else { format!("{base}-{n}") };
            BatchInput { source, document_id }
        })
        .collect())
}

fn panicked(input: &BatchInput, message: String) -> DocumentOutcome {
    DocumentOutcome {
        summary: DocumentSummary {
            document_id: input.document_id.clone(),
            source: input.source.clone(),
            status: DocumentStatus::Failed,
            stages: Vec::new(),
            failure: Some(DocumentFailure {
                stage: None,
                kind: "panic".into(),
                message,
                partial: false,
            }),
            warnings: Vec::new(),
            duration_ms: 0,
        },
        dictionary_entries: None,
    }
}

/// Process documents on a bounded worker pool, streaming each outcome into
/// the ledger as it arrives.
pub async fn run_batch(
    conn: &Connection,
    inputs: Vec<BatchInput>,
    opts: Arc<PipelineOptions>,
    cancel: CancelToken,
) -> Result<BatchReport> {
    opts.validate()?;
    let run_id = new_run_id();
    let started_at = Utc::now();
    let started = Instant::now();
    let total = inputs.len();
    fs::create_dir_all(&opts.output_dir)?;
    db::start_run(conn, &run_id, &opts.output_dir, total)?;
    info!(run_id = %run_id, documents = total, workers = opts.worker_count, "batch started");

    let progress = Arc::new(ProgressSink::open(&opts.output_dir.join("progress.jsonl"))?);
    let semaphore = Arc::new(Semaphore::new(opts.worker_count));

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta}) {msg}")?
            .progress_chars("=> "),
    );

    // Channel: workers send outcomes, this loop owns the ledger
    let (tx, mut rx) = tokio::sync::mpsc::channel::<(usize, DocumentOutcome)>(opts.worker_count * 2);

    for (index, input) in inputs.into_iter().enumerate() {
        let sem = Arc::clone(&semaphore);
        let opts = Arc::clone(&opts);
        let progress = Arc::clone(&progress);
        let cancel = cancel.clone();
        let tx = tx.clone();

        tokio::spawn(async move {
            let Ok(_permit) = sem.acquire_owned().await else {
                return;
            };
            let runner = DocumentRunner::new(&input.source, &input.document_id, opts, cancel)
                .with_progress(progress);
            let outcome = match tokio::task::spawn_blocking(move || runner.run()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(document_id = %input.document_id, "worker panicked: {e}");
                    panicked(&input, e.to_string())
                }
            };
            let _ = tx.send((index, outcome)).await;
        });
    }

    // Drop our copy of tx so rx closes when all spawned tasks finish
    drop(tx);

    let mut summaries = Vec::with_capacity(total);
    while let Some((index, outcome)) = rx.recv().await {
        let summary = &outcome.summary;
        db::save_document(conn, &run_id, summary)?;
        if let Some(entries) = &outcome.dictionary_entries {
            db::save_entries(conn, &summary.document_id, entries)?;
        }
        match (&summary.status, &summary.failure) {
            (DocumentStatus::Failed, Some(failure)) => warn!(
                document_id = %summary.document_id,
                kind = %failure.kind,
                partial = failure.partial,
                "document failed"
            ),
            (status, _) => info!(
                document_id = %summary.document_id,
                status = status.as_str(),
                warnings = summary.warnings.len(),
                duration_ms = summary.duration_ms,
                "document finished"
            ),
        }
        pb.set_message(summary.document_id.clone());
        pb.inc(1);
        summaries.push((index, outcome.summary));
    }
    pb.finish_and_clear();

    summaries.sort_by_key(|(index, _)| *index);
    let report = BatchReport::new(
        run_id,
        started_at,
        summaries.into_iter().map(|(_, s)| s).collect(),
    );
    write_json_atomic(&opts.output_dir.join("batch_report.json"), &report)?;
    db::finish_run(conn, &report)?;

    info!(
        run_id = %report.run_id,
        completed = report.completed,
        failed = report.failed,
        cancelled = report.cancelled,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "batch finished"
    );
    Ok(report)
}

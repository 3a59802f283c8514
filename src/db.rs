use std::path::Path;

use anyhow::Result;
use rusqlite::Connection;

use crate::parser::entries::DictionaryEntry;
use crate::pipeline::report::{BatchReport, DocumentSummary, StageStatus};

pub const LEDGER_FILE: &str = "pipeline.sqlite";

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS runs (
            run_id      TEXT PRIMARY KEY,
            output_dir  TEXT NOT NULL,
            inputs      INTEGER NOT NULL,
            completed   INTEGER,
            failed      INTEGER,
            cancelled   INTEGER,
            started_at  TEXT NOT NULL DEFAULT (datetime('now')),
            finished_at TEXT
        );

        CREATE TABLE IF NOT EXISTS documents (
            id           INTEGER PRIMARY KEY,
            run_id       TEXT NOT NULL REFERENCES runs(run_id),
            document_id  TEXT NOT NULL,
            source       TEXT NOT NULL,
            status       TEXT NOT NULL,
            failed_stage TEXT,
            error_kind   TEXT,
            error        TEXT,
            partial      BOOLEAN NOT NULL DEFAULT 0,
            warnings     INTEGER NOT NULL DEFAULT 0,
            duration_ms  INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_documents_run ON documents(run_id);

        CREATE TABLE IF NOT EXISTS stage_metrics (
            id          INTEGER PRIMARY KEY,
            run_id      TEXT NOT NULL REFERENCES runs(run_id),
            document_id TEXT NOT NULL,
            stage       TEXT NOT NULL,
            status      TEXT NOT NULL,
            skipped     BOOLEAN NOT NULL,
            duration_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_stage_metrics_doc ON stage_metrics(document_id);

        -- Replaced per document whenever the dictionary stage runs
        CREATE TABLE IF NOT EXISTS dictionary_entries (
            id          INTEGER PRIMARY KEY,
            document_id TEXT NOT NULL,
            term        TEXT NOT NULL,
            definition  TEXT NOT NULL,
            confidence  REAL NOT NULL,
            start_pos   INTEGER NOT NULL,
            end_pos     INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_entries_doc ON dictionary_entries(document_id);
        CREATE INDEX IF NOT EXISTS idx_entries_term ON dictionary_entries(term);
        ",
    )?;
    Ok(())
}

pub fn start_run(conn: &Connection, run_id: &str, output_dir: &Path, inputs: usize) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO runs (run_id, output_dir, inputs) VALUES (?1, ?2, ?3)",
        rusqlite::params![run_id, output_dir.to_string_lossy(), inputs],
    )?;
    Ok(())
}

pub fn finish_run(conn: &Connection, report: &BatchReport) -> Result<()> {
    conn.execute(
        "UPDATE runs SET completed = ?2, failed = ?3, cancelled = ?4, finished_at = datetime('now')
         WHERE run_id = ?1",
        rusqlite::params![report.run_id, report.completed, report.failed, report.cancelled],
    )?;
    Ok(())
}

/// One document's status row plus its per-stage metrics.
pub fn save_document(conn: &Connection, run_id: &str, doc: &DocumentSummary) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    {
        let failure = doc.failure.as_ref();
        tx.execute(
            "INSERT INTO documents
                (run_id, document_id, source, status, failed_stage, error_kind, error, partial, warnings, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                run_id,
                doc.document_id,
                doc.source.to_string_lossy(),
                doc.status.as_str(),
                failure.and_then(|f| f.stage).map(|s| s.as_str()),
                failure.map(|f| f.kind.as_str()),
                failure.map(|f| f.message.as_str()),
                failure.is_some_and(|f| f.partial),
                doc.warnings.len(),
                doc.duration_ms,
            ],
        )?;

        let mut stmt = tx.prepare(
            "INSERT INTO stage_metrics (run_id, document_id, stage, status, skipped, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for m in &doc.stages {
            stmt.execute(rusqlite::params![
                run_id,
                doc.document_id,
                m.stage.as_str(),
                m.status.as_str(),
                m.status == StageStatus::Skipped,
                m.duration_ms,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub fn save_entries(conn: &Connection, document_id: &str, entries: &[DictionaryEntry]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        tx.execute(
            "DELETE FROM dictionary_entries WHERE document_id = ?1",
            [document_id],
        )?;
        let mut stmt = tx.prepare(
            "INSERT INTO dictionary_entries (document_id, term, definition, confidence, start_pos, end_pos)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for e in entries {
            count += stmt.execute(rusqlite::params![
                document_id,
                e.term,
                e.definition,
                e.confidence as f64,
                e.source_range.start,
                e.source_range.end,
            ])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

// ── Stats ──

pub struct Stats {
    pub runs: usize,
    pub documents: usize,
    pub failed: usize,
    pub partial: usize,
    pub stages_run: usize,
    pub stages_skipped: usize,
    pub entries: usize,
    pub last_run: Option<String>,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let runs: usize = conn.query_row("SELECT COUNT(*) FROM runs", [], |r| r.get(0))?;
    let documents: usize = conn.query_row(
        "SELECT COUNT(DISTINCT document_id) FROM documents",
        [],
        |r| r.get(0),
    )?;
    let failed: usize = conn.query_row(
        "SELECT COUNT(*) FROM documents WHERE status = 'failed'",
        [],
        |r| r.get(0),
    )?;
    let partial: usize =
        conn.query_row("SELECT COUNT(*) FROM documents WHERE partial = 1", [], |r| r.get(0))?;
    let stages_run: usize = conn.query_row(
        "SELECT COUNT(*) FROM stage_metrics WHERE status = 'ran'",
        [],
        |r| r.get(0),
    )?;
    let stages_skipped: usize = conn.query_row(
        "SELECT COUNT(*) FROM stage_metrics WHERE skipped = 1",
        [],
        |r| r.get(0),
    )?;
    let entries: usize =
        conn.query_row("SELECT COUNT(*) FROM dictionary_entries", [], |r| r.get(0))?;
    let last_run: Option<String> = conn
        .query_row(
            "SELECT run_id FROM runs ORDER BY started_at DESC, run_id DESC LIMIT 1",
            [],
            |r| r.get(0),
        )
        .ok();
    Ok(Stats {
        runs,
        documents,
        failed,
        partial,
        stages_run,
        stages_skipped,
        entries,
        last_run,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::tree::Span;
    use crate::pipeline::report::{DocumentFailure, DocumentStatus, StageMetric};
    use crate::pipeline::Stage;
    use std::path::PathBuf;

    fn ledger() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = connect(&dir.path().join(LEDGER_FILE)).unwrap();
        init_schema(&conn).unwrap();
        (dir, conn)
    }

    fn fetch_entries(conn: &Connection, document_id: &str) -> Result<Vec<(String, String)>> {
        let mut stmt = conn.prepare(
            "SELECT term, definition FROM dictionary_entries WHERE document_id = ?1 ORDER BY start_pos",
        )?;
        let rows = stmt
            .query_map([document_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn entry(term: &str, start: usize) -> DictionaryEntry {
        DictionaryEntry {
            term: term.into(),
            definition: format!("{term} def"),
            confidence: 0.9,
            source_range: Span::new(start, start + 10),
        }
    }

    #[test]
    fn entries_are_replaced_per_document() {
        let (_dir, conn) = ledger();
        save_entries(&conn, "a", &[entry("apple", 0), entry("pear", 20)]).unwrap();
        save_entries(&conn, "b", &[entry("lime", 0)]).unwrap();
        assert_eq!(save_entries(&conn, "a", &[entry("quince", 5)]).unwrap(), 1);

        assert_eq!(
            fetch_entries(&conn, "a").unwrap(),
            vec![("quince".to_string(), "quince def".to_string())]
        );
        assert_eq!(get_stats(&conn).unwrap().entries, 2);
    }

    #[test]
    fn documents_and_stages_feed_stats() {
        let (_dir, conn) = ledger();
        start_run(&conn, "run-1", Path::new("out"), 2).unwrap();
        let ok = DocumentSummary {
            document_id: "a".into(),
            source: PathBuf::from("a.txt"),
            status: DocumentStatus::Completed,
            stages: vec![
                StageMetric {
                    stage: Stage::Parse,
                    status: StageStatus::Skipped,
                    duration_ms: 0,
                },
                StageMetric {
                    stage: Stage::ExportRawArtifacts,
                    status: StageStatus::Ran,
                    duration_ms: 3,
                },
            ],
            failure: None,
            warnings: Vec::new(),
            duration_ms: 3,
        };
        let bad = DocumentSummary {
            document_id: "b".into(),
            source: PathBuf::from("b.docx"),
            status: DocumentStatus::Failed,
            stages: Vec::new(),
            failure: Some(DocumentFailure {
                stage: Some(Stage::Parse),
                kind: "corrupt_document".into(),
                message: "truncated".into(),
                partial: true,
            }),
            warnings: Vec::new(),
            duration_ms: 1,
        };
        save_document(&conn, "run-1", &ok).unwrap();
        save_document(&conn, "run-1", &bad).unwrap();

        let stats = get_stats(&conn).unwrap();
        assert_eq!(stats.runs, 1);
        assert_eq!(stats.documents, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.partial, 1);
        assert_eq!((stats.stages_run, stats.stages_skipped), (1, 1));
        assert_eq!(stats.last_run.as_deref(), Some("run-1"));
    }
}

mod chunk;
mod dataset;
mod db;
mod digest;
mod error;
mod normalize;
mod parser;
mod pipeline;
mod settings;
mod source;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing::warn;

use pipeline::batch::{collect_inputs, run_batch};
use pipeline::{document_id, CancelToken};
use settings::{Overrides, Settings};

#[derive(Parser)]
#[command(name = "dictparse", about = "Document structure parser and training-data generator")]
struct Cli {
    /// Settings file (default: ./dictparse.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse, export, extract and generate for every input document
    Run {
        /// Files or directories (directories are scanned for supported files)
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// semantic, structural, fixed or sliding
        #[arg(short, long)]
        strategy: Option<String>,
        /// Max chunk size in characters
        #[arg(long)]
        max_size: Option<usize>,
        /// Sliding window overlap in characters
        #[arg(long)]
        overlap: Option<usize>,
        #[arg(short = 'j', long)]
        workers: Option<usize>,
        /// Target number of training examples per document
        #[arg(short = 'n', long)]
        target: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        /// Ignore existing checkpoints and rebuild everything
        #[arg(long)]
        no_resume: bool,
    },
    /// Chunk one document and print a summary
    Chunk {
        file: PathBuf,
        #[arg(short, long)]
        strategy: Option<String>,
        #[arg(long)]
        max_size: Option<usize>,
        #[arg(long)]
        overlap: Option<usize>,
    },
    /// Print the classification of every line of a document
    Classify { file: PathBuf },
    /// Show run ledger statistics
    Stats {
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Run {
            inputs,
            out,
            strategy,
            max_size,
            overlap,
            workers,
            target,
            seed,
            no_resume,
        } => {
            settings.apply(Overrides {
                output_dir: out,
                chunk_strategy: strategy,
                max_chunk_size: max_size,
                overlap,
                worker_count: workers,
                target_example_count: target,
                seed,
                no_resume,
            });
            // configuration errors surface before any document is touched
            let opts = settings.pipeline_options()?;
            let inputs = collect_inputs(&inputs)?;
            if inputs.is_empty() {
                println!("No supported documents found (.txt, .md, .docx, .pdf).");
                return Ok(());
            }

            let conn = db::connect(&opts.output_dir.join(db::LEDGER_FILE))?;
            db::init_schema(&conn)?;

            let cancel = CancelToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("interrupt received, stopping after in-flight stages");
                        cancel.cancel();
                    }
                });
            }

            println!(
                "Processing {} documents with {} workers -> {}",
                inputs.len(),
                opts.worker_count,
                opts.output_dir.display()
            );
            let report = run_batch(&conn, inputs, Arc::new(opts), cancel).await?;
            println!(
                "Done: {} completed, {} failed ({} partial), {} cancelled.",
                report.completed,
                report.failed,
                report.partial(),
                report.cancelled
            );
            for doc in &report.documents {
                if let Some(f) = &doc.failure {
                    println!("  {:<24} {:<20} {}", truncate(&doc.document_id, 24), f.kind, truncate(&f.message, 80));
                }
            }
            Ok(())
        }
        Commands::Chunk {
            file,
            strategy,
            max_size,
            overlap,
        } => {
            settings.apply(Overrides {
                chunk_strategy: strategy,
                max_chunk_size: max_size,
                overlap,
                ..Overrides::default()
            });
            settings.validate()?;
            let chunk_opts = settings.chunk_options()?;
            let mut parse_opts = settings.parse_options();
            parse_opts.resume = false;

            let parsed = parser::parse_document(&file, &document_id(&file), &parse_opts)?;
            let set = chunk::chunk_text(&parsed.text, Some(&parsed.root), &chunk_opts)?;

            println!(
                "{} chunks ({}, max {} chars), {} oversized",
                set.chunks.len(),
                chunk_opts.strategy,
                chunk_opts.max_size,
                set.oversized()
            );
            println!("{:>4} | {:>15} | {:>6} | {}", "#", "range", "chars", "text");
            println!("{}", "-".repeat(80));
            for c in &set.chunks {
                let range = format!("{}..{}", c.char_range.start, c.char_range.end);
                let flag = if c.is_oversized { "!" } else { " " };
                println!(
                    "{:>4} | {:>15} | {:>5}{} | {}",
                    c.index,
                    range,
                    c.char_count,
                    flag,
                    truncate(&c.text.replace('\n', " "), 48)
                );
            }
            Ok(())
        }
        Commands::Classify { file } => {
            settings.validate()?;
            let lines = parser::classify_document(&file, &settings.classifier)?;
            for l in &lines {
                println!("{:>5}  {:<16} {:.2}  {}", l.line, l.kind, l.confidence, truncate(&l.text, 72));
            }
            println!("\n{} lines", lines.len());
            Ok(())
        }
        Commands::Stats { out } => {
            let dir = out.unwrap_or_else(|| settings.output_dir.clone());
            let conn = db::connect(&dir.join(db::LEDGER_FILE))?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Runs:           {}", s.runs);
            println!("Last run:       {}", s.last_run.as_deref().unwrap_or("-"));
            println!("Documents:      {}", s.documents);
            println!("Failed:         {} ({} partial)", s.failed, s.partial);
            println!("Stages run:     {}", s.stages_run);
            println!("Stages skipped: {}", s.stages_skipped);
            println!("Dictionary:     {} entries", s.entries);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

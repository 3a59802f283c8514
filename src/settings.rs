//! Layered settings: defaults <- `dictparse.toml` (or `--config`) <-
//! `DICTPARSE_*` environment <- command-line flags.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkOptions, ChunkStrategy};
use crate::dataset::{CategoryQuotas, GeneratorOptions};
use crate::error::{PipelineError, Result};
use crate::parser::classify::ClassifierOptions;
use crate::parser::ParseOptions;
use crate::pipeline::PipelineOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub output_dir: PathBuf,
    pub chunk_strategy: String,
    pub max_chunk_size: usize,
    pub overlap: usize,
    pub lookback: Option<usize>,
    pub target_example_count: usize,
    pub category_quotas: CategoryQuotas,
    pub min_confidence: f32,
    pub seed: u64,
    pub context_window: usize,
    pub max_structural_children: usize,
    pub worker_count: usize,
    pub resume: bool,
    pub flush_every: usize,
    pub memory_budget_bytes: usize,
    pub classifier: ClassifierOptions,
}

impl Default for Settings {
    fn default() -> Self {
        let chunk = ChunkOptions::default();
        let generator = GeneratorOptions::default();
        let parse = ParseOptions::default();
        Settings {
            output_dir: PathBuf::from("output"),
            chunk_strategy: chunk.strategy.as_str().to_string(),
            max_chunk_size: chunk.max_size,
            overlap: chunk.overlap,
            lookback: chunk.lookback,
            target_example_count: generator.target_count,
            category_quotas: generator.category_quotas,
            min_confidence: generator.min_confidence,
            seed: generator.seed,
            context_window: generator.context_window,
            max_structural_children: generator.max_structural_children,
            worker_count: std::thread::available_parallelism().map_or(4, |n| n.get()),
            resume: true,
            flush_every: parse.flush_every,
            memory_budget_bytes: parse.memory_budget_bytes,
            classifier: parse.classifier,
        }
    }
}

/// Command-line values that take precedence over every other layer.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub output_dir: Option<PathBuf>,
    pub chunk_strategy: Option<String>,
    pub max_chunk_size: Option<usize>,
    pub overlap: Option<usize>,
    pub worker_count: Option<usize>,
    pub target_example_count: Option<usize>,
    pub seed: Option<u64>,
    pub no_resume: bool,
}

fn environment() -> Environment {
    Environment::with_prefix("DICTPARSE")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl Settings {
    /// `file` must exist when given; otherwise `./dictparse.{toml,json,yaml}` is optional.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::load_with(file, environment())
    }

    fn load_with(file: Option<&Path>, env: Environment) -> Result<Self> {
        let file_source = match file {
            Some(path) => File::from(path).required(true),
            None => File::with_name("dictparse").required(false),
        };
        let settings: Settings = Config::builder()
            .add_source(file_source)
            .add_source(env)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
        Ok(settings)
    }

    pub fn apply(&mut self, o: Overrides) {
        if let Some(v) = o.output_dir {
            self.output_dir = v;
        }
        if let Some(v) = o.chunk_strategy {
            self.chunk_strategy = v;
        }
        if let Some(v) = o.max_chunk_size {
            self.max_chunk_size = v;
        }
        if let Some(v) = o.overlap {
            self.overlap = v;
        }
        if let Some(v) = o.worker_count {
            self.worker_count = v;
        }
        if let Some(v) = o.target_example_count {
            self.target_example_count = v;
        }
        if let Some(v) = o.seed {
            self.seed = v;
        }
        if o.no_resume {
            self.resume = false;
        }
    }

    pub fn chunk_options(&self) -> Result<ChunkOptions> {
        let opts = ChunkOptions {
            strategy: self.chunk_strategy.parse::<ChunkStrategy>()?,
            max_size: self.max_chunk_size,
            overlap: self.overlap,
            lookback: self.lookback,
        };
        opts.validate()?;
        Ok(opts)
    }

    /// Every invalid value is reported before any document is touched.
    pub fn validate(&self) -> Result<()> {
        self.chunk_options()?;
        self.category_quotas.validate()?;
        let invalid = |msg: String| Err(PipelineError::InvalidConfig(msg));
        if self.worker_count == 0 {
            return invalid("worker_count must be at least 1".into());
        }
        if self.flush_every == 0 {
            return invalid("flush_every must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return invalid(format!("min_confidence must be within 0..=1, got {}", self.min_confidence));
        }
        if !(0.0..=1.0).contains(&self.classifier.accept_threshold) {
            return invalid(format!(
                "classifier.accept_threshold must be within 0..=1, got {}",
                self.classifier.accept_threshold
            ));
        }
        if self.classifier.max_depth == 0 {
            return invalid("classifier.max_depth must be at least 1".into());
        }
        Ok(())
    }

    pub fn pipeline_options(&self) -> Result<PipelineOptions> {
        self.validate()?;
        let mut opts = PipelineOptions::new(self.output_dir.clone());
        opts.parse = self.parse_options();
        opts.chunk = self.chunk_options()?;
        opts.generator = GeneratorOptions {
            target_count: self.target_example_count,
            category_quotas: self.category_quotas.clone(),
            min_confidence: self.min_confidence,
            seed: self.seed,
            context_window: self.context_window,
            max_structural_children: self.max_structural_children,
        };
        opts.worker_count = self.worker_count;
        opts.resume = self.resume;
        opts.validate()?;
        Ok(opts)
    }

    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            flush_every: self.flush_every,
            memory_budget_bytes: self.memory_budget_bytes,
            classifier: self.classifier.clone(),
            scratch_path: None,
            resume: self.resume,
        }
    }
}

//! Quota-balanced training examples derived from the structure tree.

pub mod export;

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineWarning, Result};
use crate::parser::tree::{DocumentNode, NodeKind, Span};

/// Mixed into the per-category seed for pattern-completion split points so
/// they don't share a stream with selection.
const SPLIT_SALT: u64 = 0x9e37_79b9_7f4a_7c15;
const SUMMARY_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    DictionaryPair,
    ContextualDefinition,
    Structural,
    PatternCompletion,
    Classification,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::DictionaryPair,
        Category::ContextualDefinition,
        Category::Structural,
        Category::PatternCompletion,
        Category::Classification,
    ];

    pub fn ordinal(self) -> u64 {
        self as u64
    }

    pub fn label(self) -> &'static str {
        match self {
            Category::DictionaryPair => "dictionary_pair",
            Category::ContextualDefinition => "contextual_definition",
            Category::Structural => "structural",
            Category::PatternCompletion => "pattern_completion",
            Category::Classification => "classification",
        }
    }

    pub fn instruction(self) -> &'static str {
        match self {
            Category::DictionaryPair => "Give the definition of the term.",
            Category::ContextualDefinition => {
                "Give the definition of the term, using the surrounding entries as context."
            }
            Category::Structural => "List the items that belong under this heading.",
            Category::PatternCompletion => "Complete the dictionary definition.",
            Category::Classification => {
                "Classify the line as heading, list_item, dictionary_entry, paragraph or unknown."
            }
        }
    }
}

/// Fractions of `target_count` per category. Normalized by their sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryQuotas {
    pub dictionary_pair: f64,
    pub contextual_definition: f64,
    pub structural: f64,
    pub pattern_completion: f64,
    pub classification: f64,
}

impl Default for CategoryQuotas {
    fn default() -> Self {
        CategoryQuotas {
            dictionary_pair: 0.30,
            contextual_definition: 0.20,
            structural: 0.15,
            pattern_completion: 0.15,
            classification: 0.20,
        }
    }
}

impl CategoryQuotas {
    pub fn get(&self, category: Category) -> f64 {
        match category {
            Category::DictionaryPair => self.dictionary_pair,
            Category::ContextualDefinition => self.contextual_definition,
            Category::Structural => self.structural,
            Category::PatternCompletion => self.pattern_completion,
            Category::Classification => self.classification,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut sum = 0.0;
        for c in Category::ALL {
            let q = self.get(c);
            if !q.is_finite() || q < 0.0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "category_quotas.{} must be a non-negative number, got {q}",
                    c.label()
                )));
            }
            sum += q;
        }
        if sum <= 0.0 {
            return Err(PipelineError::InvalidConfig("category_quotas must not all be zero".into()));
        }
        Ok(())
    }

    /// Largest-remainder apportionment of `target` across categories.
    /// Remainder ties go to the earlier category.
    pub fn apportion(&self, target: usize) -> [usize; 5] {
        let sum: f64 = Category::ALL.iter().map(|c| self.get(*c)).sum();
        let mut counts = [0usize; 5];
        if sum <= 0.0 {
            return counts;
        }
        // remainders compared at 1e-9 so 0.15 + 0.15 style sums tie cleanly
        let mut remainders = Vec::with_capacity(5);
        for (i, c) in Category::ALL.iter().enumerate() {
            let exact = target as f64 * self.get(*c) / sum;
            let whole = (exact + 1e-9).floor();
            counts[i] = whole as usize;
            remainders.push((((exact - whole).max(0.0) * 1e9).round() as u64, i));
        }
        let assigned: usize = counts.iter().sum();
        remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        for &(_, i) in remainders.iter().take(target.saturating_sub(assigned)) {
            counts[i] += 1;
        }
        counts
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorOptions {
    pub target_count: usize,
    pub category_quotas: CategoryQuotas,
    pub min_confidence: f32,
    pub seed: u64,
    /// Chars of sibling text on each side for contextual definitions.
    pub context_window: usize,
    pub max_structural_children: usize,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        GeneratorOptions {
            target_count: 500,
            category_quotas: CategoryQuotas::default(),
            min_confidence: 0.6,
            seed: 42,
            context_window: 160,
            max_structural_children: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub category: Category,
    pub input: String,
    pub output: String,
    pub source_range: Span,
    pub quality_score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryReport {
    pub category: Category,
    pub requested: usize,
    pub achievable: usize,
    pub achieved: usize,
    pub rejected_for_quality: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationReport {
    pub target_count: usize,
    pub seed: u64,
    pub categories: Vec<CategoryReport>,
    pub total_achieved: usize,
    pub rejected_for_quality: usize,
    pub warnings: Vec<PipelineWarning>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedDataset {
    pub examples: Vec<TrainingExample>,
    pub report: GenerationReport,
}

struct Candidate {
    input: String,
    output: String,
    source_range: Span,
    quality_score: f32,
}

#[derive(Default)]
struct Pool {
    accepted: Vec<Candidate>,
    rejected: usize,
}

impl Pool {
    fn offer(&mut self, c: Candidate, min_confidence: f32) {
        if c.quality_score < min_confidence || c.input.trim().is_empty() || c.output.trim().is_empty() {
            self.rejected += 1;
        } else {
            self.accepted.push(c);
        }
    }
}

fn truncate_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

fn tail_chars(s: &str, n: usize) -> &str {
    let count = s.chars().count();
    if count <= n {
        return s;
    }
    match s.char_indices().nth(count - n) {
        Some((i, _)) => &s[i..],
        None => s,
    }
}

fn flat(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn entry_nodes(root: &DocumentNode) -> impl Iterator<Item = &DocumentNode> {
    root.walk()
        .filter(|n| n.kind == NodeKind::DictionaryEntry && n.entry.is_some())
}

fn dictionary_pairs(root: &DocumentNode, opts: &GeneratorOptions) -> Pool {
    let mut pool = Pool::default();
    for node in entry_nodes(root) {
        let Some(entry) = &node.entry else { continue };
        pool.offer(
            Candidate {
                input: entry.term.clone(),
                output: entry.definition.clone(),
                source_range: node.char_range,
                quality_score: node.confidence,
            },
            opts.min_confidence,
        );
    }
    pool
}

fn contextual_definitions(root: &DocumentNode, opts: &GeneratorOptions) -> Pool {
    let mut pool = Pool::default();
    for parent in root.walk() {
        for (i, node) in parent.children.iter().enumerate() {
            let Some(entry) = node.entry.as_ref().filter(|_| node.kind == NodeKind::DictionaryEntry) else {
                continue;
            };
            let before = i
                .checked_sub(1)
                .map(|j| flat(tail_chars(&parent.children[j].text, opts.context_window)));
            let after = parent
                .children
                .get(i + 1)
                .map(|n| flat(truncate_chars(&n.text, opts.context_window)));
            if before.is_none() && after.is_none() {
                continue;
            }
            let mut input = entry.term.clone();
            if let Some(b) = before {
                input.push_str("\n[before] ");
                input.push_str(&b);
            }
            if let Some(a) = after {
                input.push_str("\n[after] ");
                input.push_str(&a);
            }
            pool.offer(
                Candidate {
                    input,
                    output: entry.definition.clone(),
                    source_range: node.char_range,
                    quality_score: node.confidence,
                },
                opts.min_confidence,
            );
        }
    }
    pool
}

fn structural(root: &DocumentNode, opts: &GeneratorOptions) -> Pool {
    let mut pool = Pool::default();
    for node in root.walk() {
        if !matches!(node.kind, NodeKind::Heading | NodeKind::ListItem) || node.children.is_empty() {
            continue;
        }
        let output = node
            .children
            .iter()
            .take(opts.max_structural_children)
            .map(|c| format!("- {}", truncate_chars(c.first_line(), SUMMARY_CHARS)))
            .collect::<Vec<_>>()
            .join("\n");
        pool.offer(
            Candidate {
                input: node.first_line().to_string(),
                output,
                source_range: node.char_range,
                quality_score: node.confidence,
            },
            opts.min_confidence,
        );
    }
    pool
}

fn pattern_completions(root: &DocumentNode, opts: &GeneratorOptions) -> Pool {
    let seed = opts.seed ^ SPLIT_SALT ^ Category::PatternCompletion.ordinal();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut pool = Pool::default();
    for node in entry_nodes(root) {
        let Some(entry) = &node.entry else { continue };
        let words: Vec<&str> = entry.definition.split_whitespace().collect();
        if words.len() < 2 {
            continue;
        }
        // split between 30% and 70% of the word boundaries, at least one word each side
        let boundaries = words.len() - 1;
        let lo = ((boundaries as f64 * 0.3).ceil() as usize).clamp(1, boundaries);
        let hi = ((boundaries as f64 * 0.7).floor() as usize).clamp(lo, boundaries);
        let cut = rng.gen_range(lo..=hi);
        pool.offer(
            Candidate {
                input: format!("{} — {}", entry.term, words[..cut].join(" ")),
                output: words[cut..].join(" "),
                source_range: node.char_range,
                quality_score: node.confidence,
            },
            opts.min_confidence,
        );
    }
    pool
}

fn classifications(root: &DocumentNode, opts: &GeneratorOptions) -> Pool {
    let mut pool = Pool::default();
    for node in root.walk().skip(1) {
        pool.offer(
            Candidate {
                input: node.first_line().to_string(),
                output: node.kind.label().to_string(),
                source_range: node.char_range,
                quality_score: node.confidence,
            },
            opts.min_confidence,
        );
    }
    pool
}

fn build_pool(category: Category, root: &DocumentNode, opts: &GeneratorOptions) -> Pool {
    match category {
        Category::DictionaryPair => dictionary_pairs(root, opts),
        Category::ContextualDefinition => contextual_definitions(root, opts),
        Category::Structural => structural(root, opts),
        Category::PatternCompletion => pattern_completions(root, opts),
        Category::Classification => classifications(root, opts),
    }
}

/// Derive examples from the tree. Same tree and seed give the same sequence.
pub fn generate(root: &DocumentNode, opts: &GeneratorOptions) -> Result<GeneratedDataset> {
    opts.category_quotas.validate()?;
    let requested = opts.category_quotas.apportion(opts.target_count);

    let pools: Vec<Pool> = Category::ALL
        .par_iter()
        .map(|c| build_pool(*c, root, opts))
        .collect();

    let mut examples = Vec::new();
    let mut categories = Vec::with_capacity(Category::ALL.len());
    let mut warnings = Vec::new();

    for ((category, pool), want) in Category::ALL.into_iter().zip(pools).zip(requested) {
        let achievable = pool.accepted.len();
        let chosen: Vec<usize> = if achievable > want {
            let mut rng = StdRng::seed_from_u64(opts.seed.wrapping_add(category.ordinal()));
            let mut picked = index::sample(&mut rng, achievable, want).into_vec();
            picked.sort_unstable();
            picked
        } else {
            (0..achievable).collect()
        };
        if achievable < want {
            warn!(category = category.label(), requested = want, achievable, "quota not achievable");
            warnings.push(PipelineWarning::QuotaUnachievable {
                category,
                requested: want,
                achievable,
            });
        }

        let mut slots: Vec<Option<Candidate>> = pool.accepted.into_iter().map(Some).collect();
        for i in &chosen {
            if let Some(c) = slots[*i].take() {
                examples.push(TrainingExample {
                    category,
                    input: c.input,
                    output: c.output,
                    source_range: c.source_range,
                    quality_score: c.quality_score,
                });
            }
        }
        categories.push(CategoryReport {
            category,
            requested: want,
            achievable,
            achieved: chosen.len(),
            rejected_for_quality: pool.rejected,
        });
    }

    let report = GenerationReport {
        target_count: opts.target_count,
        seed: opts.seed,
        total_achieved: examples.len(),
        rejected_for_quality: categories.iter().map(|c| c.rejected_for_quality).sum(),
        categories,
        warnings,
    };
    info!(
        achieved = report.total_achieved,
        target = report.target_count,
        rejected = report.rejected_for_quality,
        "training examples generated"
    );
    Ok(GeneratedDataset { examples, report })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_document, ParseOptions};
    use std::path::Path;

    fn glossary_tree() -> DocumentNode {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/glossary.txt");
        parse_document(&path, "glossary", &ParseOptions::default())
            .unwrap()
            .root
    }

    fn report_for(ds: &GeneratedDataset, c: Category) -> &CategoryReport {
        ds.report.categories.iter().find(|r| r.category == c).unwrap()
    }

    #[test]
    fn apportion_sums_to_target() {
        let q = CategoryQuotas::default();
        for target in [0, 1, 7, 10, 99, 500] {
            assert_eq!(q.apportion(target).iter().sum::<usize>(), target);
        }
        assert_eq!(q.apportion(10), [3, 2, 2, 1, 2]);
    }

    #[test]
    fn same_seed_same_bytes() {
        let root = glossary_tree();
        let opts = GeneratorOptions {
            target_count: 20,
            ..GeneratorOptions::default()
        };
        let a = serde_json::to_string(&generate(&root, &opts).unwrap().examples).unwrap();
        let b = serde_json::to_string(&generate(&root, &opts).unwrap().examples).unwrap();
        assert_eq!(a, b);

        let other = GeneratorOptions { seed: 7, ..opts };
        let c = serde_json::to_string(&generate(&root, &other).unwrap().examples).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn quotas_met_exactly_when_achievable() {
        let root = glossary_tree();
        let opts = GeneratorOptions {
            target_count: 10,
            ..GeneratorOptions::default()
        };
        let ds = generate(&root, &opts).unwrap();
        let expected = opts.category_quotas.apportion(10);
        for (c, want) in Category::ALL.into_iter().zip(expected) {
            let r = report_for(&ds, c);
            assert!(r.achievable >= want, "{c:?} pool too small for this test");
            assert_eq!(r.achieved, want);
            assert_eq!(ds.examples.iter().filter(|e| e.category == c).count(), want);
        }
        assert!(ds.report.warnings.is_empty());
        // selected examples keep document order inside a category
        let dict: Vec<_> = ds
            .examples
            .iter()
            .filter(|e| e.category == Category::DictionaryPair)
            .map(|e| e.source_range.start)
            .collect();
        assert!(dict.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn shortfall_is_reported_not_fabricated() {
        let root = glossary_tree();
        let opts = GeneratorOptions {
            target_count: 1000,
            ..GeneratorOptions::default()
        };
        let ds = generate(&root, &opts).unwrap();
        let r = report_for(&ds, Category::DictionaryPair);
        assert_eq!(r.requested, 300);
        assert_eq!(r.achieved, r.achievable);
        assert!(ds.report.warnings.iter().any(|w| matches!(
            w,
            PipelineWarning::QuotaUnachievable { category: Category::DictionaryPair, requested: 300, .. }
        )));
        assert_eq!(ds.report.total_achieved, ds.examples.len());
    }

    #[test]
    fn low_confidence_rejected() {
        let root = glossary_tree();
        let opts = GeneratorOptions {
            target_count: 100,
            min_confidence: 0.9,
            ..GeneratorOptions::default()
        };
        let ds = generate(&root, &opts).unwrap();
        // colon (0.75) and double-space (0.60) entries fall below 0.9
        assert!(report_for(&ds, Category::DictionaryPair).rejected_for_quality >= 2);
        assert!(ds.examples.iter().all(|e| e.quality_score >= 0.9));
    }

    #[test]
    fn pattern_completion_splits_on_words() {
        let root = glossary_tree();
        let opts = GeneratorOptions {
            target_count: 100,
            category_quotas: CategoryQuotas {
                dictionary_pair: 0.0,
                contextual_definition: 0.0,
                structural: 0.0,
                pattern_completion: 1.0,
                classification: 0.0,
            },
            ..GeneratorOptions::default()
        };
        let ds = generate(&root, &opts).unwrap();
        assert!(!ds.examples.is_empty());
        for e in &ds.examples {
            let (term, prefix) = e.input.split_once(" — ").unwrap();
            assert!(!term.is_empty() && !prefix.is_empty());
            assert!(!e.output.is_empty());
        }
    }

    #[test]
    fn invalid_quotas_rejected() {
        let root = glossary_tree();
        let opts = GeneratorOptions {
            category_quotas: CategoryQuotas {
                dictionary_pair: -1.0,
                ..CategoryQuotas::default()
            },
            ..GeneratorOptions::default()
        };
        assert_eq!(generate(&root, &opts).unwrap_err().kind(), "invalid_config");
    }
}

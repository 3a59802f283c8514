use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::tree::{EntryParts, NodeKind};
use crate::source::{Formatting, SizeClass};

static MD_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(\S.*)$").unwrap());
static SECTION_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\p{Nd}+(?:\.\p{Nd}+)+)\.?\s+\S").unwrap());
static HEADING_STYLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:heading|titre|überschrift|título)\s*(\d)$").unwrap());
static BULLET_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[-*•◦▪‣–·]\s+\S").unwrap());
static NUMBERED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\p{Nd}{1,3}[.)]|\(\p{Nd}{1,3}\)|\(?[a-zA-Z][.)]|\([a-zA-Z]\)|[ivxlc]{1,5}[.)])\s+\S").unwrap()
});
static LIST_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[-*•◦▪‣–·]|\p{Nd}{1,3}[.)]|\(\p{Nd}{1,3}\)|\(?[a-zA-Z][.)]|\([a-zA-Z]\))\s+").unwrap()
});
static DOUBLE_SPACE_CAPITAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S(?:.*?\S)?) {2,}(\p{Lu}.*)$").unwrap());

/// Sentence terminators across the scripts the corpus mixes.
const TERMINATORS: &[char] = &['.', '!', '?', ';', '。', '！', '？', '；', '؟', '۔', '।', '॥', '…'];
const MAX_TERM_CHARS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Separator {
    EmDash,
    EnDash,
    Colon,
    SpacedHyphen,
    DoubleSpaceCapital,
}

impl Separator {
    fn weight(self) -> f32 {
        match self {
            Separator::EmDash => 0.95,
            Separator::EnDash => 0.85,
            Separator::Colon => 0.75,
            Separator::SpacedHyphen | Separator::DoubleSpaceCapital => 0.60,
        }
    }

    fn split(self, body: &str) -> Option<(&str, &str)> {
        let cut = |pat: &str| body.find(pat).map(|i| (&body[..i], &body[i + pat.len()..]));
        match self {
            Separator::EmDash => cut("—"),
            Separator::EnDash => cut(" – "),
            Separator::SpacedHyphen => cut(" - "),
            Separator::Colon => cut(": ").or_else(|| cut("：")),
            Separator::DoubleSpaceCapital => {
                let caps = DOUBLE_SPACE_CAPITAL_RE.captures(body)?;
                Some((caps.get(1)?.as_str(), caps.get(2)?.as_str()))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierOptions {
    pub heading_max_words: usize,
    pub max_term_words: usize,
    pub indent_unit: usize,
    pub max_depth: u8,
    pub accept_threshold: f32,
    pub separators: Vec<Separator>,
}

impl Default for ClassifierOptions {
    fn default() -> Self {
        ClassifierOptions {
            heading_max_words: 12,
            max_term_words: 6,
            indent_unit: 4,
            max_depth: 6,
            accept_threshold: 0.5,
            separators: vec![
                Separator::EmDash,
                Separator::EnDash,
                Separator::Colon,
                Separator::SpacedHyphen,
                Separator::DoubleSpaceCapital,
            ],
        }
    }
}

/// How the node's depth should be derived by the tree builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelHint {
    /// Absolute heading depth (1 = top-level section).
    Heading(u8),
    /// Nesting depth relative to the enclosing section (list indentation).
    Nested(u8),
    /// Take the enclosing section's content level.
    Inherit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub kind: NodeKind,
    pub level: LevelHint,
    pub confidence: f32,
    pub entry: Option<EntryParts>,
}

impl Classification {
    fn paragraph() -> Self {
        Classification {
            kind: NodeKind::Paragraph,
            level: LevelHint::Inherit,
            confidence: 1.0,
            entry: None,
        }
    }
}

pub struct LineFeatures<'a> {
    pub text: &'a str,
    pub formatting: &'a Formatting,
}

struct Line<'a> {
    trimmed: &'a str,
    indent: usize,
    formatting: &'a Formatting,
}

type Rule = fn(&Line, &ClassifierOptions) -> Option<Classification>;

/// Priority order; on equal confidence the earlier rule wins.
const RULES: &[Rule] = &[dictionary_entry, heading, list_item, unknown];

pub fn leading_spaces(s: &str) -> usize {
    s.chars().take_while(|c| *c == ' ').count()
}

pub fn classify(features: &LineFeatures, opts: &ClassifierOptions) -> Classification {
    let line = Line {
        trimmed: features.text.trim(),
        indent: leading_spaces(features.text).max(features.formatting.indent),
        formatting: features.formatting,
    };
    if line.trimmed.is_empty() {
        return Classification::paragraph();
    }

    let mut best: Option<Classification> = None;
    for rule in RULES {
        let Some(candidate) = rule(&line, opts) else {
            continue;
        };
        if candidate.confidence < opts.accept_threshold {
            continue;
        }
        if best.as_ref().map_or(true, |b| candidate.confidence > b.confidence) {
            best = Some(candidate);
        }
    }
    best.unwrap_or_else(Classification::paragraph)
}

fn ends_with_terminator(s: &str) -> bool {
    s.trim_end_matches(['"', '\'', ')', '”', '’', '」'])
        .ends_with(TERMINATORS)
}

fn nesting(indent: usize, opts: &ClassifierOptions) -> u8 {
    let unit = opts.indent_unit.max(1);
    (indent / unit).min(opts.max_depth as usize) as u8
}

// ── Rules ──

fn dictionary_entry(line: &Line, opts: &ClassifierOptions) -> Option<Classification> {
    let body = match LIST_MARKER_RE.find(line.trimmed) {
        Some(m) => &line.trimmed[m.end()..],
        None => line.trimmed,
    };

    for sep in &opts.separators {
        let Some((term, definition)) = sep.split(body) else {
            continue;
        };
        let (term, definition) = (term.trim(), definition.trim());
        let words = term.split_whitespace().count();
        if definition.is_empty()
            || words == 0
            || words > opts.max_term_words
            || term.chars().count() > MAX_TERM_CHARS
            || !term.chars().any(char::is_alphabetic)
            || ends_with_terminator(term)
        {
            continue;
        }
        let term_factor = if words <= 3 { 1.0 } else { 0.9 };
        return Some(Classification {
            kind: NodeKind::DictionaryEntry,
            level: LevelHint::Inherit,
            confidence: sep.weight() * term_factor,
            entry: Some(EntryParts {
                term: term.to_string(),
                definition: definition.to_string(),
            }),
        });
    }
    None
}

/// Style name -> depth lookup.
fn style_depth(f: &Formatting) -> Option<u8> {
    if let Some(style) = f.style.as_deref() {
        let s = style.trim();
        if s.eq_ignore_ascii_case("title") {
            return Some(1);
        }
        if let Some(caps) = HEADING_STYLE_RE.captures(s) {
            return caps[1].parse::<u8>().ok().map(|d| d.max(1));
        }
    }
    match f.size_class? {
        SizeClass::Huge => Some(1),
        SizeClass::XLarge => Some(2),
        SizeClass::Large => Some(3),
        SizeClass::Normal | SizeClass::Small => None,
    }
}

fn is_all_caps(s: &str) -> bool {
    let letters: Vec<char> = s.chars().filter(|c| c.is_alphabetic()).collect();
    letters.len() >= 2
        && letters.iter().any(|c| c.is_uppercase())
        && letters.iter().all(|c| !c.is_lowercase())
}

fn heading(line: &Line, opts: &ClassifierOptions) -> Option<Classification> {
    let t = line.trimmed;
    let make = |depth: u8, confidence: f32| Classification {
        kind: NodeKind::Heading,
        level: LevelHint::Heading(depth.clamp(1, opts.max_depth.max(1))),
        confidence,
        entry: None,
    };

    if let Some(caps) = MD_HEADING_RE.captures(t) {
        return Some(make(caps[1].len() as u8, 0.95));
    }

    let words = t.split_whitespace().count();
    if words == 0 || words > opts.heading_max_words || ends_with_terminator(t) {
        return None;
    }
    if !t.chars().any(char::is_alphabetic) {
        return None;
    }

    let f = line.formatting;
    let styled = f
        .style
        .as_deref()
        .is_some_and(|s| s.eq_ignore_ascii_case("title") || HEADING_STYLE_RE.is_match(s.trim()));
    let numbered = SECTION_NUMBER_RE
        .captures(t)
        .map(|c| c[1].split('.').count() as u8);
    let large = matches!(
        f.size_class,
        Some(SizeClass::Large | SizeClass::XLarge | SizeClass::Huge)
    );

    let confidence = if styled {
        0.95
    } else if large {
        0.85
    } else if numbered.is_some() {
        0.80
    } else if f.bold {
        0.70
    } else if is_all_caps(t) {
        0.60
    } else {
        return None;
    };

    let depth = style_depth(f)
        .or(numbered)
        .unwrap_or_else(|| nesting(line.indent, opts).saturating_add(1));
    Some(make(depth, confidence))
}

fn list_item(line: &Line, opts: &ClassifierOptions) -> Option<Classification> {
    let (depth, confidence) = if let Some(level) = line.formatting.list_level {
        (level.min(opts.max_depth), 0.90)
    } else if BULLET_RE.is_match(line.trimmed) {
        (nesting(line.indent, opts), 0.90)
    } else if NUMBERED_RE.is_match(line.trimmed) {
        (nesting(line.indent, opts), 0.85)
    } else {
        return None;
    };
    Some(Classification {
        kind: NodeKind::ListItem,
        level: LevelHint::Nested(depth),
        confidence,
        entry: None,
    })
}

/// Page numbers, rules, stray punctuation.
fn unknown(line: &Line, _opts: &ClassifierOptions) -> Option<Classification> {
    if line.trimmed.chars().any(char::is_alphabetic) {
        return None;
    }
    Some(Classification {
        kind: NodeKind::Unknown,
        level: LevelHint::Inherit,
        confidence: 0.95,
        entry: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(text: &str) -> Classification {
        classify(
            &LineFeatures {
                text,
                formatting: &Formatting::default(),
            },
            &ClassifierOptions::default(),
        )
    }

    fn run_fmt(text: &str, formatting: Formatting) -> Classification {
        classify(
            &LineFeatures {
                text,
                formatting: &formatting,
            },
            &ClassifierOptions::default(),
        )
    }

    #[test]
    fn em_dash_entry() {
        let c = run("Term1 — Def1");
        assert_eq!(c.kind, NodeKind::DictionaryEntry);
        let e = c.entry.unwrap();
        assert_eq!(e.term, "Term1");
        assert_eq!(e.definition, "Def1");
        assert!((c.confidence - 0.95).abs() < 1e-6);
    }

    #[test]
    fn colon_and_double_space_entries() {
        let c = run("abacus: a counting frame");
        assert_eq!(c.kind, NodeKind::DictionaryEntry);
        assert_eq!(c.entry.unwrap().term, "abacus");

        let c = run("abacus   A counting frame");
        assert_eq!(c.kind, NodeKind::DictionaryEntry);
        assert_eq!(c.entry.unwrap().definition, "A counting frame");
    }

    #[test]
    fn cjk_entry() {
        let c = run("林檎 — 赤い果物。");
        assert_eq!(c.kind, NodeKind::DictionaryEntry);
        assert_eq!(c.entry.unwrap().term, "林檎");
    }

    #[test]
    fn sentence_with_colon_is_not_entry_when_term_too_long() {
        let c = run("The committee decided after a very long debate that: nothing changes.");
        assert_eq!(c.kind, NodeKind::Paragraph);
    }

    #[test]
    fn bulleted_entry_prefers_dictionary() {
        let c = run("- apple — a fruit");
        assert_eq!(c.kind, NodeKind::DictionaryEntry);
        assert_eq!(c.entry.unwrap().term, "apple");
    }

    #[test]
    fn exact_tie_goes_to_dictionary_entry() {
        // styled heading and em-dash entry both score 0.95
        let c = run_fmt(
            "Fruits — sweet things",
            Formatting {
                style: Some("heading 2".into()),
                ..Formatting::default()
            },
        );
        assert_eq!(c.kind, NodeKind::DictionaryEntry);
        assert!((c.confidence - 0.95).abs() < 1e-6);
        assert_eq!(c.entry.unwrap().term, "Fruits");

        let c = run("# apple — a fruit");
        assert_eq!(c.kind, NodeKind::DictionaryEntry);
    }

    #[test]
    fn higher_confidence_beats_rule_order() {
        // bullet scores 0.90; a four-word em-dash term scores 0.95 * 0.9
        let c = run("• one two three four — x");
        assert_eq!(c.kind, NodeKind::ListItem);
        assert!((c.confidence - 0.90).abs() < 1e-6);

        let c = run("• one two — x");
        assert_eq!(c.kind, NodeKind::DictionaryEntry);
    }

    #[test]
    fn markdown_heading() {
        let c = run("## Section two");
        assert_eq!(c.kind, NodeKind::Heading);
        assert_eq!(c.level, LevelHint::Heading(2));
    }

    #[test]
    fn styled_heading_uses_table() {
        let c = run_fmt(
            "Fruits",
            Formatting {
                style: Some("heading 3".into()),
                ..Formatting::default()
            },
        );
        assert_eq!(c.level, LevelHint::Heading(3));
        assert!((c.confidence - 0.95).abs() < 1e-6);
    }

    #[test]
    fn bold_heading_falls_back_to_indent() {
        let c = run_fmt(
            "    Sub topic",
            Formatting {
                bold: true,
                ..Formatting::default()
            },
        );
        assert_eq!(c.kind, NodeKind::Heading);
        assert_eq!(c.level, LevelHint::Heading(2));
    }

    #[test]
    fn indent_depth_is_capped() {
        let line = format!("{}DEEP", " ".repeat(200));
        assert_eq!(run(&line).level, LevelHint::Heading(6));
        // 1024 / 4 = 256 would wrap to 0 if narrowed before the cap
        let line = format!("{}- deep item", " ".repeat(1024));
        assert_eq!(run(&line).level, LevelHint::Nested(6));
        let line = format!("{}DEEP", " ".repeat(1024));
        assert_eq!(run(&line).level, LevelHint::Heading(6));
    }

    #[test]
    fn all_caps_and_numbered_headings() {
        assert_eq!(run("CHAPTER ONE").kind, NodeKind::Heading);
        let c = run("2.3.1 Scope of work");
        assert_eq!(c.level, LevelHint::Heading(3));
    }

    #[test]
    fn sentence_is_not_heading() {
        assert_eq!(run("This is short.").kind, NodeKind::Paragraph);
        assert_eq!(
            run_fmt(
                "Bold but a sentence.",
                Formatting {
                    bold: true,
                    ..Formatting::default()
                }
            )
            .kind,
            NodeKind::Paragraph
        );
    }

    #[test]
    fn list_items() {
        let c = run("  - first");
        assert_eq!(c.kind, NodeKind::ListItem);
        assert_eq!(c.level, LevelHint::Nested(0));
        let c = run("        3) third");
        assert_eq!(c.level, LevelHint::Nested(2));
        let c = run_fmt(
            "plain docx item",
            Formatting {
                list_level: Some(1),
                ..Formatting::default()
            },
        );
        assert_eq!(c.level, LevelHint::Nested(1));
    }

    #[test]
    fn page_number_is_unknown() {
        assert_eq!(run("— 12 —").kind, NodeKind::Unknown);
        assert_eq!(run("----").kind, NodeKind::Unknown);
    }

    #[test]
    fn plain_paragraph() {
        let c = run("the quick brown fox jumps over the lazy dog");
        assert_eq!(c.kind, NodeKind::Paragraph);
        assert_eq!(c.level, LevelHint::Inherit);
    }
}

//! Structural and semantic splitting: greedy packing of adjacent pieces,
//! descending to finer boundaries only for pieces that don't fit.

use super::sentence::{has_terminator, sentence_starts, word_starts};
use super::{char_len, Piece};
use crate::parser::tree::{DocumentNode, NodeKind, Span};

#[derive(Debug, Clone, Copy)]
enum Level {
    BlankLine,
    Line,
    Sentence,
    /// Only for runs with no sentence terminator at all.
    Word,
}

const TEXT_LEVELS: &[Level] = &[Level::BlankLine, Level::Line, Level::Sentence, Level::Word];

impl Level {
    /// Interior cut offsets (absolute, strictly inside `span`).
    fn cuts(self, text: &str, span: Span) -> Vec<usize> {
        let slice = span.slice(text);
        let rel: Vec<usize> = match self {
            Level::BlankLine => slice.match_indices("\n\n").map(|(i, _)| i + 2).collect(),
            Level::Line => slice.match_indices('\n').map(|(i, _)| i + 1).collect(),
            Level::Sentence => sentence_starts(slice),
            Level::Word if has_terminator(slice) => Vec::new(),
            Level::Word => word_starts(slice),
        };
        rel.into_iter()
            .map(|i| span.start + i)
            .filter(|&c| c > span.start && c < span.end)
            .collect()
    }
}

fn segments(span: Span, cuts: &[usize]) -> impl Iterator<Item = Span> + '_ {
    let starts = std::iter::once(span.start).chain(cuts.iter().copied());
    let ends = cuts.iter().copied().chain(std::iter::once(span.end));
    starts.zip(ends).map(|(s, e)| Span::new(s, e))
}

struct Packer<'a> {
    text: &'a str,
    max: usize,
    pending: Option<(Span, usize)>,
    out: Vec<Piece>,
}

impl<'a> Packer<'a> {
    fn new(text: &'a str, max: usize) -> Self {
        Packer {
            text,
            max,
            pending: None,
            out: Vec::new(),
        }
    }

    fn flush(&mut self) {
        if let Some((span, _)) = self.pending.take() {
            self.out.push(Piece {
                span,
                oversized: false,
            });
        }
    }

    /// Add a piece known to fit on its own.
    fn accept(&mut self, span: Span, chars: usize) {
        match self.pending {
            Some((p, n)) if p.end == span.start && n + chars <= self.max => {
                self.pending = Some((Span::new(p.start, span.end), n + chars));
            }
            _ => {
                self.flush();
                self.pending = Some((span, chars));
            }
        }
    }

    fn oversized(&mut self, span: Span) {
        self.flush();
        self.out.push(Piece {
            span,
            oversized: true,
        });
    }

    fn pack_text(&mut self, span: Span, levels: &[Level]) {
        if span.is_empty() {
            return;
        }
        let chars = char_len(self.text, span);
        if chars <= self.max {
            self.accept(span, chars);
            return;
        }
        let Some((level, rest)) = levels.split_first() else {
            self.oversized(span);
            return;
        };
        let cuts = level.cuts(self.text, span);
        if cuts.is_empty() {
            self.pack_text(span, rest);
            return;
        }
        for segment in segments(span, &cuts) {
            self.pack_text(segment, rest);
        }
    }

    fn pack_region(&mut self, region: &Region) {
        if region.span.is_empty() {
            return;
        }
        let chars = char_len(self.text, region.span);
        if chars <= self.max {
            self.accept(region.span, chars);
        } else if region.children.is_empty() {
            self.pack_text(region.span, TEXT_LEVELS);
        } else {
            for child in &region.children {
                self.pack_region(child);
            }
        }
    }

    fn finish(mut self) -> Vec<Piece> {
        self.flush();
        self.out
    }
}

/// A span of text with the finer spans it can be split into.
#[derive(Debug)]
struct Region {
    span: Span,
    children: Vec<Region>,
}

/// Split `span` at the starts of `nodes`; whatever precedes the first node
/// (a heading's own line) becomes a leaf region.
fn region_for(nodes: &[DocumentNode], span: Span) -> Region {
    if nodes.is_empty() {
        return Region {
            span,
            children: Vec::new(),
        };
    }
    let mut children = Vec::with_capacity(nodes.len() + 1);
    let first = nodes[0].char_range.start.clamp(span.start, span.end);
    if first > span.start {
        children.push(Region {
            span: Span::new(span.start, first),
            children: Vec::new(),
        });
    }
    for (i, node) in nodes.iter().enumerate() {
        let start = node.char_range.start.clamp(span.start, span.end);
        let end = nodes
            .get(i + 1)
            .map_or(span.end, |next| next.char_range.start.clamp(start, span.end));
        children.push(region_for(&node.children, Span::new(start, end)));
    }
    Region { span, children }
}

/// Top-level units: each heading alone, consecutive non-heading nodes grouped.
fn units(root: &DocumentNode) -> Vec<&[DocumentNode]> {
    let mut out = Vec::new();
    let nodes = root.children.as_slice();
    let mut i = 0;
    while i < nodes.len() {
        let j = if nodes[i].kind == NodeKind::Heading {
            i + 1
        } else {
            i + nodes[i..].iter().take_while(|n| n.kind != NodeKind::Heading).count()
        };
        out.push(&nodes[i..j]);
        i = j;
    }
    out
}

pub(super) fn structural(text: &str, root: &DocumentNode, max: usize) -> Vec<Piece> {
    let units = units(root);
    let mut packer = Packer::new(text, max);
    for (k, unit) in units.iter().enumerate() {
        let start = if k == 0 { 0 } else { unit[0].char_range.start };
        let end = units
            .get(k + 1)
            .map_or(text.len(), |next| next[0].char_range.start);
        let span = Span::new(start, end);
        let region = match unit {
            [heading] if heading.kind == NodeKind::Heading => region_for(&heading.children, span),
            group => region_for(group, span),
        };
        packer.pack_region(&region);
        // units never share a chunk
        packer.flush();
    }
    packer.finish()
}

pub(super) fn semantic(text: &str, max: usize) -> Vec<Piece> {
    let mut packer = Packer::new(text, max);
    packer.pack_text(Span::new(0, text.len()), TEXT_LEVELS);
    packer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semantic_packs_paragraphs_greedily() {
        let text = "aaaa aaaa.\n\nbbbb.\n\ncccc cccc cccc.";
        let pieces = semantic(text, 20);
        let parts: Vec<&str> = pieces.iter().map(|p| p.span.slice(text)).collect();
        assert_eq!(parts, vec!["aaaa aaaa.\n\nbbbb.\n\n", "cccc cccc cccc."]);
    }

    #[test]
    fn whole_text_fits_in_one_piece() {
        let pieces = semantic("short text", 100);
        assert_eq!(pieces.len(), 1);
        assert!(semantic("", 10).is_empty());
    }
}

use tracing::{debug, warn};

use super::classify::{Classification, LevelHint};
use super::scratch::{FlushMarker, NodeSink};
use super::tree::{NodeKind, NodeRecord, Span};
use crate::error::{PipelineWarning, Result};
use crate::source::Formatting;

/// One classified, normalized content line handed to the builder.
pub struct LineInput<'a> {
    /// Normalized line, leading indentation included.
    pub text: &'a str,
    pub formatting: &'a Formatting,
    /// Byte offset of the line in the normalized text.
    pub offset: usize,
    pub indent: usize,
    /// A blank line separates this line from the previous content line.
    pub blank_before: bool,
    pub class: Classification,
}

/// Ancestor-stack tree construction with periodic flushing of closed nodes.
///
/// Working set is the open container stack, at most one open leaf (kept open
/// so wrapped lines can be joined to it) and the flush buffer.
pub struct TreeBuilder<S: NodeSink> {
    stack: Vec<NodeRecord>,
    leaf: Option<NodeRecord>,
    leaf_indent: usize,
    buffer: Vec<NodeRecord>,
    buffered_bytes: usize,
    next_id: u32,
    nodes_closed: usize,
    flush_every: usize,
    memory_budget: usize,
    join_wrapped_lines: bool,
    flushes: usize,
    warnings: Vec<PipelineWarning>,
    sink: S,
}

impl<S: NodeSink> TreeBuilder<S> {
    pub fn new(sink: S, flush_every: usize, memory_budget: usize, join_wrapped_lines: bool) -> Self {
        let root = NodeRecord {
            id: 0,
            parent: None,
            kind: NodeKind::Root,
            level: 0,
            text: String::new(),
            formatting: Formatting::default(),
            char_range: Span::new(0, 0),
            confidence: 1.0,
            entry: None,
        };
        TreeBuilder {
            stack: vec![root],
            leaf: None,
            leaf_indent: 0,
            buffer: Vec::new(),
            buffered_bytes: 0,
            next_id: 1,
            nodes_closed: 0,
            flush_every: flush_every.max(1),
            memory_budget,
            join_wrapped_lines,
            flushes: 0,
            warnings: Vec::new(),
            sink,
        }
    }

    /// Continue from a flush marker written by an earlier, interrupted parse.
    pub fn restore(
        sink: S,
        marker: FlushMarker,
        flush_every: usize,
        memory_budget: usize,
        join_wrapped_lines: bool,
    ) -> Self {
        let mut builder = Self::new(sink, flush_every, memory_budget, join_wrapped_lines);
        if !marker.stack.is_empty() {
            builder.stack = marker.stack;
        }
        builder.leaf = marker.leaf;
        builder.leaf_indent = marker.leaf_indent;
        builder.next_id = marker.next_id;
        builder.nodes_closed = marker.nodes_closed;
        builder
    }

    fn section_level(&self) -> u8 {
        self.stack
            .iter()
            .rev()
            .find(|n| n.kind == NodeKind::Heading)
            .map_or(0, |n| n.level)
    }

    fn is_continuation(&self, line: &LineInput) -> bool {
        if !self.join_wrapped_lines || line.blank_before || line.class.kind != NodeKind::Paragraph {
            return false;
        }
        match &self.leaf {
            Some(leaf) => {
                matches!(leaf.kind, NodeKind::Paragraph | NodeKind::DictionaryEntry)
                    && line.indent >= self.leaf_indent
            }
            None => false,
        }
    }

    pub fn push(&mut self, line: LineInput) {
        let body = line.text.trim_start();
        let end = line.offset + line.text.len();

        if self.is_continuation(&line) {
            if let Some(leaf) = self.leaf.as_mut() {
                leaf.text.push('\n');
                leaf.text.push_str(body);
                if let Some(entry) = leaf.entry.as_mut() {
                    entry.definition.push(' ');
                    entry.definition.push_str(body);
                }
                leaf.char_range.end = end;
            }
            return;
        }

        self.close_leaf();

        let section = self.section_level();
        let top_kind = self.stack.last().map(|n| n.kind);
        let mut target = match line.class.level {
            LevelHint::Heading(d) => d,
            LevelHint::Nested(n) => section.saturating_add(1).saturating_add(n),
            LevelHint::Inherit
                if line.class.kind == NodeKind::Paragraph
                    && line.indent > 0
                    && top_kind == Some(NodeKind::ListItem) =>
            {
                self.stack.last().map_or(1, |n| n.level.saturating_add(1))
            }
            LevelHint::Inherit => section.saturating_add(1),
        };
        target = target.max(1);

        while self.stack.len() > 1 && self.stack.last().is_some_and(|n| n.level >= target) {
            self.pop_container();
        }
        let (parent_id, parent_level) = self
            .stack
            .last()
            .map_or((0, 0), |n| (n.id, n.level));
        target = target.min(parent_level.saturating_add(1));

        let record = NodeRecord {
            id: self.next_id,
            parent: Some(parent_id),
            kind: line.class.kind,
            level: target,
            text: body.to_string(),
            formatting: line.formatting.clone(),
            char_range: Span::new(line.offset, end),
            confidence: line.class.confidence,
            entry: line.class.entry,
        };
        self.next_id += 1;

        if record.kind.is_container() {
            self.stack.push(record);
        } else {
            self.leaf = Some(record);
            self.leaf_indent = line.indent;
        }
    }

    fn extend_top(&mut self, end: usize) {
        if let Some(top) = self.stack.last_mut() {
            top.char_range.end = top.char_range.end.max(end);
        }
    }

    fn close(&mut self, record: NodeRecord) {
        self.extend_top(record.char_range.end);
        self.buffered_bytes += record.approx_bytes();
        self.nodes_closed += 1;
        self.buffer.push(record);
    }

    fn close_leaf(&mut self) {
        if let Some(leaf) = self.leaf.take() {
            self.close(leaf);
        }
    }

    fn pop_container(&mut self) {
        if let Some(node) = self.stack.pop() {
            self.close(node);
        }
    }

    /// Call after every source line. Flushes when K nodes are buffered, or
    /// earlier when the buffer outgrows the memory budget.
    pub fn after_line(&mut self, lines_consumed: usize, text_len: usize, pending_blank: bool) -> Result<()> {
        if self.buffer.len() >= self.flush_every {
            return self.flush(lines_consumed, text_len, pending_blank, false);
        }
        if self.buffered_bytes > self.memory_budget {
            warn!(
                buffered_bytes = self.buffered_bytes,
                budget_bytes = self.memory_budget,
                "flush buffer over memory budget, forcing flush"
            );
            self.warnings.push(PipelineWarning::MemoryBudgetExceeded {
                buffered_bytes: self.buffered_bytes,
                budget_bytes: self.memory_budget,
            });
            return self.flush(lines_consumed, text_len, pending_blank, false);
        }
        Ok(())
    }

    fn flush(&mut self, lines_consumed: usize, text_len: usize, pending_blank: bool, complete: bool) -> Result<()> {
        let marker = FlushMarker {
            lines_consumed,
            text_len,
            pending_blank,
            next_id: self.next_id,
            nodes_closed: self.nodes_closed,
            stack: self.stack.clone(),
            leaf: self.leaf.clone(),
            leaf_indent: self.leaf_indent,
            complete,
        };
        self.sink.write_batch(&self.buffer, &marker)?;
        debug!(nodes = self.buffer.len(), lines_consumed, "flushed node batch");
        self.buffer.clear();
        self.buffered_bytes = 0;
        self.flushes += 1;
        Ok(())
    }

    /// Close everything, stretch the root over the whole text and hand back
    /// the sink with every record written.
    pub fn finish(mut self, lines_consumed: usize, text_len: usize, pending_blank: bool) -> Result<BuildOutput<S>> {
        self.close_leaf();
        while self.stack.len() > 1 {
            self.pop_container();
        }
        if let Some(mut root) = self.stack.pop() {
            root.char_range = Span::new(0, text_len);
            self.buffer.push(root);
            self.nodes_closed += 1;
        }
        self.flush(lines_consumed, text_len, pending_blank, true)?;
        Ok(BuildOutput {
            sink: self.sink,
            node_count: self.nodes_closed,
            flushes: self.flushes,
            warnings: self.warnings,
        })
    }
}

pub struct BuildOutput<S> {
    pub sink: S,
    pub node_count: usize,
    pub flushes: usize,
    pub warnings: Vec<PipelineWarning>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::TextAccumulator;
    use crate::parser::classify::{classify, ClassifierOptions, LineFeatures};
    use crate::parser::scratch::MemorySink;
    use crate::parser::tree::{assemble, DocumentNode};

    fn build(lines: &[&str], flush_every: usize, budget: usize, join: bool) -> (DocumentNode, BuildOutput<()>) {
        let fmt = Formatting::default();
        let opts = ClassifierOptions::default();
        let mut acc = TextAccumulator::new();
        let mut builder = TreeBuilder::new(MemorySink::default(), flush_every, budget, join);
        for (i, line) in lines.iter().enumerate() {
            let blank_before = acc.pending_blank();
            if let Some(offset) = acc.push(line) {
                let class = classify(&LineFeatures { text: line, formatting: &fmt }, &opts);
                builder.push(LineInput {
                    text: line,
                    formatting: &fmt,
                    offset,
                    indent: crate::parser::classify::leading_spaces(line),
                    blank_before,
                    class,
                });
            }
            builder.after_line(i + 1, acc.len(), acc.pending_blank()).unwrap();
        }
        let out = builder.finish(lines.len(), acc.len(), acc.pending_blank()).unwrap();
        let root = assemble(out.sink.into_records().unwrap()).unwrap();
        let meta = BuildOutput {
            sink: (),
            node_count: out.node_count,
            flushes: out.flushes,
            warnings: out.warnings,
        };
        (root, meta)
    }

    #[test]
    fn flat_entries_are_root_children() {
        let (root, meta) = build(&["Term1 — Def1", "Term2 — Def2"], 256, usize::MAX, true);
        assert_eq!(root.children.len(), 2);
        for (child, term) in root.children.iter().zip(["Term1", "Term2"]) {
            assert_eq!(child.kind, NodeKind::DictionaryEntry);
            assert_eq!(child.level, 1);
            assert_eq!(child.entry.as_ref().unwrap().term, term);
        }
        assert_eq!(meta.node_count, 3);
        assert_eq!(root.char_range, Span::new(0, 29));
    }

    #[test]
    fn headings_nest_and_pop() {
        let lines = [
            "# Fruits",
            "apple — a red fruit",
            "## Citrus",
            "lemon — sour",
            "# Vegetables",
            "leek — mild onion",
        ];
        let (root, _) = build(&lines, 256, usize::MAX, true);
        assert_eq!(root.children.len(), 2);
        let fruits = &root.children[0];
        assert_eq!(fruits.text, "# Fruits");
        assert_eq!(fruits.children.len(), 2);
        assert_eq!(fruits.children[1].kind, NodeKind::Heading);
        assert_eq!(fruits.children[1].level, 2);
        assert_eq!(fruits.children[1].children[0].level, 3);
        assert!(root.ranges_are_nested());
    }

    #[test]
    fn level_jump_is_clamped() {
        let (root, _) = build(&["#### Deep first", "body text here"], 256, usize::MAX, true);
        let heading = &root.children[0];
        assert_eq!(heading.level, 1);
        assert_eq!(heading.children[0].level, 2);
    }

    #[test]
    fn wrapped_lines_join_unless_blank_or_hard_breaks() {
        let lines = ["apple — a red", "fruit from trees", "", "a new paragraph"];
        let (root, _) = build(&lines, 256, usize::MAX, true);
        assert_eq!(root.children.len(), 2);
        let entry = root.children[0].entry.as_ref().unwrap();
        assert_eq!(entry.definition, "a red fruit from trees");
        assert_eq!(root.children[0].text, "apple — a red\nfruit from trees");

        let (root, _) = build(&lines, 256, usize::MAX, false);
        assert_eq!(root.children.len(), 3);
    }

    #[test]
    fn list_items_and_indented_continuations() {
        let lines = ["# Steps", "- first", "    - nested", "    detail under nested", "- second"];
        let (root, _) = build(&lines, 256, usize::MAX, false);
        let steps = &root.children[0];
        assert_eq!(steps.children.len(), 2);
        let first = &steps.children[0];
        assert_eq!(first.kind, NodeKind::ListItem);
        assert_eq!(first.level, 2);
        let nested = &first.children[0];
        assert_eq!(nested.level, 3);
        assert_eq!(nested.children[0].kind, NodeKind::Paragraph);
        assert!(root.ranges_are_nested());
    }

    #[test]
    fn flushes_every_k_nodes() {
        let lines: Vec<String> = (0..10).map(|i| format!("term{i} — definition {i}")).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let (root, meta) = build(&refs, 3, usize::MAX, true);
        assert_eq!(root.children.len(), 10);
        // 9 leaves closed in batches of 3, plus the final flush
        assert_eq!(meta.flushes, 4);
        assert!(meta.warnings.is_empty());
    }

    #[test]
    fn memory_budget_forces_flush_with_warning() {
        let lines: Vec<String> = (0..5).map(|i| format!("term{i} — definition {i}")).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let (root, meta) = build(&refs, 1000, 10, true);
        assert_eq!(root.children.len(), 5);
        assert!(meta.flushes > 1);
        assert!(matches!(
            meta.warnings[0],
            PipelineWarning::MemoryBudgetExceeded { budget_bytes: 10, .. }
        ));
    }
}

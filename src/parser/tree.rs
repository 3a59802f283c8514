use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::source::Formatting;

/// Byte range into the normalized document text. Always on char boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Span { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    #[cfg(test)]
    pub fn contains(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn slice<'a>(&self, text: &'a str) -> &'a str {
        &text[self.start..self.end]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Root,
    Heading,
    ListItem,
    DictionaryEntry,
    Paragraph,
    Unknown,
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Root => "root",
            NodeKind::Heading => "heading",
            NodeKind::ListItem => "list_item",
            NodeKind::DictionaryEntry => "dictionary_entry",
            NodeKind::Paragraph => "paragraph",
            NodeKind::Unknown => "unknown",
        }
    }

    /// Kinds that stay open on the ancestor stack and can own children.
    pub fn is_container(&self) -> bool {
        matches!(self, NodeKind::Root | NodeKind::Heading | NodeKind::ListItem)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryParts {
    pub term: String,
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentNode {
    pub id: u32,
    pub kind: NodeKind,
    pub level: u8,
    pub text: String,
    #[serde(default)]
    pub formatting: Formatting,
    pub char_range: Span,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<EntryParts>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DocumentNode>,
}

impl DocumentNode {
    pub fn first_line(&self) -> &str {
        self.text.lines().next().unwrap_or("")
    }

    /// Pre-order traversal, root included.
    pub fn walk(&self) -> Walk<'_> {
        Walk { stack: vec![self] }
    }

    #[cfg(test)]
    pub fn node_count(&self) -> usize {
        self.walk().count()
    }

    /// Children disjoint, ordered and inside the parent, recursively.
    #[cfg(test)]
    pub fn ranges_are_nested(&self) -> bool {
        let mut prev_end = self.char_range.start;
        for child in &self.children {
            if child.char_range.start < prev_end
                || !self.char_range.contains(&child.char_range)
                || !child.ranges_are_nested()
            {
                return false;
            }
            prev_end = child.char_range.end;
        }
        true
    }
}

pub struct Walk<'a> {
    stack: Vec<&'a DocumentNode>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a DocumentNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

/// Flat node as written to the scratch file; children are linked by `parent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: u32,
    pub parent: Option<u32>,
    pub kind: NodeKind,
    pub level: u8,
    pub text: String,
    #[serde(default)]
    pub formatting: Formatting,
    pub char_range: Span,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<EntryParts>,
}

impl NodeRecord {
    pub fn approx_bytes(&self) -> usize {
        self.text.len() + self.entry.as_ref().map_or(0, |e| e.term.len() + e.definition.len()) + 96
    }

    fn into_node(self, children: Vec<DocumentNode>) -> DocumentNode {
        DocumentNode {
            id: self.id,
            kind: self.kind,
            level: self.level,
            text: self.text,
            formatting: self.formatting,
            char_range: self.char_range,
            confidence: self.confidence,
            entry: self.entry,
            children,
        }
    }
}

/// Rebuild the owned tree from flat records. Children are ordered by id,
/// which is document order.
pub fn assemble(records: Vec<NodeRecord>) -> Option<DocumentNode> {
    let mut by_parent: HashMap<Option<u32>, Vec<NodeRecord>> = HashMap::new();
    for r in records {
        by_parent.entry(r.parent).or_default().push(r);
    }
    for list in by_parent.values_mut() {
        list.sort_by_key(|r| r.id);
    }
    let root = by_parent.get_mut(&None)?.pop()?;
    Some(build(root, &mut by_parent))
}

fn build(record: NodeRecord, by_parent: &mut HashMap<Option<u32>, Vec<NodeRecord>>) -> DocumentNode {
    let children = by_parent
        .remove(&Some(record.id))
        .unwrap_or_default()
        .into_iter()
        .map(|c| build(c, by_parent))
        .collect();
    record.into_node(children)
}

use std::io::Write;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::tree::{DocumentNode, NodeKind, Span};
use crate::error::Result;

/// Row handed to the external dictionary store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictionaryEntry {
    pub term: String,
    pub definition: String,
    pub confidence: f32,
    pub source_range: Span,
}

#[derive(Serialize)]
struct CsvRow<'a> {
    term: &'a str,
    definition: &'a str,
    confidence: f32,
    start: usize,
    end: usize,
}

fn entries_in(node: &DocumentNode) -> impl Iterator<Item = DictionaryEntry> + '_ {
    node.walk().filter_map(|n| {
        let parts = n.entry.as_ref().filter(|_| n.kind == NodeKind::DictionaryEntry)?;
        Some(DictionaryEntry {
            term: parts.term.clone(),
            definition: parts.definition.clone(),
            confidence: n.confidence,
            source_range: n.char_range,
        })
    })
}

/// All dictionary entries in document order. Top-level subtrees are walked in parallel.
pub fn extract_entries(root: &DocumentNode) -> Vec<DictionaryEntry> {
    root.children
        .par_iter()
        .flat_map_iter(entries_in)
        .collect()
}

pub fn write_csv<W: Write>(entries: &[DictionaryEntry], writer: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for e in entries {
        wtr.serialize(CsvRow {
            term: &e.term,
            definition: &e.definition,
            confidence: e.confidence,
            start: e.source_range.start,
            end: e.source_range.end,
        })?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_document, ParseOptions};
    use std::path::Path;

    #[test]
    fn entries_in_document_order() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/glossary.txt");
        let doc = parse_document(&path, "glossary", &ParseOptions::default()).unwrap();
        let entries = extract_entries(&doc.root);
        let terms: Vec<_> = entries.iter().map(|e| e.term.as_str()).collect();
        assert_eq!(
            terms,
            vec![
                "apple", "pear", "quince", "medlar", "cherry", "plum", "apricot", "damson", "lemon",
                "lime", "yuzu"
            ]
        );
        assert!(entries.windows(2).all(|w| w[0].source_range.end <= w[1].source_range.start));
        assert!(entries[0].definition.ends_with("crisp flesh."));
    }

    #[test]
    fn csv_has_header_and_quotes() {
        let entries = vec![DictionaryEntry {
            term: "quince".into(),
            definition: "a hard, acid fruit".into(),
            confidence: 0.75,
            source_range: Span::new(3, 40),
        }];
        let mut out = Vec::new();
        write_csv(&entries, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "term,definition,confidence,start,end\nquince,\"a hard, acid fruit\",0.75,3,40\n"
        );
    }
}

//! Whitespace normalization applied once before parsing and chunking.
//!
//! Rules: BOM stripped, CRLF/CR become LF, tabs become four spaces, Unicode
//! space separators become ASCII spaces, other control characters are dropped,
//! trailing whitespace is removed per line, runs of blank lines collapse to one,
//! leading and trailing blank lines are removed and there is no final newline.
//! The pass is idempotent.

const TAB_WIDTH: usize = 4;

/// Normalize a single line (no newline inside).
pub fn normalize_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    for c in line.chars() {
        match c {
            '\u{FEFF}' => {}
            '\t' => out.extend(std::iter::repeat(' ').take(TAB_WIDTH)),
            c if c != ' ' && c.is_whitespace() => out.push(' '),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    let trimmed = out.trim_end().len();
    out.truncate(trimmed);
    out
}

/// Incrementally joins normalized lines, collapsing blank runs.
///
/// `push` returns the byte offset of the line inside the output, or `None`
/// when the line was blank and carries no content.
#[derive(Debug, Default)]
pub struct TextAccumulator {
    text: String,
    pending_blank: bool,
}

impl TextAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, normalized_line: &str) -> Option<usize> {
        if normalized_line.is_empty() {
            if !self.text.is_empty() {
                self.pending_blank = true;
            }
            return None;
        }
        if !self.text.is_empty() {
            self.text.push('\n');
            if self.pending_blank {
                self.text.push('\n');
            }
        }
        self.pending_blank = false;
        let start = self.text.len();
        self.text.push_str(normalized_line);
        Some(start)
    }

    pub fn pending_blank(&self) -> bool {
        self.pending_blank
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn into_string(self) -> String {
        self.text
    }
}

/// Split raw text into lines, treating CRLF and lone CR as line breaks.
pub fn raw_lines(raw: &str) -> Vec<String> {
    raw.replace("\r\n", "\n")
        .replace('\r', "\n")
        .split('\n')
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
pub fn normalize_text(raw: &str) -> String {
    let mut acc = TextAccumulator::new();
    for line in raw_lines(raw) {
        acc.push(&normalize_line(&line));
    }
    acc.into_string()
}

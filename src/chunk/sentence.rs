use unicode_segmentation::UnicodeSegmentation;

/// Characters that end a sentence in the scripts the corpus mixes.
const TERMINATORS: &[char] = &[
    '.', '!', '?', '。', '！', '？', '．', '؟', '۔', '।', '॥', '…', '։', '።',
];

pub fn has_terminator(s: &str) -> bool {
    s.contains(TERMINATORS)
}

/// Byte offsets (relative to `text`) where a new sentence starts, 0 excluded.
///
/// UAX #29 sentence bounds; trailing spaces stay with the preceding sentence.
pub fn sentence_starts(text: &str) -> Vec<usize> {
    text.split_sentence_bound_indices()
        .map(|(i, _)| i)
        .filter(|&i| i > 0)
        .collect()
}

/// Byte offsets where a word starts after a whitespace run, 0 excluded.
pub fn word_starts(text: &str) -> Vec<usize> {
    let mut out = Vec::new();
    let mut prev_ws = false;
    for (i, c) in text.char_indices() {
        if prev_ws && !c.is_whitespace() && i > 0 {
            out.push(i);
        }
        prev_ws = c.is_whitespace();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin_sentences() {
        let t = "One two. Three four? Five.";
        assert_eq!(sentence_starts(t), vec![9, 21]);
    }

    #[test]
    fn cjk_sentences_without_spaces() {
        let t = "今日は晴れです。明日は雨です。";
        let starts = sentence_starts(t);
        assert_eq!(starts.len(), 1);
        assert_eq!(&t[starts[0]..], "明日は雨です。");
    }

    #[test]
    fn devanagari_and_arabic() {
        assert_eq!(sentence_starts("यह एक है। वह दो है।").len(), 1);
        assert_eq!(sentence_starts("ما هذا؟ هذا كتاب.").len(), 1);
    }

    #[test]
    fn words() {
        assert_eq!(word_starts("ab  cd e"), vec![4, 7]);
        assert!(has_terminator("fin。"));
        assert!(!has_terminator("no end"));
    }
}

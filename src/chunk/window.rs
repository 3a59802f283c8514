use super::sentence::{sentence_starts, word_starts};
use super::Piece;
use crate::parser::tree::Span;

/// Byte offset of every char, plus `text.len()` as the final entry.
fn char_offsets(text: &str) -> Vec<usize> {
    text.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect()
}

/// Last byte boundary in `bounds` (sorted) within `lo..=hi`.
fn last_within(bounds: &[usize], lo: usize, hi: usize) -> Option<usize> {
    let idx = bounds.partition_point(|&b| b <= hi);
    bounds[..idx].last().copied().filter(|&b| b >= lo)
}

/// Cursor advances up to `max` chars, then snaps back to the last sentence
/// start within `lookback` chars, else the last word start, else the hard limit.
pub(super) fn fixed(text: &str, max: usize, lookback: usize) -> Vec<Piece> {
    let offsets = char_offsets(text);
    let total = offsets.len() - 1;
    let sentences = sentence_starts(text);
    let words = word_starts(text);

    let mut pieces = Vec::new();
    let mut cursor = 0usize;
    while cursor < total {
        let hard = (cursor + max).min(total);
        let end = if hard == total {
            total
        } else {
            let lo_char = hard.saturating_sub(lookback).max(cursor + 1);
            let (lo, hi) = (offsets[lo_char], offsets[hard]);
            let snapped = last_within(&sentences, lo, hi).or_else(|| last_within(&words, lo, hi));
            match snapped {
                Some(byte) => offsets.partition_point(|&o| o < byte),
                None => hard,
            }
        };
        pieces.push(Piece {
            span: Span::new(offsets[cursor], offsets[end]),
            oversized: false,
        });
        cursor = end;
    }
    pieces
}

/// Windows of `max` chars advanced by `max - overlap`; the last may be shorter.
pub(super) fn sliding(text: &str, max: usize, overlap: usize) -> Vec<Piece> {
    let offsets = char_offsets(text);
    let total = offsets.len() - 1;
    let step = max - overlap;

    let mut pieces = Vec::new();
    let mut start = 0usize;
    while start < total {
        let end = (start + max).min(total);
        pieces.push(Piece {
            span: Span::new(offsets[start], offsets[end]),
            oversized: false,
        });
        if end == total {
            break;
        }
        start += step;
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_prefers_sentence_then_word_then_hard() {
        let text = "Aaaa bb. Ccc dd ee ff";
        // limit 12 falls inside "dd"; sentence start 9 is within lookback
        let p = fixed(text, 12, 4);
        assert_eq!(p[0].span, Span::new(0, 9));

        // without a sentence boundary in range, the last word start wins
        let p = fixed("aaaa bbbb cccc", 7, 3);
        assert_eq!(p[0].span, Span::new(0, 5));

        let p = fixed("abcdefghij", 4, 2);
        assert_eq!(p.iter().map(|x| x.span.len()).collect::<Vec<_>>(), vec![4, 4, 2]);
    }

    #[test]
    fn multibyte_limits_count_chars() {
        let text = "ééééé";
        let p = sliding(text, 2, 1);
        assert_eq!(p.len(), 4);
        assert_eq!(p[0].span, Span::new(0, 4));
        let p = fixed(text, 2, 1);
        assert_eq!(p.len(), 3);
    }
}

//! Recursive character text splitter.
//!
//! Splits extracted text into pieces of at most `chunk_size` characters,
//! preferring paragraph boundaries, then lines, then sentences, then spaces,
//! and only hard-cutting when a single word exceeds the limit. Consecutive
//! chunks share up to `overlap` characters of trailing context.

use std::collections::VecDeque;

const SEPARATORS: [&str; 4] = ["\n\n", "\n", ". ", " "];

/// Split `text` into trimmed, non-empty chunks.
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size - 1);
    let pieces = split_pieces(text, chunk_size, &SEPARATORS);
    merge_pieces(&pieces, chunk_size, overlap)
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn split_pieces(text: &str, chunk_size: usize, separators: &[&str]) -> Vec<String> {
    if char_len(text) <= chunk_size {
        return vec![text.to_string()];
    }
    let Some((sep, rest)) = separators.split_first() else {
        return hard_split(text, chunk_size);
    };
    if !text.contains(sep) {
        return split_pieces(text, chunk_size, rest);
    }

    let parts: Vec<&str> = text.split(sep).collect();
    let last = parts.len() - 1;
    let mut out = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        // Keep the separator on the piece so concatenation restores the text.
        let piece = if i < last {
            format!("{part}{sep}")
        } else {
            part.to_string()
        };
        if piece.is_empty() {
            continue;
        }
        if char_len(&piece) <= chunk_size {
            out.push(piece);
        } else {
            out.extend(split_pieces(&piece, chunk_size, rest));
        }
    }
    out
}

fn hard_split(text: &str, chunk_size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_size)
        .map(|c| c.iter().collect())
        .collect()
}

fn merge_pieces(pieces: &[String], chunk_size: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut window: VecDeque<&str> = VecDeque::new();
    let mut window_len = 0;

    for piece in pieces {
        let len = char_len(piece);
        if window_len + len > chunk_size && !window.is_empty() {
            push_chunk(&mut chunks, &window);
            while window_len > overlap || (window_len > 0 && window_len + len > chunk_size) {
                let Some(front) = window.pop_front() else {
                    break;
                };
                window_len -= char_len(front);
            }
        }
        window.push_back(piece);
        window_len += len;
    }
    if !window.is_empty() {
        push_chunk(&mut chunks, &window);
    }
    chunks
}

fn push_chunk(chunks: &mut Vec<String>, window: &VecDeque<&str>) {
    let text: String = window.iter().copied().collect();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return;
    }
    if chunks.last().map(String::as_str) != Some(trimmed) {
        chunks.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = split_text("Hello, world!", 100, 10);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_empty_text() {
        assert!(split_text("", 100, 10).is_empty());
        assert!(split_text("  \n\n \n", 100, 10).is_empty());
    }

    #[test]
    fn test_paragraphs_respect_limit() {
        let para = "word ".repeat(30);
        let text = format!("{para}\n\n{para}\n\n{para}");
        let chunks = split_text(&text, 200, 0);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 200, "chunk too long: {}", chunk.len());
        }
    }

    #[test]
    fn test_overlap_repeats_trailing_context() {
        let text = (0..40)
            .map(|i| format!("token{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = split_text(&text, 60, 20);
        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            let last_word = pair[0].split_whitespace().last().unwrap();
            assert!(
                pair[1].contains(last_word),
                "expected {last_word:?} to carry into {:?}",
                pair[1]
            );
        }
    }

    #[test]
    fn test_long_word_is_hard_split() {
        let text = "x".repeat(250);
        let chunks = split_text(&text, 100, 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].len(), 50);
    }

    #[test]
    fn test_multibyte_text_counts_chars() {
        let text = "é".repeat(150);
        let chunks = split_text(&text, 100, 0);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 100);
    }

    #[test]
    fn test_deterministic() {
        let text = "First paragraph.\n\nSecond one. It has sentences.\nAnd lines.";
        assert_eq!(split_text(text, 20, 5), split_text(text, 20, 5));
    }
}

//! Sentence-aware character chunker.
//!
//! Splits document text into overlapping windows of at most `size`
//! characters. Unless a window reaches the end of the text, it is shortened
//! to the last sentence boundary found in its final [`BOUNDARY_WINDOW`]
//! characters:
//!
//! - `.`, `!` or `?` followed by a space or newline (cut after the mark)
//! - a blank line, `\n\n` (cut after both newlines)
//!
//! The next window starts `overlap` characters before the previous end.
//! Positions are counted in characters, so multi-byte text is never split
//! inside a code point.

/// How far back from a window's end to look for a sentence boundary.
pub const BOUNDARY_WINDOW: usize = 100;

const DEFAULT_SIZE: usize = 1000;

/// Split `text` into chunks. Empty text yields no chunks.
///
/// `size == 0` uses the default of 1000 characters. An `overlap` of `size`
/// or more is clamped to `size / 5`.
pub fn split_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }

    let size = if size == 0 { DEFAULT_SIZE } else { size };
    let overlap = if overlap >= size { size / 5 } else { overlap };

    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < total {
        let mut end = (start + size).min(total);

        if end < total {
            if let Some(cut) = sentence_boundary(&chars[start..end]) {
                end = start + cut;
            }
        }

        chunks.push(chars[start..end].iter().collect());

        if end >= total {
            break;
        }
        let next = end.saturating_sub(overlap);
        // A short sentence cut can leave `end - overlap` behind `start`.
        start = if next > start { next } else { end };
    }

    chunks
}

/// Length of `window` up to its last sentence boundary within the final
/// [`BOUNDARY_WINDOW`] characters, if one lies past the search start.
fn sentence_boundary(window: &[char]) -> Option<usize> {
    let len = window.len();
    let search_start = len.saturating_sub(BOUNDARY_WINDOW);

    for i in (search_start..len).rev() {
        let next = window.get(i + 1).copied();
        let cut = match window[i] {
            '.' | '!' | '?' if matches!(next, Some(' ') | Some('\n')) => Some(i + 1),
            '\n' if next == Some('\n') => Some(i + 2),
            _ => None,
        };
        if let Some(cut) = cut {
            return (cut > search_start).then_some(cut);
        }
    }
    None
}

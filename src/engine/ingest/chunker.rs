// ── Ingest: Chunker ────────────────────────────────────────────────────────
// Splits normalized document text into overlapping windows sized in
// estimated tokens (4 chars ≈ 1 token). A sentence boundary found within
// the trailing fifth of a window wins over a hard cut, so chunks end on
// ". " / "! " / "? " / newline whenever the text allows it.
//
// Determinism matters more than cleverness here: the same content always
// produces the same windows, which keeps chunk ids stable across
// re-ingestion.

use crate::atoms::constants::{
    CHARS_PER_TOKEN, CHUNK_BOUNDARY_SEARCH_RATIO, CHUNK_OVERLAP_RATIO, CHUNK_TARGET_TOKENS,
};

/// Estimated token count for a text, using the 4-chars-per-token heuristic.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() / CHARS_PER_TOKEN).max(1) as u32
}

/// Returns true when the character at `pos` (0-based, in chars) ends a
/// sentence: '.', '!', '?' followed by whitespace/EOF, or a newline.
fn is_sentence_boundary(chars: &[char], pos: usize) -> bool {
    match chars[pos] {
        '\n' => true,
        '.' | '!' | '?' => match chars.get(pos + 1) {
            None => true,
            Some(next) => next.is_whitespace(),
        },
        _ => false,
    }
}

/// Split `text` into chunk strings. Empty/whitespace-only input → `[]`.
pub fn chunk_text(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.iter().all(|c| c.is_whitespace()) {
        return vec![];
    }

    let window = CHUNK_TARGET_TOKENS * CHARS_PER_TOKEN;
    let overlap = (window as f64 * CHUNK_OVERLAP_RATIO) as usize;
    let boundary_zone = (window as f64 * CHUNK_BOUNDARY_SEARCH_RATIO) as usize;

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let hard_end = (start + window).min(chars.len());

        // Within the last 20% of the window, prefer the latest sentence end.
        let end = if hard_end < chars.len() {
            let zone_start = hard_end.saturating_sub(boundary_zone).max(start + 1);
            let boundary = (zone_start..hard_end)
                .rev()
                .find(|&i| is_sentence_boundary(&chars, i));
            match boundary {
                Some(i) => i + 1, // include the terminator
                None => hard_end,
            }
        } else {
            hard_end
        };

        let chunk: String = chars[start..end].iter().collect();
        if !chunk.trim().is_empty() {
            chunks.push(chunk);
        }

        if end >= chars.len() {
            break;
        }
        // Carry the overlap into the next window, always making progress.
        start = end.saturating_sub(overlap).max(start + 1);
    }

    chunks
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW_CHARS: usize = CHUNK_TARGET_TOKENS * CHARS_PER_TOKEN;

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("A single short sentence.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "A single short sentence.");
    }

    #[test]
    fn empty_text_yields_nothing() {
        assert!(chunk_text("").is_empty());
        assert!(chunk_text("   \n  ").is_empty());
    }

    #[test]
    fn long_text_chunks_cover_everything_with_overlap() {
        // 12 windows of prose with regular sentence ends.
        let sentence = "Routing fees respond to liquidity pressure on the channel. ";
        let text = sentence.repeat(WINDOW_CHARS * 12 / sentence.len());
        let chunks = chunk_text(&text);
        assert!(chunks.len() >= 10);

        // Consecutive chunks share the configured overlap: the head of each
        // chunk must appear near the tail of its predecessor.
        for pair in chunks.windows(2) {
            let head: String = pair[1].chars().take(40).collect();
            assert!(
                pair[0].contains(head.trim_start()),
                "no overlap between consecutive chunks"
            );
        }
    }

    #[test]
    fn cuts_on_sentence_boundary_when_available() {
        let sentence = "Each chunk should end at a period when one is close enough. ";
        let text = sentence.repeat(WINDOW_CHARS * 3 / sentence.len());
        let chunks = chunk_text(&text);
        for chunk in &chunks[..chunks.len() - 1] {
            let trimmed = chunk.trim_end();
            assert!(
                trimmed.ends_with('.') || trimmed.ends_with('!') || trimmed.ends_with('?'),
                "mid-sentence cut: ...{:?}",
                &trimmed[trimmed.len().saturating_sub(30)..]
            );
        }
    }

    #[test]
    fn unbroken_text_still_makes_progress() {
        // No whitespace or punctuation at all; hard cuts must apply.
        let text = "x".repeat(WINDOW_CHARS * 3);
        let chunks = chunk_text(&text);
        assert!(chunks.len() >= 3);
        for c in &chunks {
            assert!(c.chars().count() <= WINDOW_CHARS);
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "Stable ids depend on stable windows. ".repeat(400);
        assert_eq!(chunk_text(&text), chunk_text(&text));
    }

    #[test]
    fn token_estimate_floor_is_one() {
        assert_eq!(estimate_tokens("ab"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }
}

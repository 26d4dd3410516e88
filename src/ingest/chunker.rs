use crate::error::{Result, TempographError};

/// Split episode text into segments of at most `max_chars` characters.
///
/// Paragraphs (`\n\n`) are packed greedily. A paragraph longer than `max_chars` is cut at
/// the last sentence end, newline or whitespace that leaves a head of at least a third of
/// `max_chars`, and hard-cut otherwise. Separators stay with the preceding piece, so the
/// chunks concatenate back to `text` exactly.
pub fn chunk(text: &str, max_chars: usize) -> Result<Vec<String>> {
    if max_chars == 0 {
        return Err(TempographError::InvalidInput(
            "chunk size must be greater than 0".to_string(),
        ));
    }
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for paragraph in text.split_inclusive("\n\n") {
        let len = paragraph.chars().count();

        if current_len + len <= max_chars {
            current.push_str(paragraph);
            current_len += len;
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if len <= max_chars {
            current.push_str(paragraph);
            current_len = len;
            continue;
        }

        let mut pieces = split_oversized(paragraph, max_chars);
        // The tail keeps packing with whatever follows
        if let Some(tail) = pieces.pop() {
            current_len = tail.chars().count();
            current = tail;
        }
        chunks.extend(pieces);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    Ok(chunks)
}

/// Cut a paragraph into pieces of at most `max_chars` characters.
fn split_oversized(paragraph: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = paragraph;

    loop {
        let chars: Vec<(usize, char)> = rest.char_indices().collect();
        if chars.len() <= max_chars {
            pieces.push(rest.to_string());
            return pieces;
        }
        let cut = find_break(&chars, max_chars).unwrap_or(max_chars);
        // cut <= max_chars < chars.len(), so the index is a char boundary inside `rest`
        let byte = chars[cut].0;
        pieces.push(rest[..byte].to_string());
        rest = &rest[byte..];
    }
}

/// Number of leading chars to cut off, preferring sentence ends, then newlines, then
/// whitespace. `None` when no break leaves a head of at least `max_chars / 3`.
fn find_break(chars: &[(usize, char)], max_chars: usize) -> Option<usize> {
    let min_head = (max_chars / 3).max(1);
    let last = |pred: &dyn Fn(usize) -> bool| (min_head..=max_chars).rev().find(|&k| pred(k));

    let sentence_end = |k: usize| {
        k >= 2 && chars[k - 1].1.is_whitespace() && matches!(chars[k - 2].1, '.' | '!' | '?')
    };
    let newline = |k: usize| chars[k - 1].1 == '\n';
    let whitespace = |k: usize| chars[k - 1].1.is_whitespace();

    last(&sentence_end).or_else(|| last(&newline)).or_else(|| last(&whitespace))
}

/// Estimate token count from text
///
/// Uses approximation: 1 token ≈ 4 characters
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_reconstructs(text: &str, max: usize) -> Vec<String> {
        let chunks = chunk(text, max).unwrap();
        assert_eq!(chunks.concat(), text);
        for c in &chunks {
            assert!(c.chars().count() <= max, "chunk of {} chars exceeds {}", c.chars().count(), max);
            assert!(!c.is_empty());
        }
        chunks
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens("test"), 1);
        assert_eq!(estimate_tokens("testtest12"), 3);
    }

    #[test]
    fn test_empty_and_zero() {
        assert!(chunk("", 100).unwrap().is_empty());
        assert!(matches!(chunk("abc", 0), Err(TempographError::InvalidInput(_))));
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = assert_reconstructs("Alice leads the API redesign.", 100);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_paragraphs_packed_greedily() {
        let text = "First paragraph here.\n\nSecond one.\n\nThird paragraph is a bit longer.";
        let chunks = assert_reconstructs(text, 40);
        assert_eq!(chunks[0], "First paragraph here.\n\nSecond one.\n\n");
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_oversized_paragraph_breaks_at_sentence() {
        let text = "Alice joined Acme in May. She leads the API redesign now. Bob reviews every change.";
        let chunks = assert_reconstructs(text, 60);
        assert_eq!(chunks[0], "Alice joined Acme in May. She leads the API redesign now. ");
    }

    #[test]
    fn test_falls_back_to_whitespace_then_hard_split() {
        let words = "alpha beta gamma delta epsilon zeta eta theta iota kappa";
        let chunks = assert_reconstructs(words, 20);
        assert!(chunks.iter().take(chunks.len() - 1).all(|c| c.ends_with(' ')));

        let solid = "x".repeat(50);
        let chunks = assert_reconstructs(&solid, 20);
        assert_eq!(chunks.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![20, 20, 10]);
    }

    #[test]
    fn test_break_respects_min_head() {
        // The only sentence end is too early; the whitespace near the limit wins
        let text = "Hi. abcdefghijklmnopqrstuvwxyz abcdefghij";
        let chunks = assert_reconstructs(text, 33);
        assert_eq!(chunks[0], "Hi. abcdefghijklmnopqrstuvwxyz ");
    }

    #[test]
    fn test_multibyte_text() {
        let text = "Zoë und Jürgen leiten das Projekt. Ärger gibt es keinen. ".repeat(5);
        assert_reconstructs(&text, 25);
        assert_reconstructs("日本語のテキスト。もう一つの文。", 5);
    }

    #[test]
    fn test_whitespace_heavy_text_reconstructs() {
        assert_reconstructs("\n\n\n\n   \n\nA\n\n\n", 3);
    }
}

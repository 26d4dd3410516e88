//! FTS5 query preparation and BM25 score normalization.

use std::collections::HashSet;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with",
    "by", "from", "as", "is", "are", "was", "were", "be", "been", "being", "have",
    "has", "had", "do", "does", "did", "will", "would", "should", "could", "what",
    "which", "who", "where", "when", "why", "how", "this", "that", "these", "those",
];

/// Sanitize and format an FTS5 query string
///
/// Strips characters FTS5 treats as syntax, drops stop words, quotes every remaining
/// term (so `NOT`, `:` or `.` inside a term are literal) and joins them with OR for recall.
/// If every term is a stop word the stop words are kept. Returns an empty string when
/// nothing searchable remains.
pub fn sanitize_fts5_query(query: &str) -> String {
    let cleaned: String = query
        .trim()
        .chars()
        .filter(|c| !matches!(c, '?' | '*' | '(' | ')' | '{' | '}' | '-' | '\'' | '^' | '+'))
        .collect();

    let stop_words: HashSet<&str> = STOP_WORDS.iter().copied().collect();
    let words: Vec<&str> = cleaned.split_whitespace().collect();
    let mut terms: Vec<&str> = words
        .iter()
        .copied()
        .filter(|term| !stop_words.contains(term.to_lowercase().as_str()) && term.chars().count() >= 2)
        .collect();

    if terms.is_empty() {
        terms = words;
    }

    terms
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Normalize a BM25 score to 0-1 (higher = better)
///
/// FTS5 BM25 scores are negative, better matches more negative. Sigmoid of the negated
/// score keeps them comparable with cosine scores.
pub fn normalize_bm25_score(raw_score: f64) -> f32 {
    if raw_score.is_nan() || raw_score.is_infinite() {
        return 0.0;
    }
    (1.0 / (1.0 + raw_score.exp())) as f32
}

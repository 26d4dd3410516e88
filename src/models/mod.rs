//! Graph data model: episodes, polymorphic nodes and bi-temporal edges.

mod edge;
mod episode;
mod node;

pub use edge::{Edge, EdgeKind};
pub use episode::{content_hash, EpisodeInput, EpisodeType, EpisodicNode};
pub use node::{CommunityNode, EntityNode, Node, NodeLabel, SourceNode};

use chrono::{DateTime, SecondsFormat, Utc};

/// Entity type assigned when the extractor gives none; compatible with every type.
pub const DEFAULT_ENTITY_TYPE: &str = "Entity";

/// Normalize a relation name into its class: upper snake case, punctuation collapsed.
///
/// `"works at"`, `"works-at"` and `"WORKS_AT"` are the same class.
pub fn relation_class(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.trim().chars() {
        if c.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(c.to_uppercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Normalize free text for equality checks (case and whitespace insensitive).
pub fn normalize_text(s: &str) -> String {
    s.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fixed-width RFC 3339 rendering used for storage; lexical order equals time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_relation_class_normalization() {
        assert_eq!(relation_class("works at"), "WORKS_AT");
        assert_eq!(relation_class("works-at"), "WORKS_AT");
        assert_eq!(relation_class("WORKS_AT"), "WORKS_AT");
        assert_eq!(relation_class("  blocked   on "), "BLOCKED_ON");
        assert_eq!(relation_class(""), "");
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Alice   WORKS\tat Acme "), "alice works at acme");
    }

    #[test]
    fn test_timestamp_lexical_order() {
        let a = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 11, 2, 3, 4, 5).unwrap();
        let (sa, sb) = (format_timestamp(&a), format_timestamp(&b));
        assert!(sa < sb);
        assert_eq!(sa.len(), sb.len());
        assert_eq!(parse_timestamp(&sa), Some(a));
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::relation_class;

/// What an edge connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Entity to entity fact.
    RelatesTo,
    /// Episode to entity.
    Mentions,
    /// Community to entity.
    HasMember,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::RelatesTo => "relates_to",
            EdgeKind::Mentions => "mentions",
            EdgeKind::HasMember => "has_member",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "relates_to" => Some(EdgeKind::RelatesTo),
            "mentions" => Some(EdgeKind::Mentions),
            "has_member" => Some(EdgeKind::HasMember),
            _ => None,
        }
    }
}

/// A directed, bi-temporal edge.
///
/// `valid_at`/`invalid_at` bound when the fact held in the world; `expired_at` is when
/// this record was superseded. `invalid_at >= valid_at` holds whenever both are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub uuid: Uuid,
    pub group_id: String,
    pub kind: EdgeKind,
    pub source_node_uuid: Uuid,
    pub target_node_uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub fact: String,
    #[serde(default)]
    pub fact_embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub episodes: Vec<Uuid>,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub valid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub invalid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expired_at: Option<DateTime<Utc>>,
}

impl Edge {
    fn new(
        kind: EdgeKind,
        group_id: &str,
        source: Uuid,
        target: Uuid,
        name: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            group_id: group_id.to_string(),
            kind,
            source_node_uuid: source,
            target_node_uuid: target,
            name: name.to_string(),
            fact: String::new(),
            fact_embedding: None,
            episodes: Vec::new(),
            attributes: serde_json::Map::new(),
            created_at: now,
            valid_at: None,
            invalid_at: None,
            expired_at: None,
        }
    }

    /// A fact between two entities.
    pub fn relates_to(
        group_id: &str,
        source: Uuid,
        target: Uuid,
        name: &str,
        fact: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let mut edge = Self::new(EdgeKind::RelatesTo, group_id, source, target, name, now);
        edge.fact = fact.to_string();
        edge
    }

    /// Provenance link from an episode to an entity it mentions.
    pub fn mentions(
        group_id: &str,
        episode: Uuid,
        entity: Uuid,
        reference_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut edge = Self::new(EdgeKind::Mentions, group_id, episode, entity, "MENTIONS", now);
        edge.valid_at = Some(reference_time);
        edge.episodes.push(episode);
        edge
    }

    /// Membership link from a community to an entity.
    pub fn has_member(group_id: &str, community: Uuid, entity: Uuid, now: DateTime<Utc>) -> Self {
        let mut edge = Self::new(EdgeKind::HasMember, group_id, community, entity, "HAS_MEMBER", now);
        edge.valid_at = Some(now);
        edge
    }

    pub fn relation_class(&self) -> String {
        relation_class(&self.name)
    }

    /// Live means still true in valid time.
    pub fn is_live(&self) -> bool {
        self.invalid_at.is_none()
    }

    /// Whether the fact held at instant `t`.
    pub fn valid_as_of(&self, t: DateTime<Utc>) -> bool {
        let started = self.valid_at.map_or(true, |v| v <= t);
        let not_ended = self.invalid_at.map_or(true, |i| i > t);
        started && not_ended
    }

    /// Close this edge at `at` (valid time), recorded as superseded at `now`.
    ///
    /// `at` is clamped to `valid_at` so the interval never inverts.
    pub fn invalidate(&mut self, at: DateTime<Utc>, now: DateTime<Utc>) {
        let at = match self.valid_at {
            Some(valid) if at < valid => valid,
            _ => at,
        };
        self.invalid_at = Some(at);
        self.expired_at = Some(now);
    }

    pub fn add_episode(&mut self, episode: Uuid) -> bool {
        if self.episodes.contains(&episode) {
            return false;
        }
        self.episodes.push(episode);
        true
    }

    /// The endpoint that is not `node`, if `node` is an endpoint.
    pub fn other_end(&self, node: Uuid) -> Option<Uuid> {
        if self.source_node_uuid == node {
            Some(self.target_node_uuid)
        } else if self.target_node_uuid == node {
            Some(self.source_node_uuid)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn fact() -> Edge {
        Edge::relates_to("g", Uuid::new_v4(), Uuid::new_v4(), "works at", "Alice works at Acme", Utc::now())
    }

    #[test]
    fn test_invalidate_clamps_to_valid_at() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let mut edge = fact();
        edge.valid_at = Some(t0);

        let now = Utc::now();
        edge.invalidate(t0 - Duration::days(10), now);
        assert_eq!(edge.invalid_at, Some(t0));
        assert_eq!(edge.expired_at, Some(now));
        assert!(!edge.is_live());
    }

    #[test]
    fn test_invalidate_keeps_later_instant() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let mut edge = fact();
        edge.valid_at = Some(t0);
        edge.invalidate(t0 + Duration::days(2), Utc::now());
        assert_eq!(edge.invalid_at, Some(t0 + Duration::days(2)));
    }

    #[test]
    fn test_valid_as_of() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut edge = fact();
        edge.valid_at = Some(t0);
        edge.invalidate(t0 + Duration::days(30), Utc::now());

        assert!(!edge.valid_as_of(t0 - Duration::days(1)));
        assert!(edge.valid_as_of(t0));
        assert!(edge.valid_as_of(t0 + Duration::days(29)));
        assert!(!edge.valid_as_of(t0 + Duration::days(30)));
    }

    #[test]
    fn test_relation_class_and_other_end() {
        let edge = fact();
        assert_eq!(edge.relation_class(), "WORKS_AT");
        assert_eq!(edge.other_end(edge.source_node_uuid), Some(edge.target_node_uuid));
        assert_eq!(edge.other_end(Uuid::new_v4()), None);
    }

    #[test]
    fn test_add_episode_dedupes() {
        let mut edge = fact();
        let ep = Uuid::new_v4();
        assert!(edge.add_episode(ep));
        assert!(!edge.add_episode(ep));
        assert_eq!(edge.episodes.len(), 1);
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::episode::EpisodicNode;
use super::DEFAULT_ENTITY_TYPE;

/// Storage label of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeLabel {
    Entity,
    Episodic,
    Community,
    Source,
}

impl NodeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeLabel::Entity => "entity",
            NodeLabel::Episodic => "episodic",
            NodeLabel::Community => "community",
            NodeLabel::Source => "source",
        }
    }
}

/// A canonical real-world entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityNode {
    pub uuid: Uuid,
    pub name: String,
    pub group_id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub valid_from: DateTime<Utc>,
    pub entity_type: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// Episodes that mentioned this entity.
    #[serde(default)]
    pub episodes: Vec<Uuid>,
    /// Candidate UUIDs folded into this entity.
    #[serde(default)]
    pub merged_uuids: Vec<Uuid>,
}

impl EntityNode {
    pub fn new(
        name: impl Into<String>,
        entity_type: impl Into<String>,
        group_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let entity_type = entity_type.into();
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            group_id: group_id.into(),
            summary: String::new(),
            embedding: None,
            created_at: now,
            updated_at: now,
            valid_from: now,
            entity_type: if entity_type.trim().is_empty() {
                DEFAULT_ENTITY_TYPE.to_string()
            } else {
                entity_type
            },
            attributes: serde_json::Map::new(),
            episodes: Vec::new(),
            merged_uuids: Vec::new(),
        }
    }

    pub fn is_generic(&self) -> bool {
        self.entity_type.eq_ignore_ascii_case(DEFAULT_ENTITY_TYPE)
    }

    /// Types are compatible when equal ignoring case, or when either is the generic type.
    pub fn type_compatible(&self, other: &EntityNode) -> bool {
        self.is_generic()
            || other.is_generic()
            || self.entity_type.eq_ignore_ascii_case(&other.entity_type)
    }

    pub fn add_episode(&mut self, episode: Uuid) {
        if !self.episodes.contains(&episode) {
            self.episodes.push(episode);
        }
    }

    /// Fold a duplicate into this canonical node. Identity and `created_at` are kept.
    pub fn absorb(&mut self, dup: &EntityNode, now: DateTime<Utc>) {
        self.merge_summary(&dup.summary);
        for (key, value) in &dup.attributes {
            self.attributes.entry(key.clone()).or_insert_with(|| value.clone());
        }
        for ep in &dup.episodes {
            self.add_episode(*ep);
        }
        if self.is_generic() && !dup.is_generic() {
            self.entity_type = dup.entity_type.clone();
        }
        if self.embedding.is_none() {
            self.embedding = dup.embedding.clone();
        }
        for alias in std::iter::once(&dup.uuid).chain(&dup.merged_uuids) {
            if *alias != self.uuid && !self.merged_uuids.contains(alias) {
                self.merged_uuids.push(*alias);
            }
        }
        self.updated_at = now;
    }

    /// Union of summaries: new text is appended unless already present.
    pub fn merge_summary(&mut self, other: &str) {
        let other = other.trim();
        if other.is_empty() || self.summary.contains(other) {
            return;
        }
        if self.summary.trim().is_empty() {
            self.summary = other.to_string();
        } else {
            self.summary.push(' ');
            self.summary.push_str(other);
        }
    }
}

/// A cluster of related entities with a generated summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityNode {
    pub uuid: Uuid,
    pub name: String,
    pub group_id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub valid_from: DateTime<Utc>,
    pub member_count: usize,
}

/// Origin of raw facts promoted into the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceNode {
    pub uuid: Uuid,
    pub name: String,
    pub group_id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub valid_from: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
}

/// Any node stored in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "label", rename_all = "lowercase")]
pub enum Node {
    Entity(EntityNode),
    Episodic(EpisodicNode),
    Community(CommunityNode),
    Source(SourceNode),
}

macro_rules! common_field {
    ($self:ident, $field:ident) => {
        match $self {
            Node::Entity(n) => &n.$field,
            Node::Episodic(n) => &n.$field,
            Node::Community(n) => &n.$field,
            Node::Source(n) => &n.$field,
        }
    };
}

impl Node {
    pub fn label(&self) -> NodeLabel {
        match self {
            Node::Entity(_) => NodeLabel::Entity,
            Node::Episodic(_) => NodeLabel::Episodic,
            Node::Community(_) => NodeLabel::Community,
            Node::Source(_) => NodeLabel::Source,
        }
    }

    pub fn uuid(&self) -> Uuid {
        *common_field!(self, uuid)
    }

    pub fn name(&self) -> &str {
        common_field!(self, name)
    }

    pub fn group_id(&self) -> &str {
        common_field!(self, group_id)
    }

    pub fn summary(&self) -> &str {
        common_field!(self, summary)
    }

    pub fn embedding(&self) -> Option<&[f32]> {
        common_field!(self, embedding).as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        *common_field!(self, created_at)
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        *common_field!(self, updated_at)
    }

    pub fn valid_from(&self) -> DateTime<Utc> {
        *common_field!(self, valid_from)
    }

    /// Detach the embedding, leaving `None` in its place.
    pub fn take_embedding(&mut self) -> Option<Vec<f32>> {
        match self {
            Node::Entity(n) => n.embedding.take(),
            Node::Episodic(n) => n.embedding.take(),
            Node::Community(n) => n.embedding.take(),
            Node::Source(n) => n.embedding.take(),
        }
    }

    pub fn set_embedding(&mut self, embedding: Option<Vec<f32>>) {
        match self {
            Node::Entity(n) => n.embedding = embedding,
            Node::Episodic(n) => n.embedding = embedding,
            Node::Community(n) => n.embedding = embedding,
            Node::Source(n) => n.embedding = embedding,
        }
    }

    /// Entity type for entities, `None` otherwise.
    pub fn entity_type(&self) -> Option<&str> {
        match self {
            Node::Entity(n) => Some(&n.entity_type),
            _ => None,
        }
    }

    /// Full text for episodes, empty otherwise.
    pub fn content(&self) -> &str {
        match self {
            Node::Episodic(n) => &n.content,
            _ => "",
        }
    }

    pub fn as_entity(&self) -> Option<&EntityNode> {
        match self {
            Node::Entity(n) => Some(n),
            _ => None,
        }
    }

    pub fn into_entity(self) -> Option<EntityNode> {
        match self {
            Node::Entity(n) => Some(n),
            _ => None,
        }
    }

    pub fn into_episode(self) -> Option<EpisodicNode> {
        match self {
            Node::Episodic(n) => Some(n),
            _ => None,
        }
    }

    pub fn into_community(self) -> Option<CommunityNode> {
        match self {
            Node::Community(n) => Some(n),
            _ => None,
        }
    }
}

impl From<EntityNode> for Node {
    fn from(n: EntityNode) -> Self {
        Node::Entity(n)
    }
}

impl From<EpisodicNode> for Node {
    fn from(n: EpisodicNode) -> Self {
        Node::Episodic(n)
    }
}

impl From<CommunityNode> for Node {
    fn from(n: CommunityNode) -> Self {
        Node::Community(n)
    }
}

impl From<SourceNode> for Node {
    fn from(n: SourceNode) -> Self {
        Node::Source(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_compatibility() {
        let now = Utc::now();
        let person = EntityNode::new("Alice", "Person", "g", now);
        let person_lower = EntityNode::new("Alice", "person", "g", now);
        let generic = EntityNode::new("Alice", "", "g", now);
        let org = EntityNode::new("Acme", "Organization", "g", now);

        assert_eq!(generic.entity_type, DEFAULT_ENTITY_TYPE);
        assert!(person.type_compatible(&person_lower));
        assert!(person.type_compatible(&generic));
        assert!(generic.type_compatible(&org));
        assert!(!person.type_compatible(&org));
    }

    #[test]
    fn test_absorb_merges_without_overwriting() {
        let now = Utc::now();
        let mut canonical = EntityNode::new("Alice", "Entity", "g", now);
        canonical.summary = "Engineer.".to_string();
        canonical.attributes.insert("role".into(), "engineer".into());

        let mut dup = EntityNode::new("alice", "Person", "g", now);
        dup.summary = "Works on the API.".to_string();
        dup.attributes.insert("role".into(), "manager".into());
        dup.attributes.insert("team".into(), "platform".into());
        let ep = Uuid::new_v4();
        dup.episodes.push(ep);

        let id = canonical.uuid;
        canonical.absorb(&dup, now);
        assert_eq!(canonical.uuid, id);
        assert_eq!(canonical.name, "Alice");
        assert_eq!(canonical.summary, "Engineer. Works on the API.");
        assert_eq!(canonical.attributes["role"], "engineer");
        assert_eq!(canonical.attributes["team"], "platform");
        assert_eq!(canonical.episodes, vec![ep]);
        assert_eq!(canonical.entity_type, "Person");

        assert_eq!(canonical.merged_uuids, vec![dup.uuid]);

        // Absorbing the same summary twice does not duplicate it
        canonical.absorb(&dup, now);
        assert_eq!(canonical.summary, "Engineer. Works on the API.");
        assert_eq!(canonical.merged_uuids, vec![dup.uuid]);
    }

    #[test]
    fn test_node_serde_tagged() {
        let node = Node::from(EntityNode::new("Alice", "Person", "g", Utc::now()));
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["label"], "entity");
        let back: Node = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
        assert_eq!(back.label(), NodeLabel::Entity);
        assert_eq!(back.entity_type(), Some("Person"));
    }
}

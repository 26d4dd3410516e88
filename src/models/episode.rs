//! Episodes: raw temporal input and the Episodic node derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Shape of the episode's content; guides extraction prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeType {
    /// A chat turn, usually `speaker: text`.
    Message,
    /// Free-form prose.
    #[default]
    Text,
    /// A JSON document.
    Json,
}

impl EpisodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeType::Message => "message",
            EpisodeType::Text => "text",
            EpisodeType::Json => "json",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(EpisodeType::Message),
            "text" => Some(EpisodeType::Text),
            "json" => Some(EpisodeType::Json),
            _ => None,
        }
    }
}

/// An episode as submitted for ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeInput {
    /// Caller-chosen identity; a fresh v4 UUID is assigned when absent.
    #[serde(default)]
    pub uuid: Option<Uuid>,
    #[serde(default)]
    pub name: String,
    pub content: String,
    pub group_id: String,
    /// When the episode is anchored in real-world time.
    pub reference_time: DateTime<Utc>,
    #[serde(default)]
    pub source: EpisodeType,
    #[serde(default)]
    pub source_description: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl EpisodeInput {
    pub fn new(
        name: impl Into<String>,
        content: impl Into<String>,
        group_id: impl Into<String>,
        reference_time: DateTime<Utc>,
    ) -> Self {
        Self {
            uuid: None,
            name: name.into(),
            content: content.into(),
            group_id: group_id.into(),
            reference_time,
            source: EpisodeType::Text,
            source_description: String::new(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn with_source(mut self, source: EpisodeType, description: impl Into<String>) -> Self {
        self.source = source;
        self.source_description = description.into();
        self
    }

    /// Build the Episodic node this input becomes, stamped with transaction time `now`.
    pub fn into_node(self, now: DateTime<Utc>) -> EpisodicNode {
        let uuid = self.uuid.unwrap_or_else(Uuid::new_v4);
        let name = if self.name.trim().is_empty() {
            format!("episode-{}", &uuid.to_string()[..8])
        } else {
            self.name
        };
        EpisodicNode {
            uuid,
            name,
            group_id: self.group_id,
            summary: String::new(),
            embedding: None,
            created_at: now,
            updated_at: now,
            valid_from: self.reference_time,
            content_hash: content_hash(&self.content),
            content: self.content,
            episode_type: self.source,
            source_description: self.source_description,
            metadata: self.metadata,
            entity_edges: Vec::new(),
        }
    }
}

/// A stored episode. `valid_from` is the episode's reference time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicNode {
    pub uuid: Uuid,
    pub name: String,
    pub group_id: String,
    pub summary: String,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub valid_from: DateTime<Utc>,
    pub content: String,
    pub content_hash: String,
    pub episode_type: EpisodeType,
    pub source_description: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Fact edges this episode produced or reasserted.
    pub entity_edges: Vec<Uuid>,
}

impl EpisodicNode {
    pub fn reference_time(&self) -> DateTime<Utc> {
        self.valid_from
    }

    /// Append text produced by a later `add_to_episode` call.
    pub fn append_content(&mut self, more: &str, now: DateTime<Utc>) {
        if !self.content.is_empty() && !more.is_empty() {
            self.content.push_str("\n\n");
        }
        self.content.push_str(more);
        self.content_hash = content_hash(&self.content);
        self.updated_at = now;
    }

    pub fn add_entity_edges(&mut self, edges: impl IntoIterator<Item = Uuid>) {
        for uuid in edges {
            if !self.entity_edges.contains(&uuid) {
                self.entity_edges.push(uuid);
            }
        }
    }
}

/// SHA-256 hex digest of episode content.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

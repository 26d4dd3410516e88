//! Extraction adapter: prompts the language model and turns its answers into typed
//! candidates.

pub mod adapter;
pub mod prompts;

use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::{EdgeTypeSpec, EntityTypeSpec};
use crate::error::Result;
use crate::llm::{LlmClient, LlmRequest, PromptKind};
use crate::models::{normalize_text, relation_class, Edge, EntityNode, EpisodicNode, DEFAULT_ENTITY_TYPE};
use crate::resolve::relationship::Classification;

pub use adapter::{parse_entities, parse_hydrations, parse_relationships, Attempt};

/// Interchange format requested from the model. Parsing accepts either regardless.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Tabular,
    Json,
}

/// An entity mention as the model reported it.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateEntity {
    pub name: String,
    /// Empty when the model gave no type.
    pub entity_type: String,
}

/// A fact between two named entities as the model reported it.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRelationship {
    pub source: String,
    pub target: String,
    pub relation: String,
    pub fact: String,
    pub strength: Option<f32>,
    pub valid_at: Option<chrono::DateTime<chrono::Utc>>,
    pub invalid_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Summary and attributes for one entity, from the hydration pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Hydration {
    pub name: String,
    pub summary: String,
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommunitySummary {
    pub name: String,
    pub summary: String,
}

/// Drives the language model for every extraction-side task.
#[derive(Clone)]
pub struct Extractor {
    llm: Arc<dyn LlmClient>,
    format: ResponseFormat,
    entity_types: Vec<EntityTypeSpec>,
    edge_types: Vec<EdgeTypeSpec>,
}

impl Extractor {
    pub fn new(llm: Arc<dyn LlmClient>, format: ResponseFormat) -> Self {
        Self {
            llm,
            format,
            entity_types: Vec::new(),
            edge_types: Vec::new(),
        }
    }

    pub fn with_entity_types(mut self, entity_types: Vec<EntityTypeSpec>) -> Self {
        self.entity_types = entity_types;
        self
    }

    pub fn with_edge_types(mut self, edge_types: Vec<EdgeTypeSpec>) -> Self {
        self.edge_types = edge_types;
        self
    }

    pub fn format(&self) -> ResponseFormat {
        self.format
    }

    pub fn edge_types(&self) -> &[EdgeTypeSpec] {
        &self.edge_types
    }

    async fn call(&self, kind: PromptKind, messages: Vec<crate::llm::Message>) -> Result<String> {
        let start = std::time::Instant::now();
        let response = self.llm.generate(&LlmRequest::new(kind, messages)).await?;
        log::debug!("{} call took {:?} ({} chars)", kind, start.elapsed(), response.len());
        Ok(response)
    }

    /// Entities mentioned in one chunk, deduplicated by normalized name.
    pub async fn extract_entities(
        &self,
        chunk: &str,
        episode: &EpisodicNode,
        previous: &[EpisodicNode],
    ) -> Result<Vec<CandidateEntity>> {
        let messages = prompts::extract_entities(chunk, episode, previous, &self.entity_types, self.format);
        let raw = self.call(PromptKind::ExtractEntities, messages).await?;

        let mut seen = HashSet::new();
        let entities = parse_entities(&raw, self.format)?
            .into_iter()
            .filter(|c| !c.name.trim().is_empty())
            .filter(|c| seen.insert(normalize_text(&c.name)))
            .map(|c| CandidateEntity {
                name: c.name.trim().to_string(),
                entity_type: self.canonical_entity_type(&c.entity_type),
            })
            .collect();
        Ok(entities)
    }

    /// Facts between the given entities stated in one chunk.
    ///
    /// Facts naming an entity outside `entities` are dropped, as are facts violating a
    /// declared edge type's endpoint types.
    pub async fn extract_relationships(
        &self,
        chunk: &str,
        episode: &EpisodicNode,
        entities: &[EntityNode],
        previous: &[EpisodicNode],
    ) -> Result<Vec<CandidateRelationship>> {
        if entities.len() < 2 {
            return Ok(Vec::new());
        }
        let messages =
            prompts::extract_relationships(chunk, episode, entities, previous, &self.edge_types, self.format);
        let raw = self.call(PromptKind::ExtractRelationships, messages).await?;

        let find = |name: &str| {
            let key = normalize_text(name);
            entities.iter().find(|e| normalize_text(&e.name) == key)
        };

        let mut kept = Vec::new();
        for rel in parse_relationships(&raw, self.format)? {
            let (Some(source), Some(target)) = (find(&rel.source), find(&rel.target)) else {
                log::debug!("Dropping fact with unknown endpoint: {} -> {}", rel.source, rel.target);
                continue;
            };
            if !self.admits_relation(&rel.relation, &source.entity_type, &target.entity_type) {
                log::debug!(
                    "Dropping {} between {} and {}: endpoint types not allowed",
                    rel.relation,
                    source.entity_type,
                    target.entity_type
                );
                continue;
            }
            kept.push(rel);
        }
        Ok(kept)
    }

    /// Summaries and attributes for the entities seen in one chunk.
    pub async fn hydrate(&self, chunk: &str, entities: &[EntityNode]) -> Result<Vec<Hydration>> {
        if entities.is_empty() {
            return Ok(Vec::new());
        }
        let messages = prompts::hydrate_attributes(chunk, entities, self.format);
        let raw = self.call(PromptKind::HydrateAttributes, messages).await?;
        parse_hydrations(&raw, self.format)
    }

    pub async fn summarize_community(&self, members: &[EntityNode]) -> Result<CommunitySummary> {
        let raw = self
            .call(PromptKind::SummarizeCommunity, prompts::summarize_community(members))
            .await?;
        Ok(parse_community_summary(&raw, members))
    }

    /// Ask the model how `candidate` relates to `existing`.
    pub async fn judge(&self, existing: &Edge, candidate: &Edge) -> Result<Classification> {
        let raw = self
            .call(PromptKind::JudgeContradiction, prompts::judge_contradiction(existing, candidate))
            .await?;
        Ok(parse_classification(&raw))
    }

    /// With declared entity types, unknown types collapse to the generic type and known
    /// ones take their declared spelling.
    fn canonical_entity_type(&self, raw: &str) -> String {
        let raw = raw.trim();
        if raw.is_empty() {
            return DEFAULT_ENTITY_TYPE.to_string();
        }
        if self.entity_types.is_empty() {
            return raw.to_string();
        }
        self.entity_types
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(raw))
            .map(|t| t.name.clone())
            .unwrap_or_else(|| DEFAULT_ENTITY_TYPE.to_string())
    }

    /// Whether a declared edge type allows these endpoint types. Undeclared relations pass.
    pub fn admits_relation(&self, relation: &str, source_type: &str, target_type: &str) -> bool {
        let class = relation_class(relation);
        let Some(spec) = self.edge_types.iter().find(|t| relation_class(&t.name) == class) else {
            return true;
        };
        let allowed = |types: &[String], actual: &str| {
            types.is_empty()
                || types.iter().any(|t| {
                    t.eq_ignore_ascii_case(actual) || t.eq_ignore_ascii_case(DEFAULT_ENTITY_TYPE)
                })
        };
        allowed(&spec.source_types, source_type) && allowed(&spec.target_types, target_type)
    }
}

fn parse_community_summary(raw: &str, members: &[EntityNode]) -> CommunitySummary {
    #[derive(Deserialize)]
    struct Answer {
        #[serde(default)]
        name: String,
        #[serde(default)]
        summary: String,
    }

    let fallback_name = || {
        let names: Vec<&str> = members.iter().take(3).map(|m| m.name.as_str()).collect();
        names.join(", ")
    };

    let json = raw.find('{').zip(raw.rfind('}')).filter(|(s, e)| s < e).map(|(s, e)| &raw[s..=e]);
    if let Some(Ok(answer)) = json.map(serde_json::from_str::<Answer>) {
        let name = if answer.name.trim().is_empty() { fallback_name() } else { answer.name.trim().to_string() };
        return CommunitySummary { name, summary: answer.summary.trim().to_string() };
    }

    let mut lines = raw.lines().map(str::trim).filter(|l| !l.is_empty());
    let name = lines
        .next()
        .map(|l| l.trim_start_matches('#').trim_start_matches("Name:").trim().to_string())
        .filter(|l| !l.is_empty())
        .unwrap_or_else(fallback_name);
    let summary: Vec<&str> = lines.collect();
    CommunitySummary {
        name,
        summary: summary.join(" ").trim_start_matches("Summary:").trim().to_string(),
    }
}

fn parse_classification(raw: &str) -> Classification {
    let answer = raw.to_lowercase();
    if answer.contains("restatement") || answer.contains("duplicate") {
        Classification::Restatement
    } else if answer.contains("contradict") {
        Classification::Contradiction
    } else {
        Classification::Compatible
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    struct Canned(Mutex<Vec<String>>);

    #[async_trait]
    impl LlmClient for Canned {
        async fn generate(&self, _request: &LlmRequest) -> Result<String> {
            Ok(self.0.lock().unwrap().remove(0))
        }
    }

    fn extractor(answers: &[&str]) -> Extractor {
        let llm = Canned(Mutex::new(answers.iter().map(|s| s.to_string()).collect()));
        Extractor::new(Arc::new(llm), ResponseFormat::Tabular)
    }

    fn episode() -> EpisodicNode {
        let now = Utc::now();
        crate::models::EpisodeInput::new("e", "Alice leads the API redesign.", "g1", now).into_node(now)
    }

    #[tokio::test]
    async fn test_extract_entities_dedupes_and_types() {
        let ex = extractor(&["name | entity_type\nAlice | Person\nalice | Person\nAPI redesign |"])
            .with_entity_types(vec![EntityTypeSpec { name: "Person".into(), description: String::new() }]);
        let entities = ex.extract_entities("Alice leads the API redesign.", &episode(), &[]).await.unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].entity_type, "Person");
        assert_eq!(entities[1].entity_type, DEFAULT_ENTITY_TYPE);
    }

    #[tokio::test]
    async fn test_extract_relationships_drops_unknown_endpoints() {
        let ex = extractor(&["Alice | LEADS | API redesign\nBob | KNOWS | Alice"]);
        let now = Utc::now();
        let entities = vec![
            EntityNode::new("Alice", "Person", "g1", now),
            EntityNode::new("API Redesign", "Project", "g1", now),
        ];
        let rels = ex.extract_relationships("x", &episode(), &entities, &[]).await.unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].relation, "LEADS");
    }

    #[test]
    fn test_admits_relation() {
        let ex = extractor(&[]).with_edge_types(vec![EdgeTypeSpec {
            name: "WORKS_AT".into(),
            description: String::new(),
            exclusive: true,
            source_types: vec!["Person".into()],
            target_types: vec!["Organization".into()],
        }]);
        assert!(ex.admits_relation("works at", "Person", "Organization"));
        assert!(!ex.admits_relation("WORKS_AT", "Organization", "Organization"));
        assert!(ex.admits_relation("KNOWS", "Organization", "Organization"));
    }

    #[test]
    fn test_parse_community_summary() {
        let now = Utc::now();
        let members = vec![EntityNode::new("Alice", "Person", "g", now)];
        let s = parse_community_summary(r#"{"name": "API team", "summary": "Works on the API."}"#, &members);
        assert_eq!(s.name, "API team");
        let s = parse_community_summary("", &members);
        assert_eq!(s.name, "Alice");
    }

    #[test]
    fn test_parse_classification() {
        assert_eq!(parse_classification("RESTATEMENT"), Classification::Restatement);
        assert_eq!(parse_classification("This is a contradiction."), Classification::Contradiction);
        assert_eq!(parse_classification("COMPATIBLE"), Classification::Compatible);
    }
}

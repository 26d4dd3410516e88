//! Resolution: folding extracted candidates into the canonical graph.
//!
//! [`ResolutionStrategy`] bundles the three resolution operations. [`DefaultStrategy`]
//! wires the built-in resolvers to a store, an embedder and the extractor.

pub mod community;
pub mod entity;
pub mod harness;
pub mod relationship;
pub mod uuid_map;

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use crate::embeddings::Embedder;
use crate::error::Result;
use crate::extraction::Extractor;
use crate::models::{Edge, EntityNode, EpisodicNode};
use crate::store::GraphStore;

pub use community::CommunityReport;
pub use entity::{identity_entities, resolve_entities, DedupeResult, DedupeStats};
pub use harness::{validate_strategy, StrategyCheck, StrategyReport};
pub use relationship::{
    identity_relationships, resolve_relationships, Classification, ContradictionPolicy, LlmContradictionPolicy,
    RelationClassPolicy, RelationshipResolution, RelationshipStats,
};
pub use uuid_map::{UuidMap, UuidMapBuilder};

/// What the pipeline does when a strategy operation fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyErrorPolicy {
    /// Abort with the strategy error.
    #[default]
    Fail,
    /// Retry the operation with [`DefaultStrategy`].
    Fallback,
    /// Continue with an identity mapping and record the skip in the result.
    Skip,
}

impl StrategyErrorPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyErrorPolicy::Fail => "fail",
            StrategyErrorPolicy::Fallback => "fallback",
            StrategyErrorPolicy::Skip => "skip",
        }
    }
}

/// The three resolution operations the pipeline delegates.
#[async_trait]
pub trait ResolutionStrategy: Send + Sync {
    /// Deduplicate per-chunk candidates against `context` (existing canonical entities).
    async fn resolve_entities(
        &self,
        candidates: Vec<Vec<EntityNode>>,
        context: Vec<EntityNode>,
    ) -> Result<DedupeResult>;

    /// Resolve candidate facts against live facts, closing contradicted ones.
    async fn resolve_relationships(
        &self,
        candidates: Vec<Edge>,
        uuid_map: &UuidMap,
        canonical_nodes: &[EntityNode],
        episode: &EpisodicNode,
    ) -> Result<RelationshipResolution>;

    /// Assign the group's entities to communities and persist them.
    async fn build_communities(&self, group_id: &str, rebuild: bool) -> Result<CommunityReport>;
}

/// Built-in resolution: embedding dedupe, bi-temporal fact resolution and label
/// propagation.
#[derive(Clone)]
pub struct DefaultStrategy {
    store: Arc<dyn GraphStore>,
    embedder: Arc<dyn Embedder>,
    extractor: Extractor,
    policy: Arc<dyn ContradictionPolicy>,
    dedupe_threshold: f32,
    max_iterations: usize,
}

impl DefaultStrategy {
    pub fn new(store: Arc<dyn GraphStore>, embedder: Arc<dyn Embedder>, extractor: Extractor) -> Self {
        Self {
            store,
            embedder,
            extractor,
            policy: Arc::new(RelationClassPolicy::default()),
            dedupe_threshold: 0.85,
            max_iterations: 20,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn ContradictionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_dedupe_threshold(mut self, threshold: f32) -> Self {
        self.dedupe_threshold = threshold;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }
}

#[async_trait]
impl ResolutionStrategy for DefaultStrategy {
    async fn resolve_entities(
        &self,
        candidates: Vec<Vec<EntityNode>>,
        context: Vec<EntityNode>,
    ) -> Result<DedupeResult> {
        Ok(entity::resolve_entities(candidates, context, self.dedupe_threshold))
    }

    async fn resolve_relationships(
        &self,
        candidates: Vec<Edge>,
        uuid_map: &UuidMap,
        canonical_nodes: &[EntityNode],
        episode: &EpisodicNode,
    ) -> Result<RelationshipResolution> {
        relationship::resolve_relationships(
            self.store.as_ref(),
            self.policy.as_ref(),
            candidates,
            uuid_map,
            canonical_nodes,
            episode,
        )
        .await
    }

    async fn build_communities(&self, group_id: &str, rebuild: bool) -> Result<CommunityReport> {
        community::build_communities(
            self.store.as_ref(),
            self.embedder.as_ref(),
            &self.extractor,
            group_id,
            rebuild,
            self.max_iterations,
        )
        .await
    }
}

//! Hybrid retrieval over the graph.
//!
//! Each result kind (facts, entities, episodes, communities) is searched with one or more
//! methods: cosine similarity, FTS5 keyword matching and breadth-first traversal. The
//! per-method lists are fused (RRF or MMR), optionally reranked, filtered by `min_score`
//! and truncated.

pub mod fusion;
pub mod hybrid;
pub mod keyword;
pub mod rerank;

use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::SearchDefaults;
use crate::models::{CommunityNode, Edge, EntityNode, EpisodicNode};
use crate::store::TemporalFilter;

pub use fusion::{mmr, rrf, RRF_K};
pub use hybrid::SearchEngine;
pub use rerank::CrossEncoder;

/// Retrieval method for one result kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMethod {
    CosineSimilarity,
    Keyword,
    BreadthFirst,
}

/// How per-method ranked lists are combined.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fusion {
    /// Reciprocal Rank Fusion, k = 60.
    Rrf,
    /// Maximal Marginal Relevance over the RRF relevance.
    Mmr { lambda: f32 },
}

/// Reranking pass applied after fusion, in order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PostRerank {
    CrossEncoder,
    /// Graph distance from `center`; closer is better.
    NodeDistance { center: Uuid },
    /// Episode-mention frequency; more is better.
    EpisodeMentions,
}

/// Search settings for one result kind.
#[derive(Debug, Clone, PartialEq)]
pub struct KindSearch {
    pub methods: Vec<SearchMethod>,
    pub fusion: Fusion,
    pub rerankers: Vec<PostRerank>,
}

pub type EdgeSearch = KindSearch;
pub type NodeSearch = KindSearch;
pub type EpisodeSearch = KindSearch;
pub type CommunitySearch = KindSearch;

impl KindSearch {
    pub fn new(methods: Vec<SearchMethod>) -> Self {
        Self { methods, fusion: Fusion::Rrf, rerankers: Vec::new() }
    }

    /// Cosine plus keyword, fused with RRF.
    pub fn hybrid() -> Self {
        Self::new(vec![SearchMethod::CosineSimilarity, SearchMethod::Keyword])
    }

    pub fn with_fusion(mut self, fusion: Fusion) -> Self {
        self.fusion = fusion;
        self
    }

    pub fn with_reranker(mut self, reranker: PostRerank) -> Self {
        self.rerankers.push(reranker);
        self
    }
}

/// What to search and how. A kind left as `None` is not searched.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    pub edges: Option<EdgeSearch>,
    pub nodes: Option<NodeSearch>,
    pub episodes: Option<EpisodeSearch>,
    pub communities: Option<CommunitySearch>,
    pub limit: usize,
    pub min_score: f32,
    pub bfs_max_depth: usize,
    /// Explicit traversal origins. When empty, traversal starts from the other methods' hits.
    pub bfs_origins: Vec<Uuid>,
    pub filter: TemporalFilter,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self::from_defaults(&SearchDefaults::default())
    }
}

impl SearchConfig {
    /// Hybrid search over every kind, tuned by the `[search]` config section.
    pub fn from_defaults(defaults: &SearchDefaults) -> Self {
        Self {
            edges: Some(KindSearch::hybrid()),
            nodes: Some(KindSearch::hybrid()),
            episodes: Some(KindSearch::hybrid()),
            communities: Some(KindSearch::hybrid()),
            limit: defaults.default_limit,
            min_score: defaults.min_score,
            bfs_max_depth: defaults.bfs_max_depth,
            bfs_origins: Vec::new(),
            filter: TemporalFilter::default(),
        }
    }

    /// Only facts, with the given settings.
    pub fn edges_only(edges: EdgeSearch) -> Self {
        Self { edges: Some(edges), nodes: None, episodes: None, communities: None, ..Self::default() }
    }

    /// Only entities, with the given settings.
    pub fn nodes_only(nodes: NodeSearch) -> Self {
        Self { edges: None, nodes: Some(nodes), episodes: None, communities: None, ..Self::default() }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn with_filter(mut self, filter: TemporalFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_origins(mut self, origins: Vec<Uuid>) -> Self {
        self.bfs_origins = origins;
        self
    }

    /// Per-method fetch size.
    pub fn fetch_limit(&self) -> usize {
        self.limit.saturating_mul(2).max(1)
    }

    pub(crate) fn kinds(&self) -> impl Iterator<Item = &KindSearch> {
        [&self.edges, &self.nodes, &self.episodes, &self.communities].into_iter().flatten()
    }
}

/// A search hit with its final score and 1-based rank.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scored<T> {
    pub item: T,
    pub score: f32,
    pub rank: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResults {
    pub edges: Vec<Scored<Edge>>,
    pub nodes: Vec<Scored<EntityNode>>,
    pub episodes: Vec<Scored<EpisodicNode>>,
    pub communities: Vec<Scored<CommunityNode>>,
}

impl SearchResults {
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty() && self.nodes.is_empty() && self.episodes.is_empty() && self.communities.is_empty()
    }
}

/// What fusion and reranking need to know about a result.
pub trait SearchItem: Clone + Send + Sync + 'static {
    fn uuid(&self) -> Uuid;

    fn embedding(&self) -> Option<&[f32]>;

    /// Text a cross-encoder scores against the query.
    fn passage(&self) -> String;

    /// Graph nodes the item sits on, for distance reranking and traversal seeding.
    fn anchors(&self) -> Vec<Uuid>;

    /// How often the item is backed by episodes. `counts` holds per-entity mention counts.
    fn mention_count(&self, counts: &HashMap<Uuid, usize>) -> usize;
}

impl SearchItem for Edge {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn embedding(&self) -> Option<&[f32]> {
        self.fact_embedding.as_deref()
    }

    fn passage(&self) -> String {
        self.fact.clone()
    }

    fn anchors(&self) -> Vec<Uuid> {
        vec![self.source_node_uuid, self.target_node_uuid]
    }

    fn mention_count(&self, _counts: &HashMap<Uuid, usize>) -> usize {
        self.episodes.len()
    }
}

impl SearchItem for EntityNode {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn embedding(&self) -> Option<&[f32]> {
        self.embedding.as_deref()
    }

    fn passage(&self) -> String {
        if self.summary.is_empty() {
            self.name.clone()
        } else {
            format!("{}: {}", self.name, self.summary)
        }
    }

    fn anchors(&self) -> Vec<Uuid> {
        vec![self.uuid]
    }

    fn mention_count(&self, counts: &HashMap<Uuid, usize>) -> usize {
        counts.get(&self.uuid).copied().unwrap_or(0)
    }
}

impl SearchItem for EpisodicNode {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn embedding(&self) -> Option<&[f32]> {
        self.embedding.as_deref()
    }

    fn passage(&self) -> String {
        self.content.clone()
    }

    fn anchors(&self) -> Vec<Uuid> {
        vec![self.uuid]
    }

    fn mention_count(&self, _counts: &HashMap<Uuid, usize>) -> usize {
        self.entity_edges.len()
    }
}

impl SearchItem for CommunityNode {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn embedding(&self) -> Option<&[f32]> {
        self.embedding.as_deref()
    }

    fn passage(&self) -> String {
        format!("{}: {}", self.name, self.summary)
    }

    fn anchors(&self) -> Vec<Uuid> {
        Vec::new()
    }

    fn mention_count(&self, _counts: &HashMap<Uuid, usize>) -> usize {
        self.member_count
    }
}

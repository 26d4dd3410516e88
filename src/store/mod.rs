//! Graph store collaborator.
//!
//! The pipeline and search engine only talk to [`GraphStore`]; [`SqliteGraphStore`] is the
//! embedded implementation.

pub mod raw;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Edge, EdgeKind, EntityNode, EpisodicNode, Node, NodeLabel};

pub use raw::{RawFactStore, RawFacts, SqliteRawFactStore};
pub use sqlite::SqliteGraphStore;

/// Outcome of a bulk write: records that failed are reported, not fatal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkReport {
    pub succeeded: usize,
    pub failures: Vec<RecordFailure>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordFailure {
    pub uuid: Uuid,
    pub error: String,
}

impl BulkReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: BulkReport) {
        self.succeeded += other.succeeded;
        self.failures.extend(other.failures);
    }
}

/// Which facts a read may see.
///
/// With `as_of` set, only facts valid at that instant are returned (whether or not they
/// were closed later). Otherwise closed facts are hidden unless `include_invalidated`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TemporalFilter {
    pub include_invalidated: bool,
    pub as_of: Option<DateTime<Utc>>,
}

impl TemporalFilter {
    pub fn live() -> Self {
        Self::default()
    }

    pub fn admits(&self, edge: &Edge) -> bool {
        match self.as_of {
            Some(t) => edge.valid_as_of(t),
            None => self.include_invalidated || edge.is_live(),
        }
    }
}

/// Nodes and edges reached by a bounded breadth-first walk.
#[derive(Debug, Clone, Default)]
pub struct Traversal {
    /// Reached node, hop distance from the nearest origin. Origins are depth 0.
    pub nodes: Vec<(Uuid, usize)>,
    /// Traversed edge, depth of the hop that crossed it (1-based).
    pub edges: Vec<(Edge, usize)>,
}

/// Counts for one group, or the whole store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphStats {
    pub entities: usize,
    pub episodes: usize,
    pub communities: usize,
    pub sources: usize,
    pub live_facts: usize,
    pub invalidated_facts: usize,
    pub mentions: usize,
    pub memberships: usize,
}

/// Persistence contract for the knowledge graph.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert_node(&self, node: &Node) -> Result<()>;

    /// Write many nodes; a failing record is logged and reported, the rest still land.
    async fn upsert_nodes(&self, nodes: &[Node]) -> Result<BulkReport>;

    async fn get_node(&self, uuid: Uuid) -> Result<Option<Node>>;

    /// Fetch the nodes that exist among `uuids`, in no particular order.
    async fn get_nodes(&self, uuids: &[Uuid]) -> Result<Vec<Node>>;

    /// Delete a node and every edge touching it. Returns whether the node existed.
    async fn delete_node(&self, uuid: Uuid) -> Result<bool>;

    async fn upsert_edge(&self, edge: &Edge) -> Result<()>;

    async fn upsert_edges(&self, edges: &[Edge]) -> Result<BulkReport>;

    async fn get_edge(&self, uuid: Uuid) -> Result<Option<Edge>>;

    async fn get_edges(&self, uuids: &[Uuid]) -> Result<Vec<Edge>>;

    async fn delete_edge(&self, uuid: Uuid) -> Result<bool>;

    /// Every entity node in the group.
    async fn entity_nodes(&self, group_id: &str) -> Result<Vec<EntityNode>>;

    /// Live `RelatesTo` edges from `source` to `target` (ordered pair).
    async fn live_edges_between(&self, source: Uuid, target: Uuid) -> Result<Vec<Edge>>;

    /// Edges of `kind` in the group admitted by `filter`.
    async fn edges_of_kind(&self, group_id: &str, kind: EdgeKind, filter: TemporalFilter) -> Result<Vec<Edge>>;

    /// Edges touching `node` in either direction, optionally restricted to one kind.
    async fn edges_for_node(&self, node: Uuid, kind: Option<EdgeKind>) -> Result<Vec<Edge>>;

    /// Edges whose provenance lists `episode`.
    async fn edges_with_episode(&self, group_id: &str, episode: Uuid) -> Result<Vec<Edge>>;

    /// Entity nodes whose provenance lists `episode`.
    async fn entities_with_episode(&self, group_id: &str, episode: Uuid) -> Result<Vec<EntityNode>>;

    /// The most recent episodes with `valid_from <= before`, newest first.
    async fn recent_episodes(&self, group_id: &str, before: DateTime<Utc>, limit: usize) -> Result<Vec<EpisodicNode>>;

    /// `RelatesTo` edges whose `valid_at` lies in `[from, to)`.
    async fn edges_in_range(&self, group_id: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Edge>>;

    /// Nodes of `label` ranked by cosine similarity of their embedding to `query`.
    async fn vector_search_nodes(
        &self,
        group_id: &str,
        label: NodeLabel,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(Node, f32)>>;

    /// `RelatesTo` edges ranked by cosine similarity of their fact embedding to `query`.
    async fn vector_search_edges(
        &self,
        group_id: &str,
        query: &[f32],
        filter: TemporalFilter,
        limit: usize,
    ) -> Result<Vec<(Edge, f32)>>;

    /// Nodes of `label` ranked by BM25 over name, summary and content. Scores are in `[0, 1]`.
    async fn keyword_search_nodes(
        &self,
        group_id: &str,
        label: NodeLabel,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(Node, f32)>>;

    /// `RelatesTo` edges ranked by BM25 over name and fact. Scores are in `[0, 1]`.
    async fn keyword_search_edges(
        &self,
        group_id: &str,
        query: &str,
        filter: TemporalFilter,
        limit: usize,
    ) -> Result<Vec<(Edge, f32)>>;

    /// Breadth-first walk over `RelatesTo` (admitted by `filter`) and `Mentions` edges,
    /// undirected, at most `max_depth` hops from `origins`.
    async fn traverse(
        &self,
        group_id: &str,
        origins: &[Uuid],
        max_depth: usize,
        filter: TemporalFilter,
    ) -> Result<Traversal>;

    /// Number of episodes mentioning each entity.
    async fn mention_counts(&self, entities: &[Uuid]) -> Result<HashMap<Uuid, usize>>;

    /// Entity to community membership for the group.
    async fn community_memberships(&self, group_id: &str) -> Result<HashMap<Uuid, Uuid>>;

    /// Member entity UUIDs of one community.
    async fn community_members(&self, community: Uuid) -> Result<Vec<Uuid>>;

    /// Delete every community node (and membership edge) of the group.
    async fn delete_communities(&self, group_id: &str) -> Result<usize>;

    async fn stats(&self, group_id: Option<&str>) -> Result<GraphStats>;

    /// Remove everything in one group, or in the whole store.
    async fn clear(&self, group_id: Option<&str>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_temporal_filter() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut edge = Edge::relates_to("g", Uuid::new_v4(), Uuid::new_v4(), "LEADS", "x leads y", t0);
        edge.valid_at = Some(t0);
        assert!(TemporalFilter::live().admits(&edge));

        edge.invalidate(t0 + Duration::days(10), t0 + Duration::days(10));
        assert!(!TemporalFilter::live().admits(&edge));
        assert!(TemporalFilter { include_invalidated: true, as_of: None }.admits(&edge));
        assert!(TemporalFilter { include_invalidated: false, as_of: Some(t0 + Duration::days(5)) }.admits(&edge));
        assert!(!TemporalFilter { include_invalidated: true, as_of: Some(t0 + Duration::days(15)) }.admits(&edge));
    }

    #[test]
    fn test_bulk_report_merge() {
        let mut a = BulkReport { succeeded: 2, failures: vec![] };
        a.merge(BulkReport {
            succeeded: 1,
            failures: vec![RecordFailure { uuid: Uuid::nil(), error: "x".into() }],
        });
        assert_eq!(a.succeeded, 3);
        assert!(!a.is_clean());
    }
}

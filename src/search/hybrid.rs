use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use super::fusion::{mmr, rrf};
use super::rerank::{self, CrossEncoder};
use super::{Fusion, KindSearch, PostRerank, Scored, SearchConfig, SearchItem, SearchMethod, SearchResults};
use crate::embeddings::Embedder;
use crate::error::{Result, TempographError};
use crate::models::{CommunityNode, Edge, EdgeKind, EntityNode, EpisodicNode, Node, NodeLabel};
use crate::store::GraphStore;

/// Node-backed result kinds.
trait LabeledItem: SearchItem {
    const LABEL: NodeLabel;

    fn from_node(node: Node) -> Option<Self>;
}

impl LabeledItem for EntityNode {
    const LABEL: NodeLabel = NodeLabel::Entity;

    fn from_node(node: Node) -> Option<Self> {
        node.into_entity()
    }
}

impl LabeledItem for EpisodicNode {
    const LABEL: NodeLabel = NodeLabel::Episodic;

    fn from_node(node: Node) -> Option<Self> {
        node.into_episode()
    }
}

impl LabeledItem for CommunityNode {
    const LABEL: NodeLabel = NodeLabel::Community;

    fn from_node(node: Node) -> Option<Self> {
        node.into_community()
    }
}

fn items<T>(hits: Vec<(T, f32)>) -> Vec<T> {
    hits.into_iter().map(|(item, _)| item).collect()
}

/// Read-only hybrid search over one graph store.
#[derive(Clone)]
pub struct SearchEngine {
    store: Arc<dyn GraphStore>,
    embedder: Arc<dyn Embedder>,
    cross_encoder: Option<Arc<dyn CrossEncoder>>,
}

impl SearchEngine {
    pub fn new(store: Arc<dyn GraphStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder, cross_encoder: None }
    }

    pub fn with_cross_encoder(mut self, encoder: Arc<dyn CrossEncoder>) -> Self {
        self.cross_encoder = Some(encoder);
        self
    }

    /// Search facts, entities, episodes and communities of `group_id` concurrently.
    ///
    /// Each method over-fetches `2 × limit`; `min_score` applies after fusion and
    /// reranking, then each kind is cut to `limit`.
    pub async fn search(&self, query: &str, group_id: &str, config: &SearchConfig) -> Result<SearchResults> {
        let start = Instant::now();
        if query.trim().is_empty() && config.bfs_origins.is_empty() {
            return Err(TempographError::InvalidInput("search query is empty".to_string()));
        }
        if config.limit == 0 {
            return Ok(SearchResults::default());
        }

        let needs_embedding = !query.trim().is_empty()
            && config.kinds().any(|k| k.methods.contains(&SearchMethod::CosineSimilarity));
        let query_embedding = if needs_embedding {
            Some(self.embedder.embed(query).await?)
        } else {
            None
        };
        let embedding = query_embedding.as_deref();

        let (edges, nodes, episodes, communities) = tokio::try_join!(
            self.search_edges(query, embedding, group_id, config),
            self.search_nodes::<EntityNode>(config.nodes.as_ref(), query, embedding, group_id, config),
            self.search_nodes::<EpisodicNode>(config.episodes.as_ref(), query, embedding, group_id, config),
            self.search_nodes::<CommunityNode>(config.communities.as_ref(), query, embedding, group_id, config),
        )?;

        log::debug!(
            "Search '{}' in {}: {} facts, {} entities, {} episodes, {} communities in {:?}",
            query,
            group_id,
            edges.len(),
            nodes.len(),
            episodes.len(),
            communities.len(),
            start.elapsed()
        );
        Ok(SearchResults { edges, nodes, episodes, communities })
    }

    /// Traversal origins: the explicit ones, else the anchors of every hit so far.
    fn origins<T: SearchItem>(config: &SearchConfig, lists: &[Vec<T>]) -> Vec<Uuid> {
        if !config.bfs_origins.is_empty() {
            return config.bfs_origins.clone();
        }
        let mut seen = HashSet::new();
        lists
            .iter()
            .flatten()
            .flat_map(|item| item.anchors())
            .filter(|u| seen.insert(*u))
            .collect()
    }

    async fn search_edges(
        &self,
        query: &str,
        embedding: Option<&[f32]>,
        group_id: &str,
        config: &SearchConfig,
    ) -> Result<Vec<Scored<Edge>>> {
        let Some(kind) = config.edges.as_ref() else {
            return Ok(Vec::new());
        };
        let fetch = config.fetch_limit();
        let mut lists: Vec<Vec<Edge>> = Vec::new();

        for method in &kind.methods {
            match method {
                SearchMethod::CosineSimilarity => {
                    if let Some(embedding) = embedding {
                        lists.push(items(
                            self.store.vector_search_edges(group_id, embedding, config.filter, fetch).await?,
                        ));
                    }
                }
                SearchMethod::Keyword => {
                    if !query.trim().is_empty() {
                        lists.push(items(
                            self.store.keyword_search_edges(group_id, query, config.filter, fetch).await?,
                        ));
                    }
                }
                SearchMethod::BreadthFirst => {}
            }
        }

        if kind.methods.contains(&SearchMethod::BreadthFirst) {
            let origins = Self::origins(config, &lists);
            if !origins.is_empty() {
                let traversal = self.store.traverse(group_id, &origins, config.bfs_max_depth, config.filter).await?;
                let mut reached: Vec<(Edge, usize)> =
                    traversal.edges.into_iter().filter(|(e, _)| e.kind == EdgeKind::RelatesTo).collect();
                reached.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.uuid.cmp(&b.0.uuid)));
                lists.push(reached.into_iter().take(fetch).map(|(e, _)| e).collect());
            }
        }

        self.fuse_and_rerank(query, group_id, kind, config, lists).await
    }

    async fn search_nodes<T: LabeledItem>(
        &self,
        kind: Option<&KindSearch>,
        query: &str,
        embedding: Option<&[f32]>,
        group_id: &str,
        config: &SearchConfig,
    ) -> Result<Vec<Scored<T>>> {
        let Some(kind) = kind else {
            return Ok(Vec::new());
        };
        let fetch = config.fetch_limit();
        let mut lists: Vec<Vec<T>> = Vec::new();

        for method in &kind.methods {
            let hits = match method {
                SearchMethod::CosineSimilarity => match embedding {
                    Some(embedding) => self.store.vector_search_nodes(group_id, T::LABEL, embedding, fetch).await?,
                    None => continue,
                },
                SearchMethod::Keyword if !query.trim().is_empty() => {
                    self.store.keyword_search_nodes(group_id, T::LABEL, query, fetch).await?
                }
                _ => continue,
            };
            lists.push(hits.into_iter().filter_map(|(node, _)| T::from_node(node)).collect());
        }

        if kind.methods.contains(&SearchMethod::BreadthFirst) {
            let origins = Self::origins(config, &lists);
            if !origins.is_empty() {
                lists.push(self.reached_nodes::<T>(group_id, &origins, config).await?);
            }
        }

        self.fuse_and_rerank(query, group_id, kind, config, lists).await
    }

    /// Nodes of `T`'s label reached from `origins`, nearest first. Communities are reached
    /// through the memberships of reached entities.
    async fn reached_nodes<T: LabeledItem>(
        &self,
        group_id: &str,
        origins: &[Uuid],
        config: &SearchConfig,
    ) -> Result<Vec<T>> {
        let traversal = self.store.traverse(group_id, origins, config.bfs_max_depth, config.filter).await?;
        let mut depths: HashMap<Uuid, usize> = traversal.nodes.into_iter().collect();

        if T::LABEL == NodeLabel::Community {
            let memberships = self.store.community_memberships(group_id).await?;
            let mut community_depths: HashMap<Uuid, usize> = HashMap::new();
            for (entity, depth) in &depths {
                if let Some(community) = memberships.get(entity) {
                    let d = community_depths.entry(*community).or_insert(*depth);
                    *d = (*d).min(*depth);
                }
            }
            depths = community_depths;
        }

        let uuids: Vec<Uuid> = depths.keys().copied().collect();
        let mut reached: Vec<(T, usize)> = self
            .store
            .get_nodes(&uuids)
            .await?
            .into_iter()
            .filter_map(T::from_node)
            .filter_map(|item| depths.get(&item.uuid()).map(|d| (item, *d)))
            .collect();
        reached.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.uuid().cmp(&b.0.uuid())));
        Ok(reached.into_iter().take(config.fetch_limit()).map(|(item, _)| item).collect())
    }

    async fn fuse_and_rerank<T: SearchItem>(
        &self,
        query: &str,
        group_id: &str,
        kind: &KindSearch,
        config: &SearchConfig,
        lists: Vec<Vec<T>>,
    ) -> Result<Vec<Scored<T>>> {
        let mut results = rrf(lists);
        if let Fusion::Mmr { lambda } = kind.fusion {
            results = mmr(results, lambda);
        }

        for reranker in &kind.rerankers {
            results = match reranker {
                PostRerank::CrossEncoder => {
                    let encoder = self
                        .cross_encoder
                        .as_deref()
                        .ok_or_else(|| TempographError::Search("no cross-encoder configured".to_string()))?;
                    rerank::cross_encoder(encoder, query, results).await?
                }
                PostRerank::NodeDistance { center } => {
                    let traversal =
                        self.store.traverse(group_id, &[*center], config.bfs_max_depth, config.filter).await?;
                    let distances: HashMap<Uuid, usize> = traversal.nodes.into_iter().collect();
                    rerank::node_distance(results, &distances)
                }
                PostRerank::EpisodeMentions => {
                    let anchors: Vec<Uuid> = results.iter().flat_map(|s| s.item.anchors()).collect();
                    let counts = self.store.mention_counts(&anchors).await?;
                    rerank::episode_mentions(results, &counts)
                }
            };
        }

        results.retain(|s| s.score >= config.min_score);
        results.truncate(config.limit);
        for (idx, scored) in results.iter_mut().enumerate() {
            scored.rank = idx + 1;
        }
        Ok(results)
    }
}

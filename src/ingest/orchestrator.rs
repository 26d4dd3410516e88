//! Per-episode ingestion: chunk, extract, resolve, persist.

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use uuid::Uuid;

use super::{chunk, estimate_tokens, CancelToken, IngestStage};
use crate::config::{validate_type_declarations, Config, EdgeTypeSpec, EntityTypeSpec, IngestConfig};
use crate::embeddings::Embedder;
use crate::error::{Result, TempographError};
use crate::extraction::{Extractor, ResponseFormat};
use crate::llm::LlmClient;
use crate::models::{
    normalize_text, CommunityNode, Edge, EdgeKind, EntityNode, EpisodeInput, EpisodicNode, Node, SourceNode,
};
use crate::resolve::{
    identity_entities, identity_relationships, CommunityReport, ContradictionPolicy, DedupeResult, DedupeStats,
    DefaultStrategy, RelationClassPolicy, RelationshipResolution, RelationshipStats, ResolutionStrategy,
    StrategyErrorPolicy, UuidMap,
};
use crate::store::{GraphStore, RawFactStore, RawFacts, RecordFailure};

fn group_pattern() -> &'static Regex {
    static GROUP: OnceLock<Regex> = OnceLock::new();
    GROUP.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("static regex is valid"))
}

/// Check a group id: 1 to 128 ASCII letters, digits, `_` or `-`.
pub fn validate_group_id(group_id: &str) -> Result<()> {
    if group_pattern().is_match(group_id) {
        Ok(())
    } else {
        Err(TempographError::Validation(format!("invalid group_id '{}'", group_id)))
    }
}

/// Per-call knobs for [`Ingestor::add_episode`] and friends.
#[derive(Debug, Clone, Default)]
pub struct AddEpisodeOptions {
    /// Use exactly these episodes as context instead of the most recent ones.
    pub previous_episode_uuids: Option<Vec<Uuid>>,
    /// Overrides the configured `update_communities`.
    pub update_communities: Option<bool>,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct IngestStats {
    pub chunks: usize,
    pub chunks_with_entities: usize,
    pub approx_tokens: usize,
    pub entities_candidates: usize,
    pub entities_dropped: usize,
    pub entities_merged: usize,
    pub entities_created: usize,
    pub facts_candidates: usize,
    pub facts_created: usize,
    pub facts_restated: usize,
    pub facts_invalidated: usize,
    pub facts_trimmed: usize,
    pub facts_historical: usize,
    pub facts_dropped: usize,
    pub hydrated: usize,
    pub elapsed_ms: u128,
}

impl IngestStats {
    fn record_entities(&mut self, s: &DedupeStats) {
        self.entities_candidates += s.candidates;
        self.entities_dropped += s.dropped;
        self.entities_merged += s.merged;
        self.entities_created += s.created;
    }

    fn record_facts(&mut self, s: &RelationshipStats) {
        self.facts_candidates += s.candidates;
        self.facts_created += s.created;
        self.facts_restated += s.restated;
        self.facts_invalidated += s.invalidated;
        self.facts_trimmed += s.trimmed;
        self.facts_historical += s.historical;
        self.facts_dropped += s.dropped;
    }
}

#[derive(Debug, Clone)]
pub struct AddEpisodeResult {
    /// The stored episode (after append, the combined one).
    pub episode: EpisodicNode,
    /// Canonical entities created or updated.
    pub nodes: Vec<EntityNode>,
    /// Facts produced or reasserted by the episode.
    pub edges: Vec<Edge>,
    /// Stored facts this episode closed.
    pub invalidated: Vec<Edge>,
    pub mentions: Vec<Edge>,
    pub communities: Vec<CommunityNode>,
    /// The episode already existed; nothing was done.
    pub skipped: bool,
    pub stats: IngestStats,
    pub persist_failures: Vec<RecordFailure>,
    /// Strategy operations skipped under [`StrategyErrorPolicy::Skip`].
    pub strategy_skips: Vec<String>,
}

impl AddEpisodeResult {
    fn skipped(episode: EpisodicNode) -> Self {
        Self {
            episode,
            nodes: Vec::new(),
            edges: Vec::new(),
            invalidated: Vec::new(),
            mentions: Vec::new(),
            communities: Vec::new(),
            skipped: true,
            stats: IngestStats::default(),
            persist_failures: Vec::new(),
            strategy_skips: Vec::new(),
        }
    }
}

/// Outcome of one episode in a bulk run.
#[derive(Debug)]
pub struct EpisodeOutcome {
    pub name: String,
    pub result: Result<AddEpisodeResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RemovalReport {
    pub mentions_deleted: usize,
    pub facts_deleted: usize,
    pub facts_updated: usize,
    pub entities_deleted: usize,
    pub entities_updated: usize,
}

#[derive(Debug, Clone)]
pub struct PromoteResult {
    pub source: SourceNode,
    pub nodes: Vec<EntityNode>,
    pub edges: Vec<Edge>,
    pub invalidated: Vec<Edge>,
    pub persist_failures: Vec<RecordFailure>,
    pub strategy_skips: Vec<String>,
}

/// Builds an [`Ingestor`]; missing collaborators and bad type declarations fail here,
/// before any I/O.
#[derive(Default)]
pub struct IngestorBuilder {
    store: Option<Arc<dyn GraphStore>>,
    raw_store: Option<Arc<dyn RawFactStore>>,
    embedder: Option<Arc<dyn Embedder>>,
    llm: Option<Arc<dyn LlmClient>>,
    strategy: Option<(String, Arc<dyn ResolutionStrategy>)>,
    policy: Option<Arc<dyn ContradictionPolicy>>,
    config: IngestConfig,
    response_format: ResponseFormat,
    entity_types: Vec<EntityTypeSpec>,
    edge_types: Vec<EdgeTypeSpec>,
    community_iterations: usize,
}

impl IngestorBuilder {
    pub fn new() -> Self {
        Self {
            community_iterations: 20,
            ..Default::default()
        }
    }

    /// Take tuning, response format and type declarations from a loaded config.
    pub fn from_config(config: &Config) -> Self {
        Self::new()
            .config(config.ingest.clone())
            .response_format(config.llm.response_format)
            .entity_types(config.entity_types.clone())
            .edge_types(config.edge_types.clone())
            .community_iterations(config.community.max_iterations)
    }

    pub fn store(mut self, store: Arc<dyn GraphStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn raw_store(mut self, raw_store: Arc<dyn RawFactStore>) -> Self {
        self.raw_store = Some(raw_store);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Use a custom resolution strategy; `name` appears in strategy errors.
    pub fn strategy(mut self, name: impl Into<String>, strategy: Arc<dyn ResolutionStrategy>) -> Self {
        self.strategy = Some((name.into(), strategy));
        self
    }

    /// Contradiction policy for the default strategy.
    pub fn contradiction_policy(mut self, policy: Arc<dyn ContradictionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn config(mut self, config: IngestConfig) -> Self {
        self.config = config;
        self
    }

    pub fn response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = format;
        self
    }

    pub fn entity_types(mut self, entity_types: Vec<EntityTypeSpec>) -> Self {
        self.entity_types = entity_types;
        self
    }

    pub fn edge_types(mut self, edge_types: Vec<EdgeTypeSpec>) -> Self {
        self.edge_types = edge_types;
        self
    }

    pub fn community_iterations(mut self, iterations: usize) -> Self {
        self.community_iterations = iterations;
        self
    }

    pub fn build(self) -> Result<Ingestor> {
        let missing = |what: &str| TempographError::Config(format!("ingestor requires {}", what));
        let store = self.store.ok_or_else(|| missing("a graph store"))?;
        let embedder = self.embedder.ok_or_else(|| missing("an embedder"))?;
        let llm = self.llm.ok_or_else(|| missing("a language model client"))?;

        validate_type_declarations(&self.entity_types, &self.edge_types).map_err(TempographError::Config)?;
        if self.config.chunk_max_chars == 0 {
            return Err(TempographError::Config("chunk_max_chars must be greater than 0".to_string()));
        }
        for (name, value) in [
            ("dedupe_threshold", self.config.dedupe_threshold),
            ("restatement_threshold", self.config.restatement_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(TempographError::Config(format!("{} must be between 0.0 and 1.0", name)));
            }
        }

        let extractor = Extractor::new(llm, self.response_format)
            .with_entity_types(self.entity_types)
            .with_edge_types(self.edge_types.clone());

        let non_exclusive = self
            .config
            .non_exclusive_relations
            .iter()
            .cloned()
            .chain(self.edge_types.iter().filter(|t| !t.exclusive).map(|t| t.name.clone()));
        let policy: Arc<dyn ContradictionPolicy> = match self.policy {
            Some(policy) => policy,
            None => Arc::new(RelationClassPolicy::new(non_exclusive, self.config.restatement_threshold)),
        };

        let default_strategy: Arc<dyn ResolutionStrategy> = Arc::new(
            DefaultStrategy::new(store.clone(), embedder.clone(), extractor.clone())
                .with_policy(policy)
                .with_dedupe_threshold(self.config.dedupe_threshold)
                .with_max_iterations(self.community_iterations),
        );
        let (strategy_name, strategy) = self
            .strategy
            .unwrap_or_else(|| ("default".to_string(), default_strategy.clone()));

        Ok(Ingestor {
            store,
            raw_store: self.raw_store,
            embedder,
            extractor,
            strategy,
            strategy_name,
            fallback: default_strategy,
            config: self.config,
        })
    }
}

/// Runs the ingestion pipeline. Owns its collaborators; calls for one group must be
/// serialized by the caller.
pub struct Ingestor {
    store: Arc<dyn GraphStore>,
    raw_store: Option<Arc<dyn RawFactStore>>,
    embedder: Arc<dyn Embedder>,
    extractor: Extractor,
    strategy: Arc<dyn ResolutionStrategy>,
    strategy_name: String,
    fallback: Arc<dyn ResolutionStrategy>,
    config: IngestConfig,
}

/// Everything the shared pipeline produced for one piece of text.
struct PipelineOutput {
    /// Embedding of the first chunk.
    episode_embedding: Option<Vec<f32>>,
    nodes: Vec<EntityNode>,
    edges: Vec<Edge>,
    invalidated: Vec<Edge>,
    mentions: Vec<Edge>,
    stats: IngestStats,
    persist_failures: Vec<RecordFailure>,
    strategy_skips: Vec<String>,
}

fn staged<T>(stage: IngestStage, result: Result<T>) -> Result<T> {
    result.map_err(|e| e.at_stage(stage))
}

impl Ingestor {
    pub fn builder() -> IngestorBuilder {
        IngestorBuilder::new()
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn strategy(&self) -> &Arc<dyn ResolutionStrategy> {
        &self.strategy
    }

    /// Ingest one episode. Re-ingesting an existing episode UUID is a no-op.
    pub async fn add_episode(&self, input: EpisodeInput, opts: &AddEpisodeOptions) -> Result<AddEpisodeResult> {
        let start = Instant::now();
        let now = Utc::now();

        opts.cancel.check(IngestStage::Validate)?;
        staged(IngestStage::Validate, self.validate_input(&input))?;
        if let Some(uuid) = input.uuid {
            if let Some(existing) = staged(IngestStage::Validate, self.store.get_node(uuid).await)? {
                log::warn!("Episode {} already exists, skipping", uuid);
                let episode = existing.into_episode().unwrap_or_else(|| input.clone().into_node(now));
                return Ok(AddEpisodeResult::skipped(episode));
            }
        }

        let mut episode = input.into_node(now);
        log::info!("Ingesting episode {} ({}) into {}", episode.name, episode.uuid, episode.group_id);

        let work = episode.clone();
        let output = self.run_pipeline(&work, opts).await?;
        episode.add_entity_edges(output.edges.iter().map(|e| e.uuid));
        episode.embedding = output.episode_embedding.clone();

        self.finish(episode, output, opts, start).await
    }

    /// Ingest several episodes one after another. A failure is reported and the rest
    /// still run; cancellation stops the batch.
    pub async fn add_episodes(&self, inputs: Vec<EpisodeInput>, opts: &AddEpisodeOptions) -> Vec<EpisodeOutcome> {
        let per_episode = AddEpisodeOptions { update_communities: Some(false), ..opts.clone() };
        let mut outcomes = Vec::with_capacity(inputs.len());
        let mut groups = HashSet::new();

        for input in inputs {
            let name = input.name.clone();
            let group = input.group_id.clone();
            let result = self.add_episode(input, &per_episode).await;
            let cancelled = matches!(result, Err(TempographError::Cancelled(_)));
            match &result {
                Ok(r) if !r.skipped => {
                    groups.insert(group);
                }
                Ok(_) => {}
                Err(e) => log::error!("Episode '{}' failed: {}", name, e),
            }
            outcomes.push(EpisodeOutcome { name, result });
            if cancelled {
                break;
            }
        }

        if opts.update_communities.unwrap_or(self.config.update_communities) {
            for group in groups {
                if let Err(e) = self.strategy.build_communities(&group, false).await {
                    log::warn!("Community update for {} failed: {}", group, e);
                }
            }
        }
        outcomes
    }

    /// Append text to an existing episode and ingest only the new text.
    pub async fn add_to_episode(&self, uuid: Uuid, content: &str, opts: &AddEpisodeOptions) -> Result<AddEpisodeResult> {
        let start = Instant::now();
        let now = Utc::now();

        opts.cancel.check(IngestStage::Validate)?;
        let stored = staged(IngestStage::Validate, self.store.get_node(uuid).await)?
            .and_then(Node::into_episode)
            .ok_or_else(|| TempographError::EpisodeNotFound(uuid.to_string()))?;
        if content.trim().is_empty() {
            return Err(TempographError::Validation("appended content is empty".to_string()).at_stage(IngestStage::Validate));
        }

        let mut work = stored.clone();
        work.content = content.to_string();
        work.entity_edges.clear();
        work.embedding = None;

        let output = self.run_pipeline(&work, opts).await?;

        let mut episode = stored;
        episode.append_content(content, now);
        episode.add_entity_edges(output.edges.iter().map(|e| e.uuid));
        log::info!("Appended {} chars to episode {}", content.chars().count(), episode.uuid);

        self.finish(episode, output, opts, start).await
    }

    /// Persist the episode, rebuild communities if asked, and assemble the result.
    async fn finish(
        &self,
        episode: EpisodicNode,
        mut output: PipelineOutput,
        opts: &AddEpisodeOptions,
        start: Instant,
    ) -> Result<AddEpisodeResult> {
        opts.cancel.check(IngestStage::Persist)?;
        staged(IngestStage::Persist, self.store.upsert_node(&Node::from(episode.clone())).await)?;

        let mut communities = Vec::new();
        if opts.update_communities.unwrap_or(self.config.update_communities) {
            opts.cancel.check(IngestStage::RebuildCommunities)?;
            match self.strategy.build_communities(&episode.group_id, false).await {
                Ok(CommunityReport { communities: built, .. }) => communities = built,
                Err(e) => log::warn!("Community update for {} failed: {}", episode.group_id, e),
            }
        }

        output.stats.elapsed_ms = start.elapsed().as_millis();
        log::info!(
            "Episode {} done in {:?}: {} entities, {} facts, {} invalidated",
            episode.uuid,
            start.elapsed(),
            output.nodes.len(),
            output.edges.len(),
            output.invalidated.len()
        );

        Ok(AddEpisodeResult {
            episode,
            nodes: output.nodes,
            edges: output.edges,
            invalidated: output.invalidated,
            mentions: output.mentions,
            communities,
            skipped: false,
            stats: output.stats,
            persist_failures: output.persist_failures,
            strategy_skips: output.strategy_skips,
        })
    }

    fn validate_input(&self, input: &EpisodeInput) -> Result<()> {
        validate_group_id(&input.group_id)?;
        if input.content.trim().is_empty() {
            return Err(TempographError::Validation("episode content is empty".to_string()));
        }
        Ok(())
    }

    /// Previous episodes: the explicit list, or the most recent ones up to the
    /// episode's reference time.
    async fn gather_context(&self, episode: &EpisodicNode, opts: &AddEpisodeOptions) -> Result<Vec<EpisodicNode>> {
        let mut previous: Vec<EpisodicNode> = match &opts.previous_episode_uuids {
            Some(uuids) => self
                .store
                .get_nodes(uuids)
                .await?
                .into_iter()
                .filter_map(Node::into_episode)
                .collect(),
            None => {
                self.store
                    .recent_episodes(&episode.group_id, episode.reference_time(), self.config.previous_episodes + 1)
                    .await?
            }
        };
        previous.retain(|p| p.uuid != episode.uuid && p.group_id == episode.group_id);
        previous.sort_by_key(|p| p.valid_from);
        if opts.previous_episode_uuids.is_none() && previous.len() > self.config.previous_episodes {
            previous.drain(..previous.len() - self.config.previous_episodes);
        }
        Ok(previous)
    }

    /// Per-chunk entity candidates with name embeddings and episode provenance.
    async fn extract_entity_candidates(
        &self,
        chunks: &[String],
        episode: &EpisodicNode,
        previous: &[EpisodicNode],
        cancel: &CancelToken,
    ) -> Result<Vec<Vec<EntityNode>>> {
        let now = Utc::now();
        let mut per_chunk = Vec::with_capacity(chunks.len());
        for (i, text) in chunks.iter().enumerate() {
            cancel.check(IngestStage::ExtractEntities)?;
            let found = self.extractor.extract_entities(text, episode, previous).await?;
            log::debug!("Chunk {}: {} entity candidates", i, found.len());
            let nodes: Vec<EntityNode> = found
                .into_iter()
                .map(|c| {
                    let mut node = EntityNode::new(c.name, c.entity_type, &episode.group_id, now);
                    node.valid_from = episode.reference_time();
                    node.add_episode(episode.uuid);
                    node
                })
                .collect();
            per_chunk.push(nodes);
        }

        self.embed_names(per_chunk.iter_mut().flatten()).await?;
        Ok(per_chunk)
    }

    async fn embed_names<'a>(&self, nodes: impl Iterator<Item = &'a mut EntityNode>) -> Result<()> {
        let mut nodes: Vec<&mut EntityNode> = nodes.filter(|n| n.embedding.is_none()).collect();
        if nodes.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
        let embeddings = self.embedder.embed_batch(&names).await?;
        for (node, embedding) in nodes.iter_mut().zip(embeddings) {
            node.embedding = Some(embedding);
        }
        Ok(())
    }

    async fn embed_facts(&self, edges: &mut [Edge]) -> Result<()> {
        let facts: Vec<String> = edges.iter().map(|e| e.fact.clone()).collect();
        if facts.is_empty() {
            return Ok(());
        }
        let embeddings = self.embedder.embed_batch(&facts).await?;
        for (edge, embedding) in edges.iter_mut().zip(embeddings) {
            edge.fact_embedding = Some(embedding);
        }
        Ok(())
    }

    /// Extract facts among the entities visible in each chunk.
    async fn extract_fact_candidates(
        &self,
        chunks: &[String],
        chunk_entities: &[Vec<EntityNode>],
        episode: &EpisodicNode,
        previous: &[EpisodicNode],
        cancel: &CancelToken,
    ) -> Result<Vec<Edge>> {
        let now = Utc::now();
        let mut edges = Vec::new();
        for (text, entities) in chunks.iter().zip(chunk_entities) {
            if entities.is_empty() {
                continue;
            }
            cancel.check(IngestStage::ExtractRelationships)?;
            let by_name: HashMap<String, Uuid> = entities.iter().map(|e| (normalize_text(&e.name), e.uuid)).collect();
            for rel in self.extractor.extract_relationships(text, episode, entities, previous).await? {
                let (Some(&source), Some(&target)) =
                    (by_name.get(&normalize_text(&rel.source)), by_name.get(&normalize_text(&rel.target)))
                else {
                    continue;
                };
                let mut edge = Edge::relates_to(&episode.group_id, source, target, &rel.relation, &rel.fact, now);
                edge.valid_at = rel.valid_at;
                edge.invalid_at = rel.invalid_at;
                if let Some(strength) = rel.strength {
                    edge.attributes.insert("strength".to_string(), serde_json::json!(strength));
                }
                edges.push(edge);
            }
        }
        self.embed_facts(&mut edges).await?;
        Ok(edges)
    }

    /// Stages shared by add and append, up to (not including) the episode write.
    async fn run_pipeline(&self, episode: &EpisodicNode, opts: &AddEpisodeOptions) -> Result<PipelineOutput> {
        let cancel = &opts.cancel;
        let mut stats = IngestStats::default();
        let mut persist_failures = Vec::new();
        let mut strategy_skips = Vec::new();

        cancel.check(IngestStage::Chunk)?;
        let chunks = staged(IngestStage::Chunk, chunk(&episode.content, self.config.chunk_max_chars))?;
        stats.chunks = chunks.len();
        stats.approx_tokens = estimate_tokens(&episode.content);
        log::debug!("Episode {} split into {} chunks", episode.uuid, chunks.len());
        let episode_embedding = match chunks.first() {
            Some(first) => Some(staged(IngestStage::Chunk, self.embedder.embed(first).await)?),
            None => None,
        };

        cancel.check(IngestStage::ContextGather)?;
        let previous = staged(IngestStage::ContextGather, self.gather_context(episode, opts).await)?;
        let context = staged(IngestStage::ContextGather, self.store.entity_nodes(&episode.group_id).await)?;

        cancel.check(IngestStage::ExtractEntities)?;
        let candidates = staged(
            IngestStage::ExtractEntities,
            self.extract_entity_candidates(&chunks, episode, &previous, cancel).await,
        )?;

        cancel.check(IngestStage::ResolveEntities)?;
        let mut dedupe = staged(
            IngestStage::ResolveEntities,
            self.resolve_entities_with_policy(candidates, context, &mut strategy_skips).await,
        )?;
        stats.record_entities(&dedupe.stats);
        stats.chunks_with_entities = dedupe.chunk_nodes.iter().filter(|c| !c.is_empty()).count();
        // Early write so later failures still leave the entities in place
        let report = staged(IngestStage::ResolveEntities, self.store.upsert_nodes(&entity_nodes(&dedupe.nodes)).await)?;
        persist_failures.extend(report.failures);

        let chunk_entities: Vec<Vec<EntityNode>> = dedupe
            .chunk_nodes
            .iter()
            .map(|uuids| uuids.iter().filter_map(|u| dedupe.node(*u).cloned()).collect())
            .collect();

        cancel.check(IngestStage::ExtractRelationships)?;
        let fact_candidates = staged(
            IngestStage::ExtractRelationships,
            self.extract_fact_candidates(&chunks, &chunk_entities, episode, &previous, cancel).await,
        )?;

        cancel.check(IngestStage::ResolveRelationships)?;
        let resolution = staged(
            IngestStage::ResolveRelationships,
            self.resolve_relationships_with_policy(fact_candidates, &dedupe.uuid_map, &dedupe.nodes, episode, &mut strategy_skips)
                .await,
        )?;
        stats.record_facts(&resolution.stats);

        if self.config.hydrate_attributes {
            cancel.check(IngestStage::HydrateAttributes)?;
            stats.hydrated = staged(
                IngestStage::HydrateAttributes,
                self.hydrate(&chunks, &chunk_entities, &mut dedupe.nodes, cancel).await,
            )?;
        }

        cancel.check(IngestStage::BuildEpisodicEdges)?;
        let mentions = staged(
            IngestStage::BuildEpisodicEdges,
            self.build_mentions(episode, &dedupe.chunk_nodes).await,
        )?;

        cancel.check(IngestStage::Persist)?;
        let node_report = staged(IngestStage::Persist, self.store.upsert_nodes(&entity_nodes(&dedupe.nodes)).await)?;
        let mut edges: Vec<Edge> = resolution.resolved.clone();
        edges.extend(resolution.invalidated.iter().cloned());
        edges.extend(mentions.iter().cloned());
        let edge_report = staged(IngestStage::Persist, self.store.upsert_edges(&edges).await)?;
        for failure in node_report.failures.iter().chain(edge_report.failures.iter()) {
            log::warn!("Skipped record {}: {}", failure.uuid, failure.error);
        }
        persist_failures.extend(node_report.failures);
        persist_failures.extend(edge_report.failures);

        Ok(PipelineOutput {
            episode_embedding,
            nodes: dedupe.nodes,
            edges: resolution.resolved,
            invalidated: resolution.invalidated,
            mentions,
            stats,
            persist_failures,
            strategy_skips,
        })
    }

    /// Merge hydration answers into canonical nodes; returns how many were updated.
    async fn hydrate(
        &self,
        chunks: &[String],
        chunk_entities: &[Vec<EntityNode>],
        canonical: &mut [EntityNode],
        cancel: &CancelToken,
    ) -> Result<usize> {
        let now = Utc::now();
        let mut updated = HashSet::new();
        for (text, entities) in chunks.iter().zip(chunk_entities) {
            if entities.is_empty() {
                continue;
            }
            cancel.check(IngestStage::HydrateAttributes)?;
            for hydration in self.extractor.hydrate(text, entities).await? {
                let key = normalize_text(&hydration.name);
                let Some(visible) = entities.iter().find(|e| normalize_text(&e.name) == key) else {
                    continue;
                };
                let Some(node) = canonical.iter_mut().find(|n| n.uuid == visible.uuid) else {
                    continue;
                };
                node.merge_summary(&hydration.summary);
                for (k, v) in hydration.attributes {
                    node.attributes.insert(k, v);
                }
                node.updated_at = now;
                updated.insert(node.uuid);
            }
        }
        Ok(updated.len())
    }

    /// One `Mentions` edge per entity seen in the episode, skipping ones already stored
    /// (appends).
    async fn build_mentions(&self, episode: &EpisodicNode, chunk_nodes: &[Vec<Uuid>]) -> Result<Vec<Edge>> {
        let now = Utc::now();
        let existing: HashSet<Uuid> = self
            .store
            .edges_for_node(episode.uuid, Some(EdgeKind::Mentions))
            .await?
            .into_iter()
            .map(|e| e.target_node_uuid)
            .collect();

        let mut seen = HashSet::new();
        Ok(chunk_nodes
            .iter()
            .flatten()
            .filter(|u| !existing.contains(u) && seen.insert(**u))
            .map(|u| Edge::mentions(&episode.group_id, episode.uuid, *u, episode.reference_time(), now))
            .collect())
    }

    fn strategy_error(&self, operation: &str, e: TempographError) -> TempographError {
        TempographError::Strategy {
            strategy: self.strategy_name.clone(),
            operation: operation.to_string(),
            message: e.to_string(),
        }
    }

    async fn resolve_entities_with_policy(
        &self,
        candidates: Vec<Vec<EntityNode>>,
        context: Vec<EntityNode>,
        skips: &mut Vec<String>,
    ) -> Result<DedupeResult> {
        let policy = self.config.strategy_error_policy;
        let retry = (policy != StrategyErrorPolicy::Fail).then(|| (candidates.clone(), context.clone()));
        let error = match self.strategy.resolve_entities(candidates, context).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };
        match (policy, retry) {
            (StrategyErrorPolicy::Fallback, Some((candidates, context))) => {
                log::warn!("Strategy {} failed on resolve_entities ({}); using default", self.strategy_name, error);
                self.fallback.resolve_entities(candidates, context).await
            }
            (StrategyErrorPolicy::Skip, Some((candidates, _))) => {
                log::warn!("Strategy {} failed on resolve_entities ({}); keeping candidates as-is", self.strategy_name, error);
                skips.push(format!("resolve_entities: {}", error));
                Ok(identity_entities(candidates))
            }
            _ => Err(self.strategy_error("resolve_entities", error)),
        }
    }

    async fn resolve_relationships_with_policy(
        &self,
        candidates: Vec<Edge>,
        uuid_map: &UuidMap,
        canonical: &[EntityNode],
        episode: &EpisodicNode,
        skips: &mut Vec<String>,
    ) -> Result<RelationshipResolution> {
        let policy = self.config.strategy_error_policy;
        let retry = (policy != StrategyErrorPolicy::Fail).then(|| candidates.clone());
        let error = match self.strategy.resolve_relationships(candidates, uuid_map, canonical, episode).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };
        match (policy, retry) {
            (StrategyErrorPolicy::Fallback, Some(candidates)) => {
                log::warn!("Strategy {} failed on resolve_relationships ({}); using default", self.strategy_name, error);
                self.fallback.resolve_relationships(candidates, uuid_map, canonical, episode).await
            }
            (StrategyErrorPolicy::Skip, Some(candidates)) => {
                log::warn!(
                    "Strategy {} failed on resolve_relationships ({}); storing facts unresolved",
                    self.strategy_name,
                    error
                );
                skips.push(format!("resolve_relationships: {}", error));
                Ok(identity_relationships(candidates, uuid_map, episode))
            }
            _ => Err(self.strategy_error("resolve_relationships", error)),
        }
    }

    /// Remove an episode and everything only it supports.
    pub async fn remove_episode(&self, uuid: Uuid) -> Result<RemovalReport> {
        let episode = self
            .store
            .get_node(uuid)
            .await?
            .and_then(Node::into_episode)
            .ok_or_else(|| TempographError::EpisodeNotFound(uuid.to_string()))?;
        let group = episode.group_id.as_str();
        let mut report = RemovalReport::default();

        for mention in self.store.edges_for_node(uuid, Some(EdgeKind::Mentions)).await? {
            if self.store.delete_edge(mention.uuid).await? {
                report.mentions_deleted += 1;
            }
        }

        for mut fact in self.store.edges_with_episode(group, uuid).await? {
            fact.episodes.retain(|e| *e != uuid);
            if fact.episodes.is_empty() {
                self.store.delete_edge(fact.uuid).await?;
                report.facts_deleted += 1;
            } else {
                self.store.upsert_edge(&fact).await?;
                report.facts_updated += 1;
            }
        }

        let now = Utc::now();
        for mut entity in self.store.entities_with_episode(group, uuid).await? {
            entity.episodes.retain(|e| *e != uuid);
            if entity.episodes.is_empty() {
                self.store.delete_node(entity.uuid).await?;
                report.entities_deleted += 1;
            } else {
                entity.updated_at = now;
                self.store.upsert_node(&Node::from(entity)).await?;
                report.entities_updated += 1;
            }
        }

        self.store.delete_node(uuid).await?;
        log::info!(
            "Removed episode {}: {} facts deleted, {} entities deleted",
            uuid,
            report.facts_deleted,
            report.entities_deleted
        );
        Ok(report)
    }

    fn raw_store(&self) -> Result<&Arc<dyn RawFactStore>> {
        self.raw_store
            .as_ref()
            .ok_or_else(|| TempographError::Config("no raw-fact store configured".to_string()))
    }

    /// Extract candidates without touching the graph and park them in the raw-fact store.
    pub async fn extract_only(&self, input: EpisodeInput, opts: &AddEpisodeOptions) -> Result<RawFacts> {
        let raw_store = self.raw_store()?;
        let now = Utc::now();
        let cancel = &opts.cancel;

        cancel.check(IngestStage::Validate)?;
        staged(IngestStage::Validate, self.validate_input(&input))?;
        let episode = input.into_node(now);

        cancel.check(IngestStage::Chunk)?;
        let chunks = staged(IngestStage::Chunk, chunk(&episode.content, self.config.chunk_max_chars))?;

        cancel.check(IngestStage::ContextGather)?;
        let previous = staged(IngestStage::ContextGather, self.gather_context(&episode, opts).await)?;

        cancel.check(IngestStage::ExtractEntities)?;
        let entities = staged(
            IngestStage::ExtractEntities,
            self.extract_entity_candidates(&chunks, &episode, &previous, cancel).await,
        )?;

        cancel.check(IngestStage::ExtractRelationships)?;
        let edges = staged(
            IngestStage::ExtractRelationships,
            self.extract_fact_candidates(&chunks, &entities, &episode, &previous, cancel).await,
        )?;

        let facts = RawFacts {
            source_id: episode.uuid.to_string(),
            group_id: episode.group_id.clone(),
            episode,
            entities,
            edges,
            created_at: now,
            promoted_at: None,
        };
        staged(IngestStage::Persist, raw_store.save(&facts).await)?;
        log::info!(
            "Saved raw facts {}: {} entities, {} facts",
            facts.source_id,
            facts.entity_count(),
            facts.edges.len()
        );
        Ok(facts)
    }

    /// Resolve previously extracted raw facts into the graph under a source node.
    pub async fn promote(&self, source_id: &str, opts: &AddEpisodeOptions) -> Result<PromoteResult> {
        let raw_store = self.raw_store()?;
        let now = Utc::now();
        let cancel = &opts.cancel;

        let raw = raw_store
            .get(source_id)
            .await?
            .ok_or_else(|| TempographError::EpisodeNotFound(source_id.to_string()))?;
        if raw.promoted_at.is_some() {
            return Err(TempographError::Validation(format!("raw facts {} were already promoted", source_id)));
        }

        let source = SourceNode {
            uuid: Uuid::new_v4(),
            name: raw.episode.name.clone(),
            group_id: raw.group_id.clone(),
            summary: String::new(),
            embedding: None,
            created_at: now,
            updated_at: now,
            valid_from: raw.episode.reference_time(),
            description: if raw.episode.source_description.is_empty() {
                format!("raw facts {}", source_id)
            } else {
                raw.episode.source_description.clone()
            },
        };
        // Provenance points at the source node
        let mut anchor = raw.episode.clone();
        anchor.uuid = source.uuid;

        let mut candidates = raw.entities;
        for node in candidates.iter_mut().flatten() {
            node.episodes = vec![source.uuid];
        }
        self.embed_names(candidates.iter_mut().flatten()).await?;
        let mut fact_candidates = raw.edges;
        for edge in &mut fact_candidates {
            edge.episodes.clear();
        }
        if fact_candidates.iter().any(|e| e.fact_embedding.is_none()) {
            self.embed_facts(&mut fact_candidates).await?;
        }

        let mut skips = Vec::new();
        cancel.check(IngestStage::ResolveEntities)?;
        let context = self.store.entity_nodes(&raw.group_id).await?;
        let dedupe = staged(
            IngestStage::ResolveEntities,
            self.resolve_entities_with_policy(candidates, context, &mut skips).await,
        )?;

        cancel.check(IngestStage::ResolveRelationships)?;
        let resolution = staged(
            IngestStage::ResolveRelationships,
            self.resolve_relationships_with_policy(fact_candidates, &dedupe.uuid_map, &dedupe.nodes, &anchor, &mut skips)
                .await,
        )?;

        cancel.check(IngestStage::Persist)?;
        staged(IngestStage::Persist, self.store.upsert_node(&Node::from(source.clone())).await)?;
        let mut failures = staged(IngestStage::Persist, self.store.upsert_nodes(&entity_nodes(&dedupe.nodes)).await)?.failures;
        let mut edges = resolution.resolved.clone();
        edges.extend(resolution.invalidated.iter().cloned());
        failures.extend(staged(IngestStage::Persist, self.store.upsert_edges(&edges).await)?.failures);
        raw_store.mark_promoted(source_id, now).await?;

        log::info!(
            "Promoted {}: {} entities, {} facts, {} invalidated",
            source_id,
            dedupe.nodes.len(),
            resolution.resolved.len(),
            resolution.invalidated.len()
        );
        Ok(PromoteResult {
            source,
            nodes: dedupe.nodes,
            edges: resolution.resolved,
            invalidated: resolution.invalidated,
            persist_failures: failures,
            strategy_skips: skips,
        })
    }

    /// Rebuild (or incrementally update) the group's communities.
    pub async fn build_communities(&self, group_id: &str, rebuild: bool) -> Result<CommunityReport> {
        validate_group_id(group_id)?;
        self.strategy.build_communities(group_id, rebuild).await
    }
}

fn entity_nodes(nodes: &[EntityNode]) -> Vec<Node> {
    nodes.iter().cloned().map(Node::from).collect()
}

//! Bi-temporal fact resolution.
//!
//! Candidate facts are checked against the live facts between the same ordered pair of
//! canonical entities. A restatement extends provenance, a contradiction closes the older
//! fact, anything else becomes a new live fact.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::uuid_map::UuidMap;
use crate::embeddings::cosine_similarity;
use crate::error::Result;
use crate::extraction::Extractor;
use crate::models::{normalize_text, relation_class, Edge, EdgeKind, EntityNode, EpisodicNode};
use crate::store::GraphStore;

/// How a candidate fact relates to an existing live fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Restatement,
    Contradiction,
    Compatible,
}

/// Decides how a candidate fact relates to an existing live fact between the same pair.
#[async_trait]
pub trait ContradictionPolicy: Send + Sync {
    async fn classify(&self, candidate: &Edge, existing: &Edge) -> Result<Classification>;
}

/// Rule-based policy: equal facts (or near-identical fact embeddings) restate; the same
/// exclusive relation class contradicts.
#[derive(Debug, Clone)]
pub struct RelationClassPolicy {
    non_exclusive: HashSet<String>,
    restatement_threshold: f32,
}

impl RelationClassPolicy {
    pub fn new<I, S>(non_exclusive: I, restatement_threshold: f32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            non_exclusive: non_exclusive.into_iter().map(|s| relation_class(s.as_ref())).collect(),
            restatement_threshold,
        }
    }

    pub fn is_exclusive(&self, class: &str) -> bool {
        !self.non_exclusive.contains(class)
    }

    fn is_restatement(&self, candidate: &Edge, existing: &Edge) -> bool {
        if normalize_text(&candidate.fact) == normalize_text(&existing.fact) {
            return true;
        }
        match (&candidate.fact_embedding, &existing.fact_embedding) {
            (Some(a), Some(b)) => cosine_similarity(a, b) >= self.restatement_threshold,
            _ => false,
        }
    }
}

impl Default for RelationClassPolicy {
    fn default() -> Self {
        Self::new(["CO_OCCURS_WITH"], 0.95)
    }
}

#[async_trait]
impl ContradictionPolicy for RelationClassPolicy {
    async fn classify(&self, candidate: &Edge, existing: &Edge) -> Result<Classification> {
        if self.is_restatement(candidate, existing) {
            return Ok(Classification::Restatement);
        }
        let class = candidate.relation_class();
        if class == existing.relation_class() && self.is_exclusive(&class) {
            return Ok(Classification::Contradiction);
        }
        Ok(Classification::Compatible)
    }
}

/// Asks the language model to judge each pair. Restatements are still caught locally
/// first, and non-exclusive classes never contradict.
#[derive(Clone)]
pub struct LlmContradictionPolicy {
    extractor: Extractor,
    rules: RelationClassPolicy,
}

impl LlmContradictionPolicy {
    pub fn new(extractor: Extractor, rules: RelationClassPolicy) -> Self {
        Self { extractor, rules }
    }
}

#[async_trait]
impl ContradictionPolicy for LlmContradictionPolicy {
    async fn classify(&self, candidate: &Edge, existing: &Edge) -> Result<Classification> {
        if self.rules.is_restatement(candidate, existing) {
            return Ok(Classification::Restatement);
        }
        let verdict = self.extractor.judge(existing, candidate).await?;
        if verdict == Classification::Contradiction
            && (!self.rules.is_exclusive(&candidate.relation_class())
                || !self.rules.is_exclusive(&existing.relation_class()))
        {
            return Ok(Classification::Compatible);
        }
        Ok(verdict)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelationshipStats {
    pub candidates: usize,
    pub dropped: usize,
    pub restated: usize,
    pub invalidated: usize,
    /// Closed facts whose end moved back to make room for an older candidate.
    pub trimmed: usize,
    pub created: usize,
    pub historical: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RelationshipResolution {
    /// Facts the episode produced or reasserted: new edges and restated existing ones.
    pub resolved: Vec<Edge>,
    /// Previously stored facts closed (or shortened) by this batch.
    pub invalidated: Vec<Edge>,
    pub stats: RelationshipStats,
}

#[derive(Debug)]
struct Tracked {
    edge: Edge,
    stored: bool,
    restated: bool,
    changed: bool,
}

impl Tracked {
    fn loaded(edge: Edge) -> Self {
        Self { edge, stored: true, restated: false, changed: false }
    }

    fn new(edge: Edge) -> Self {
        Self { edge, stored: false, restated: false, changed: false }
    }
}

/// Default `valid_at` to the episode's reference time. A fact that arrives already ended
/// keeps an unknown start rather than one after its end.
fn anchor(candidate: &mut Edge, reference_time: DateTime<Utc>) {
    if candidate.valid_at.is_none() && candidate.invalid_at.is_none() {
        candidate.valid_at = Some(reference_time);
    }
}

/// Resolve candidate facts for one episode against the store's facts.
///
/// Endpoints are rewritten through `uuid_map`; candidates with an endpoint outside the
/// canonical set, or that collapse into a self-loop, are dropped. Every fact per ordered
/// pair (live and closed) is loaded once and tracked across the batch, so an exclusive
/// relation class never holds twice at one instant:
/// - a live contradicted fact starting no later than the candidate is closed at the
///   candidate's start;
/// - a contradicted fact starting later bounds the candidate's end;
/// - a closed contradicted fact spanning the candidate's start is shortened to it.
pub async fn resolve_relationships(
    store: &dyn GraphStore,
    policy: &dyn ContradictionPolicy,
    candidates: Vec<Edge>,
    uuid_map: &UuidMap,
    canonical_nodes: &[EntityNode],
    episode: &EpisodicNode,
) -> Result<RelationshipResolution> {
    let now = Utc::now();
    let reference_time = episode.reference_time();
    let canonical: HashSet<Uuid> = canonical_nodes
        .iter()
        .map(|n| n.uuid)
        .chain(uuid_map.canonical_uuids().iter().copied())
        .collect();
    let rewrite = |uuid: Uuid| {
        uuid_map
            .resolve(uuid)
            .or_else(|| canonical.contains(&uuid).then_some(uuid))
            .filter(|u| canonical.contains(u))
    };

    let mut stats = RelationshipStats::default();
    let mut arena: Vec<Tracked> = Vec::new();
    let mut by_pair: HashMap<(Uuid, Uuid), Vec<usize>> = HashMap::new();

    for mut candidate in candidates {
        stats.candidates += 1;
        let (Some(source), Some(target)) = (rewrite(candidate.source_node_uuid), rewrite(candidate.target_node_uuid))
        else {
            log::warn!("Dropping fact '{}': endpoint is not a canonical entity", candidate.fact);
            stats.dropped += 1;
            continue;
        };
        if source == target {
            log::warn!("Dropping self-referential fact '{}'", candidate.fact);
            stats.dropped += 1;
            continue;
        }

        candidate.source_node_uuid = source;
        candidate.target_node_uuid = target;
        candidate.group_id = episode.group_id.clone();
        candidate.name = relation_class(&candidate.name);
        candidate.add_episode(episode.uuid);
        anchor(&mut candidate, reference_time);

        if let Some(ended) = candidate.invalid_at {
            candidate.invalidate(ended, now);
            log::debug!("Storing historical fact '{}'", candidate.fact);
            stats.historical += 1;
            arena.push(Tracked::new(candidate));
            continue;
        }

        let pair = (source, target);
        if !by_pair.contains_key(&pair) {
            let live = store.live_edges_between(source, target).await?;
            let closed = store
                .edges_for_node(source, Some(EdgeKind::RelatesTo))
                .await?
                .into_iter()
                .filter(|e| e.source_node_uuid == source && e.target_node_uuid == target && !e.is_live());
            let mut slots = Vec::new();
            for edge in live.into_iter().chain(closed) {
                slots.push(arena.len());
                arena.push(Tracked::loaded(edge));
            }
            by_pair.insert(pair, slots);
        }
        let (live, closed): (Vec<usize>, Vec<usize>) = by_pair
            .get(&pair)
            .map(|slots| slots.iter().copied().partition(|&s| arena[s].edge.is_live()))
            .unwrap_or_default();

        let mut restated_by = None;
        let mut contradicted = Vec::new();
        for slot in live {
            match policy.classify(&candidate, &arena[slot].edge).await? {
                Classification::Restatement => {
                    restated_by = Some(slot);
                    break;
                }
                Classification::Contradiction => contradicted.push(slot),
                Classification::Compatible => {}
            }
        }

        if let Some(slot) = restated_by {
            let tracked = &mut arena[slot];
            if tracked.edge.add_episode(episode.uuid) {
                log::debug!("Fact '{}' restated", tracked.edge.fact);
            }
            tracked.restated = true;
            stats.restated += 1;
            continue;
        }

        let candidate_start = candidate.valid_at.unwrap_or(reference_time);
        let mut candidate_end: Option<DateTime<Utc>> = None;

        for slot in contradicted {
            let existing_start = arena[slot].edge.valid_at;
            match existing_start {
                // Older news: the stored fact already superseded it
                Some(existing_start) if candidate_start < existing_start => bound_end(&mut candidate_end, existing_start),
                _ => {
                    close(&mut arena[slot], candidate_start, now);
                    stats.invalidated += 1;
                }
            }
        }

        for slot in closed {
            let earlier = &arena[slot].edge;
            let Some(closed_start) = earlier.valid_at else { continue };
            let spans_start = earlier.valid_as_of(candidate_start);
            if !spans_start && closed_start <= candidate_start {
                continue;
            }
            if policy.classify(&candidate, earlier).await? != Classification::Contradiction {
                continue;
            }
            if spans_start {
                close(&mut arena[slot], candidate_start, now);
                stats.trimmed += 1;
            } else {
                bound_end(&mut candidate_end, closed_start);
            }
        }

        let slot = arena.len();
        match candidate_end {
            Some(end) => {
                candidate.invalidate(end, now);
                stats.historical += 1;
            }
            None => stats.created += 1,
        }
        arena.push(Tracked::new(candidate));
        if let Some(pair_slots) = by_pair.get_mut(&pair) {
            pair_slots.push(slot);
        }
    }

    let mut resolution = RelationshipResolution { stats, ..Default::default() };
    for tracked in arena {
        match (tracked.stored, tracked.changed, tracked.restated) {
            (false, _, _) => resolution.resolved.push(tracked.edge),
            (true, true, _) => resolution.invalidated.push(tracked.edge),
            (true, false, true) => resolution.resolved.push(tracked.edge),
            (true, false, false) => {}
        }
    }

    log::debug!(
        "Fact resolution: {} candidates, {} new, {} restated, {} invalidated, {} trimmed, {} historical, {} dropped",
        stats.candidates,
        stats.created,
        stats.restated,
        stats.invalidated,
        stats.trimmed,
        stats.historical,
        stats.dropped
    );
    Ok(resolution)
}

/// Attach candidate facts without consulting stored facts: endpoints are rewritten through
/// `uuid_map`, every surviving candidate is stored as new.
pub fn identity_relationships(candidates: Vec<Edge>, uuid_map: &UuidMap, episode: &EpisodicNode) -> RelationshipResolution {
    let now = Utc::now();
    let mut resolution = RelationshipResolution::default();

    for mut candidate in candidates {
        resolution.stats.candidates += 1;
        let (Some(source), Some(target)) =
            (uuid_map.resolve(candidate.source_node_uuid), uuid_map.resolve(candidate.target_node_uuid))
        else {
            resolution.stats.dropped += 1;
            continue;
        };
        if source == target {
            resolution.stats.dropped += 1;
            continue;
        }
        candidate.source_node_uuid = source;
        candidate.target_node_uuid = target;
        candidate.group_id = episode.group_id.clone();
        candidate.name = relation_class(&candidate.name);
        candidate.add_episode(episode.uuid);
        anchor(&mut candidate, episode.reference_time());
        if let Some(ended) = candidate.invalid_at {
            candidate.invalidate(ended, now);
            resolution.stats.historical += 1;
        } else {
            resolution.stats.created += 1;
        }
        resolution.resolved.push(candidate);
    }
    resolution
}

fn bound_end(end: &mut Option<DateTime<Utc>>, at: DateTime<Utc>) {
    *end = Some(end.map_or(at, |e| e.min(at)));
}

fn close(tracked: &mut Tracked, at: DateTime<Utc>, now: DateTime<Utc>) {
    log::debug!("Closing fact '{}' at {}", tracked.edge.fact, at);
    tracked.edge.invalidate(at, now);
    tracked.changed = true;
}

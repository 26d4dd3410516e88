//! Cross-chunk entity deduplication.

use chrono::Utc;
use std::collections::{BTreeSet, HashSet};
use uuid::Uuid;

use super::uuid_map::{UuidMap, UuidMapBuilder};
use crate::embeddings::cosine_similarity;
use crate::models::{normalize_text, EntityNode};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupeStats {
    pub candidates: usize,
    pub dropped: usize,
    pub merged: usize,
    pub created: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DedupeResult {
    pub uuid_map: UuidMap,
    /// Canonical nodes created or updated by this call, in arena order.
    pub nodes: Vec<EntityNode>,
    /// Canonical UUIDs each chunk's candidates resolved to, in first-seen order.
    pub chunk_nodes: Vec<Vec<Uuid>>,
    pub stats: DedupeStats,
}

impl DedupeResult {
    pub fn node(&self, uuid: Uuid) -> Option<&EntityNode> {
        self.nodes.iter().find(|n| n.uuid == uuid)
    }
}

/// Similarity of a candidate to a pool member. Equal normalized names score 1.0;
/// otherwise name embeddings are compared when both exist.
fn similarity(a: &EntityNode, b: &EntityNode) -> f32 {
    if normalize_text(&a.name) == normalize_text(&b.name) {
        return 1.0;
    }
    match (&a.embedding, &b.embedding) {
        (Some(x), Some(y)) => cosine_similarity(x, y),
        _ => 0.0,
    }
}

/// Fold candidates (per chunk, in chunk order) into canonical entities.
///
/// The pool starts with `context` (existing canonical entities of the same group). A
/// candidate merges into the most similar type-compatible pool member scoring at least
/// `threshold`, or becomes canonical itself.
pub fn resolve_entities(candidates: Vec<Vec<EntityNode>>, context: Vec<EntityNode>, threshold: f32) -> DedupeResult {
    let now = Utc::now();
    let group = candidates.iter().flatten().map(|c| c.group_id.clone()).next();

    let mut builder = UuidMapBuilder::new();
    let mut pool: Vec<EntityNode> = Vec::new();
    let mut touched = BTreeSet::new();
    let mut stats = DedupeStats::default();

    for node in context {
        if Some(&node.group_id) != group.as_ref() {
            continue;
        }
        if node.uuid.is_nil() || node.name.trim().is_empty() || builder.lookup(node.uuid).is_some() {
            continue;
        }
        let slot = builder.add_canonical(node.uuid);
        for alias in &node.merged_uuids {
            if builder.lookup(*alias).is_none() {
                builder.map(*alias, slot);
            }
        }
        pool.push(node);
    }

    let mut chunk_nodes = Vec::with_capacity(candidates.len());
    for chunk in candidates {
        let mut visible = Vec::new();
        let mut seen = HashSet::new();

        for candidate in chunk {
            stats.candidates += 1;
            if candidate.uuid.is_nil() || candidate.name.trim().is_empty() {
                log::warn!("Dropping malformed entity candidate {:?}", candidate.name);
                stats.dropped += 1;
                continue;
            }
            if Some(&candidate.group_id) != group.as_ref() {
                log::warn!("Dropping entity candidate {} from group {}", candidate.name, candidate.group_id);
                stats.dropped += 1;
                continue;
            }

            let slot = match builder.lookup(candidate.uuid) {
                // Already canonical or merged before (re-resolution of our own output)
                Some(i) => {
                    pool[i].absorb(&candidate, now);
                    i
                }
                None => {
                    let best = pool
                        .iter()
                        .enumerate()
                        .filter(|(_, member)| member.type_compatible(&candidate))
                        .map(|(i, member)| (i, similarity(&candidate, member)))
                        .fold(None::<(usize, f32)>, |best, (i, s)| match best {
                            Some((_, b)) if b >= s => best,
                            _ => Some((i, s)),
                        });

                    match best {
                        Some((i, score)) if score >= threshold => {
                            log::debug!(
                                "Merging '{}' into '{}' (similarity {:.3})",
                                candidate.name,
                                pool[i].name,
                                score
                            );
                            pool[i].absorb(&candidate, now);
                            builder.map(candidate.uuid, i);
                            stats.merged += 1;
                            i
                        }
                        _ => {
                            let i = builder.add_canonical(candidate.uuid);
                            pool.push(candidate);
                            stats.created += 1;
                            i
                        }
                    }
                }
            };

            touched.insert(slot);
            if seen.insert(slot) {
                visible.push(pool[slot].uuid);
            }
        }
        chunk_nodes.push(visible);
    }

    log::debug!(
        "Entity resolution: {} candidates, {} created, {} merged, {} dropped",
        stats.candidates,
        stats.created,
        stats.merged,
        stats.dropped
    );

    DedupeResult {
        uuid_map: builder.build(),
        nodes: touched.into_iter().map(|i| pool[i].clone()).collect(),
        chunk_nodes,
        stats,
    }
}

/// Keep every well-formed candidate as its own canonical entity, without merging.
pub fn identity_entities(candidates: Vec<Vec<EntityNode>>) -> DedupeResult {
    let mut builder = UuidMapBuilder::new();
    let mut nodes = Vec::new();
    let mut stats = DedupeStats::default();
    let mut chunk_nodes = Vec::with_capacity(candidates.len());

    for chunk in candidates {
        let mut visible = Vec::new();
        for candidate in chunk {
            stats.candidates += 1;
            if candidate.uuid.is_nil() || candidate.name.trim().is_empty() {
                stats.dropped += 1;
                continue;
            }
            if builder.lookup(candidate.uuid).is_some() {
                continue;
            }
            builder.add_canonical(candidate.uuid);
            visible.push(candidate.uuid);
            nodes.push(candidate);
            stats.created += 1;
        }
        chunk_nodes.push(visible);
    }

    DedupeResult { uuid_map: builder.build(), nodes, chunk_nodes, stats }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, ty: &str, embedding: Option<Vec<f32>>) -> EntityNode {
        let mut n = EntityNode::new(name, ty, "g1", Utc::now());
        n.embedding = embedding;
        n
    }

    /// Unit vector at cosine `s` from [1, 0].
    fn at_similarity(s: f32) -> Vec<f32> {
        vec![s, (1.0 - s * s).sqrt()]
    }

    #[test]
    fn test_identity_keeps_duplicates_apart() {
        let a = node("Alice", "Person", None);
        let b = node("Alice", "Person", None);
        let blank = node("  ", "Person", None);
        let result = identity_entities(vec![vec![a.clone(), blank], vec![b.clone()]]);

        assert_eq!(result.stats.created, 2);
        assert_eq!(result.stats.dropped, 1);
        assert_eq!(result.uuid_map.resolve(b.uuid), Some(b.uuid));
        assert_eq!(result.chunk_nodes, vec![vec![a.uuid], vec![b.uuid]]);
    }

    #[test]
    fn test_exact_name_merges_across_chunks() {
        let a = node("Alice", "Person", None);
        let b = node("alice ", "Person", None);
        let result = resolve_entities(vec![vec![a.clone()], vec![b.clone()]], vec![], 0.85);

        assert_eq!(result.stats.created, 1);
        assert_eq!(result.stats.merged, 1);
        assert_eq!(result.uuid_map.resolve(b.uuid), Some(a.uuid));
        assert_eq!(result.chunk_nodes, vec![vec![a.uuid], vec![a.uuid]]);
        assert_eq!(result.nodes.len(), 1);
    }

    #[test]
    fn test_threshold_boundary() {
        let anchor = node("Robert Smith", "Person", Some(vec![1.0, 0.0]));
        let close = node("Bob Smith", "Person", Some(at_similarity(0.9)));
        let near = node("Rob Smith", "Person", Some(at_similarity(0.86)));
        let far = node("Roberta Smythe", "Person", Some(at_similarity(0.80)));

        let result = resolve_entities(vec![vec![close.clone(), near.clone(), far.clone()]], vec![anchor.clone()], 0.85);
        assert_eq!(result.uuid_map.resolve(close.uuid), Some(anchor.uuid));
        assert_eq!(result.uuid_map.resolve(near.uuid), Some(anchor.uuid));
        assert_eq!(result.uuid_map.resolve(far.uuid), Some(far.uuid));
        assert_eq!(result.stats.merged, 2);
        assert_eq!(result.stats.created, 1);
    }

    #[test]
    fn test_incompatible_types_do_not_merge() {
        let person = node("Mercury", "Person", None);
        let planet = node("Mercury", "Planet", None);
        let generic = node("Mercury", "", None);
        let result = resolve_entities(vec![vec![person.clone(), planet.clone(), generic.clone()]], vec![], 0.85);
        assert_eq!(result.stats.created, 2);
        assert_eq!(result.uuid_map.resolve(generic.uuid), Some(person.uuid));
    }

    #[test]
    fn test_malformed_and_foreign_context() {
        let mut nil = node("Ghost", "Person", None);
        nil.uuid = Uuid::nil();
        let blank = node("  ", "Person", None);
        let mut foreign = node("Alice", "Person", None);
        foreign.group_id = "other".into();
        let alice = node("Alice", "Person", None);

        let result = resolve_entities(vec![vec![nil, blank, alice.clone()]], vec![foreign.clone()], 0.85);
        assert_eq!(result.stats.dropped, 2);
        assert_eq!(result.stats.created, 1);
        assert_eq!(result.uuid_map.resolve(alice.uuid), Some(alice.uuid));
        assert_eq!(result.uuid_map.resolve(foreign.uuid), None);
    }

    #[test]
    fn test_idempotent_against_own_output() {
        let chunks = vec![
            vec![node("Alice", "Person", None), node("Acme", "Organization", None)],
            vec![node("alice", "Person", None)],
        ];
        let first = resolve_entities(chunks.clone(), vec![], 0.85);
        assert_eq!(first.stats.created, 2);

        assert_eq!(first.stats.merged, 1);

        let second = resolve_entities(chunks, first.nodes.clone(), 0.85);
        assert_eq!(second.stats.created, 0);
        assert_eq!(second.stats.merged, 0);
        assert_eq!(second.nodes.len(), 2);
        assert_eq!(second.chunk_nodes, first.chunk_nodes);
        let mut before: Vec<_> = first.nodes.iter().map(|n| n.uuid).collect();
        let mut after: Vec<_> = second.nodes.iter().map(|n| n.uuid).collect();
        before.sort();
        after.sort();
        assert_eq!(before, after);
    }

    #[test]
    fn test_merge_keeps_canonical_identity() {
        let mut a = node("Alice", "Entity", None);
        a.summary = "Engineer.".into();
        let mut b = node("Alice", "Person", None);
        b.summary = "Leads the API redesign.".into();
        b.attributes.insert("team".into(), "platform".into());
        let b_uuid = b.uuid;

        let result = resolve_entities(vec![vec![b]], vec![a.clone()], 0.85);
        let merged = result.node(a.uuid).unwrap();
        assert_eq!(merged.merged_uuids, vec![b_uuid]);
        assert_eq!(merged.entity_type, "Person");
        assert_eq!(merged.summary, "Engineer. Leads the API redesign.");
        assert_eq!(merged.attributes["team"], "platform");
    }
}

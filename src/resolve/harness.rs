//! Property checks for resolution strategies against synthetic input.

use chrono::{Duration, TimeZone, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::ResolutionStrategy;
use crate::error::Result;
use crate::models::{Edge, EntityNode, EpisodeInput, EpisodicNode, Node};
use crate::store::GraphStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StrategyReport {
    pub checks: Vec<StrategyCheck>,
}

impl StrategyReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn violations(&self) -> impl Iterator<Item = &StrategyCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }

    fn check(&mut self, name: &'static str, passed: bool, detail: impl Into<String>) {
        let detail = detail.into();
        if !passed {
            log::warn!("Strategy check {} failed: {}", name, detail);
        }
        self.checks.push(StrategyCheck { name, passed, detail });
    }
}

/// Run a strategy over synthetic entities and facts and report violated properties.
///
/// Entity and fact resolution only read from `store`. With `include_communities`, a
/// throwaway group is written, clustered and cleared again.
pub async fn validate_strategy(
    strategy: &dyn ResolutionStrategy,
    store: &dyn GraphStore,
    include_communities: bool,
) -> Result<StrategyReport> {
    let group = format!("strategy-check-{}", &Uuid::new_v4().simple().to_string()[..8]);
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now);
    let mut report = StrategyReport::default();

    let alice = EntityNode::new("Alice", "Person", &group, t0);
    let alice_again = EntityNode::new("alice", "Person", &group, t0);
    let acme = EntityNode::new("Acme", "Organization", &group, t0);
    let blank = EntityNode::new("   ", "Person", &group, t0);
    let chunks = vec![vec![alice.clone(), acme.clone()], vec![alice_again.clone(), blank.clone()]];

    let dedupe = match strategy.resolve_entities(chunks.clone(), Vec::new()).await {
        Ok(d) => d,
        Err(e) => {
            report.check("resolve_entities", false, e.to_string());
            return Ok(report);
        }
    };

    let mapped = [alice.uuid, alice_again.uuid, acme.uuid].iter().all(|u| dedupe.uuid_map.resolve(*u).is_some());
    report.check("entities_mapped", mapped, "every well-formed candidate resolves to a canonical uuid");

    let canonical: HashSet<Uuid> = dedupe.nodes.iter().map(|n| n.uuid).collect();
    let targets_known = [alice.uuid, alice_again.uuid, acme.uuid]
        .iter()
        .filter_map(|u| dedupe.uuid_map.resolve(*u))
        .all(|c| canonical.contains(&c));
    report.check("entities_canonical_returned", targets_known, "mapped canonical nodes are returned");

    let same = dedupe.uuid_map.resolve(alice.uuid).is_some()
        && dedupe.uuid_map.resolve(alice.uuid) == dedupe.uuid_map.resolve(alice_again.uuid);
    report.check("entities_exact_name_merge", same, "'Alice' and 'alice' share one canonical entity");

    report.check(
        "entities_malformed_dropped",
        dedupe.uuid_map.resolve(blank.uuid).is_none(),
        "a blank-named candidate is not mapped",
    );
    report.check(
        "entities_chunk_visibility",
        dedupe.chunk_nodes.len() == chunks.len(),
        format!("{} chunk entries for {} chunks", dedupe.chunk_nodes.len(), chunks.len()),
    );

    match strategy.resolve_entities(chunks, dedupe.nodes.clone()).await {
        Ok(second) => {
            let again: HashSet<Uuid> = second.nodes.iter().map(|n| n.uuid).collect();
            report.check(
                "entities_idempotent",
                again.is_subset(&canonical),
                format!("{} canonical after first pass, {} after second", canonical.len(), again.len()),
            );
        }
        Err(e) => report.check("entities_idempotent", false, e.to_string()),
    }

    let (Some(a), Some(c)) = (dedupe.uuid_map.resolve(alice.uuid), dedupe.uuid_map.resolve(acme.uuid)) else {
        return Ok(report);
    };
    let episode: EpisodicNode =
        EpisodeInput::new("strategy-check", "Alice joined Acme, then became CTO.", &group, t0 + Duration::days(2))
            .into_node(t0);
    let mut joined = Edge::relates_to(&group, alice.uuid, acme.uuid, "ROLE_AT", "Alice is an engineer at Acme", t0);
    joined.valid_at = Some(t0);
    let mut promoted = Edge::relates_to(&group, alice_again.uuid, acme.uuid, "ROLE_AT", "Alice is CTO at Acme", t0);
    promoted.valid_at = Some(t0 + Duration::days(1));
    let self_loop = Edge::relates_to(&group, alice.uuid, alice_again.uuid, "KNOWS", "Alice knows herself", t0);

    match strategy
        .resolve_relationships(vec![joined, promoted, self_loop], &dedupe.uuid_map, &dedupe.nodes, &episode)
        .await
    {
        Ok(resolution) => {
            let all: Vec<&Edge> = resolution.resolved.iter().chain(resolution.invalidated.iter()).collect();
            report.check(
                "relationships_endpoints_canonical",
                all.iter().all(|e| [a, c].contains(&e.source_node_uuid) && [a, c].contains(&e.target_node_uuid)),
                "fact endpoints are canonical entities",
            );
            report.check(
                "relationships_no_self_loops",
                all.iter().all(|e| e.source_node_uuid != e.target_node_uuid),
                "self-referential facts are dropped",
            );
            report.check(
                "relationships_provenance",
                resolution.resolved.iter().all(|e| e.episodes.contains(&episode.uuid)),
                "resolved facts cite the episode",
            );
            report.check(
                "relationships_interval",
                all.iter().all(|e| match (e.valid_at, e.invalid_at) {
                    (Some(v), Some(i)) => i >= v,
                    _ => true,
                }),
                "invalid_at never precedes valid_at",
            );
            let mut live: HashMap<(Uuid, Uuid, String), usize> = HashMap::new();
            for e in all.iter().filter(|e| e.is_live()) {
                *live.entry((e.source_node_uuid, e.target_node_uuid, e.relation_class())).or_default() += 1;
            }
            report.check(
                "relationships_exclusive",
                live.values().all(|n| *n <= 1),
                "at most one live fact per pair and relation class",
            );
        }
        Err(e) => report.check("resolve_relationships", false, e.to_string()),
    }

    if include_communities {
        check_communities(strategy, store, &group, &mut report).await?;
    }
    Ok(report)
}

async fn check_communities(
    strategy: &dyn ResolutionStrategy,
    store: &dyn GraphStore,
    group: &str,
    report: &mut StrategyReport,
) -> Result<()> {
    let now = Utc::now();
    let names = ["Ada", "Grace", "Linus", "Ken"];
    let entities: Vec<EntityNode> = names.iter().map(|n| EntityNode::new(*n, "Person", group, now)).collect();
    let nodes: Vec<Node> = entities.iter().cloned().map(Node::from).collect();
    store.upsert_nodes(&nodes).await?;
    let facts = vec![
        Edge::relates_to(group, entities[0].uuid, entities[1].uuid, "WORKS_WITH", "Ada works with Grace", now),
        Edge::relates_to(group, entities[2].uuid, entities[3].uuid, "WORKS_WITH", "Linus works with Ken", now),
    ];
    store.upsert_edges(&facts).await?;

    let outcome = strategy.build_communities(group, true).await;
    let memberships = store.community_memberships(group).await;
    store.clear(Some(group)).await?;

    match (outcome, memberships) {
        (Ok(_), Ok(memberships)) => {
            let covered = entities.iter().all(|e| memberships.contains_key(&e.uuid));
            report.check("communities_cover_entities", covered, "every entity belongs to a community");
            let paired = memberships.get(&entities[0].uuid) == memberships.get(&entities[1].uuid);
            report.check("communities_follow_edges", paired, "connected entities share a community");
        }
        (Err(e), _) | (_, Err(e)) => report.check("build_communities", false, e.to_string()),
    }
    Ok(())
}

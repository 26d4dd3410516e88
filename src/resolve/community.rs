//! Community detection by label propagation over live facts.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

use crate::embeddings::Embedder;
use crate::error::Result;
use crate::extraction::Extractor;
use crate::models::{CommunityNode, Edge, EdgeKind, EntityNode, Node};
use crate::store::{GraphStore, TemporalFilter};

/// Undirected adjacency weighted by the number of edges between two entities.
pub type Adjacency = HashMap<Uuid, BTreeMap<Uuid, usize>>;

pub fn adjacency<'a>(edges: impl IntoIterator<Item = &'a Edge>) -> Adjacency {
    let mut adj: Adjacency = HashMap::new();
    for edge in edges {
        let (a, b) = (edge.source_node_uuid, edge.target_node_uuid);
        if a == b {
            continue;
        }
        *adj.entry(a).or_default().entry(b).or_default() += 1;
        *adj.entry(b).or_default().entry(a).or_default() += 1;
    }
    adj
}

/// Cluster `nodes` by label propagation restricted to edges among them.
///
/// Nodes are visited in UUID order and adopt the label with the largest neighbor weight,
/// ties going to the smallest label. Stops at a fixed point or after `max_iterations`.
/// Returns clusters sorted by their smallest member.
pub fn label_propagation(nodes: &[Uuid], adj: &Adjacency, max_iterations: usize) -> Vec<Vec<Uuid>> {
    let order: BTreeSet<Uuid> = nodes.iter().copied().collect();
    let mut labels: HashMap<Uuid, Uuid> = order.iter().map(|n| (*n, *n)).collect();

    for iteration in 0..max_iterations {
        let mut changed = false;
        for node in &order {
            let mut tally: BTreeMap<Uuid, usize> = BTreeMap::new();
            if let Some(neighbors) = adj.get(node) {
                for (neighbor, weight) in neighbors {
                    if let Some(label) = labels.get(neighbor) {
                        *tally.entry(*label).or_default() += weight;
                    }
                }
            }
            let best = tally
                .iter()
                .fold(None::<(Uuid, usize)>, |best, (label, count)| match best {
                    Some((_, c)) if c >= *count => best,
                    _ => Some((*label, *count)),
                });
            if let Some((label, _)) = best {
                if labels.get(node) != Some(&label) {
                    labels.insert(*node, label);
                    changed = true;
                }
            }
        }
        if !changed {
            log::debug!("Label propagation converged after {} iterations", iteration + 1);
            break;
        }
    }

    let mut clusters: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
    for node in &order {
        if let Some(label) = labels.get(node) {
            clusters.entry(*label).or_default().push(*node);
        }
    }
    let mut clusters: Vec<Vec<Uuid>> = clusters.into_values().collect();
    clusters.sort_by_key(|c| c[0]);
    clusters
}

/// Place unassigned entities into existing communities where their neighbors are.
///
/// An entity whose neighbors sit in one community joins it; with several, the one with
/// the most connecting edges wins (ties by UUID). Returns the new memberships and the
/// entities left unassigned.
pub fn assign_to_neighbors(
    unassigned: &[Uuid],
    memberships: &HashMap<Uuid, Uuid>,
    adj: &Adjacency,
) -> (HashMap<Uuid, Uuid>, Vec<Uuid>) {
    let mut joined = HashMap::new();
    let mut rest = Vec::new();
    let order: BTreeSet<Uuid> = unassigned.iter().copied().collect();

    for entity in order {
        let mut tally: BTreeMap<Uuid, usize> = BTreeMap::new();
        if let Some(neighbors) = adj.get(&entity) {
            for (neighbor, weight) in neighbors {
                let community = memberships.get(neighbor).or_else(|| joined.get(neighbor));
                if let Some(c) = community {
                    *tally.entry(*c).or_default() += weight;
                }
            }
        }
        let modal = tally
            .iter()
            .fold(None::<(Uuid, usize)>, |best, (c, n)| match best {
                Some((_, b)) if b >= *n => best,
                _ => Some((*c, *n)),
            });
        match modal {
            Some((community, _)) => {
                joined.insert(entity, community);
            }
            None => rest.push(entity),
        }
    }
    (joined, rest)
}

/// Communities written by one build.
#[derive(Debug, Clone, Default)]
pub struct CommunityReport {
    /// New or re-summarized community nodes.
    pub communities: Vec<CommunityNode>,
    /// New membership edges.
    pub memberships: Vec<Edge>,
    /// Entities that received a community in this run.
    pub assigned: usize,
}

/// Cluster the group's entities and persist communities with membership edges.
///
/// Incremental unless `rebuild`: existing members stay put and only unassigned entities
/// are placed. `rebuild` deletes the group's communities first.
pub async fn build_communities(
    store: &dyn GraphStore,
    embedder: &dyn Embedder,
    extractor: &Extractor,
    group_id: &str,
    rebuild: bool,
    max_iterations: usize,
) -> Result<CommunityReport> {
    let start = std::time::Instant::now();
    if rebuild {
        let removed = store.delete_communities(group_id).await?;
        log::debug!("Removed {} communities from group {}", removed, group_id);
    }

    let entities = store.entity_nodes(group_id).await?;
    let by_uuid: HashMap<Uuid, &EntityNode> = entities.iter().map(|e| (e.uuid, e)).collect();
    let facts = store.edges_of_kind(group_id, EdgeKind::RelatesTo, TemporalFilter::live()).await?;
    let adj = adjacency(&facts);
    let memberships = store.community_memberships(group_id).await?;

    let unassigned: Vec<Uuid> = entities
        .iter()
        .map(|e| e.uuid)
        .filter(|u| !memberships.contains_key(u))
        .collect();
    if unassigned.is_empty() {
        return Ok(CommunityReport::default());
    }

    let (joined, rest) = assign_to_neighbors(&unassigned, &memberships, &adj);
    let new_clusters = label_propagation(&rest, &adj, max_iterations);

    let now = Utc::now();
    let mut report = CommunityReport::default();

    // Existing communities that gained members
    let mut grown: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
    for (entity, community) in &joined {
        grown.entry(*community).or_default().push(*entity);
    }
    for (community_uuid, mut new_members) in grown {
        new_members.sort();
        let Some(mut community) = store.get_node(community_uuid).await?.and_then(Node::into_community) else {
            log::warn!("Community {} vanished during assignment", community_uuid);
            continue;
        };
        let mut members = store.community_members(community_uuid).await?;
        members.extend(new_members.iter().copied());
        let member_nodes: Vec<EntityNode> = members.iter().filter_map(|u| by_uuid.get(u).map(|e| (*e).clone())).collect();

        let summary = extractor.summarize_community(&member_nodes).await?;
        if summary.name != community.name {
            community.embedding = Some(embedder.embed(&summary.name).await?);
            community.name = summary.name;
        }
        community.summary = summary.summary;
        community.member_count = members.len();
        community.updated_at = now;

        for entity in new_members {
            report.memberships.push(Edge::has_member(group_id, community_uuid, entity, now));
        }
        report.communities.push(community);
    }

    for cluster in new_clusters {
        let member_nodes: Vec<EntityNode> = cluster.iter().filter_map(|u| by_uuid.get(u).map(|e| (*e).clone())).collect();
        let summary = extractor.summarize_community(&member_nodes).await?;
        let community = CommunityNode {
            uuid: Uuid::new_v4(),
            embedding: Some(embedder.embed(&summary.name).await?),
            name: summary.name,
            group_id: group_id.to_string(),
            summary: summary.summary,
            created_at: now,
            updated_at: now,
            valid_from: now,
            member_count: cluster.len(),
        };
        for entity in &cluster {
            report.memberships.push(Edge::has_member(group_id, community.uuid, *entity, now));
        }
        report.communities.push(community);
    }

    report.assigned = unassigned.len();

    let nodes: Vec<Node> = report.communities.iter().cloned().map(Node::from).collect();
    let node_report = store.upsert_nodes(&nodes).await?;
    let edge_report = store.upsert_edges(&report.memberships).await?;
    for failure in node_report.failures.iter().chain(edge_report.failures.iter()) {
        log::warn!("Failed to persist community record {}: {}", failure.uuid, failure.error);
    }

    log::info!(
        "Communities for {}: {} written, {} entities assigned in {:?}",
        group_id,
        report.communities.len(),
        report.assigned,
        start.elapsed()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ids(n: usize) -> Vec<Uuid> {
        let mut v: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
        v.sort();
        v
    }

    fn link(a: Uuid, b: Uuid) -> Edge {
        Edge::relates_to("g", a, b, "KNOWS", "knows", Utc::now())
    }

    #[test]
    fn test_two_components_two_clusters() {
        let n = ids(5);
        let edges = vec![link(n[0], n[1]), link(n[1], n[2]), link(n[3], n[4])];
        let clusters = label_propagation(&n, &adjacency(&edges), 20);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0], vec![n[0], n[1], n[2]]);
        assert_eq!(clusters[1], vec![n[3], n[4]]);
    }

    #[test]
    fn test_isolated_nodes_are_singletons() {
        let n = ids(3);
        let clusters = label_propagation(&n, &Adjacency::new(), 20);
        assert_eq!(clusters, vec![vec![n[0]], vec![n[1]], vec![n[2]]]);
    }

    #[test]
    fn test_deterministic() {
        let n = ids(6);
        let edges = vec![
            link(n[0], n[1]),
            link(n[1], n[2]),
            link(n[2], n[0]),
            link(n[3], n[4]),
            link(n[4], n[5]),
            link(n[2], n[3]),
        ];
        let adj = adjacency(&edges);
        let first = label_propagation(&n, &adj, 20);
        let second = label_propagation(&n, &adj, 20);
        assert_eq!(first, second);
        assert_eq!(first.iter().map(Vec::len).sum::<usize>(), 6);
    }

    #[test]
    fn test_assign_to_neighbors() {
        let n = ids(5);
        let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
        let memberships: HashMap<Uuid, Uuid> = [(n[0], c1), (n[1], c2), (n[2], c2)].into_iter().collect();
        // n[3] touches c1 once and c2 twice; n[4] is isolated
        let edges = vec![link(n[3], n[0]), link(n[3], n[1]), link(n[3], n[2])];
        let (joined, rest) = assign_to_neighbors(&[n[3], n[4]], &memberships, &adjacency(&edges));
        assert_eq!(joined.get(&n[3]), Some(&c2));
        assert_eq!(rest, vec![n[4]]);
    }

    #[test]
    fn test_self_loops_ignored() {
        let n = ids(1);
        let adj = adjacency(&[link(n[0], n[0])]);
        assert!(adj.is_empty());
    }
}

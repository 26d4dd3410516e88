//! Post-fusion rerankers.

use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

use super::fusion::sort_and_rank;
use super::{Scored, SearchItem};
use crate::error::{Result, TempographError};

/// Pairwise relevance scorer, e.g. a hosted cross-encoder model.
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    /// One score in `[0, 1]` per passage, in input order.
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>>;
}

/// Replace scores with cross-encoder scores and re-sort.
pub async fn cross_encoder<T: SearchItem>(
    encoder: &dyn CrossEncoder,
    query: &str,
    mut items: Vec<Scored<T>>,
) -> Result<Vec<Scored<T>>> {
    if items.is_empty() {
        return Ok(items);
    }
    let passages: Vec<String> = items.iter().map(|s| s.item.passage()).collect();
    let scores = encoder.score(query, &passages).await?;
    if scores.len() != items.len() {
        return Err(TempographError::Search(format!(
            "cross-encoder returned {} scores for {} passages",
            scores.len(),
            items.len()
        )));
    }
    for (scored, score) in items.iter_mut().zip(scores) {
        scored.score = score.clamp(0.0, 1.0);
    }
    sort_and_rank(&mut items);
    Ok(items)
}

/// Score by hop distance from a center node: `1 / (1 + hops)`, 0 when unreachable.
///
/// `distances` maps reached nodes to their hop count; an item's distance is the smallest
/// over its anchors. Stable for equal scores.
pub fn node_distance<T: SearchItem>(mut items: Vec<Scored<T>>, distances: &HashMap<Uuid, usize>) -> Vec<Scored<T>> {
    for scored in &mut items {
        let hops = scored.item.anchors().iter().filter_map(|a| distances.get(a)).min().copied();
        scored.score = hops.map_or(0.0, |h| 1.0 / (1.0 + h as f32));
    }
    stable_rank(&mut items);
    items
}

/// Score by how many episodes back the item, relative to the best-backed item.
pub fn episode_mentions<T: SearchItem>(mut items: Vec<Scored<T>>, counts: &HashMap<Uuid, usize>) -> Vec<Scored<T>> {
    let mentions: Vec<usize> = items.iter().map(|s| s.item.mention_count(counts)).collect();
    let max = mentions.iter().copied().max().unwrap_or(0);
    for (scored, n) in items.iter_mut().zip(mentions) {
        scored.score = if max == 0 { 0.0 } else { n as f32 / max as f32 };
    }
    stable_rank(&mut items);
    items
}

/// Sort by score descending keeping the previous order for ties.
fn stable_rank<T>(items: &mut [Scored<T>]) {
    items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    for (idx, scored) in items.iter_mut().enumerate() {
        scored.rank = idx + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Edge, EntityNode};
    use chrono::Utc;

    fn scored_nodes(names: &[&str]) -> Vec<Scored<EntityNode>> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| Scored {
                item: EntityNode::new(*n, "Person", "g", Utc::now()),
                score: 1.0 - i as f32 * 0.1,
                rank: i + 1,
            })
            .collect()
    }

    struct LengthEncoder;

    #[async_trait]
    impl CrossEncoder for LengthEncoder {
        async fn score(&self, _query: &str, passages: &[String]) -> Result<Vec<f32>> {
            Ok(passages.iter().map(|p| p.len() as f32 / 10.0).collect())
        }
    }

    struct BrokenEncoder;

    #[async_trait]
    impl CrossEncoder for BrokenEncoder {
        async fn score(&self, _query: &str, _passages: &[String]) -> Result<Vec<f32>> {
            Ok(vec![0.5])
        }
    }

    #[tokio::test]
    async fn test_cross_encoder_resorts() {
        let items = scored_nodes(&["Al", "Alexandra", "Bob"]);
        let reranked = cross_encoder(&LengthEncoder, "q", items).await.unwrap();
        let names: Vec<&str> = reranked.iter().map(|s| s.item.name.as_str()).collect();
        assert_eq!(names, vec!["Alexandra", "Bob", "Al"]);
        assert!((reranked[0].score - 0.9).abs() < 1e-6);
        assert_eq!(reranked[2].rank, 3);
    }

    #[tokio::test]
    async fn test_cross_encoder_count_mismatch() {
        let items = scored_nodes(&["A", "B"]);
        let err = cross_encoder(&BrokenEncoder, "q", items).await.unwrap_err();
        assert!(matches!(err, TempographError::Search(_)));
    }

    #[test]
    fn test_node_distance() {
        let items = scored_nodes(&["far", "near", "unreachable"]);
        let mut distances = HashMap::new();
        distances.insert(items[0].item.uuid, 2);
        distances.insert(items[1].item.uuid, 0);

        let reranked = node_distance(items, &distances);
        let names: Vec<&str> = reranked.iter().map(|s| s.item.name.as_str()).collect();
        assert_eq!(names, vec!["near", "far", "unreachable"]);
        assert!((reranked[0].score - 1.0).abs() < 1e-6);
        assert_eq!(reranked[2].score, 0.0);
    }

    #[test]
    fn test_node_distance_uses_nearest_edge_endpoint() {
        let now = Utc::now();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let ab = Edge::relates_to("g", a, b, "KNOWS", "a knows b", now);
        let bc = Edge::relates_to("g", b, c, "KNOWS", "b knows c", now);
        let items = vec![
            Scored { item: bc, score: 0.9, rank: 1 },
            Scored { item: ab, score: 0.8, rank: 2 },
        ];
        let distances = HashMap::from([(a, 0), (b, 1), (c, 2)]);

        let reranked = node_distance(items, &distances);
        assert_eq!(reranked[0].item.source_node_uuid, a);
        assert!((reranked[1].score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_episode_mentions() {
        let items = scored_nodes(&["rare", "common", "never"]);
        let counts = HashMap::from([(items[0].item.uuid, 1), (items[1].item.uuid, 4)]);

        let reranked = episode_mentions(items, &counts);
        let names: Vec<&str> = reranked.iter().map(|s| s.item.name.as_str()).collect();
        assert_eq!(names, vec!["common", "rare", "never"]);
        assert!((reranked[1].score - 0.25).abs() < 1e-6);
    }
}

//! Rank fusion: Reciprocal Rank Fusion and Maximal Marginal Relevance.

use std::cmp::Ordering;
use std::collections::HashMap;
use uuid::Uuid;

use super::{Scored, SearchItem};
use crate::embeddings::cosine_similarity;

/// RRF constant (Cormack et al. 2009)
pub const RRF_K: f32 = 60.0;

/// Sort by score descending, ties by UUID ascending, then number ranks from 1.
pub(crate) fn sort_and_rank<T: SearchItem>(items: &mut Vec<Scored<T>>) {
    items.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.item.uuid().cmp(&b.item.uuid()))
    });
    for (idx, scored) in items.iter_mut().enumerate() {
        scored.rank = idx + 1;
    }
}

/// Combine ranked lists with Reciprocal Rank Fusion.
///
/// ```text
/// RRF(d) = Σ 1 / (K + rank_i(d))
/// ```
///
/// Ranks are 1-based. Scores are divided by the best achievable score (first in every
/// list) so they land in `[0, 1]`. Ties break by UUID, so the order is deterministic.
pub fn rrf<T: SearchItem>(lists: Vec<Vec<T>>) -> Vec<Scored<T>> {
    let non_empty = lists.iter().filter(|l| !l.is_empty()).count();
    if non_empty == 0 {
        return Vec::new();
    }
    let max_score = non_empty as f32 / (RRF_K + 1.0);

    let mut scores: HashMap<Uuid, (f32, T)> = HashMap::new();
    for list in lists {
        for (rank, item) in list.into_iter().enumerate() {
            let rrf_score = 1.0 / (RRF_K + (rank + 1) as f32);
            scores
                .entry(item.uuid())
                .and_modify(|(score, _)| *score += rrf_score)
                .or_insert((rrf_score, item));
        }
    }

    let mut fused: Vec<Scored<T>> = scores
        .into_values()
        .map(|(score, item)| Scored { item, score: (score / max_score).min(1.0), rank: 0 })
        .collect();
    sort_and_rank(&mut fused);
    fused
}

/// Greedy Maximal Marginal Relevance over already-scored items.
///
/// Each step picks the item maximizing `λ·relevance − (1−λ)·max_sim`, where `max_sim` is
/// the highest cosine similarity to an item already picked (0 without embeddings). The
/// picked item's score becomes that MMR value; ranks follow pick order.
pub fn mmr<T: SearchItem>(candidates: Vec<Scored<T>>, lambda: f32) -> Vec<Scored<T>> {
    let lambda = lambda.clamp(0.0, 1.0);
    let mut remaining = candidates;
    // Deterministic start: best relevance, ties by UUID
    sort_and_rank(&mut remaining);
    let mut selected: Vec<Scored<T>> = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let mut best: Option<(usize, f32)> = None;
        for (idx, candidate) in remaining.iter().enumerate() {
            let max_sim = selected
                .iter()
                .filter_map(|s| match (candidate.item.embedding(), s.item.embedding()) {
                    (Some(a), Some(b)) => Some(cosine_similarity(a, b)),
                    _ => None,
                })
                .fold(0.0_f32, f32::max);
            let value = lambda * candidate.score - (1.0 - lambda) * max_sim;
            // Strictly greater keeps the earlier (better relevance, smaller UUID) candidate
            if best.map_or(true, |(_, v)| value > v) {
                best = Some((idx, value));
            }
        }
        let Some((idx, value)) = best else { break };
        let mut picked = remaining.remove(idx);
        picked.score = value;
        picked.rank = selected.len() + 1;
        selected.push(picked);
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityNode;
    use chrono::Utc;

    fn node(name: &str, uuid: u128, embedding: Option<Vec<f32>>) -> EntityNode {
        let mut n = EntityNode::new(name, "Entity", "g", Utc::now());
        n.uuid = Uuid::from_u128(uuid);
        n.embedding = embedding;
        n
    }

    fn names<T>(results: &[Scored<T>], name: impl Fn(&T) -> &str) -> Vec<String> {
        results.iter().map(|s| name(&s.item).to_string()).collect()
    }

    #[test]
    fn test_rrf_overlap_wins() {
        let a = node("A", 1, None);
        let b = node("B", 2, None);
        let c = node("C", 3, None);

        let fused = rrf(vec![vec![a.clone(), b.clone(), c.clone()], vec![b, c, a]]);
        assert_eq!(names(&fused, |n: &EntityNode| &n.name), vec!["B", "A", "C"]);
        assert_eq!(fused.iter().map(|s| s.rank).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_rrf_ties_break_by_uuid() {
        let x = node("X", 9, None);
        let y = node("Y", 4, None);
        // Y first in one list, X first in the other: equal scores
        let fused = rrf(vec![vec![x.clone(), y.clone()], vec![y, x]]);
        assert_eq!(names(&fused, |n: &EntityNode| &n.name), vec!["Y", "X"]);
        assert!((fused[0].score - fused[1].score).abs() < 1e-6);
    }

    #[test]
    fn test_rrf_scores_normalized() {
        let a = node("A", 1, None);
        let b = node("B", 2, None);
        let fused = rrf(vec![vec![a.clone(), b.clone()], vec![a]]);
        assert!((fused[0].score - 1.0).abs() < 1e-6);
        assert!(fused.iter().all(|s| (0.0..=1.0).contains(&s.score)));

        let single = rrf(vec![vec![b], Vec::new()]);
        assert!((single[0].score - 1.0).abs() < 1e-6);
        assert!(rrf::<EntityNode>(vec![Vec::new()]).is_empty());
    }

    #[test]
    fn test_mmr_prefers_diverse_items() {
        let candidates = vec![
            Scored { item: node("A", 1, Some(vec![1.0, 0.0])), score: 1.0, rank: 1 },
            Scored { item: node("A-copy", 2, Some(vec![1.0, 0.0])), score: 0.95, rank: 2 },
            Scored { item: node("B", 3, Some(vec![0.0, 1.0])), score: 0.9, rank: 3 },
        ];
        let picked = mmr(candidates, 0.5);
        assert_eq!(names(&picked, |n: &EntityNode| &n.name), vec!["A", "B", "A-copy"]);
        assert!(picked[2].score < 0.0);
    }

    #[test]
    fn test_mmr_lambda_one_is_relevance_order() {
        let candidates = vec![
            Scored { item: node("low", 1, Some(vec![0.0, 1.0])), score: 0.2, rank: 2 },
            Scored { item: node("high", 2, Some(vec![1.0, 0.0])), score: 0.8, rank: 1 },
        ];
        let picked = mmr(candidates, 1.0);
        assert_eq!(names(&picked, |n: &EntityNode| &n.name), vec!["high", "low"]);
        assert!((picked[0].score - 0.8).abs() < 1e-6);
    }
}

//! Reciprocal Rank Fusion.
//!
//! Each list contributes `1 / (k + rank)` to every chunk it contains; a
//! chunk's fused score is the sum over lists. Raw backend scores are never
//! compared, only ranks.
//!
//! Ordering is total and deterministic: fused score, then the number of
//! contributing modalities, then the best single rank, then `chunk_id`.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::{FusedHit, Modality};
use crate::retrieve::RankedList;

/// Fuse ranked lists and keep the best `limit` hits.
///
/// A chunk listed twice in the same list counts once, at its best rank.
/// Contributions are summed in ascending-rank order, so two chunks with the
/// same ranks across modalities get bit-identical scores.
pub fn fuse(lists: &[RankedList], k: f64, limit: usize) -> Vec<FusedHit> {
    let mut contributions: HashMap<&str, Vec<(Modality, usize)>> = HashMap::new();

    for list in lists {
        let mut best: HashMap<&str, usize> = HashMap::new();
        for hit in &list.hits {
            let rank = best.entry(hit.chunk_id.as_str()).or_insert(hit.rank);
            *rank = (*rank).min(hit.rank);
        }
        for (chunk_id, rank) in best {
            contributions
                .entry(chunk_id)
                .or_default()
                .push((list.modality, rank));
        }
    }

    let mut fused: Vec<FusedHit> = contributions
        .into_iter()
        .map(|(chunk_id, mut contribs)| {
            contribs.sort_by_key(|(m, r)| (*r, *m));
            let fused_score = contribs
                .iter()
                .map(|(_, r)| 1.0 / (k + *r as f64))
                .sum::<f64>();
            FusedHit {
                chunk_id: chunk_id.to_string(),
                fused_score,
                contributions: contribs,
            }
        })
        .collect();

    fused.sort_by(compare);
    fused.truncate(limit);
    fused
}

fn compare(a: &FusedHit, b: &FusedHit) -> Ordering {
    b.fused_score
        .total_cmp(&a.fused_score)
        .then_with(|| b.contributions.len().cmp(&a.contributions.len()))
        .then_with(|| a.best_rank().cmp(&b.best_rank()))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RetrievalHit;

    fn list(modality: Modality, ids: &[&str]) -> RankedList {
        RankedList {
            modality,
            hits: ids
                .iter()
                .enumerate()
                .map(|(i, id)| RetrievalHit {
                    chunk_id: id.to_string(),
                    modality,
                    rank: i + 1,
                    score: 0.0,
                })
                .collect(),
        }
    }

    fn ids(hits: &[FusedHit]) -> Vec<&str> {
        hits.iter().map(|h| h.chunk_id.as_str()).collect()
    }

    #[test]
    fn test_rrf_formula() {
        let fused = fuse(
            &[
                list(Modality::Lexical, &["x", "y"]),
                list(Modality::Dense, &["x"]),
            ],
            60.0,
            10,
        );
        assert_eq!(ids(&fused), vec!["x", "y"]);
        assert!((fused[0].fused_score - 2.0 / 61.0).abs() < 1e-12);
        assert!((fused[1].fused_score - 1.0 / 62.0).abs() < 1e-12);
        assert_eq!(
            fused[0].contributions,
            vec![(Modality::Lexical, 1), (Modality::Dense, 1)]
        );
    }

    #[test]
    fn test_single_list_keeps_order() {
        let fused = fuse(&[list(Modality::Sparse, &["c", "a", "b"])], 60.0, 10);
        assert_eq!(ids(&fused), vec!["c", "a", "b"]);
        assert!((fused[0].fused_score - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn test_monotonic_in_rank() {
        // Improving y's lexical rank can only raise its score.
        let before = fuse(
            &[
                list(Modality::Lexical, &["a", "b", "y"]),
                list(Modality::Dense, &["y"]),
            ],
            60.0,
            10,
        );
        let after = fuse(
            &[
                list(Modality::Lexical, &["a", "y", "b"]),
                list(Modality::Dense, &["y"]),
            ],
            60.0,
            10,
        );
        let score = |hits: &[FusedHit]| {
            hits.iter()
                .find(|h| h.chunk_id == "y")
                .map(|h| h.fused_score)
                .unwrap()
        };
        assert!(score(&after) > score(&before));
    }

    #[test]
    fn test_tie_break_by_chunk_id() {
        let fused = fuse(
            &[
                list(Modality::Lexical, &["doc2#0"]),
                list(Modality::Dense, &["doc1#4"]),
            ],
            60.0,
            10,
        );
        assert_eq!(fused[0].fused_score, fused[1].fused_score);
        assert_eq!(ids(&fused), vec!["doc1#4", "doc2#0"]);
    }

    #[test]
    fn test_tie_break_prefers_more_modalities() {
        // k = 1: rank 1 alone is 1/2, rank 3 twice is 1/4 + 1/4.
        let fused = fuse(
            &[
                list(Modality::Lexical, &["solo", "p", "both"]),
                list(Modality::Dense, &["q", "r", "both"]),
            ],
            1.0,
            10,
        );
        let solo = fused.iter().position(|h| h.chunk_id == "solo").unwrap();
        let both = fused.iter().position(|h| h.chunk_id == "both").unwrap();
        assert_eq!(fused[solo].fused_score, fused[both].fused_score);
        assert!(both < solo);
    }

    #[test]
    fn test_duplicate_in_one_list_uses_best_rank() {
        let fused = fuse(&[list(Modality::Lexical, &["a", "b", "a"])], 60.0, 10);
        assert_eq!(fused.len(), 2);
        assert!((fused[0].fused_score - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn test_degraded_two_lists() {
        // Dense leg timed out; only lexical and sparse lists remain.
        let fused = fuse(
            &[
                list(Modality::Lexical, &["A", "B", "C"]),
                list(Modality::Sparse, &["B", "A", "D"]),
            ],
            60.0,
            10,
        );
        assert_eq!(ids(&fused), vec!["A", "B", "C", "D"]);
        assert_eq!(fused[0].fused_score, fused[1].fused_score);
    }

    #[test]
    fn test_truncates_after_fusion() {
        // "z" is last in each list but first overall once fused.
        let fused = fuse(
            &[
                list(Modality::Lexical, &["a", "z"]),
                list(Modality::Dense, &["b", "z"]),
                list(Modality::Sparse, &["c", "z"]),
            ],
            60.0,
            1,
        );
        assert_eq!(ids(&fused), vec!["z"]);
    }

    #[test]
    fn test_empty_lists() {
        assert!(fuse(&[], 60.0, 5).is_empty());
        assert!(fuse(&[list(Modality::Dense, &[])], 60.0, 5).is_empty());
    }
}

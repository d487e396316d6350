//! Near-duplicate filtering over a ranked list.
//!
//! Greedy and order-dependent by design: the highest-scoring version of a
//! cluster of near-duplicates always wins. O(n²) in the accepted set, which
//! is fine because the ranker bounds the pool to top-K before this stage.

use crate::rank::{Scored, cosine_similarity};

/// Walk the ranked list in order, dropping any candidate whose cosine
/// similarity against an already-accepted item exceeds `threshold`.
///
/// Output preserves rank order; no two surviving items are more similar
/// than `threshold`.
pub fn dedupe(ranked: Vec<Scored>, threshold: f64) -> Vec<Scored> {
    let mut accepted: Vec<Scored> = Vec::with_capacity(ranked.len());

    for candidate in ranked {
        let duplicate = accepted.iter().any(|kept| {
            kept.item.embedding.len() == candidate.item.embedding.len()
                && cosine_similarity(&kept.item.embedding, &candidate.item.embedding) > threshold
        });
        if !duplicate {
            accepted.push(candidate);
        }
    }

    accepted
}

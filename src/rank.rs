//! Hybrid ranking: semantic similarity + lexical overlap + recency decay.
//!
//! Pure functions over candidate slices. The ranker never mutates items;
//! usage tracking happens in the engine after budgeting.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::RankWeights;
use crate::model::MemoryItem;

/// A candidate paired with its composite score.
#[derive(Debug, Clone)]
pub struct Scored {
    pub item: MemoryItem,
    pub score: f64,
}

/// Score and order candidates descending by relevance to the query.
///
/// score = w.cosine * clamp01(cosine) + w.lexical * lexical + w.recency * recency
///
/// Candidates whose embedding dimension doesn't match the query's are
/// skipped with a warning; one malformed item never fails the batch.
/// Empty input yields empty output. Ties break by `last_accessed_at`
/// descending, then id ascending, so the ordering is deterministic.
pub fn rank(
    query_embedding: &[f32],
    query_text: &str,
    candidates: Vec<MemoryItem>,
    weights: &RankWeights,
    half_life_days: f64,
    now: DateTime<Utc>,
) -> Vec<Scored> {
    let query_tokens = tokenize(query_text);

    let mut scored: Vec<Scored> = candidates
        .into_iter()
        .filter_map(|item| {
            if item.embedding.len() != query_embedding.len() {
                warn!(
                    id = %item.id,
                    expected = query_embedding.len(),
                    actual = item.embedding.len(),
                    "skipping candidate with mismatched embedding dimension"
                );
                return None;
            }

            let semantic = cosine_similarity(query_embedding, &item.embedding).clamp(0.0, 1.0);
            let lexical = lexical_overlap(&query_tokens, &item.lexical_text);
            let recency = recency_score(item.idle_days(now), half_life_days);

            let score = weights.cosine * semantic
                + weights.lexical * lexical
                + weights.recency * recency;

            Some(Scored { item, score })
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.item.last_accessed_at.cmp(&a.item.last_accessed_at))
            .then_with(|| a.item.id.cmp(&b.item.id))
    });

    scored
}

/// Cosine similarity in [-1, 1]. Zero-magnitude vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Exponential recency decay: 1.0 for just-touched items, 0.5 at one
/// half-life, approaching (never reaching) zero for very old items.
pub fn recency_score(idle_days: f64, half_life_days: f64) -> f64 {
    let idle = idle_days.max(0.0);
    (-std::f64::consts::LN_2 * idle / half_life_days).exp()
}

/// Lexical score: fraction of distinct query tokens present in the item
/// text. Normalized to [0, 1] and monotonic in shared-term overlap.
/// Deliberately simpler than BM25; corpus statistics aren't available at
/// this layer.
pub fn lexical_overlap(query_tokens: &[String], text: &str) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let item_tokens = tokenize(text);
    let matched = query_tokens
        .iter()
        .filter(|t| item_tokens.contains(t))
        .count();
    matched as f64 / query_tokens.len() as f64
}

/// Lowercased alphanumeric tokens, deduplicated, order preserved.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for raw in text.split(|c: char| !c.is_alphanumeric()) {
        if raw.is_empty() {
            continue;
        }
        let token = raw.to_lowercase();
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens
}

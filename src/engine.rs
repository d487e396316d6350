//! Context assembly. The public entry point for consumers.
//!
//! Orchestrates fetch -> rank -> dedupe -> cap and records usage on
//! everything returned. Degrades instead of failing: a store error yields
//! a smaller bundle, and a blown deadline drops the usage write rather
//! than the bundle. Neither surfaces as an error to the caller.

use std::time::Instant;

use chrono::Utc;
use tracing::{debug, warn};

use crate::budget;
use crate::config::{EngineConfig, RankWeights};
use crate::diversity;
use crate::error::Result;
use crate::model::*;
use crate::rank;
use crate::store::ItemStore;

/// Per-token-counting callback. Tokenization is model-specific, so the
/// consuming application supplies its own; `budget::estimate_tokens` is
/// the fallback.
pub type TokenCounter = Box<dyn Fn(&MemoryItem) -> usize + Send + Sync>;

/// A context-build request. Everything beyond the query is optional and
/// falls back to the engine's configuration.
pub struct ContextRequest {
    pub(crate) query_embedding: Vec<f32>,
    pub(crate) query_text: String,
    pub(crate) token_budget: Option<usize>,
    pub(crate) weights: Option<RankWeights>,
    pub(crate) top_k: Option<usize>,
    pub(crate) deadline: Option<Instant>,
}

impl ContextRequest {
    pub fn new(query_embedding: Vec<f32>, query_text: impl Into<String>) -> Self {
        Self {
            query_embedding,
            query_text: query_text.into(),
            token_budget: None,
            weights: None,
            top_k: None,
            deadline: None,
        }
    }

    pub fn token_budget(mut self, budget: usize) -> Self {
        self.token_budget = Some(budget);
        self
    }

    /// Per-query weight override, e.g. `RankWeights::semantic_only()` for
    /// pure-semantic evaluation.
    pub fn weights(mut self, weights: RankWeights) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    /// Deadline for follow-up store writes. Ranking over already-fetched
    /// candidates always completes; past the deadline the engine returns
    /// the assembled bundle without recording usage.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// The memory engine: a store plus the read pipeline over it.
///
/// Concurrent readers are safe against the background pruner and the fact
/// upserter because every store mutation is transactional and reads see
/// snapshot state.
pub struct Engine<S: ItemStore> {
    store: S,
    config: EngineConfig,
    count_tokens: TokenCounter,
}

impl<S: ItemStore> Engine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            count_tokens: Box::new(budget::estimate_tokens),
        }
    }

    /// Replace the default chars/4 estimator with a model tokenizer.
    pub fn with_token_counter(mut self, counter: TokenCounter) -> Self {
        self.count_tokens = counter;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Context assembly
    // -----------------------------------------------------------------------

    /// Build a ranked, de-duplicated, budget-capped context bundle.
    ///
    /// Candidate fetch failures degrade the bundle rather than failing
    /// the request; the worst outcome is fewer items than the budget
    /// allows. A blown deadline never discards work already done.
    pub fn build_context(&mut self, request: ContextRequest) -> ContextBundle {
        let weights = request.weights.unwrap_or(self.config.weights);
        let token_budget = request.token_budget.unwrap_or(self.config.token_budget);
        let top_k = request.top_k.unwrap_or(self.config.top_k);

        let candidates = match self.store.fetch_candidates(top_k) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("candidate fetch failed, returning degraded bundle: {e}");
                return ContextBundle::empty();
            }
        };
        let candidate_count = candidates.len();

        let ranked = rank::rank(
            &request.query_embedding,
            &request.query_text,
            candidates,
            &weights,
            self.config.half_life_days,
            Utc::now(),
        );
        let ranked_count = ranked.len();

        let deduped = diversity::dedupe(ranked, self.config.dedupe_threshold);
        let dropped_duplicates = ranked_count - deduped.len();

        let capped = budget::cap(
            deduped,
            token_budget,
            &self.config.category_shares,
            &self.count_tokens,
        );

        // Once candidates are in memory the in-process stages always run to
        // completion; a blown deadline only forgoes the follow-up store
        // write, never the bundle already assembled. Usage feeds future
        // pruning decisions, and losing one update is not worth failing an
        // otherwise good bundle over.
        if past_deadline(request.deadline) {
            debug!("deadline exceeded; skipping usage recording");
        } else {
            let ids: Vec<ItemId> = capped.items.iter().map(|item| item.id).collect();
            if let Err(e) = self.store.touch(&ids) {
                warn!("failed to record item usage: {e}");
            }
        }

        debug!(
            candidates = candidate_count,
            returned = capped.items.len(),
            total_tokens = capped.total_tokens,
            "context assembled"
        );

        ContextBundle {
            items: capped.items,
            total_tokens: capped.total_tokens,
            excluded_count: (candidate_count - ranked_count) // dimension mismatches
                + dropped_duplicates
                + capped.excluded_count,
        }
    }

    // -----------------------------------------------------------------------
    // Ingestion and facts
    // -----------------------------------------------------------------------

    /// Ingest a new memory item.
    pub fn insert(&mut self, new: NewMemoryItem) -> Result<MemoryItem> {
        self.store.insert(new)
    }

    pub fn get(&self, id: ItemId) -> Result<MemoryItem> {
        self.store.get(id)
    }

    /// Versioned fact write. A `contradiction: true` result means the new
    /// value differs from the previously active one; the old version is
    /// retained, superseded, for the caller or an auditor to review.
    pub fn upsert_fact(
        &mut self,
        entity_key: &str,
        fact_key: &str,
        value: &str,
        embedding: Vec<f32>,
    ) -> Result<UpsertResult> {
        self.store.upsert_fact(entity_key, fact_key, value, embedding)
    }

    pub fn active_fact(&self, entity_key: &str, fact_key: &str) -> Result<Option<EntityFact>> {
        self.store.active_fact(entity_key, fact_key)
    }

    pub fn fact_versions(&self, entity_key: &str, fact_key: &str) -> Result<Vec<EntityFact>> {
        self.store.fact_versions(entity_key, fact_key)
    }

    // -----------------------------------------------------------------------
    // Operator surface
    // -----------------------------------------------------------------------

    /// Evict one item by hand, with the same delete+audit guarantees as
    /// the background pruner. Reason recorded as `manual`.
    pub fn evict_manual(&mut self, id: ItemId) -> Result<()> {
        let item = self.store.get(id)?;
        self.store.evict(&item, PruneReason::Manual)
    }

    /// Audit records after a sequence number.
    pub fn audit_since(&self, seq: u64) -> Result<Vec<PruneAuditRecord>> {
        self.store.audit_since(seq)
    }

    pub fn count_items(&self) -> Result<usize> {
        self.store.count_items()
    }
}

fn past_deadline(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

//! Core data model.
//!
//! A memory item is a unit of retrievable context. It has identity,
//! a category tag, an embedding for semantic scoring, raw text for
//! lexical scoring, and the usage counters that feed pruning decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Memory Item
// ---------------------------------------------------------------------------

/// A unit of retrievable context tracked by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Unique identifier.
    pub id: ItemId,

    /// What kind of memory this is. Determines per-category budget
    /// accounting; the ranker treats all categories uniformly.
    pub category: Category,

    /// Fixed-length embedding vector. Dimensionality is set per store;
    /// every item in a store shares the same dimension.
    pub embedding: Vec<f32>,

    /// Raw text used for lexical (keyword) scoring.
    pub lexical_text: String,

    pub created_at: DateTime<Utc>,

    /// Refreshed every time the item is returned in a context bundle.
    /// Invariant: never earlier than `created_at`.
    pub last_accessed_at: DateTime<Utc>,

    /// Monotonically increasing usage counter.
    pub access_count: u32,

    /// Caller-assigned importance in [0, 1]. Higher survives pruning longer.
    pub salience: f64,

    /// Optional hard expiration. Once passed, the item is always evicted
    /// regardless of other signals.
    pub expires_at: Option<DateTime<Utc>>,
}

impl MemoryItem {
    /// Age in fractional days relative to `now`.
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_milliseconds() as f64 / 86_400_000.0
    }

    /// Days since the item was last returned in a bundle.
    pub fn idle_days(&self, now: DateTime<Utc>) -> f64 {
        (now - self.last_accessed_at).num_milliseconds() as f64 / 86_400_000.0
    }

    /// Has the hard expiration passed?
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// Newtype for memory item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// What kind of context a memory item carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// A single conversation turn.
    Turn,
    /// A regenerated summary of older turns.
    Summary,
    /// A versioned structured fact about a named entity.
    EntityFact,
    /// A discrete event recalled episodically.
    EpisodicEvent,
    /// An embedded chunk of ingested source material.
    SemanticChunk,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Turn,
        Category::Summary,
        Category::EntityFact,
        Category::EpisodicEvent,
        Category::SemanticChunk,
    ];
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Category::Turn => "turn",
            Category::Summary => "summary",
            Category::EntityFact => "entity_fact",
            Category::EpisodicEvent => "episodic_event",
            Category::SemanticChunk => "semantic_chunk",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "turn" => Ok(Category::Turn),
            "summary" => Ok(Category::Summary),
            "entity_fact" => Ok(Category::EntityFact),
            "episodic_event" => Ok(Category::EpisodicEvent),
            "semantic_chunk" => Ok(Category::SemanticChunk),
            _ => Err(format!("unknown category: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Entity Fact
// ---------------------------------------------------------------------------

/// A versioned key/value fact about a named entity.
///
/// Specialization of a memory item: the fact row references the backing
/// item, which carries the embedding and usage counters. At most one
/// version per (entity_key, fact_key) is active (`superseded_by == None`);
/// prior versions are retained for audit until explicitly pruned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityFact {
    /// Backing memory item.
    pub item_id: ItemId,

    /// Stable identifier for the entity (e.g. "user:kelly").
    pub entity_key: String,

    /// Attribute name.
    pub fact_key: String,

    /// Attribute value for this version.
    pub fact_value: String,

    /// Monotonically increasing per (entity_key, fact_key), starting at 1.
    pub version: u32,

    /// The newer version that replaced this one, if any. Lookup only,
    /// not ownership.
    pub superseded_by: Option<ItemId>,

    pub created_at: DateTime<Utc>,
}

/// What happened on a fact upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertResult {
    /// Backing item of the active version after the upsert.
    pub item_id: ItemId,

    /// Active version number after the upsert.
    pub version: u32,

    /// True when the new value differed from the previously active value.
    /// Advisory, not blocking: the old version is kept, superseded.
    pub contradiction: bool,
}

// ---------------------------------------------------------------------------
// Prune Audit
// ---------------------------------------------------------------------------

/// Why an item was evicted. Precedence during evaluation: Expired, then
/// AgeThreshold, then LowAccessLowSalience; Manual comes from operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneReason {
    Expired,
    AgeThreshold,
    LowAccessLowSalience,
    Manual,
}

impl std::fmt::Display for PruneReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PruneReason::Expired => "expired",
            PruneReason::AgeThreshold => "age_threshold",
            PruneReason::LowAccessLowSalience => "low_access_low_salience",
            PruneReason::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for PruneReason {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "expired" => Ok(PruneReason::Expired),
            "age_threshold" => Ok(PruneReason::AgeThreshold),
            "low_access_low_salience" => Ok(PruneReason::LowAccessLowSalience),
            "manual" => Ok(PruneReason::Manual),
            _ => Err(format!("unknown prune reason: {s}")),
        }
    }
}

/// Append-only record of a single eviction. Immutable once written;
/// ordering by `seq` is the canonical audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneAuditRecord {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    pub item_id: ItemId,
    pub reason: PruneReason,
    pub pruned_at: DateTime<Utc>,
    /// Minimal fields of the evicted item for forensic replay.
    pub snapshot: ItemSnapshot,
}

/// The fields of an evicted item preserved in its audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub category: Category,
    pub lexical_text: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u32,
    pub salience: f64,
}

impl From<&MemoryItem> for ItemSnapshot {
    fn from(item: &MemoryItem) -> Self {
        Self {
            category: item.category,
            lexical_text: item.lexical_text.clone(),
            created_at: item.created_at,
            last_accessed_at: item.last_accessed_at,
            access_count: item.access_count,
            salience: item.salience,
        }
    }
}

// ---------------------------------------------------------------------------
// Context Bundle
// ---------------------------------------------------------------------------

/// The final output of a context build: ranked, de-duplicated items under
/// the token budget, in rank order.
#[derive(Debug, Clone)]
pub struct ContextBundle {
    pub items: Vec<MemoryItem>,
    /// Estimated token cost of everything in `items`.
    pub total_tokens: usize,
    /// Candidates dropped after ranking (near-duplicate, over budget,
    /// or cut by the deadline).
    pub excluded_count: usize,
}

impl ContextBundle {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total_tokens: 0,
            excluded_count: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for ingesting new memory items. The store's public insert API.
pub struct NewMemoryItem {
    pub(crate) category: Category,
    pub(crate) embedding: Vec<f32>,
    pub(crate) lexical_text: String,
    pub(crate) salience: f64,
    pub(crate) expires_at: Option<DateTime<Utc>>,
}

impl NewMemoryItem {
    pub fn new(category: Category, embedding: Vec<f32>, lexical_text: impl Into<String>) -> Self {
        Self {
            category,
            embedding,
            lexical_text: lexical_text.into(),
            salience: 0.5,
            expires_at: None,
        }
    }

    /// Importance in [0, 1]; clamped. Defaults to 0.5.
    pub fn salience(mut self, salience: f64) -> Self {
        self.salience = salience.clamp(0.0, 1.0);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Materialize with a fresh id and current timestamps.
    pub(crate) fn build(self, now: DateTime<Utc>) -> MemoryItem {
        MemoryItem {
            id: ItemId::new(),
            category: self.category,
            embedding: self.embedding,
            lexical_text: self.lexical_text,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            salience: self.salience,
            expires_at: self.expires_at,
        }
    }
}

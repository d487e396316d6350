//! SQLite item store.
//!
//! Single source of truth for memory items, entity facts, and the prune
//! audit log. WAL mode gives concurrent readers snapshot semantics while
//! the pruner and upserter write. Every multi-row mutation (evict+audit,
//! insert-version+mark-superseded) runs in one transaction, so no reader
//! ever observes a half-applied change.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Error, Result};
use crate::model::*;

/// Store abstraction the engine and pruner are written against.
///
/// The store is the only shared mutable state in the crate; ranking,
/// filtering, and budgeting are pure functions over data fetched here.
pub trait ItemStore {
    /// Ingest a new item. Rejects embeddings that don't match the store's
    /// configured dimension.
    fn insert(&mut self, new: NewMemoryItem) -> Result<MemoryItem>;

    /// Get an item by id.
    fn get(&self, id: ItemId) -> Result<MemoryItem>;

    /// Bounded candidate pool for ranking: most recently accessed,
    /// unexpired items. The real relevance ordering happens in the ranker.
    fn fetch_candidates(&self, top_k: usize) -> Result<Vec<MemoryItem>>;

    /// Record usage: bump `access_count` and refresh `last_accessed_at`
    /// for every listed item, in one transaction.
    fn touch(&mut self, ids: &[ItemId]) -> Result<()>;

    fn count_items(&self) -> Result<usize>;

    /// Items old enough to be prune candidates, oldest first. Items
    /// younger than `min_age_days` are never returned.
    fn scan_prunable(
        &self,
        now: DateTime<Utc>,
        min_age_days: f64,
        batch: usize,
    ) -> Result<Vec<MemoryItem>>;

    /// Delete an item and append its audit record atomically. Neither an
    /// un-audited deletion nor an audit-without-delete can occur.
    fn evict(&mut self, item: &MemoryItem, reason: PruneReason) -> Result<()>;

    /// Versioned fact write. See `UpsertResult` for the outcomes.
    fn upsert_fact(
        &mut self,
        entity_key: &str,
        fact_key: &str,
        value: &str,
        embedding: Vec<f32>,
    ) -> Result<UpsertResult>;

    /// The active (non-superseded) version for a key pair, if any.
    fn active_fact(&self, entity_key: &str, fact_key: &str) -> Result<Option<EntityFact>>;

    /// All versions for a key pair, oldest first.
    fn fact_versions(&self, entity_key: &str, fact_key: &str) -> Result<Vec<EntityFact>>;

    /// Audit records after a sequence number, in audit order.
    fn audit_since(&self, seq: u64) -> Result<Vec<PruneAuditRecord>>;
}

/// SQLite-backed store. Owns the connection.
pub struct SqliteStore {
    conn: Connection,
    dim: usize,
}

/// Handle for storage operations within a transaction.
///
/// Methods delegate to the same SQL as `SqliteStore`, executed against the
/// transaction's connection, so either everything commits or nothing does.
pub(crate) struct TxContext<'a> {
    tx: &'a Connection,
}

impl TxContext<'_> {
    pub fn insert_item(&self, item: &MemoryItem) -> Result<()> {
        insert_item_on(self.tx, item)
    }

    pub fn insert_fact(&self, fact: &EntityFact) -> Result<()> {
        insert_fact_on(self.tx, fact)
    }

    pub fn active_fact(&self, entity_key: &str, fact_key: &str) -> Result<Option<EntityFact>> {
        active_fact_on(self.tx, entity_key, fact_key)
    }

    pub fn mark_superseded(&self, item_id: ItemId, by: ItemId) -> Result<()> {
        let changed = self.tx.execute(
            "UPDATE entity_facts SET superseded_by = ?1 WHERE item_id = ?2",
            params![by.0.to_string(), item_id.0.to_string()],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(item_id));
        }
        Ok(())
    }

    pub fn touch_item(&self, id: ItemId, now: DateTime<Utc>) -> Result<()> {
        self.tx.execute(
            "UPDATE memory_items
             SET access_count = access_count + 1, last_accessed_at = ?1
             WHERE id = ?2",
            params![now.to_rfc3339(), id.0.to_string()],
        )?;
        Ok(())
    }

    pub fn append_audit(
        &self,
        item: &MemoryItem,
        reason: PruneReason,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let snapshot = serde_json::to_string(&ItemSnapshot::from(item))
            .map_err(|e| Error::AuditWriteFailure {
                item_id: item.id,
                reason: format!("snapshot serialization: {e}"),
            })?;
        self.tx
            .execute(
                "INSERT INTO prune_audit_log (item_id, reason, pruned_at, snapshot)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    item.id.0.to_string(),
                    reason.to_string(),
                    now.to_rfc3339(),
                    snapshot,
                ],
            )
            .map_err(|e| Error::AuditWriteFailure {
                item_id: item.id,
                reason: e.to_string(),
            })?;
        Ok(())
    }

    pub fn delete_item(&self, id: ItemId) -> Result<()> {
        // Fact rows reference the item; remove them first.
        self.tx.execute(
            "DELETE FROM entity_facts WHERE item_id = ?1",
            params![id.0.to_string()],
        )?;
        let deleted = self.tx.execute(
            "DELETE FROM memory_items WHERE id = ?1",
            params![id.0.to_string()],
        )?;
        if deleted == 0 {
            return Err(Error::NotFound(id));
        }
        Ok(())
    }
}

impl SqliteStore {
    /// Open or create a store at the given path, configured for
    /// `dim`-dimensional embeddings. Reopening with a different dimension
    /// is a configuration error.
    pub fn open(path: impl AsRef<std::path::Path>, dim: usize) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut store = Self { conn, dim };
        store.init()?;
        Ok(store)
    }

    /// In-memory store (for testing).
    pub fn in_memory(dim: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn, dim };
        store.init()?;
        Ok(store)
    }

    /// The embedding dimension every item in this store carries.
    pub fn dim(&self) -> usize {
        self.dim
    }

    fn init(&mut self) -> Result<()> {
        // WAL mode for concurrent readers
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS store_meta (
                key     TEXT PRIMARY KEY,
                value   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS memory_items (
                id                  TEXT PRIMARY KEY,
                category            TEXT NOT NULL,
                embedding           BLOB NOT NULL,
                lexical_text        TEXT NOT NULL,
                created_at          TEXT NOT NULL,
                last_accessed_at    TEXT NOT NULL,
                access_count        INTEGER NOT NULL DEFAULT 0,
                salience            REAL NOT NULL DEFAULT 0.5,
                expires_at          TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_items_accessed
                ON memory_items(last_accessed_at DESC);
            CREATE INDEX IF NOT EXISTS idx_items_created
                ON memory_items(created_at ASC);
            CREATE INDEX IF NOT EXISTS idx_items_category
                ON memory_items(category);

            CREATE TABLE IF NOT EXISTS entity_facts (
                item_id         TEXT PRIMARY KEY REFERENCES memory_items(id),
                entity_key      TEXT NOT NULL,
                fact_key        TEXT NOT NULL,
                fact_value      TEXT NOT NULL,
                version         INTEGER NOT NULL,
                superseded_by   TEXT,
                created_at      TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_facts_active
                ON entity_facts(entity_key, fact_key)
                WHERE superseded_by IS NULL;
            CREATE INDEX IF NOT EXISTS idx_facts_key
                ON entity_facts(entity_key, fact_key, version);

            CREATE TABLE IF NOT EXISTS prune_audit_log (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id     TEXT NOT NULL,
                reason      TEXT NOT NULL,
                pruned_at   TEXT NOT NULL,
                snapshot    TEXT NOT NULL
            );
            ",
        )?;

        // Pin the embedding dimension on first open; reject mismatched reopens.
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'embedding_dim'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            Some(value) => {
                let persisted: usize = value
                    .parse()
                    .map_err(|_| Error::Config(format!("corrupt embedding_dim meta: {value}")))?;
                if persisted != self.dim {
                    return Err(Error::DimensionMismatch {
                        expected: persisted,
                        actual: self.dim,
                    });
                }
            }
            None => {
                self.conn.execute(
                    "INSERT INTO store_meta (key, value) VALUES ('embedding_dim', ?1)",
                    params![self.dim.to_string()],
                )?;
            }
        }

        Ok(())
    }

    /// Execute a closure within a SQLite transaction.
    ///
    /// Commits if the closure returns Ok, rolls back on Err.
    pub(crate) fn with_transaction<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&TxContext) -> Result<T>,
    {
        let tx = self.conn.transaction()?;
        let ctx = TxContext { tx: &tx };
        let result = f(&ctx)?;
        tx.commit()?;
        Ok(result)
    }

    fn check_dim(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: embedding.len(),
            });
        }
        Ok(())
    }
}

impl ItemStore for SqliteStore {
    fn insert(&mut self, new: NewMemoryItem) -> Result<MemoryItem> {
        self.check_dim(&new.embedding)?;
        let item = new.build(Utc::now());
        insert_item_on(&self.conn, &item)?;
        Ok(item)
    }

    fn get(&self, id: ItemId) -> Result<MemoryItem> {
        get_item_on(&self.conn, id)
    }

    fn fetch_candidates(&self, top_k: usize) -> Result<Vec<MemoryItem>> {
        fetch_candidates_on(&self.conn, top_k).map_err(as_unavailable)
    }

    fn touch(&mut self, ids: &[ItemId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        self.with_transaction(|ctx| {
            for id in ids {
                ctx.touch_item(*id, now)?;
            }
            Ok(())
        })
    }

    fn count_items(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM memory_items", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn scan_prunable(
        &self,
        now: DateTime<Utc>,
        min_age_days: f64,
        batch: usize,
    ) -> Result<Vec<MemoryItem>> {
        scan_prunable_on(&self.conn, now, min_age_days, batch).map_err(as_unavailable)
    }

    fn evict(&mut self, item: &MemoryItem, reason: PruneReason) -> Result<()> {
        let now = Utc::now();
        self.with_transaction(|ctx| {
            ctx.append_audit(item, reason, now)?;
            ctx.delete_item(item.id)?;
            Ok(())
        })
    }

    fn upsert_fact(
        &mut self,
        entity_key: &str,
        fact_key: &str,
        value: &str,
        embedding: Vec<f32>,
    ) -> Result<UpsertResult> {
        self.check_dim(&embedding)?;
        let now = Utc::now();

        let lexical_text = format!("{entity_key} {fact_key}: {value}");
        let item = NewMemoryItem::new(Category::EntityFact, embedding, lexical_text)
            .salience(0.8) // structured facts out-survive chatter by default
            .build(now);

        self.with_transaction(|ctx| {
            let current = ctx.active_fact(entity_key, fact_key)?;

            match current {
                None => {
                    ctx.insert_item(&item)?;
                    ctx.insert_fact(&EntityFact {
                        item_id: item.id,
                        entity_key: entity_key.to_string(),
                        fact_key: fact_key.to_string(),
                        fact_value: value.to_string(),
                        version: 1,
                        superseded_by: None,
                        created_at: now,
                    })?;
                    Ok(UpsertResult {
                        item_id: item.id,
                        version: 1,
                        contradiction: false,
                    })
                }
                Some(active) if active.fact_value == value => {
                    // Same value: refresh usage, keep the version.
                    ctx.touch_item(active.item_id, now)?;
                    Ok(UpsertResult {
                        item_id: active.item_id,
                        version: active.version,
                        contradiction: false,
                    })
                }
                Some(active) => {
                    // Differing value: new version becomes active, the old
                    // one is kept and marked superseded. Advisory only.
                    ctx.insert_item(&item)?;
                    ctx.mark_superseded(active.item_id, item.id)?;
                    ctx.insert_fact(&EntityFact {
                        item_id: item.id,
                        entity_key: entity_key.to_string(),
                        fact_key: fact_key.to_string(),
                        fact_value: value.to_string(),
                        version: active.version + 1,
                        superseded_by: None,
                        created_at: now,
                    })?;
                    Ok(UpsertResult {
                        item_id: item.id,
                        version: active.version + 1,
                        contradiction: true,
                    })
                }
            }
        })
    }

    fn active_fact(&self, entity_key: &str, fact_key: &str) -> Result<Option<EntityFact>> {
        active_fact_on(&self.conn, entity_key, fact_key)
    }

    fn fact_versions(&self, entity_key: &str, fact_key: &str) -> Result<Vec<EntityFact>> {
        let mut stmt = self.conn.prepare(
            "SELECT item_id, entity_key, fact_key, fact_value, version, superseded_by, created_at
             FROM entity_facts
             WHERE entity_key = ?1 AND fact_key = ?2
             ORDER BY version ASC",
        )?;
        let facts = stmt
            .query_map(params![entity_key, fact_key], |row| Ok(row_to_fact(row)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut result = Vec::new();
        for fact in facts {
            result.push(fact.map_err(|e| Error::Other(format!("parse error: {e}")))?);
        }
        Ok(result)
    }

    fn audit_since(&self, seq: u64) -> Result<Vec<PruneAuditRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, item_id, reason, pruned_at, snapshot
             FROM prune_audit_log WHERE seq > ?1 ORDER BY seq ASC",
        )?;
        let records = stmt
            .query_map(params![seq as i64], |row| Ok(row_to_audit(row)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut result = Vec::new();
        for record in records {
            result.push(record.map_err(|e| Error::Other(format!("parse error: {e}")))?);
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Inner functions — accept &Connection so they work with both
// Connection (auto-commit) and Transaction (deref to Connection).
// ---------------------------------------------------------------------------

fn fetch_candidates_on(conn: &Connection, top_k: usize) -> Result<Vec<MemoryItem>> {
    let now = Utc::now().to_rfc3339();
    let mut stmt = conn.prepare(
        "SELECT * FROM memory_items
         WHERE expires_at IS NULL OR expires_at > ?1
         ORDER BY last_accessed_at DESC, id ASC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![now, top_k as i64], |row| Ok(row_to_item(row)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    collect_items(rows)
}

fn scan_prunable_on(
    conn: &Connection,
    now: DateTime<Utc>,
    min_age_days: f64,
    batch: usize,
) -> Result<Vec<MemoryItem>> {
    let cutoff = now - chrono::Duration::milliseconds((min_age_days * 86_400_000.0) as i64);
    let mut stmt = conn.prepare(
        "SELECT * FROM memory_items
         WHERE created_at <= ?1
         ORDER BY created_at ASC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![cutoff.to_rfc3339(), batch as i64], |row| {
            Ok(row_to_item(row))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    collect_items(rows)
}

/// Batch reads degrade to `StoreUnavailable` on connection-level failure;
/// callers treat that as "no candidates this round", not a crash.
fn as_unavailable(e: Error) -> Error {
    match e {
        Error::Storage(inner) => Error::StoreUnavailable(inner.to_string()),
        other => other,
    }
}

fn insert_item_on(conn: &Connection, item: &MemoryItem) -> Result<()> {
    conn.execute(
        "INSERT INTO memory_items (
            id, category, embedding, lexical_text, created_at,
            last_accessed_at, access_count, salience, expires_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            item.id.0.to_string(),
            item.category.to_string(),
            embedding_to_blob(&item.embedding),
            item.lexical_text,
            item.created_at.to_rfc3339(),
            item.last_accessed_at.to_rfc3339(),
            item.access_count,
            item.salience,
            item.expires_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

fn get_item_on(conn: &Connection, id: ItemId) -> Result<MemoryItem> {
    conn.query_row(
        "SELECT * FROM memory_items WHERE id = ?1",
        params![id.0.to_string()],
        |row| Ok(row_to_item(row)),
    )
    .optional()?
    .ok_or(Error::NotFound(id))?
    .map_err(|e| Error::Other(format!("failed to parse memory item: {e}")))
}

fn insert_fact_on(conn: &Connection, fact: &EntityFact) -> Result<()> {
    conn.execute(
        "INSERT INTO entity_facts (
            item_id, entity_key, fact_key, fact_value, version, superseded_by, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            fact.item_id.0.to_string(),
            fact.entity_key,
            fact.fact_key,
            fact.fact_value,
            fact.version,
            fact.superseded_by.map(|id| id.0.to_string()),
            fact.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn active_fact_on(conn: &Connection, entity_key: &str, fact_key: &str) -> Result<Option<EntityFact>> {
    conn.query_row(
        "SELECT item_id, entity_key, fact_key, fact_value, version, superseded_by, created_at
         FROM entity_facts
         WHERE entity_key = ?1 AND fact_key = ?2 AND superseded_by IS NULL",
        params![entity_key, fact_key],
        |row| Ok(row_to_fact(row)),
    )
    .optional()?
    .transpose()
    .map_err(|e| Error::Other(format!("failed to parse entity fact: {e}")))
}

fn collect_items(
    rows: Vec<std::result::Result<MemoryItem, String>>,
) -> Result<Vec<MemoryItem>> {
    let mut result = Vec::with_capacity(rows.len());
    for row in rows {
        result.push(row.map_err(|e| Error::Other(format!("parse error: {e}")))?);
    }
    Ok(result)
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

fn row_to_item(row: &rusqlite::Row) -> std::result::Result<MemoryItem, String> {
    let id_str: String = row.get(0).map_err(|e| e.to_string())?;
    let category_str: String = row.get(1).map_err(|e| e.to_string())?;
    let embedding_blob: Vec<u8> = row.get(2).map_err(|e| e.to_string())?;
    let created_str: String = row.get(4).map_err(|e| e.to_string())?;
    let accessed_str: String = row.get(5).map_err(|e| e.to_string())?;
    let expires_str: Option<String> = row.get(8).map_err(|e| e.to_string())?;

    Ok(MemoryItem {
        id: ItemId(id_str.parse().map_err(|e: uuid::Error| e.to_string())?),
        category: category_str.parse()?,
        embedding: blob_to_embedding(&embedding_blob)?,
        lexical_text: row.get(3).map_err(|e| e.to_string())?,
        created_at: created_str
            .parse()
            .map_err(|_| "invalid created_at".to_string())?,
        last_accessed_at: accessed_str
            .parse()
            .map_err(|_| "invalid last_accessed_at".to_string())?,
        access_count: row.get(6).map_err(|e| e.to_string())?,
        salience: row.get(7).map_err(|e| e.to_string())?,
        expires_at: expires_str.and_then(|s| s.parse().ok()),
    })
}

fn row_to_fact(row: &rusqlite::Row) -> std::result::Result<EntityFact, String> {
    let item_str: String = row.get(0).map_err(|e| e.to_string())?;
    let superseded_str: Option<String> = row.get(5).map_err(|e| e.to_string())?;
    let created_str: String = row.get(6).map_err(|e| e.to_string())?;

    Ok(EntityFact {
        item_id: ItemId(item_str.parse().map_err(|e: uuid::Error| e.to_string())?),
        entity_key: row.get(1).map_err(|e| e.to_string())?,
        fact_key: row.get(2).map_err(|e| e.to_string())?,
        fact_value: row.get(3).map_err(|e| e.to_string())?,
        version: row.get(4).map_err(|e| e.to_string())?,
        superseded_by: superseded_str
            .map(|s| s.parse().map(ItemId))
            .transpose()
            .map_err(|e: uuid::Error| e.to_string())?,
        created_at: created_str
            .parse()
            .map_err(|_| "invalid created_at".to_string())?,
    })
}

fn row_to_audit(row: &rusqlite::Row) -> std::result::Result<PruneAuditRecord, String> {
    let item_str: String = row.get(1).map_err(|e| e.to_string())?;
    let reason_str: String = row.get(2).map_err(|e| e.to_string())?;
    let pruned_str: String = row.get(3).map_err(|e| e.to_string())?;
    let snapshot_str: String = row.get(4).map_err(|e| e.to_string())?;

    Ok(PruneAuditRecord {
        seq: row.get::<_, i64>(0).map_err(|e| e.to_string())? as u64,
        item_id: ItemId(item_str.parse().map_err(|e: uuid::Error| e.to_string())?),
        reason: reason_str.parse()?,
        pruned_at: pruned_str
            .parse()
            .map_err(|_| "invalid pruned_at".to_string())?,
        snapshot: serde_json::from_str(&snapshot_str).map_err(|e| e.to_string())?,
    })
}

/// Little-endian f32 bytes. Compact and lossless; SQLite has no native
/// vector type.
fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn blob_to_embedding(blob: &[u8]) -> std::result::Result<Vec<f32>, String> {
    if blob.len() % 4 != 0 {
        return Err(format!("embedding blob has odd length {}", blob.len()));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

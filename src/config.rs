//! Typed configuration with documented defaults.
//!
//! All knobs ship with the defaults the engine was tuned with. `from_env`
//! overlays `MNEMON_*` environment variables on top of the defaults and
//! fails fast on malformed values rather than silently ignoring them.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::model::Category;

/// Relative weights of the three ranking signals. Expected to sum to 1.0
/// so composite scores stay in [0, 1]; not enforced, since callers may
/// deliberately zero a term for experimentation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankWeights {
    pub cosine: f64,
    pub lexical: f64,
    pub recency: f64,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            cosine: 0.55,
            lexical: 0.25,
            recency: 0.20,
        }
    }
}

impl RankWeights {
    /// Pure-semantic weights: cosine only. Useful for evaluating the
    /// embedding signal in isolation.
    pub fn semantic_only() -> Self {
        Self {
            cosine: 1.0,
            lexical: 0.0,
            recency: 0.0,
        }
    }
}

/// Thresholds driving the pruner's eviction rules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PruneThresholds {
    /// Rule 2: evict when older than this and rarely accessed.
    pub max_age_days: f64,
    /// Items accessed at least this often are immune to rules 2 and 3.
    pub min_access_count: u32,
    /// Rule 3: evict when salience is below this and rarely accessed.
    pub salience_floor: f64,
    /// Items younger than this are never scanned, to avoid thrashing
    /// on fresh ingests.
    pub min_age_days: f64,
    /// Max items pulled per scan pass.
    pub scan_batch_size: usize,
}

impl Default for PruneThresholds {
    fn default() -> Self {
        Self {
            max_age_days: 180.0,
            min_access_count: 2,
            salience_floor: 0.1,
            min_age_days: 7.0,
            scan_batch_size: 500,
        }
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub weights: RankWeights,
    /// Recency signal halves every this many days.
    pub half_life_days: f64,
    /// Candidates with cosine similarity above this against an accepted
    /// item are dropped as near-duplicates.
    pub dedupe_threshold: f64,
    /// Default hard cap on bundle size, in model tokens.
    pub token_budget: usize,
    /// Optional per-category share of the token budget, as a fraction of
    /// the total. Categories absent from the map are uncapped.
    pub category_shares: HashMap<Category, f64>,
    /// Candidate pool bound fed to the ranker.
    pub top_k: usize,
    pub prune: PruneThresholds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            weights: RankWeights::default(),
            half_life_days: 14.0,
            dedupe_threshold: 0.92,
            token_budget: 2048,
            category_shares: HashMap::new(),
            top_k: 200,
            prune: PruneThresholds::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `MNEMON_*` environment variables.
    ///
    /// Recognized: `MNEMON_WEIGHT_COSINE`, `MNEMON_WEIGHT_LEXICAL`,
    /// `MNEMON_WEIGHT_RECENCY`, `MNEMON_HALF_LIFE_DAYS`,
    /// `MNEMON_DEDUPE_THRESHOLD`, `MNEMON_TOKEN_BUDGET`, `MNEMON_TOP_K`,
    /// `MNEMON_MAX_AGE_DAYS`, `MNEMON_MIN_ACCESS_COUNT`,
    /// `MNEMON_SALIENCE_FLOOR`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = parsed_var::<f64>("MNEMON_WEIGHT_COSINE")? {
            config.weights.cosine = v;
        }
        if let Some(v) = parsed_var::<f64>("MNEMON_WEIGHT_LEXICAL")? {
            config.weights.lexical = v;
        }
        if let Some(v) = parsed_var::<f64>("MNEMON_WEIGHT_RECENCY")? {
            config.weights.recency = v;
        }
        if let Some(v) = parsed_var::<f64>("MNEMON_HALF_LIFE_DAYS")? {
            config.half_life_days = v;
        }
        if let Some(v) = parsed_var::<f64>("MNEMON_DEDUPE_THRESHOLD")? {
            config.dedupe_threshold = v;
        }
        if let Some(v) = parsed_var::<usize>("MNEMON_TOKEN_BUDGET")? {
            config.token_budget = v;
        }
        if let Some(v) = parsed_var::<usize>("MNEMON_TOP_K")? {
            config.top_k = v;
        }
        if let Some(v) = parsed_var::<f64>("MNEMON_MAX_AGE_DAYS")? {
            config.prune.max_age_days = v;
        }
        if let Some(v) = parsed_var::<u32>("MNEMON_MIN_ACCESS_COUNT")? {
            config.prune.min_access_count = v;
        }
        if let Some(v) = parsed_var::<f64>("MNEMON_SALIENCE_FLOOR")? {
            config.prune.salience_floor = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make scores or budgets meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.half_life_days <= 0.0 {
            return Err(Error::Config("half_life_days must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.dedupe_threshold) {
            return Err(Error::Config("dedupe_threshold must be in [0, 1]".into()));
        }
        for w in [
            self.weights.cosine,
            self.weights.lexical,
            self.weights.recency,
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(Error::Config("rank weights must be in [0, 1]".into()));
            }
        }
        for (category, share) in &self.category_shares {
            if !(0.0..=1.0).contains(share) {
                return Err(Error::Config(format!(
                    "category share for {category} must be in [0, 1]"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.prune.salience_floor) {
            return Err(Error::Config("salience_floor must be in [0, 1]".into()));
        }
        Ok(())
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} has invalid value: {raw}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_sum_to_one() {
        let w = RankWeights::default();
        assert!((w.cosine + w.lexical + w.recency - 1.0).abs() < 1e-9);
    }

    #[test]
    fn validate_rejects_bad_half_life() {
        let config = EngineConfig {
            half_life_days: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_threshold() {
        let config = EngineConfig {
            dedupe_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

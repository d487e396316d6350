//! Background pruning: scan, evaluate, evict, audit.
//!
//! The sweep is an explicit state machine (Idle -> Scanning -> Evaluating
//! -> Evicting -> Idle) rather than an ad-hoc loop, driven by a timer or
//! an explicit trigger. Cancellation is checked at item boundaries, never
//! mid-item, so an eviction and its audit record always land together.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::PruneThresholds;
use crate::error::Result;
use crate::model::{MemoryItem, PruneReason};
use crate::store::ItemStore;

// ---------------------------------------------------------------------------
// Eviction rules
// ---------------------------------------------------------------------------

/// Apply the eviction rules in precedence order; first match wins.
///
/// 1. Hard expiration passed -> `Expired`.
/// 2. Older than `max_age_days` and accessed fewer than
///    `min_access_count` times -> `AgeThreshold`.
/// 3. Salience below `salience_floor` and accessed fewer than
///    `min_access_count` times -> `LowAccessLowSalience`.
/// 4. Otherwise retain.
pub fn evaluate(
    item: &MemoryItem,
    now: DateTime<Utc>,
    thresholds: &PruneThresholds,
) -> Option<PruneReason> {
    if item.is_expired(now) {
        return Some(PruneReason::Expired);
    }
    if item.age_days(now) > thresholds.max_age_days
        && item.access_count < thresholds.min_access_count
    {
        return Some(PruneReason::AgeThreshold);
    }
    if item.salience < thresholds.salience_floor
        && item.access_count < thresholds.min_access_count
    {
        return Some(PruneReason::LowAccessLowSalience);
    }
    None
}

// ---------------------------------------------------------------------------
// Sweep state machine
// ---------------------------------------------------------------------------

/// Where a sweep currently is. Cyclic; terminal only on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrunerState {
    Idle,
    Scanning,
    Evaluating,
    Evicting,
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub evicted: usize,
    pub retained: usize,
    /// Items whose eviction failed and was skipped. The sweep never
    /// aborts on a per-item failure.
    pub failed: usize,
    /// True when the sweep stopped early on a cancellation signal.
    pub cancelled: bool,
}

/// Cancellation signal shared between a sweep and its driver.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The pruner. Owns its own store handle, independent of any request path.
pub struct Pruner<S: ItemStore> {
    store: S,
    thresholds: PruneThresholds,
    state: PrunerState,
}

impl<S: ItemStore> Pruner<S> {
    pub fn new(store: S, thresholds: PruneThresholds) -> Self {
        Self {
            store,
            thresholds,
            state: PrunerState::Idle,
        }
    }

    pub fn state(&self) -> PrunerState {
        self.state
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Run one full sweep cycle: Idle -> Scanning -> Evaluating ->
    /// Evicting -> Idle.
    ///
    /// A scan failure aborts the cycle (the driver retries on its next
    /// tick); an evaluation or eviction failure on one item is logged and
    /// the sweep continues with the next.
    pub fn sweep(&mut self, cancel: &CancelFlag) -> Result<SweepReport> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        self.state = PrunerState::Scanning;
        let batch = match self.store.scan_prunable(
            now,
            self.thresholds.min_age_days,
            self.thresholds.scan_batch_size,
        ) {
            Ok(batch) => batch,
            Err(e) => {
                self.state = PrunerState::Idle;
                error!("prune scan failed: {e}");
                return Err(e);
            }
        };
        report.scanned = batch.len();

        for item in batch {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            self.state = PrunerState::Evaluating;
            let Some(reason) = evaluate(&item, now, &self.thresholds) else {
                report.retained += 1;
                continue;
            };

            self.state = PrunerState::Evicting;
            match self.store.evict(&item, reason) {
                Ok(()) => {
                    debug!(id = %item.id, %reason, "evicted");
                    report.evicted += 1;
                }
                Err(e) => {
                    // Failed eviction rolled back; item survives audited-or-not-at-all.
                    warn!(id = %item.id, %reason, "eviction failed, skipping: {e}");
                    report.failed += 1;
                }
            }
        }

        self.state = PrunerState::Idle;
        info!(
            scanned = report.scanned,
            evicted = report.evicted,
            retained = report.retained,
            failed = report.failed,
            cancelled = report.cancelled,
            "prune sweep complete"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Daemon driver
// ---------------------------------------------------------------------------

/// Handle for stopping a running [`PruneDaemon`] from another task.
#[derive(Clone)]
pub struct DaemonHandle {
    shutdown: Arc<Notify>,
    cancel: CancelFlag,
}

impl DaemonHandle {
    /// Stop the daemon: cancels any in-flight sweep at the next item
    /// boundary and exits the run loop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.shutdown.notify_one();
    }
}

/// Timer-driven sweep loop. The daemon owns its pruner (and through it a
/// dedicated store handle), so sweeps never contend with request-path
/// reads beyond what the store's snapshot semantics already allow.
pub struct PruneDaemon<S: ItemStore> {
    pruner: Pruner<S>,
    interval: std::time::Duration,
    shutdown: Arc<Notify>,
    cancel: CancelFlag,
}

impl<S: ItemStore> PruneDaemon<S> {
    pub fn new(store: S, thresholds: PruneThresholds, interval: std::time::Duration) -> Self {
        Self {
            pruner: Pruner::new(store, thresholds),
            interval,
            shutdown: Arc::new(Notify::new()),
            cancel: CancelFlag::new(),
        }
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            shutdown: Arc::clone(&self.shutdown),
            cancel: self.cancel.clone(),
        }
    }

    /// Run sweeps on the configured interval until shutdown.
    ///
    /// A failed sweep (store unavailable) is logged and retried on the
    /// next tick rather than tearing the loop down.
    pub async fn run(mut self) {
        info!(interval_s = self.interval.as_secs(), "prune daemon started");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("prune daemon shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            if self.cancel.is_cancelled() {
                info!("prune daemon shutting down");
                return;
            }

            if let Err(e) = self.pruner.sweep(&self.cancel) {
                warn!("sweep failed, retrying next tick: {e}");
            }
        }
    }
}

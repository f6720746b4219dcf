//! Sandbox pool allocator
//!
//! Atomically claims and returns sandbox slots against the
//! coordination store. Slot identities are stable: the pool list and
//! per-slot busy markers are the only mutable state, and every
//! mutation is a single atomic store operation. The allocator is
//! stateless with respect to evaluations; lifecycle events are the
//! monitor's responsibility.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::EvalResult;
use crate::evaluation::EvalId;
use crate::infra::{CoordinationStore, DurableStore, SlotRelease};

/// Coordination-store key holding the FIFO of free sandbox URLs
pub const AVAILABLE_KEY: &str = "available_executors";
/// Prefix of per-sandbox busy markers
pub const BUSY_PREFIX: &str = "executor:busy:";

/// Two releases of one slot closer together than this are classified
/// as a probable dual-callback rather than an operator action.
const DUAL_CALLBACK_WINDOW: Duration = Duration::from_secs(1);

/// Allocator counters, exposed for tests and introspection
#[derive(Default)]
pub struct PoolStats {
    claims: AtomicU64,
    releases: AtomicU64,
    double_releases: AtomicU64,
    unknown_releases: AtomicU64,
    forced_releases: AtomicU64,
    expired_reclaims: AtomicU64,
}

/// Point-in-time copy of [`PoolStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    /// Successful claims
    pub claims: u64,
    /// Normal releases
    pub releases: u64,
    /// Detected double releases
    pub double_releases: u64,
    /// Releases of slots with neither marker nor pool entry
    pub unknown_releases: u64,
    /// Releases forced by the reconciler for terminal evaluations
    pub forced_releases: u64,
    /// Slots reclaimed after their busy marker expired
    pub expired_reclaims: u64,
}

impl PoolStats {
    fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            claims: self.claims.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            double_releases: self.double_releases.load(Ordering::Relaxed),
            unknown_releases: self.unknown_releases.load(Ordering::Relaxed),
            forced_releases: self.forced_releases.load(Ordering::Relaxed),
            expired_reclaims: self.expired_reclaims.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of one reconciler pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Markers force-released because their evaluation was terminal or
    /// unknown
    pub forced_releases: u64,
    /// Slots returned to the pool after marker expiry
    pub expired_reclaims: u64,
}

/// Pool of execution sandboxes
pub struct SandboxPool {
    store: Arc<dyn CoordinationStore>,
    config: PoolConfig,
    sandboxes: Vec<String>,
    last_release: DashMap<String, Instant>,
    stats: PoolStats,
}

impl SandboxPool {
    /// Create a pool over the given sandbox URLs
    pub fn new(store: Arc<dyn CoordinationStore>, config: PoolConfig, sandboxes: Vec<String>) -> Self {
        Self {
            store,
            config,
            sandboxes,
            last_release: DashMap::new(),
            stats: PoolStats::default(),
        }
    }

    /// Seed the available list with every configured sandbox that is
    /// neither pooled nor busy. Safe to call repeatedly.
    pub async fn init(&self) -> EvalResult<()> {
        let available = self.store.list_range(AVAILABLE_KEY).await?;
        for url in &self.sandboxes {
            let busy = self
                .store
                .get(&format!("{}{}", BUSY_PREFIX, url))
                .await?
                .is_some();
            if !busy && !available.iter().any(|s| s == url) {
                self.store.push_front(AVAILABLE_KEY, url).await?;
            }
        }
        info!(pool_size = self.sandboxes.len(), "sandbox pool initialized");
        Ok(())
    }

    /// Atomically claim a sandbox for `eval_id`
    ///
    /// Returns `None` when the pool is exhausted; at most one claimer
    /// can win any given slot.
    pub async fn claim(&self, eval_id: &EvalId) -> EvalResult<Option<String>> {
        let claimed = self
            .store
            .claim_slot(
                AVAILABLE_KEY,
                BUSY_PREFIX,
                eval_id.as_str(),
                self.config.busy_ttl(),
            )
            .await?;
        if let Some(url) = &claimed {
            self.stats.claims.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("evald_pool_claims_total").increment(1);
            debug!(%eval_id, sandbox = %url, "claimed sandbox");
        }
        Ok(claimed)
    }

    /// Idempotently return a sandbox to the pool
    ///
    /// Wired as both the success-path and failure-path continuation of
    /// dispatch, so a second signal for the same slot is expected
    /// occasionally: it is detected and counted, never corrupting pool
    /// state.
    pub async fn release(&self, url: &str) -> EvalResult<SlotRelease> {
        let outcome = self
            .store
            .release_slot(AVAILABLE_KEY, BUSY_PREFIX, url)
            .await?;
        let previous = self.last_release.insert(url.to_string(), Instant::now());

        match outcome {
            SlotRelease::Released => {
                self.stats.releases.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("evald_pool_releases_total").increment(1);
                debug!(sandbox = %url, "released sandbox");
            }
            SlotRelease::DoubleRelease => {
                self.stats.double_releases.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("evald_pool_double_releases_total").increment(1);
                let interval = previous.map(|at| at.elapsed());
                match interval {
                    Some(gap) if gap <= DUAL_CALLBACK_WINDOW => warn!(
                        sandbox = %url,
                        interval_ms = gap.as_millis() as u64,
                        "double release detected: probable dual-callback"
                    ),
                    Some(gap) => warn!(
                        sandbox = %url,
                        interval_ms = gap.as_millis() as u64,
                        "double release detected"
                    ),
                    None => warn!(sandbox = %url, "double release detected"),
                }
            }
            SlotRelease::UnknownSlot => {
                self.stats.unknown_releases.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("evald_pool_unknown_releases_total").increment(1);
                warn!(sandbox = %url, "release of unknown sandbox");
            }
        }
        Ok(outcome)
    }

    /// Free sandboxes, head first
    pub async fn available(&self) -> EvalResult<Vec<String>> {
        self.store.list_range(AVAILABLE_KEY).await
    }

    /// Busy sandboxes with the evaluation holding each
    pub async fn busy(&self) -> EvalResult<Vec<(String, String)>> {
        let mut held = Vec::new();
        for key in self.store.keys_with_prefix(BUSY_PREFIX).await? {
            let url = key.trim_start_matches(BUSY_PREFIX).to_string();
            if let Some(owner) = self.store.get(&key).await? {
                held.push((url, owner));
            }
        }
        Ok(held)
    }

    /// Counter snapshot
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    /// One reconciler pass: force-release markers whose evaluation is
    /// terminal (or unparseable), then return slots whose marker
    /// expired to the pool. Run from a single process per deployment.
    pub async fn reconcile(&self, durable: &Arc<dyn DurableStore>) -> EvalResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for key in self.store.keys_with_prefix(BUSY_PREFIX).await? {
            let url = key.trim_start_matches(BUSY_PREFIX).to_string();
            let Some(owner) = self.store.get(&key).await? else {
                continue;
            };
            let terminal = match EvalId::parse_str(&owner) {
                Ok(id) => match durable.get(&id).await? {
                    Some(eval) => eval.status.is_terminal(),
                    // Unknown evaluation holding a slot: treat as leaked.
                    None => true,
                },
                Err(_) => true,
            };
            if terminal {
                if self.release(&url).await? == SlotRelease::Released {
                    self.stats.forced_releases.fetch_add(1, Ordering::Relaxed);
                    report.forced_releases += 1;
                    info!(sandbox = %url, owner = %owner, "force-released sandbox held by terminal evaluation");
                }
            }
        }

        let available = self.store.list_range(AVAILABLE_KEY).await?;
        for url in &self.sandboxes {
            let busy = self
                .store
                .get(&format!("{}{}", BUSY_PREFIX, url))
                .await?
                .is_some();
            if !busy && !available.iter().any(|s| s == url) {
                self.store.push_front(AVAILABLE_KEY, url).await?;
                self.stats.expired_reclaims.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("evald_pool_expired_reclaims_total").increment(1);
                report.expired_reclaims += 1;
                warn!(sandbox = %url, "reclaimed sandbox after busy-marker expiry");
            }
        }
        Ok(report)
    }
}

//! Durable store writer
//!
//! Subscribes to every `evaluation:*` channel and applies each event
//! under the status state machine, atomically via optimistic
//! concurrency on the record version. This is the only place
//! evaluation status is mutated after creation; malordered events are
//! rejected here rather than corrupting state, and re-delivered
//! terminal events are idempotent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, warn};

use crate::config::{PlatformLimits, WriterConfig};
use crate::error::{EvalError, EvalResult};
use crate::evaluation::{transition_allowed, Evaluation};
use crate::events::{EventKind, LifecycleEvent};
use crate::infra::{DurableStore, EventBus};
use crate::task::Priority;

/// What applying one event did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The transition was applied
    Applied,
    /// The event re-delivered an already-applied state
    Idempotent,
    /// The transition is illegal; the event was dropped
    Rejected,
}

/// Writer counters
#[derive(Default)]
pub struct WriterStats {
    applied: AtomicU64,
    idempotent: AtomicU64,
    rejected: AtomicU64,
    skeletons_created: AtomicU64,
}

impl WriterStats {
    /// Transitions applied
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Idempotent re-deliveries
    pub fn idempotent(&self) -> u64 {
        self.idempotent.load(Ordering::Relaxed)
    }

    /// Rejected transitions
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Records created from non-queued events for unknown ids
    pub fn skeletons_created(&self) -> u64 {
        self.skeletons_created.load(Ordering::Relaxed)
    }
}

/// Applies lifecycle events to the durable store
pub struct StoreWriter {
    config: WriterConfig,
    limits: PlatformLimits,
    durable: Arc<dyn DurableStore>,
    bus: Arc<dyn EventBus>,
    stats: WriterStats,
}

impl StoreWriter {
    /// Build a writer over the injected collaborators
    pub fn new(
        config: WriterConfig,
        limits: PlatformLimits,
        durable: Arc<dyn DurableStore>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            config,
            limits,
            durable,
            bus,
            stats: WriterStats::default(),
        }
    }

    /// Counter access
    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    /// Writer loop: apply events until shutdown
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        self.run_with(self.bus.subscribe(), shutdown).await
    }

    /// Writer loop over an already-open subscription, so no event
    /// published between wiring and spawning is lost
    pub async fn run_with(
        &self,
        mut rx: broadcast::Receiver<LifecycleEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = rx.recv() => match received {
                    Ok(event) => {
                        if let Err(e) = self.apply(&event).await {
                            error!(eval_id = %event.eval_id, error = %e, "failed to apply event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "writer lagged behind the event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    /// Apply one event under the state machine
    pub async fn apply(&self, event: &LifecycleEvent) -> EvalResult<ApplyOutcome> {
        loop {
            let Some(current) = self.durable.get(&event.eval_id).await? else {
                if let Some(outcome) = self.materialize(event).await? {
                    return Ok(outcome);
                }
                continue;
            };

            let target = event.kind.status();
            if current.status == target {
                return self.apply_idempotent(&current, event).await;
            }

            if !transition_allowed(current.status, target, self.config.allow_skipped_running) {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("evald_writer_rejected_transitions_total").increment(1);
                warn!(
                    eval_id = %event.eval_id,
                    from = %current.status,
                    to = %target,
                    sequence = event.sequence,
                    "rejected illegal transition, dropping event"
                );
                return Ok(ApplyOutcome::Rejected);
            }

            let mut next = current.clone();
            self.merge(&mut next, event);
            if self.durable.update_if_version(&next, current.version).await? {
                self.stats.applied.fetch_add(1, Ordering::Relaxed);
                debug!(
                    eval_id = %event.eval_id,
                    from = %current.status,
                    to = %target,
                    "transition applied"
                );
                return Ok(ApplyOutcome::Applied);
            }
            // Version contention: reload and retry.
        }
    }

    /// Create a record for an event whose evaluation is unknown. The
    /// `queued` snapshot reproduces the submission and completes the
    /// `(initial) -> queued` transition in one step; anything else gets
    /// a skeleton so a late or lost `queued` event cannot stall the
    /// terminal outcome, and the caller re-applies the event against it.
    async fn materialize(&self, event: &LifecycleEvent) -> EvalResult<Option<ApplyOutcome>> {
        let (eval, applies_event) = match (&event.kind, &event.submission) {
            (EventKind::Queued, Some(snapshot)) => (
                Evaluation::new(
                    event.eval_id.clone(),
                    snapshot.source.clone(),
                    snapshot.runtime.clone(),
                    snapshot.timeout_secs,
                    snapshot.priority,
                ),
                true,
            ),
            _ => {
                self.stats.skeletons_created.fetch_add(1, Ordering::Relaxed);
                warn!(
                    eval_id = %event.eval_id,
                    kind = ?event.kind,
                    "event for unknown evaluation, creating skeleton record"
                );
                (
                    Evaluation::new(
                        event.eval_id.clone(),
                        String::new(),
                        "unknown".to_string(),
                        0,
                        Priority::Normal,
                    ),
                    false,
                )
            }
        };
        match self.durable.insert(&eval).await {
            Ok(()) if applies_event => {
                self.stats.applied.fetch_add(1, Ordering::Relaxed);
                Ok(Some(ApplyOutcome::Applied))
            }
            Ok(()) | Err(EvalError::AlreadyExists(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn apply_idempotent(
        &self,
        current: &Evaluation,
        event: &LifecycleEvent,
    ) -> EvalResult<ApplyOutcome> {
        self.stats.idempotent.fetch_add(1, Ordering::Relaxed);
        if !current.status.is_terminal() {
            return Ok(ApplyOutcome::Idempotent);
        }

        // Terminal re-delivery refreshes the update timestamp; output
        // fields are only ever extended, and only when asked to.
        let mut next = current.clone();
        next.updated_at = next.updated_at.max(chrono::Utc::now());
        if event.append {
            if let Some(extra) = &event.output {
                let merged = format!("{}{}", next.output.as_deref().unwrap_or(""), extra);
                next.output = Some(self.limits.clamp_output(&merged));
            }
            if let Some(extra) = &event.stderr {
                let merged = format!("{}{}", next.stderr.as_deref().unwrap_or(""), extra);
                next.stderr = Some(self.limits.clamp_output(&merged));
            }
        }
        // Lost CAS here means another writer already refreshed it.
        let _ = self.durable.update_if_version(&next, current.version).await?;
        Ok(ApplyOutcome::Idempotent)
    }

    fn merge(&self, next: &mut Evaluation, event: &LifecycleEvent) {
        let target = event.kind.status();
        next.status = target;
        // First-entry timestamps are never rewound.
        next.updated_at = next.updated_at.max(event.timestamp).max(chrono::Utc::now());

        if let Some(url) = &event.sandbox_url {
            next.assigned_sandbox = Some(url.clone());
        }
        if next.job_name.is_none() {
            next.job_name = event.job_name.clone();
        }

        if target.is_terminal() {
            if next.exit_code.is_none() {
                next.exit_code = event.exit_code;
            }
            if next.output.is_none() {
                next.output = event.output.as_deref().map(|o| self.limits.clamp_output(o));
            }
            if next.stderr.is_none() {
                next.stderr = event.stderr.as_deref().map(|o| self.limits.clamp_output(o));
            }
            if next.error.is_none() {
                next.error = event.error.clone();
            }
            if let Some(retries) = event.retry_count {
                next.retry_count = next.retry_count.max(retries);
            }
            // Advisory only once terminal.
            next.assigned_sandbox = None;
        }
    }
}

//! Submission gateway
//!
//! Owns the evaluation id space and the initial durable record.
//! Accepted submissions get a time-sortable id, a sequence-0 `queued`
//! event, and a task envelope on the dispatcher stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{GatewayConfig, PlatformLimits};
use crate::error::{EvalError, EvalResult};
use crate::evaluation::{EvalId, EvalStatus, Evaluation};
use crate::events::{LifecycleEvent, SubmissionSnapshot};
use crate::infra::{CoordinationStore, DurableStore, EventBus, TaskStream};
use crate::task::{ExecuteTask, Priority, TaskEnvelope, TaskKind};

/// One submission
#[derive(Debug, Clone)]
pub struct SubmissionRequest {
    /// Source text to execute
    pub source: String,
    /// Target runtime tag
    pub runtime: String,
    /// Requested execution deadline in seconds
    pub timeout_secs: u64,
    /// Priority class
    pub priority: Priority,
}

/// Gateway counters
#[derive(Default)]
pub struct GatewayStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    queued_publish_failures: AtomicU64,
}

impl GatewayStats {
    /// Accepted submissions
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Validation rejections
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// `queued` events that failed to publish (non-fatal)
    pub fn queued_publish_failures(&self) -> u64 {
        self.queued_publish_failures.load(Ordering::Relaxed)
    }
}

/// Entry point for new evaluations
pub struct SubmissionGateway {
    limits: PlatformLimits,
    config: GatewayConfig,
    durable: Arc<dyn DurableStore>,
    bus: Arc<dyn EventBus>,
    stream: Arc<dyn TaskStream>,
    coord: Arc<dyn CoordinationStore>,
    stats: GatewayStats,
}

impl SubmissionGateway {
    /// Build a gateway over the injected collaborators
    pub fn new(
        limits: PlatformLimits,
        config: GatewayConfig,
        durable: Arc<dyn DurableStore>,
        bus: Arc<dyn EventBus>,
        stream: Arc<dyn TaskStream>,
        coord: Arc<dyn CoordinationStore>,
    ) -> Self {
        Self {
            limits,
            config,
            durable,
            bus,
            stream,
            coord,
            stats: GatewayStats::default(),
        }
    }

    fn validate(&self, request: &SubmissionRequest) -> EvalResult<()> {
        if request.source.is_empty() {
            return Err(EvalError::Validation("source must not be empty".to_string()));
        }
        if request.source.len() > self.limits.max_source_bytes {
            return Err(EvalError::Validation(format!(
                "source exceeds {} bytes",
                self.limits.max_source_bytes
            )));
        }
        if request.timeout_secs == 0 || request.timeout_secs > self.limits.max_timeout_secs {
            return Err(EvalError::Validation(format!(
                "timeout must be between 1 and {} seconds",
                self.limits.max_timeout_secs
            )));
        }
        if !self.config.runtimes.iter().any(|r| r == &request.runtime) {
            return Err(EvalError::Validation(format!(
                "unknown runtime tag: {}",
                request.runtime
            )));
        }
        Ok(())
    }

    /// Accept one submission, returning its evaluation id
    pub async fn submit(&self, request: SubmissionRequest) -> EvalResult<EvalId> {
        if let Err(e) = self.validate(&request) {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let id = EvalId::generate();
        let eval = Evaluation::new(
            id.clone(),
            request.source.clone(),
            request.runtime.clone(),
            request.timeout_secs,
            request.priority,
        );
        self.durable.insert(&eval).await?;

        // A lost `queued` event is non-fatal: the writer observes the
        // first real lifecycle event instead.
        match self.publish_queued(&id, &request).await {
            Ok(()) => {}
            Err(e) => {
                self.stats
                    .queued_publish_failures
                    .fetch_add(1, Ordering::Relaxed);
                metrics::counter!("evald_gateway_queued_publish_failures_total").increment(1);
                warn!(eval_id = %id, error = %e, "failed to publish queued event");
            }
        }

        let envelope = TaskEnvelope::new(TaskKind::Execute(ExecuteTask {
            eval_id: id.clone(),
            source: request.source,
            runtime: request.runtime,
            timeout_secs: request.timeout_secs,
            priority: request.priority,
        }));
        if let Err(e) = self.stream.enqueue(envelope).await {
            self.mark_unschedulable(&id).await;
            return Err(EvalError::ServiceUnavailable(format!(
                "task stream enqueue failed: {}",
                e
            )));
        }

        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("evald_gateway_accepted_total").increment(1);
        info!(eval_id = %id, priority = ?request.priority, "submission accepted");
        Ok(id)
    }

    async fn publish_queued(&self, id: &EvalId, request: &SubmissionRequest) -> EvalResult<()> {
        let sequence = self.coord.next_sequence(id).await?;
        let event = LifecycleEvent::queued(
            id.clone(),
            sequence,
            SubmissionSnapshot {
                source: request.source.clone(),
                runtime: request.runtime.clone(),
                timeout_secs: request.timeout_secs,
                priority: request.priority,
            },
        );
        self.bus.publish(&event).await
    }

    /// The submission never reached the task stream; the gateway still
    /// owns the record, so it writes the failure directly.
    async fn mark_unschedulable(&self, id: &EvalId) {
        let Ok(Some(mut eval)) = self.durable.get(id).await else {
            return;
        };
        let expected = eval.version;
        eval.status = EvalStatus::Failed;
        eval.error = Some("service_unavailable".to_string());
        eval.updated_at = chrono::Utc::now();
        let _ = self.durable.update_if_version(&eval, expected).await;
    }

    /// Accept a batch; items succeed or fail independently
    ///
    /// Fan-out is shaped by a plain inter-item delay; the ceiling bounds
    /// a single batch.
    pub async fn submit_batch(
        &self,
        requests: Vec<SubmissionRequest>,
    ) -> EvalResult<Vec<EvalResult<EvalId>>> {
        if requests.len() > self.config.batch_ceiling {
            return Err(EvalError::Validation(format!(
                "batch exceeds ceiling of {} items",
                self.config.batch_ceiling
            )));
        }

        let delay = self.config.inter_item_delay();
        let mut results = Vec::with_capacity(requests.len());
        let total = requests.len();
        for (index, request) in requests.into_iter().enumerate() {
            results.push(self.submit(request).await);
            if index + 1 < total {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(results)
    }

    /// Counter access
    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }
}

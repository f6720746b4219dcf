//! Task dispatcher
//!
//! Consumes the task stream and runs the two-phase assign-then-execute
//! chain for each envelope. Phase 1 (sandbox assignment) tolerates
//! unbounded waiting so pool exhaustion never consumes the retry
//! budget; Phase 2 (orchestrator submission) retries within a bounded
//! budget and dead-letters on exhaustion. The sandbox release is wired
//! on every exit path of Phase 2, success and failure alike, and the
//! allocator tolerates the resulting dual fires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::allocator::SandboxPool;
use crate::config::PipelineConfig;
use crate::error::{EvalError, EvalResult};
use crate::evaluation::EvalId;
use crate::events::LifecycleEvent;
use crate::infra::{
    CoordinationStore, DurableStore, EventBus, ExecuteRequest, OrchestratorClient,
    OrchestratorError, TaskStream,
};
use crate::resilience::{backoff_delay, jittered, DeadLetterStore};
use crate::task::{ExecuteTask, TaskEnvelope, TaskKind};

/// Margin added to the evaluation deadline before the release waiter
/// gives up and releases unconditionally
const RELEASE_WAIT_MARGIN: Duration = Duration::from_secs(120);

/// Dispatcher counters
#[derive(Default)]
pub struct DispatcherStats {
    dispatched: AtomicU64,
    dead_lettered: AtomicU64,
    capacity_retries: AtomicU64,
    discarded_terminal: AtomicU64,
    discarded_duplicates: AtomicU64,
}

impl DispatcherStats {
    /// Tasks successfully handed to the orchestrator
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Tasks moved to the dead-letter store
    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    /// Phase-2 capacity rejections that re-entered Phase 1
    pub fn capacity_retries(&self) -> u64 {
        self.capacity_retries.load(Ordering::Relaxed)
    }

    /// Envelopes discarded because their evaluation was already terminal
    pub fn discarded_terminal(&self) -> u64 {
        self.discarded_terminal.load(Ordering::Relaxed)
    }

    /// Redelivered envelopes discarded because another delivery holds
    /// the assignment
    pub fn discarded_duplicates(&self) -> u64 {
        self.discarded_duplicates.load(Ordering::Relaxed)
    }
}

enum SandboxAcquire {
    Claimed(String),
    EvalTerminal,
    Shutdown,
}

/// One dispatcher worker; multiple may run concurrently
pub struct DispatcherWorker {
    config: PipelineConfig,
    stream: Arc<dyn TaskStream>,
    pool: Arc<SandboxPool>,
    orchestrator: Arc<dyn OrchestratorClient>,
    bus: Arc<dyn EventBus>,
    durable: Arc<dyn DurableStore>,
    coord: Arc<dyn CoordinationStore>,
    dlq: Arc<DeadLetterStore>,
    stats: DispatcherStats,
}

impl DispatcherWorker {
    /// Build a worker over the injected collaborators
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        stream: Arc<dyn TaskStream>,
        pool: Arc<SandboxPool>,
        orchestrator: Arc<dyn OrchestratorClient>,
        bus: Arc<dyn EventBus>,
        durable: Arc<dyn DurableStore>,
        coord: Arc<dyn CoordinationStore>,
        dlq: Arc<DeadLetterStore>,
    ) -> Self {
        Self {
            config,
            stream,
            pool,
            orchestrator,
            bus,
            durable,
            coord,
            dlq,
            stats: DispatcherStats::default(),
        }
    }

    /// Counter access
    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    /// Worker loop: dequeue and dispatch until shutdown
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                dequeued = self.stream.dequeue(Duration::from_secs(1)) => match dequeued {
                    Ok(Some(envelope)) => {
                        if let Err(e) = self.handle(envelope, &mut shutdown).await {
                            error!(error = %e, "task handling failed");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "task dequeue failed");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                },
            }
        }
    }

    async fn handle(
        &self,
        envelope: TaskEnvelope,
        shutdown: &mut watch::Receiver<bool>,
    ) -> EvalResult<()> {
        match &envelope.kind {
            TaskKind::Execute(task) => {
                let task = task.clone();
                self.dispatch_execute(envelope, task, shutdown).await
            }
        }
    }

    async fn dispatch_execute(
        &self,
        envelope: TaskEnvelope,
        task: ExecuteTask,
        shutdown: &mut watch::Receiver<bool>,
    ) -> EvalResult<()> {
        // A cancellation that lands before scheduling shows up as a
        // terminal record; the envelope is discarded on dequeue.
        if self.eval_is_terminal(&task.eval_id).await? {
            self.stats.discarded_terminal.fetch_add(1, Ordering::Relaxed);
            debug!(eval_id = %task.eval_id, "discarding task for terminal evaluation");
            return self.stream.ack(envelope.task_id).await;
        }

        // At-least-once delivery means duplicates. The assigner marker
        // makes this delivery the single consumer for the evaluation;
        // its TTL frees the assignment if this worker dies mid-chain.
        let assigner_key = format!("assigner:{}", task.eval_id);
        let delivery = envelope.task_id.to_string();
        let won = self
            .coord
            .set_if_absent_with_ttl(&assigner_key, &delivery, self.config.pool.busy_ttl())
            .await?;
        if !won {
            let holder = self.coord.get(&assigner_key).await?;
            if holder.as_deref() != Some(delivery.as_str()) {
                self.stats.discarded_duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(
                    eval_id = %task.eval_id,
                    holder = holder.as_deref().unwrap_or(""),
                    "discarding duplicate delivery"
                );
                return self.stream.ack(envelope.task_id).await;
            }
        }

        let request = ExecuteRequest {
            eval_id: task.eval_id.clone(),
            code: task.source.clone(),
            language: task.runtime.clone(),
            timeout_secs: task.timeout_secs,
            memory_limit_mb: self.config.limits.memory_limit_mb,
            cpu_limit: self.config.limits.cpu_limit,
        };

        let mut quota_attempts = 0u32;
        loop {
            // Phase 1: assignment. Waits as long as it takes.
            let sandbox = match self.acquire_sandbox(&task, shutdown).await? {
                SandboxAcquire::Claimed(url) => url,
                SandboxAcquire::EvalTerminal => {
                    self.stats.discarded_terminal.fetch_add(1, Ordering::Relaxed);
                    return self.stream.ack(envelope.task_id).await;
                }
                SandboxAcquire::Shutdown => {
                    return self.stream.nack(envelope.task_id).await;
                }
            };
            self.publish_provisioning(&task.eval_id, &sandbox).await;

            // Phase 2: execution.
            match self.submit_with_transient_retry(&request).await {
                Ok(job_name) => {
                    self.spawn_release_waiter(task.eval_id.clone(), sandbox, task.timeout_secs);
                    self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("evald_dispatcher_dispatched_total").increment(1);
                    info!(eval_id = %task.eval_id, job = %job_name, "task submitted to orchestrator");
                    return self.stream.ack(envelope.task_id).await;
                }
                Err(OrchestratorError::CapacityExceeded) => {
                    // The sandbox filled since Phase 1, or the
                    // orchestrator hit its admission window. Never
                    // dead-lettered for capacity alone.
                    self.pool.release(&sandbox).await?;
                    self.stats.capacity_retries.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("evald_dispatcher_capacity_retries_total").increment(1);
                    tokio::time::sleep(jittered(
                        Duration::from_millis(self.config.pool.claim_backoff_ms),
                        0.5,
                    ))
                    .await;
                }
                Err(OrchestratorError::QuotaExhausted) => {
                    self.pool.release(&sandbox).await?;
                    quota_attempts += 1;
                    if quota_attempts > self.config.retry.max_attempts {
                        return self
                            .dead_letter(
                                &envelope,
                                &task,
                                EvalError::QuotaExhausted(
                                    "orchestrator quota exhausted beyond retry budget".to_string(),
                                ),
                                quota_attempts,
                            )
                            .await;
                    }
                    tokio::time::sleep(backoff_delay(&self.config.retry, quota_attempts - 1)).await;
                }
                Err(OrchestratorError::Unavailable(msg)) => {
                    // Transient retry budget exhausted inside
                    // submit_with_transient_retry.
                    self.pool.release(&sandbox).await?;
                    return self
                        .dead_letter(
                            &envelope,
                            &task,
                            EvalError::OrchestratorUnavailable(msg),
                            self.config.retry.max_attempts,
                        )
                        .await;
                }
                Err(OrchestratorError::Rejected(msg)) => {
                    self.pool.release(&sandbox).await?;
                    return self
                        .dead_letter(&envelope, &task, EvalError::OrchestratorRejected(msg), 0)
                        .await;
                }
            }
        }
    }

    /// Retry transient submission failures in place, keeping the
    /// claimed sandbox. Other error classes return immediately.
    async fn submit_with_transient_retry(
        &self,
        request: &ExecuteRequest,
    ) -> Result<String, OrchestratorError> {
        let mut attempt = 0u32;
        loop {
            match self.orchestrator.submit(request).await {
                Err(OrchestratorError::Unavailable(msg)) => {
                    attempt += 1;
                    if attempt > self.config.retry.max_attempts {
                        return Err(OrchestratorError::Unavailable(msg));
                    }
                    warn!(
                        eval_id = %request.eval_id,
                        attempt,
                        error = %msg,
                        "transient submission failure, retrying"
                    );
                    tokio::time::sleep(backoff_delay(&self.config.retry, attempt - 1)).await;
                }
                other => return other,
            }
        }
    }

    async fn acquire_sandbox(
        &self,
        task: &ExecuteTask,
        shutdown: &mut watch::Receiver<bool>,
    ) -> EvalResult<SandboxAcquire> {
        loop {
            if self.eval_is_terminal(&task.eval_id).await? {
                return Ok(SandboxAcquire::EvalTerminal);
            }
            if let Some(url) = self.pool.claim(&task.eval_id).await? {
                return Ok(SandboxAcquire::Claimed(url));
            }
            let wait = jittered(Duration::from_millis(self.config.pool.claim_backoff_ms), 0.5);
            tokio::select! {
                _ = shutdown.changed() => return Ok(SandboxAcquire::Shutdown),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn eval_is_terminal(&self, eval_id: &EvalId) -> EvalResult<bool> {
        Ok(self
            .durable
            .get(eval_id)
            .await?
            .map(|eval| eval.is_terminal())
            .unwrap_or(false))
    }

    /// Advisory only: a lost provisioning event does not stall the
    /// pipeline.
    async fn publish_provisioning(&self, eval_id: &EvalId, sandbox: &str) {
        let sequence = match self.coord.next_sequence(eval_id).await {
            Ok(seq) => seq,
            Err(e) => {
                warn!(eval_id = %eval_id, error = %e, "sequence allocation failed");
                return;
            }
        };
        let event = LifecycleEvent::provisioning(eval_id.clone(), sequence, sandbox.to_string());
        if let Err(e) = self.bus.publish(&event).await {
            warn!(eval_id = %eval_id, error = %e, "failed to publish provisioning event");
        }
    }

    /// Success-path release continuation: waits for the evaluation's
    /// terminal event on the bus, then returns the sandbox. The
    /// deadline fallback and the busy-marker TTL cover lost events.
    fn spawn_release_waiter(&self, eval_id: EvalId, sandbox: String, timeout_secs: u64) {
        let mut rx = self.bus.subscribe();
        let pool = self.pool.clone();
        let wait = Duration::from_secs(timeout_secs) + RELEASE_WAIT_MARGIN;
        tokio::spawn(async move {
            let deadline = tokio::time::sleep(wait);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    received = rx.recv() => match received {
                        Ok(ev) if ev.eval_id == eval_id && ev.kind.is_terminal() => break,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            if let Err(e) = pool.release(&sandbox).await {
                warn!(sandbox = %sandbox, error = %e, "release continuation failed");
            }
        });
    }

    async fn dead_letter(
        &self,
        envelope: &TaskEnvelope,
        task: &ExecuteTask,
        error: EvalError,
        attempts: u32,
    ) -> EvalResult<()> {
        let retry_count = envelope.retry_count + attempts;
        self.dlq.record(envelope, &error, retry_count).await?;
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("evald_dispatcher_dead_lettered_total").increment(1);
        error!(
            eval_id = %task.eval_id,
            class = error.class(),
            retry_count,
            "task dead-lettered"
        );

        match self.coord.next_sequence(&task.eval_id).await {
            Ok(sequence) => {
                let mut event =
                    LifecycleEvent::failed(task.eval_id.clone(), sequence, error.class().to_string());
                event.retry_count = Some(retry_count);
                if let Err(e) = self.bus.publish(&event).await {
                    warn!(eval_id = %task.eval_id, error = %e, "failed to publish failed event");
                }
            }
            Err(e) => warn!(eval_id = %task.eval_id, error = %e, "sequence allocation failed"),
        }
        self.stream.ack(envelope.task_id).await
    }
}

//! Pipeline wiring and supervision
//!
//! Builds every component over the injected infrastructure, spawns the
//! worker loops, and offers the library-level entry points: submit,
//! read, cancel, shutdown.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::allocator::SandboxPool;
use crate::config::PipelineConfig;
use crate::dispatcher::DispatcherWorker;
use crate::error::{EvalError, EvalResult};
use crate::evaluation::{EvalId, Evaluation};
use crate::events::LifecycleEvent;
use crate::gateway::{SubmissionGateway, SubmissionRequest};
use crate::infra::{CoordinationStore, DurableStore, EventBus, OrchestratorClient, TaskStream};
use crate::monitor::LifecycleMonitor;
use crate::resilience::DeadLetterStore;
use crate::writer::StoreWriter;

/// Grace period for worker loops to finish on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The assembled evaluation pipeline
pub struct EvalPipeline {
    /// Submission gateway
    pub gateway: Arc<SubmissionGateway>,
    /// Sandbox pool allocator
    pub pool: Arc<SandboxPool>,
    /// Lifecycle monitor
    pub monitor: Arc<LifecycleMonitor>,
    /// Durable store writer
    pub writer: Arc<StoreWriter>,
    /// Dispatcher workers
    pub dispatchers: Vec<Arc<DispatcherWorker>>,
    /// Dead-letter store
    pub dlq: Arc<DeadLetterStore>,
    durable: Arc<dyn DurableStore>,
    orchestrator: Arc<dyn OrchestratorClient>,
    coord: Arc<dyn CoordinationStore>,
    bus: Arc<dyn EventBus>,
    shutdown_tx: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl EvalPipeline {
    /// Wire up every component, seed the sandbox pool, and start the
    /// worker loops
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        config: PipelineConfig,
        sandboxes: Vec<String>,
        workers: usize,
        stream: Arc<dyn TaskStream>,
        bus: Arc<dyn EventBus>,
        coord: Arc<dyn CoordinationStore>,
        durable: Arc<dyn DurableStore>,
        orchestrator: Arc<dyn OrchestratorClient>,
    ) -> EvalResult<Self> {
        config.validate()?;

        let pool = Arc::new(SandboxPool::new(
            coord.clone(),
            config.pool.clone(),
            sandboxes,
        ));
        pool.init().await?;

        let dlq = Arc::new(DeadLetterStore::new(
            coord.clone(),
            config.retry.dlq_capacity,
        ));
        let gateway = Arc::new(SubmissionGateway::new(
            config.limits.clone(),
            config.gateway.clone(),
            durable.clone(),
            bus.clone(),
            stream.clone(),
            coord.clone(),
        ));
        let writer = Arc::new(StoreWriter::new(
            config.writer.clone(),
            config.limits.clone(),
            durable.clone(),
            bus.clone(),
        ));
        let monitor = Arc::new(LifecycleMonitor::new(
            config.monitor.clone(),
            config.limits.clone(),
            config.retry.clone(),
            orchestrator.clone(),
            bus.clone(),
            coord.clone(),
            durable.clone(),
        ));

        let dispatchers: Vec<Arc<DispatcherWorker>> = (0..workers.max(1))
            .map(|_| {
                Arc::new(DispatcherWorker::new(
                    config.clone(),
                    stream.clone(),
                    pool.clone(),
                    orchestrator.clone(),
                    bus.clone(),
                    durable.clone(),
                    coord.clone(),
                    dlq.clone(),
                ))
            })
            .collect();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        // Subscribe before anything can publish, then spawn.
        let writer_rx = bus.subscribe();
        {
            let writer = writer.clone();
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                writer.run_with(writer_rx, shutdown).await;
            }));
        }
        {
            let monitor = monitor.clone();
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                monitor.run(shutdown).await;
            }));
        }
        {
            let monitor = monitor.clone();
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                monitor.run_orphan_reconciler(shutdown).await;
            }));
        }
        {
            let pool = pool.clone();
            let durable = durable.clone();
            let interval = Duration::from_secs(config.pool.reconcile_interval_secs);
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(interval) => {
                            if let Err(e) = pool.reconcile(&durable).await {
                                warn!(error = %e, "pool reconciliation failed");
                            }
                        }
                    }
                }
            }));
        }
        for dispatcher in &dispatchers {
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                dispatcher.run(shutdown).await;
            }));
        }

        info!(workers = dispatchers.len(), "evaluation pipeline started");
        Ok(Self {
            gateway,
            pool,
            monitor,
            writer,
            dispatchers,
            dlq,
            durable,
            orchestrator,
            coord,
            bus,
            shutdown_tx,
            tasks: parking_lot::Mutex::new(tasks),
        })
    }

    /// Accept one submission
    pub async fn submit(&self, request: SubmissionRequest) -> EvalResult<EvalId> {
        self.gateway.submit(request).await
    }

    /// Accept a batch of submissions
    pub async fn submit_batch(
        &self,
        requests: Vec<SubmissionRequest>,
    ) -> EvalResult<Vec<EvalResult<EvalId>>> {
        self.gateway.submit_batch(requests).await
    }

    /// Read an evaluation record
    pub async fn read(&self, id: &EvalId) -> EvalResult<Option<Evaluation>> {
        self.durable.get(id).await
    }

    /// Best-effort cancellation
    ///
    /// A running job is deleted at the orchestrator and the monitor's
    /// DELETED handler produces the `cancelled` event; an evaluation
    /// that never reached the orchestrator is cancelled through the
    /// event pipeline and discarded by the dispatcher on dequeue.
    /// Cancelling an already-terminal evaluation is a no-op.
    pub async fn cancel(&self, id: &EvalId) -> EvalResult<()> {
        let Some(eval) = self.durable.get(id).await? else {
            return Err(EvalError::NotFound(id.to_string()));
        };
        if eval.is_terminal() {
            return Ok(());
        }
        if let Some(job_name) = &eval.job_name {
            self.orchestrator
                .delete_job(job_name)
                .await
                .map_err(EvalError::from)?;
            info!(eval_id = %id, job = %job_name, "cancellation requested, job deleted");
            return Ok(());
        }

        let sequence = self.coord.next_sequence(id).await?;
        self.bus
            .publish(&LifecycleEvent::cancelled(id.clone(), sequence))
            .await?;
        info!(eval_id = %id, "cancellation requested before scheduling");
        Ok(())
    }

    /// Stop all worker loops, waiting up to the grace period each
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        info!("evaluation pipeline stopped");
    }
}

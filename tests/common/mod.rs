//! In-process orchestrator fixture and pipeline harness
//!
//! Simulates the container orchestrator: submissions become jobs that
//! move through pending -> running -> terminal on a scripted schedule,
//! fanning watch events out over a broadcast channel. Tests script
//! outcomes per submission and can inject capacity/quota failures or
//! sever the watch stream.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use evald::evaluation::EvalId;
use evald::infra::{
    ExecuteRequest, JobEvent, JobEventStream, JobLogs, JobPhase, JobStatus, JobSummary,
    OrchestratorClient, OrchestratorError, WatchAction,
};

/// How a scripted job ends
#[derive(Debug, Clone)]
pub enum SimResult {
    /// Exit zero with stdout
    Succeed { stdout: String },
    /// Non-zero exit
    Fail { stdout: String, exit_code: i32 },
    /// Killed by the orchestrator deadline
    Deadline,
}

/// Scripted behavior for one submission
#[derive(Debug, Clone)]
pub struct SimOutcome {
    /// Time from running to terminal
    pub delay: Duration,
    /// Terminal result
    pub result: SimResult,
    /// Captured stderr served by the logs endpoint
    pub stderr: String,
    /// Whether a running-phase watch event is emitted
    pub emit_running: bool,
    /// Finish the job without emitting the terminal watch event;
    /// only reconciliation can discover it
    pub silent_terminal: bool,
}

impl SimOutcome {
    /// Successful execution producing `stdout`
    pub fn succeed(stdout: &str) -> Self {
        Self {
            delay: Duration::from_millis(30),
            result: SimResult::Succeed {
                stdout: stdout.to_string(),
            },
            stderr: String::new(),
            emit_running: true,
            silent_terminal: false,
        }
    }

    /// Non-zero exit
    pub fn fail(stdout: &str, exit_code: i32) -> Self {
        Self {
            delay: Duration::from_millis(30),
            result: SimResult::Fail {
                stdout: stdout.to_string(),
                exit_code,
            },
            stderr: String::new(),
            emit_running: true,
            silent_terminal: false,
        }
    }

    /// Deadline kill
    pub fn deadline() -> Self {
        Self {
            delay: Duration::from_millis(30),
            result: SimResult::Deadline,
            stderr: String::new(),
            emit_running: true,
            silent_terminal: false,
        }
    }

    /// Override the running-to-terminal delay
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Captured stderr to serve alongside stdout
    pub fn with_stderr(mut self, stderr: &str) -> Self {
        self.stderr = stderr.to_string();
        self
    }

    /// Sub-100ms execution: the running phase is never observable
    pub fn without_running(mut self) -> Self {
        self.emit_running = false;
        self
    }

    /// Suppress the terminal watch event
    pub fn silent(mut self) -> Self {
        self.silent_terminal = true;
        self
    }
}

type Scripter = dyn Fn(&ExecuteRequest) -> SimOutcome + Send + Sync;

#[derive(Clone)]
struct SimJob {
    job_name: String,
    eval_id: EvalId,
    phase: JobPhase,
    exit_code: Option<i32>,
    reason: Option<String>,
    logs: String,
    stderr: String,
    // Dense per-job change counter; each emitted event consumes one.
    revision: u64,
}

struct SimInner {
    jobs: Mutex<HashMap<String, SimJob>>,
    events: broadcast::Sender<JobEvent>,
    watch_cut: broadcast::Sender<()>,
    job_counter: AtomicU64,
    capacity: Option<usize>,
    submit_failures: Mutex<VecDeque<OrchestratorError>>,
    log_failures: Mutex<VecDeque<OrchestratorError>>,
    script: Box<Scripter>,
}

/// Scripted in-process orchestrator
#[derive(Clone)]
pub struct SimOrchestrator {
    inner: Arc<SimInner>,
}

impl SimOrchestrator {
    /// Orchestrator whose every job follows `script`
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&ExecuteRequest) -> SimOutcome + Send + Sync + 'static,
    {
        let (events, _) = broadcast::channel(4096);
        let (watch_cut, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(SimInner {
                jobs: Mutex::new(HashMap::new()),
                events,
                watch_cut,
                job_counter: AtomicU64::new(1),
                capacity: None,
                submit_failures: Mutex::new(VecDeque::new()),
                log_failures: Mutex::new(VecDeque::new()),
                script: Box::new(script),
            }),
        }
    }

    /// Reject submissions beyond `capacity` unfinished jobs with 429
    pub fn with_capacity<F>(script: F, capacity: usize) -> Self
    where
        F: Fn(&ExecuteRequest) -> SimOutcome + Send + Sync + 'static,
    {
        let mut sim = Self::new(script);
        let inner = Arc::get_mut(&mut sim.inner).expect("fresh orchestrator");
        inner.capacity = Some(capacity);
        sim
    }

    /// Queue an error for the next submission
    pub fn inject_submit_failure(&self, error: OrchestratorError) {
        self.inner.submit_failures.lock().push_back(error);
    }

    /// Queue an error for the next logs fetch
    pub fn inject_log_failure(&self, error: OrchestratorError) {
        self.inner.log_failures.lock().push_back(error);
    }

    /// Sever every open watch stream, forcing renewal
    pub fn cut_watch(&self) {
        let _ = self.inner.watch_cut.send(());
    }

    /// Whether a job for this evaluation still exists
    pub fn has_job_for(&self, eval_id: &EvalId) -> bool {
        self.inner
            .jobs
            .lock()
            .values()
            .any(|j| &j.eval_id == eval_id)
    }

    fn emit(&self, action: WatchAction, job: &SimJob, revision: u64, active: u32, succeeded: u32, failed: u32) {
        let event = JobEvent {
            action,
            job_name: job.job_name.clone(),
            eval_id: job.eval_id.clone(),
            revision,
            active,
            succeeded,
            failed,
            reason: job.reason.clone(),
            exit_code: job.exit_code,
        };
        let _ = self.inner.events.send(event);
    }

    fn unfinished_jobs(&self) -> usize {
        self.inner
            .jobs
            .lock()
            .values()
            .filter(|j| !j.phase.is_finished())
            .count()
    }

    fn run_job(&self, job_name: String, timeout_secs: u64, outcome: SimOutcome) {
        let sim = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if outcome.emit_running {
                let (job, revision) = {
                    let mut jobs = sim.inner.jobs.lock();
                    let Some(job) = jobs.get_mut(&job_name) else { return };
                    job.phase = JobPhase::Running;
                    let revision = job.revision;
                    job.revision += 1;
                    (job.clone(), revision)
                };
                sim.emit(WatchAction::Modified, &job, revision, 1, 0, 0);
            }

            let delay = match outcome.result {
                SimResult::Deadline => outcome.delay.min(Duration::from_secs(timeout_secs)),
                _ => outcome.delay,
            };
            tokio::time::sleep(delay).await;

            let (finished, revision) = {
                let mut jobs = sim.inner.jobs.lock();
                // Deleted mid-flight: nothing more to report.
                let Some(job) = jobs.get_mut(&job_name) else { return };
                match &outcome.result {
                    SimResult::Succeed { stdout } => {
                        job.phase = JobPhase::Succeeded;
                        job.exit_code = Some(0);
                        job.logs = stdout.clone();
                    }
                    SimResult::Fail { stdout, exit_code } => {
                        job.phase = JobPhase::Failed;
                        job.exit_code = Some(*exit_code);
                        job.logs = stdout.clone();
                    }
                    SimResult::Deadline => {
                        job.phase = JobPhase::Failed;
                        job.reason = Some("DeadlineExceeded".to_string());
                        job.logs = String::new();
                    }
                }
                job.stderr = outcome.stderr.clone();
                let revision = job.revision;
                job.revision += 1;
                (job.clone(), revision)
            };
            if !outcome.silent_terminal {
                match finished.phase {
                    JobPhase::Succeeded => {
                        sim.emit(WatchAction::Modified, &finished, revision, 0, 1, 0)
                    }
                    _ => sim.emit(WatchAction::Modified, &finished, revision, 0, 0, 1),
                }
            }
        });
    }
}

#[async_trait]
impl OrchestratorClient for SimOrchestrator {
    async fn submit(&self, request: &ExecuteRequest) -> Result<String, OrchestratorError> {
        if let Some(error) = self.inner.submit_failures.lock().pop_front() {
            return Err(error);
        }
        if let Some(capacity) = self.inner.capacity {
            if self.unfinished_jobs() >= capacity {
                return Err(OrchestratorError::CapacityExceeded);
            }
        }

        let job_name = format!("job-{}", self.inner.job_counter.fetch_add(1, Ordering::SeqCst));
        let outcome = (self.inner.script)(request);
        let job = SimJob {
            job_name: job_name.clone(),
            eval_id: request.eval_id.clone(),
            phase: JobPhase::Pending,
            exit_code: None,
            reason: None,
            logs: String::new(),
            stderr: String::new(),
            revision: 0,
        };
        self.inner.jobs.lock().insert(job_name.clone(), job);
        self.run_job(job_name.clone(), request.timeout_secs, outcome);
        Ok(job_name)
    }

    async fn status(&self, job_name: &str) -> Result<JobStatus, OrchestratorError> {
        let jobs = self.inner.jobs.lock();
        let Some(job) = jobs.get(job_name) else {
            return Err(OrchestratorError::Rejected(format!(
                "job {} not found",
                job_name
            )));
        };
        Ok(JobStatus {
            status: job.phase,
            started_at: None,
            completed_at: None,
            exit_code: job.exit_code,
            reason: job.reason.clone(),
        })
    }

    async fn logs(&self, job_name: &str) -> Result<JobLogs, OrchestratorError> {
        if let Some(error) = self.inner.log_failures.lock().pop_front() {
            return Err(error);
        }
        let jobs = self.inner.jobs.lock();
        jobs.get(job_name)
            .map(|j| JobLogs {
                stdout: j.logs.clone(),
                stderr: j.stderr.clone(),
            })
            .ok_or_else(|| OrchestratorError::Rejected(format!("job {} not found", job_name)))
    }

    async fn delete_job(&self, job_name: &str) -> Result<(), OrchestratorError> {
        let removed = self.inner.jobs.lock().remove(job_name);
        if let Some(job) = removed {
            let revision = job.revision;
            self.emit(WatchAction::Deleted, &job, revision, 0, 0, 0);
        }
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<JobSummary>, OrchestratorError> {
        Ok(self
            .inner
            .jobs
            .lock()
            .values()
            .map(|j| JobSummary {
                job_name: j.job_name.clone(),
                eval_id: j.eval_id.clone(),
            })
            .collect())
    }

    async fn watch(&self) -> Result<JobEventStream, OrchestratorError> {
        let events = BroadcastStream::new(self.inner.events.subscribe())
            .filter_map(|item| async move { item.ok() });
        let mut cut = self.inner.watch_cut.subscribe();
        let stream = events.take_until(Box::pin(async move {
            let _ = cut.recv().await;
        }));
        Ok(Box::pin(stream))
    }
}

use evald::config::PipelineConfig;
use evald::evaluation::Evaluation;
use evald::gateway::SubmissionRequest;
use evald::infra::{
    EventBus, MemoryCoordinationStore, MemoryDurableStore, MemoryEventBus, MemoryTaskStream,
};
use evald::pipeline::EvalPipeline;
use evald::task::Priority;
use std::time::Instant;

/// Pipeline configuration with delays shrunk for test time
pub fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.pool.claim_backoff_ms = 20;
    config.retry.initial_delay_ms = 5;
    config.retry.max_delay_ms = 50;
    config.monitor.gap_wait_secs = 1;
    config.gateway.batch_items_per_sec = 1000;
    config
}

/// A started pipeline over in-memory infrastructure and the simulator
pub struct Harness {
    pub pipeline: EvalPipeline,
    pub sim: SimOrchestrator,
    pub bus: Arc<MemoryEventBus>,
}

/// Start a pipeline with the fast test configuration
pub async fn start_pipeline(sim: SimOrchestrator, sandboxes: &[&str], workers: usize) -> Harness {
    start_pipeline_with(fast_config(), sim, sandboxes, workers).await
}

/// Start a pipeline with an explicit configuration
pub async fn start_pipeline_with(
    config: PipelineConfig,
    sim: SimOrchestrator,
    sandboxes: &[&str],
    workers: usize,
) -> Harness {
    let bus = Arc::new(MemoryEventBus::new());
    let bus_dyn: Arc<dyn EventBus> = bus.clone();
    let pipeline = EvalPipeline::start(
        config,
        sandboxes.iter().map(|s| s.to_string()).collect(),
        workers,
        Arc::new(MemoryTaskStream::new()),
        bus_dyn,
        Arc::new(MemoryCoordinationStore::new()),
        Arc::new(MemoryDurableStore::new()),
        Arc::new(sim.clone()),
    )
    .await
    .expect("pipeline start");
    Harness { pipeline, sim, bus }
}

/// A well-formed submission
pub fn request(source: &str, timeout_secs: u64) -> SubmissionRequest {
    SubmissionRequest {
        source: source.to_string(),
        runtime: "py".to_string(),
        timeout_secs,
        priority: Priority::Normal,
    }
}

/// Poll until the evaluation reaches a terminal state
pub async fn wait_for_terminal(
    pipeline: &EvalPipeline,
    id: &EvalId,
    within: Duration,
) -> Evaluation {
    let deadline = Instant::now() + within;
    loop {
        if let Some(eval) = pipeline.read(id).await.expect("durable read") {
            if eval.is_terminal() {
                return eval;
            }
        }
        if Instant::now() > deadline {
            panic!("evaluation {} did not reach a terminal state", id);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the evaluation carries an orchestrator job handle
pub async fn wait_for_job(pipeline: &EvalPipeline, id: &EvalId, within: Duration) -> String {
    let deadline = Instant::now() + within;
    loop {
        if let Some(eval) = pipeline.read(id).await.expect("durable read") {
            if let Some(job) = eval.job_name {
                return job;
            }
        }
        if Instant::now() > deadline {
            panic!("evaluation {} never got a job handle", id);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

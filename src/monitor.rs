//! Job lifecycle monitor
//!
//! Long-lived watcher on the orchestrator's job-event stream. Converts
//! job changes into at most one `running` and one terminal lifecycle
//! event per evaluation, published in per-evaluation order: event N
//! goes out only after event N-1 has been published. Source events
//! observed out of revision order are buffered until the gap closes or
//! the gap timeout releases them.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{MonitorConfig, PlatformLimits, RetrySettings};
use crate::error::EvalResult;
use crate::evaluation::EvalId;
use crate::events::{EventKind, LifecycleEvent};
use crate::infra::{
    CoordinationStore, DurableStore, EventBus, JobEvent, JobLogs, JobPhase, OrchestratorClient,
    WatchAction,
};
use crate::resilience::retry_with_backoff;

/// Monitor counters
#[derive(Default)]
pub struct MonitorStats {
    running_published: AtomicU64,
    terminal_published: AtomicU64,
    gap_timeouts: AtomicU64,
    synthesized_terminals: AtomicU64,
    orphans_deleted: AtomicU64,
    late_log_appends: AtomicU64,
}

impl MonitorStats {
    /// `running` events published
    pub fn running_published(&self) -> u64 {
        self.running_published.load(Ordering::Relaxed)
    }

    /// Terminal events published
    pub fn terminal_published(&self) -> u64 {
        self.terminal_published.load(Ordering::Relaxed)
    }

    /// Sequence gaps released after the gap timeout
    pub fn gap_timeouts(&self) -> u64 {
        self.gap_timeouts.load(Ordering::Relaxed)
    }

    /// Terminal events synthesized during reconnect reconciliation
    pub fn synthesized_terminals(&self) -> u64 {
        self.synthesized_terminals.load(Ordering::Relaxed)
    }

    /// Orphaned orchestrator jobs deleted
    pub fn orphans_deleted(&self) -> u64 {
        self.orphans_deleted.load(Ordering::Relaxed)
    }

    /// Append events published after a late log retrieval
    pub fn late_log_appends(&self) -> u64 {
        self.late_log_appends.load(Ordering::Relaxed)
    }
}

/// What one observed job change means for an evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
enum Emission {
    Running { job_name: String },
    Completed { job_name: String, exit_code: i32 },
    Failed { job_name: String, reason: String, exit_code: Option<i32> },
    Cancelled,
}

struct EvalTrack {
    job_name: String,
    expected: Option<u64>,
    buffer: BTreeMap<u64, JobEvent>,
    gap_since: Option<Instant>,
    running_emitted: bool,
    terminal_emitted: bool,
}

impl EvalTrack {
    fn new(job_name: String) -> Self {
        Self {
            job_name,
            expected: None,
            buffer: BTreeMap::new(),
            gap_since: None,
            running_emitted: false,
            terminal_emitted: false,
        }
    }

    fn interpret(&mut self, event: &JobEvent) -> Option<Emission> {
        if self.terminal_emitted {
            return None;
        }
        if event.action == WatchAction::Deleted {
            self.terminal_emitted = true;
            return Some(Emission::Cancelled);
        }
        if event.succeeded > 0 {
            self.terminal_emitted = true;
            return Some(Emission::Completed {
                job_name: event.job_name.clone(),
                exit_code: event.exit_code.unwrap_or(0),
            });
        }
        let deadline_exceeded = event.reason.as_deref() == Some("DeadlineExceeded");
        if event.failed > 0 || deadline_exceeded {
            self.terminal_emitted = true;
            return Some(Emission::Failed {
                job_name: event.job_name.clone(),
                reason: event
                    .reason
                    .clone()
                    .unwrap_or_else(|| "JobFailed".to_string()),
                exit_code: event.exit_code,
            });
        }
        if event.active > 0 && !self.running_emitted {
            self.running_emitted = true;
            return Some(Emission::Running {
                job_name: event.job_name.clone(),
            });
        }
        None
    }
}

/// Per-evaluation ordering and dedup state
struct OrderedTracker {
    tracks: HashMap<EvalId, EvalTrack>,
    gap_wait: Duration,
    stats: Arc<MonitorStats>,
}

impl OrderedTracker {
    fn new(gap_wait: Duration, stats: Arc<MonitorStats>) -> Self {
        Self {
            tracks: HashMap::new(),
            gap_wait,
            stats,
        }
    }

    /// Ingest one source event; returns emissions now releasable, in
    /// order.
    fn observe(&mut self, event: JobEvent) -> Vec<(EvalId, Emission)> {
        let eval_id = event.eval_id.clone();
        let track = self
            .tracks
            .entry(eval_id.clone())
            .or_insert_with(|| EvalTrack::new(event.job_name.clone()));
        if track.terminal_emitted {
            return Vec::new();
        }
        if let Some(expected) = track.expected {
            if event.revision < expected {
                // Stale redelivery from the source.
                return Vec::new();
            }
        }
        track.buffer.insert(event.revision, event);
        Self::drain(&eval_id, track)
    }

    fn drain(eval_id: &EvalId, track: &mut EvalTrack) -> Vec<(EvalId, Emission)> {
        let mut ready = Vec::new();
        loop {
            let Some((&first, _)) = track.buffer.first_key_value() else {
                track.gap_since = None;
                break;
            };
            let expected = *track.expected.get_or_insert(first);
            if first != expected {
                if track.gap_since.is_none() {
                    track.gap_since = Some(Instant::now());
                }
                break;
            }
            let Some((_, event)) = track.buffer.pop_first() else {
                break;
            };
            track.expected = Some(first + 1);
            track.gap_since = None;
            if let Some(emission) = track.interpret(&event) {
                ready.push((eval_id.clone(), emission));
            }
        }
        ready
    }

    /// Release buffered events past any gap older than the gap timeout
    fn flush_gaps(&mut self) -> Vec<(EvalId, Emission)> {
        let mut ready = Vec::new();
        for (eval_id, track) in self.tracks.iter_mut() {
            let Some(since) = track.gap_since else { continue };
            if since.elapsed() < self.gap_wait {
                continue;
            }
            let Some((&first, _)) = track.buffer.first_key_value() else {
                track.gap_since = None;
                continue;
            };
            self.stats.gap_timeouts.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("evald_monitor_gap_timeouts_total").increment(1);
            warn!(
                %eval_id,
                expected = track.expected.unwrap_or(0),
                observed = first,
                "event gap timed out, releasing later events"
            );
            track.expected = Some(first);
            ready.extend(Self::drain(eval_id, track));
        }
        ready
    }

    /// Evaluations observed but not yet terminal, with their job names
    fn open_tracks(&self) -> Vec<(EvalId, String)> {
        self.tracks
            .iter()
            .filter(|(_, t)| !t.terminal_emitted)
            .map(|(id, t)| (id.clone(), t.job_name.clone()))
            .collect()
    }

    fn mark_terminal(&mut self, eval_id: &EvalId) {
        if let Some(track) = self.tracks.get_mut(eval_id) {
            track.terminal_emitted = true;
        }
    }

    fn is_running_emitted(&self, eval_id: &EvalId) -> bool {
        self.tracks
            .get(eval_id)
            .map(|t| t.running_emitted)
            .unwrap_or(false)
    }

    fn note_running(&mut self, eval_id: &EvalId, job_name: &str) {
        let track = self
            .tracks
            .entry(eval_id.clone())
            .or_insert_with(|| EvalTrack::new(job_name.to_string()));
        track.running_emitted = true;
    }
}

/// Watches the orchestrator and feeds the event bus
pub struct LifecycleMonitor {
    config: MonitorConfig,
    limits: PlatformLimits,
    retry: RetrySettings,
    orchestrator: Arc<dyn OrchestratorClient>,
    bus: Arc<dyn EventBus>,
    coord: Arc<dyn CoordinationStore>,
    durable: Arc<dyn DurableStore>,
    stats: Arc<MonitorStats>,
}

impl LifecycleMonitor {
    /// Build a monitor over the injected collaborators
    pub fn new(
        config: MonitorConfig,
        limits: PlatformLimits,
        retry: RetrySettings,
        orchestrator: Arc<dyn OrchestratorClient>,
        bus: Arc<dyn EventBus>,
        coord: Arc<dyn CoordinationStore>,
        durable: Arc<dyn DurableStore>,
    ) -> Self {
        Self {
            config,
            limits,
            retry,
            orchestrator,
            bus,
            coord,
            durable,
            stats: Arc::new(MonitorStats::default()),
        }
    }

    /// Counter access
    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    /// Watch loop: consume the job-event stream, renewing the
    /// connection when it ends and reconciling state on each renewal.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tracker = OrderedTracker::new(self.config.gap_wait(), self.stats.clone());
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.orchestrator.watch().await {
                Ok(mut stream) => {
                    let mut tick = tokio::time::interval(Duration::from_secs(1));
                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            _ = tick.tick() => {
                                for (eval_id, emission) in tracker.flush_gaps() {
                                    self.publish_emission(&eval_id, emission).await;
                                }
                            }
                            next = stream.next() => match next {
                                Some(event) => {
                                    for (eval_id, emission) in tracker.observe(event) {
                                        self.publish_emission(&eval_id, emission).await;
                                    }
                                }
                                None => break,
                            },
                        }
                    }
                    debug!("watch stream ended, reconciling before renewal");
                    self.reconcile(&mut tracker).await;
                }
                Err(e) => {
                    warn!(error = %e, "failed to open watch stream");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    /// Reconnect reconciliation: synthesize terminal events for
    /// evaluations whose job finished or vanished while the watch was
    /// down, and catch up on jobs observed for the first time.
    async fn reconcile(&self, tracker: &mut OrderedTracker) {
        let listed = match self.orchestrator.list_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "job listing failed during reconciliation");
                return;
            }
        };
        let by_eval: HashMap<EvalId, String> = listed
            .into_iter()
            .map(|j| (j.eval_id, j.job_name))
            .collect();

        // Tracked evaluations whose job disappeared before terminal.
        for (eval_id, job_name) in tracker.open_tracks() {
            if by_eval.contains_key(&eval_id) {
                continue;
            }
            info!(%eval_id, job = %job_name, "job gone before terminal, synthesizing cancelled");
            self.stats
                .synthesized_terminals
                .fetch_add(1, Ordering::Relaxed);
            tracker.mark_terminal(&eval_id);
            self.publish_emission(&eval_id, Emission::Cancelled).await;
        }

        // Listed jobs: synthesize whatever the watch missed.
        for (eval_id, job_name) in by_eval {
            if let Ok(Some(eval)) = self.durable.get(&eval_id).await {
                if eval.is_terminal() {
                    continue;
                }
            }
            let status = match self.orchestrator.status(&job_name).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(job = %job_name, error = %e, "status fetch failed during reconciliation");
                    continue;
                }
            };
            match status.status {
                JobPhase::Succeeded => {
                    self.stats
                        .synthesized_terminals
                        .fetch_add(1, Ordering::Relaxed);
                    tracker.mark_terminal(&eval_id);
                    self.publish_emission(
                        &eval_id,
                        Emission::Completed {
                            job_name,
                            exit_code: status.exit_code.unwrap_or(0),
                        },
                    )
                    .await;
                }
                JobPhase::Failed => {
                    self.stats
                        .synthesized_terminals
                        .fetch_add(1, Ordering::Relaxed);
                    tracker.mark_terminal(&eval_id);
                    self.publish_emission(
                        &eval_id,
                        Emission::Failed {
                            job_name,
                            reason: status.reason.unwrap_or_else(|| "JobFailed".to_string()),
                            exit_code: status.exit_code,
                        },
                    )
                    .await;
                }
                JobPhase::Running => {
                    if !tracker.is_running_emitted(&eval_id) {
                        tracker.note_running(&eval_id, &job_name);
                        self.publish_emission(&eval_id, Emission::Running { job_name }).await;
                    }
                }
                JobPhase::Pending => {}
            }
        }
    }

    /// Orphan-job reconciler: delete jobs whose evaluation is already
    /// terminal in the durable store. Returns the number deleted.
    pub async fn reconcile_orphans(&self) -> EvalResult<u64> {
        let jobs = match self.orchestrator.list_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "job listing failed during orphan reconciliation");
                return Ok(0);
            }
        };
        let mut deleted = 0u64;
        for job in jobs {
            let Some(eval) = self.durable.get(&job.eval_id).await? else {
                continue;
            };
            if !eval.is_terminal() {
                continue;
            }
            match self.orchestrator.delete_job(&job.job_name).await {
                Ok(()) => {
                    deleted += 1;
                    self.stats.orphans_deleted.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("evald_monitor_orphans_deleted_total").increment(1);
                }
                Err(e) => warn!(job = %job.job_name, error = %e, "orphan deletion failed"),
            }
        }
        if deleted > 0 {
            info!(deleted, "orphaned jobs removed");
        }
        Ok(deleted)
    }

    /// Orphan reconciler loop
    pub async fn run_orphan_reconciler(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.orphan_interval_secs);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.reconcile_orphans().await {
                        warn!(error = %e, "orphan reconciliation failed");
                    }
                }
            }
        }
    }

    async fn publish_emission(&self, eval_id: &EvalId, emission: Emission) {
        let sequence = match self.coord.next_sequence(eval_id).await {
            Ok(seq) => seq,
            Err(e) => {
                warn!(%eval_id, error = %e, "sequence allocation failed");
                return;
            }
        };

        let event = match emission {
            Emission::Running { job_name } => {
                self.stats.running_published.fetch_add(1, Ordering::Relaxed);
                LifecycleEvent::running(eval_id.clone(), sequence, job_name)
            }
            Emission::Completed { job_name, exit_code } => {
                let (logs, fetch_failed) = self.fetch_logs_or_empty(&job_name).await;
                self.stats.terminal_published.fetch_add(1, Ordering::Relaxed);
                let mut event = LifecycleEvent::completed(
                    eval_id.clone(),
                    sequence,
                    Some(job_name.clone()),
                    exit_code,
                    logs.stdout,
                );
                if !logs.stderr.is_empty() {
                    event.stderr = Some(logs.stderr);
                }
                if fetch_failed {
                    self.spawn_late_log_append(eval_id.clone(), job_name, EventKind::Completed);
                }
                event
            }
            Emission::Failed { job_name, reason, exit_code } => {
                let (logs, fetch_failed) = self.fetch_logs_or_empty(&job_name).await;
                self.stats.terminal_published.fetch_add(1, Ordering::Relaxed);
                let mut event = LifecycleEvent::failed(eval_id.clone(), sequence, reason);
                event.job_name = Some(job_name.clone());
                event.exit_code = exit_code;
                event.output = Some(logs.stdout);
                if !logs.stderr.is_empty() {
                    event.stderr = Some(logs.stderr);
                }
                if fetch_failed {
                    self.spawn_late_log_append(eval_id.clone(), job_name, EventKind::Failed);
                }
                event
            }
            Emission::Cancelled => {
                self.stats.terminal_published.fetch_add(1, Ordering::Relaxed);
                LifecycleEvent::cancelled(eval_id.clone(), sequence)
            }
        };

        if let Err(e) = self.bus.publish(&event).await {
            warn!(%eval_id, error = %e, "failed to publish lifecycle event");
        }
    }

    /// Bounded, retried log fetch
    async fn fetch_logs(&self, job_name: &str) -> EvalResult<JobLogs> {
        let orchestrator = self.orchestrator.clone();
        let job = job_name.to_string();
        let logs = retry_with_backoff(&self.retry, move || {
            let orchestrator = orchestrator.clone();
            let job = job.clone();
            async move { orchestrator.logs(&job).await.map_err(Into::into) }
        })
        .await?;
        Ok(JobLogs {
            stdout: self.limits.clamp_output(&logs.stdout),
            stderr: self.limits.clamp_output(&logs.stderr),
        })
    }

    /// A terminal event must not stall on missing logs: degrade to
    /// empty streams and let the late retrieval extend the record.
    async fn fetch_logs_or_empty(&self, job_name: &str) -> (JobLogs, bool) {
        match self.fetch_logs(job_name).await {
            Ok(logs) => (logs, false),
            Err(e) => {
                warn!(job = %job_name, error = %e, "log fetch failed, scheduling late retrieval");
                (JobLogs::default(), true)
            }
        }
    }

    /// The terminal event went out without logs. Keep trying in the
    /// background; once the orchestrator serves them, publish an
    /// explicit append event so the writer extends the terminal record.
    fn spawn_late_log_append(&self, eval_id: EvalId, job_name: String, kind: EventKind) {
        let orchestrator = self.orchestrator.clone();
        let coord = self.coord.clone();
        let bus = self.bus.clone();
        let limits = self.limits.clone();
        let retry = self.retry.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(retry.max_delay_ms)).await;

            let job = job_name.clone();
            let fetched = retry_with_backoff(&retry, move || {
                let orchestrator = orchestrator.clone();
                let job = job.clone();
                async move { orchestrator.logs(&job).await.map_err(Into::into) }
            })
            .await;
            let logs = match fetched {
                Ok(logs) => logs,
                Err(e) => {
                    warn!(job = %job_name, error = %e, "late log retrieval failed, record keeps empty output");
                    return;
                }
            };
            if logs.stdout.is_empty() && logs.stderr.is_empty() {
                return;
            }

            let sequence = match coord.next_sequence(&eval_id).await {
                Ok(seq) => seq,
                Err(e) => {
                    warn!(%eval_id, error = %e, "sequence allocation failed");
                    return;
                }
            };
            let event = LifecycleEvent::log_append(
                eval_id.clone(),
                sequence,
                kind,
                (!logs.stdout.is_empty()).then(|| limits.clamp_output(&logs.stdout)),
                (!logs.stderr.is_empty()).then(|| limits.clamp_output(&logs.stderr)),
            );
            match bus.publish(&event).await {
                Ok(()) => {
                    stats.late_log_appends.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("evald_monitor_late_log_appends_total").increment(1);
                }
                Err(e) => warn!(%eval_id, error = %e, "failed to publish log append"),
            }
        });
    }
}

//! Orchestrator client
//!
//! The container orchestrator is an opaque collaborator: it accepts
//! execution submissions, runs jobs against sandboxes, and exposes a
//! label-filtered job-event stream. This module carries the contract
//! types, the HTTP client, and the watch-stream plumbing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::error::EvalError;
use crate::evaluation::EvalId;

/// Submission payload for `POST /execute`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Evaluation the job belongs to; becomes the job label
    pub eval_id: EvalId,
    /// Source text to execute
    pub code: String,
    /// Runtime tag
    pub language: String,
    /// Hard execution deadline, enforced by the orchestrator
    pub timeout_secs: u64,
    /// Memory limit in MiB
    pub memory_limit_mb: u64,
    /// CPU limit in cores
    pub cpu_limit: f64,
}

/// Orchestrator error classes, one per §-contract response
#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    /// 429: the sandbox filled since assignment, or orchestrator
    /// capacity was hit
    #[error("Orchestrator capacity exceeded")]
    CapacityExceeded,
    /// 403: orchestrator-level admission limit
    #[error("Orchestrator quota exhausted")]
    QuotaExhausted,
    /// Network failure or 5xx; retryable
    #[error("Orchestrator unavailable: {0}")]
    Unavailable(String),
    /// Any other 4xx; permanent
    #[error("Orchestrator rejected request: {0}")]
    Rejected(String),
}

impl From<OrchestratorError> for EvalError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::CapacityExceeded => {
                EvalError::Capacity("orchestrator capacity exceeded".to_string())
            }
            OrchestratorError::QuotaExhausted => {
                EvalError::QuotaExhausted("orchestrator quota exhausted".to_string())
            }
            OrchestratorError::Unavailable(msg) => EvalError::OrchestratorUnavailable(msg),
            OrchestratorError::Rejected(msg) => EvalError::OrchestratorRejected(msg),
        }
    }
}

/// Job phase reported by `GET /status/{job}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    /// Accepted, not yet scheduled
    Pending,
    /// Executing
    Running,
    /// Finished with exit code zero
    Succeeded,
    /// Finished with non-zero exit, error, or deadline kill
    Failed,
}

impl JobPhase {
    /// Whether the job has finished
    pub fn is_finished(&self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }
}

/// Point-in-time job status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    /// Current phase
    pub status: JobPhase,
    /// Start timestamp, if started
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Completion timestamp, if finished
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Exit code, if finished
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Failure reason (e.g. `DeadlineExceeded`)
    #[serde(default)]
    pub reason: Option<String>,
}

/// Captured job output, one field per stream
///
/// Bounded by the caller against the platform output limit.
#[derive(Debug, Clone, Default)]
pub struct JobLogs {
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

/// One entry of `GET /jobs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    /// Orchestrator job handle
    pub job_name: String,
    /// Owning evaluation, from the job label
    pub eval_id: EvalId,
}

/// Watch action on the job-event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchAction {
    /// Job created
    Added,
    /// Job state changed
    Modified,
    /// Job deleted
    Deleted,
}

/// One observed change on the job-event stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    /// Watch action
    pub action: WatchAction,
    /// Orchestrator job handle
    pub job_name: String,
    /// Owning evaluation, from the job label
    pub eval_id: EvalId,
    /// Dense per-job change counter starting at 0; consumers buffer on
    /// gaps because events may arrive out of order
    pub revision: u64,
    /// Count of active pods
    #[serde(default)]
    pub active: u32,
    /// Count of succeeded pods
    #[serde(default)]
    pub succeeded: u32,
    /// Count of failed pods
    #[serde(default)]
    pub failed: u32,
    /// Failure reason, if any
    #[serde(default)]
    pub reason: Option<String>,
    /// Exit code, when the orchestrator reports one
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Stream of job events; ends on its own at the watch renewal interval
pub type JobEventStream = Pin<Box<dyn Stream<Item = JobEvent> + Send>>;

/// Orchestrator contract
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    /// Submit an execution; returns the job handle
    async fn submit(&self, request: &ExecuteRequest) -> Result<String, OrchestratorError>;

    /// Fetch current job status
    async fn status(&self, job_name: &str) -> Result<JobStatus, OrchestratorError>;

    /// Fetch job output streams; the caller bounds them
    async fn logs(&self, job_name: &str) -> Result<JobLogs, OrchestratorError>;

    /// Delete a job; deleting a missing job is not an error
    async fn delete_job(&self, job_name: &str) -> Result<(), OrchestratorError>;

    /// List platform-labelled jobs
    async fn list_jobs(&self) -> Result<Vec<JobSummary>, OrchestratorError>;

    /// Open a bounded watch on the job-event stream
    async fn watch(&self) -> Result<JobEventStream, OrchestratorError>;
}

#[derive(Deserialize)]
struct ExecuteResponse {
    job_name: String,
}

#[derive(Deserialize)]
struct LogsResponse {
    logs: String,
    #[serde(default)]
    stderr: String,
}

#[derive(Deserialize)]
struct JobsResponse {
    jobs: Vec<JobSummary>,
}

#[derive(Deserialize)]
struct EventsResponse {
    events: Vec<JobEvent>,
    /// Opaque server-side cursor to resume from
    #[serde(default)]
    next: u64,
}

/// HTTP orchestrator client
pub struct HttpOrchestratorClient {
    http: reqwest::Client,
    base_url: String,
    watch_window: Duration,
    poll_interval: Duration,
}

impl HttpOrchestratorClient {
    /// Build a client against `base_url` with the given watch renewal
    /// window
    pub fn new(base_url: impl Into<String>, watch_window: Duration) -> Result<Self, OrchestratorError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| OrchestratorError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            watch_window,
            poll_interval: Duration::from_millis(500),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read_error_body(response: reqwest::Response) -> String {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        format!("{}: {}", status, body)
    }

    async fn classify<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, OrchestratorError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| OrchestratorError::Unavailable(format!("bad response body: {}", e)));
        }
        match status.as_u16() {
            403 => Err(OrchestratorError::QuotaExhausted),
            429 => Err(OrchestratorError::CapacityExceeded),
            500..=599 => Err(OrchestratorError::Unavailable(
                Self::read_error_body(response).await,
            )),
            _ => Err(OrchestratorError::Rejected(
                Self::read_error_body(response).await,
            )),
        }
    }

    async fn fetch_events(&self, since: u64) -> Result<(Vec<JobEvent>, u64), OrchestratorError> {
        let response = self
            .http
            .get(self.url("/events"))
            .query(&[("since", since.to_string())])
            .send()
            .await
            .map_err(|e| OrchestratorError::Unavailable(e.to_string()))?;
        let parsed: EventsResponse = Self::classify(response).await?;
        Ok((parsed.events, parsed.next.max(since)))
    }
}

#[async_trait]
impl OrchestratorClient for HttpOrchestratorClient {
    async fn submit(&self, request: &ExecuteRequest) -> Result<String, OrchestratorError> {
        let response = self
            .http
            .post(self.url("/execute"))
            .json(request)
            .send()
            .await
            .map_err(|e| OrchestratorError::Unavailable(e.to_string()))?;
        let parsed: ExecuteResponse = Self::classify(response).await?;
        Ok(parsed.job_name)
    }

    async fn status(&self, job_name: &str) -> Result<JobStatus, OrchestratorError> {
        let response = self
            .http
            .get(self.url(&format!("/status/{}", job_name)))
            .send()
            .await
            .map_err(|e| OrchestratorError::Unavailable(e.to_string()))?;
        Self::classify(response).await
    }

    async fn logs(&self, job_name: &str) -> Result<JobLogs, OrchestratorError> {
        let response = self
            .http
            .get(self.url(&format!("/logs/{}", job_name)))
            .send()
            .await
            .map_err(|e| OrchestratorError::Unavailable(e.to_string()))?;
        let parsed: LogsResponse = Self::classify(response).await?;
        Ok(JobLogs {
            stdout: parsed.logs,
            stderr: parsed.stderr,
        })
    }

    async fn delete_job(&self, job_name: &str) -> Result<(), OrchestratorError> {
        let response = self
            .http
            .delete(self.url(&format!("/jobs/{}", job_name)))
            .send()
            .await
            .map_err(|e| OrchestratorError::Unavailable(e.to_string()))?;
        let status = response.status();
        if status.is_success() || status.as_u16() == 404 {
            return Ok(());
        }
        match status.as_u16() {
            500..=599 => Err(OrchestratorError::Unavailable(
                Self::read_error_body(response).await,
            )),
            _ => Err(OrchestratorError::Rejected(
                Self::read_error_body(response).await,
            )),
        }
    }

    async fn list_jobs(&self) -> Result<Vec<JobSummary>, OrchestratorError> {
        let response = self
            .http
            .get(self.url("/jobs"))
            .send()
            .await
            .map_err(|e| OrchestratorError::Unavailable(e.to_string()))?;
        let parsed: JobsResponse = Self::classify(response).await?;
        Ok(parsed.jobs)
    }

    async fn watch(&self) -> Result<JobEventStream, OrchestratorError> {
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let poll_interval = self.poll_interval;
        let deadline = Instant::now() + self.watch_window;

        let client = HttpOrchestratorClient {
            http,
            base_url,
            watch_window: self.watch_window,
            poll_interval,
        };

        let state = (client, VecDeque::<JobEvent>::new(), 0u64);
        let stream = futures::stream::unfold(state, move |(client, mut pending, mut since)| {
            async move {
                loop {
                    if let Some(event) = pending.pop_front() {
                        return Some((event, (client, pending, since)));
                    }
                    if Instant::now() >= deadline {
                        return None;
                    }
                    match client.fetch_events(since).await {
                        Ok((events, next)) => {
                            since = next;
                            pending.extend(events);
                            if pending.is_empty() {
                                tokio::time::sleep(client.poll_interval).await;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "job event poll failed");
                            tokio::time::sleep(client.poll_interval).await;
                        }
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ExecuteRequest {
        ExecuteRequest {
            eval_id: EvalId::generate(),
            code: "print(1)".to_string(),
            language: "py".to_string(),
            timeout_secs: 10,
            memory_limit_mb: 512,
            cpu_limit: 0.5,
        }
    }

    async fn client_for(server: &MockServer) -> HttpOrchestratorClient {
        HttpOrchestratorClient::new(server.uri(), Duration::from_secs(300)).unwrap()
    }

    #[tokio::test]
    async fn test_submit_success_returns_job_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_name": "job-1"})))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let job = client.submit(&request()).await.unwrap();
        assert_eq!(job, "job-1");
    }

    #[tokio::test]
    async fn test_submit_maps_quota_and_capacity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let client = client_for(&server).await;
        assert!(matches!(
            client.submit(&request()).await,
            Err(OrchestratorError::QuotaExhausted)
        ));

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        let client = client_for(&server).await;
        assert!(matches!(
            client.submit(&request()).await,
            Err(OrchestratorError::CapacityExceeded)
        ));
    }

    #[tokio::test]
    async fn test_submit_maps_transient_and_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let client = client_for(&server).await;
        assert!(matches!(
            client.submit(&request()).await,
            Err(OrchestratorError::Unavailable(_))
        ));

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad language"))
            .mount(&server)
            .await;
        let client = client_for(&server).await;
        assert!(matches!(
            client.submit(&request()).await,
            Err(OrchestratorError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_status_and_logs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status/job-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "succeeded",
                "exit_code": 0
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/logs/job-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "logs": "2\n",
                "stderr": "warning: unused\n"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let status = client.status("job-1").await.unwrap();
        assert_eq!(status.status, JobPhase::Succeeded);
        assert!(status.status.is_finished());
        let logs = client.logs("job-1").await.unwrap();
        assert_eq!(logs.stdout, "2\n");
        assert_eq!(logs.stderr, "warning: unused\n");
    }

    #[tokio::test]
    async fn test_logs_without_stderr_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/logs/job-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"logs": "ok\n"})))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let logs = client.logs("job-2").await.unwrap();
        assert_eq!(logs.stdout, "ok\n");
        assert!(logs.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_job_is_idempotent() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/jobs/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        client.delete_job("gone").await.unwrap();
    }
}

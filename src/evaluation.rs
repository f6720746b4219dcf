//! Evaluation records and the status state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EvalError, EvalResult};
use crate::task::Priority;

/// Unique identifier for an evaluation
///
/// Wraps a UUIDv7 string: immutable, globally unique, and
/// lexicographically ordered by creation time, so listing ids
/// approximates submission order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvalId(String);

impl EvalId {
    /// Generate a new time-sortable evaluation ID
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Parse from string
    pub fn parse_str(s: &str) -> EvalResult<Self> {
        Uuid::parse_str(s)
            .map(|u| Self(u.to_string()))
            .map_err(|e| EvalError::Validation(format!("Invalid evaluation ID: {}", e)))
    }

    /// Borrow the underlying string form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EvalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Evaluation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalStatus {
    /// Accepted by the gateway, waiting for a dispatcher worker
    Queued,
    /// A sandbox is assigned; the orchestrator submission is in flight
    Provisioning,
    /// The orchestrator reported the job active
    Running,
    /// Terminal: execution finished and output was captured
    Completed,
    /// Terminal: execution or scheduling failed
    Failed,
    /// Terminal: cancelled before completion
    Cancelled,
}

impl EvalStatus {
    /// Whether this status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EvalStatus::Completed | EvalStatus::Failed | EvalStatus::Cancelled
        )
    }

    /// Lowercase name, matching the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            EvalStatus::Queued => "queued",
            EvalStatus::Provisioning => "provisioning",
            EvalStatus::Running => "running",
            EvalStatus::Completed => "completed",
            EvalStatus::Failed => "failed",
            EvalStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for EvalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from -> to` is a legal status transition.
///
/// `allow_skipped_running` additionally admits `queued -> completed` and
/// `provisioning -> completed`, which accommodate sub-100ms executions
/// whose `running` event was lost in transit. Same-state terminal
/// re-application is handled by the writer as idempotent success and is
/// not part of this table.
pub fn transition_allowed(from: EvalStatus, to: EvalStatus, allow_skipped_running: bool) -> bool {
    use EvalStatus::*;
    match (from, to) {
        (Queued, Provisioning) | (Queued, Running) => true,
        (Queued, Failed) | (Queued, Cancelled) => true,
        (Queued, Completed) => allow_skipped_running,
        (Provisioning, Running) => true,
        (Provisioning, Failed) | (Provisioning, Cancelled) => true,
        (Provisioning, Completed) => allow_skipped_running,
        (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
        _ => false,
    }
}

/// Durable evaluation record
///
/// Mutated only by the gateway (initial record) and the store writer
/// (every transition after the evaluation enters the event pipeline).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    /// Stable unique identifier
    pub id: EvalId,
    /// Current status per the state machine
    pub status: EvalStatus,
    /// Submitted source text
    pub source: String,
    /// Target runtime tag
    pub runtime: String,
    /// Requested execution deadline in seconds
    pub timeout_secs: u64,
    /// Priority class
    pub priority: Priority,
    /// First transition timestamp
    pub created_at: DateTime<Utc>,
    /// Last transition timestamp; never rewound
    pub updated_at: DateTime<Utc>,
    /// Sandbox handle; populated while provisioning/running only
    pub assigned_sandbox: Option<String>,
    /// Orchestrator job handle once created
    pub job_name: Option<String>,
    /// Process exit code, set on terminal entry
    pub exit_code: Option<i32>,
    /// Captured stdout, bounded
    pub output: Option<String>,
    /// Captured stderr, bounded
    pub stderr: Option<String>,
    /// Free-form error string
    pub error: Option<String>,
    /// Accumulated retry count
    pub retry_count: u32,
    /// Optimistic-concurrency version, bumped on every durable write
    pub version: u64,
}

impl Evaluation {
    /// Create the initial queued record
    pub fn new(id: EvalId, source: String, runtime: String, timeout_secs: u64, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: EvalStatus::Queued,
            source,
            runtime,
            timeout_secs,
            priority,
            created_at: now,
            updated_at: now,
            assigned_sandbox: None,
            job_name: None,
            exit_code: None,
            output: None,
            stderr: None,
            error: None,
            retry_count: 0,
            version: 0,
        }
    }

    /// Whether the evaluation has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

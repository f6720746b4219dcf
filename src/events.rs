//! Lifecycle events published on the evaluation event bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::evaluation::{EvalId, EvalStatus};
use crate::task::Priority;

/// Event kinds, one per `evaluation:*` channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Accepted by the gateway
    Queued,
    /// Sandbox assigned, orchestrator submission in flight
    Provisioning,
    /// Job observed active
    Running,
    /// Job finished; output captured
    Completed,
    /// Job or scheduling failed
    Failed,
    /// Job deleted before terminal
    Cancelled,
}

impl EventKind {
    /// Event bus channel for this kind
    pub fn channel(&self) -> &'static str {
        match self {
            EventKind::Queued => "evaluation:queued",
            EventKind::Provisioning => "evaluation:provisioning",
            EventKind::Running => "evaluation:running",
            EventKind::Completed => "evaluation:completed",
            EventKind::Failed => "evaluation:failed",
            EventKind::Cancelled => "evaluation:cancelled",
        }
    }

    /// Status this event drives the evaluation toward
    pub fn status(&self) -> EvalStatus {
        match self {
            EventKind::Queued => EvalStatus::Queued,
            EventKind::Provisioning => EvalStatus::Provisioning,
            EventKind::Running => EvalStatus::Running,
            EventKind::Completed => EvalStatus::Completed,
            EventKind::Failed => EvalStatus::Failed,
            EventKind::Cancelled => EvalStatus::Cancelled,
        }
    }

    /// Whether this kind enters a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

/// Submission parameters snapshotted onto the `queued` event so the
/// writer can materialize a record even if the gateway's durable insert
/// was lost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionSnapshot {
    /// Submitted source text
    pub source: String,
    /// Runtime tag
    pub runtime: String,
    /// Execution deadline in seconds
    pub timeout_secs: u64,
    /// Priority class
    pub priority: Priority,
}

/// A single lifecycle event for one evaluation
///
/// Sequence numbers are per-evaluation and dense starting at 0; they
/// are allocated through the coordination store so that gateway (0),
/// dispatcher (1) and monitor (2..) share one series. Gaps indicate
/// loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Evaluation the event belongs to
    pub eval_id: EvalId,
    /// Event kind
    pub kind: EventKind,
    /// Dense per-evaluation sequence number
    pub sequence: u64,
    /// Producer timestamp
    pub timestamp: DateTime<Utc>,
    /// Submission snapshot; present on `queued` only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission: Option<SubmissionSnapshot>,
    /// Assigned sandbox URL; present on `provisioning`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_url: Option<String>,
    /// Orchestrator job handle; present from `running` onward
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    /// Process exit code; terminal events only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Captured stdout; terminal events only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Captured stderr; terminal events only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Failure reason or error class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Retry count accumulated by the dispatcher
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// Extend (rather than replace) output fields on an already-terminal
    /// record, bounded by the platform output limit.
    #[serde(default)]
    pub append: bool,
}

impl LifecycleEvent {
    fn base(eval_id: EvalId, kind: EventKind, sequence: u64) -> Self {
        Self {
            eval_id,
            kind,
            sequence,
            timestamp: Utc::now(),
            submission: None,
            sandbox_url: None,
            job_name: None,
            exit_code: None,
            output: None,
            stderr: None,
            error: None,
            retry_count: None,
            append: false,
        }
    }

    /// Sequence-0 event published by the gateway
    pub fn queued(eval_id: EvalId, sequence: u64, submission: SubmissionSnapshot) -> Self {
        let mut ev = Self::base(eval_id, EventKind::Queued, sequence);
        ev.submission = Some(submission);
        ev
    }

    /// Advisory event published by the dispatcher after Phase 1
    pub fn provisioning(eval_id: EvalId, sequence: u64, sandbox_url: String) -> Self {
        let mut ev = Self::base(eval_id, EventKind::Provisioning, sequence);
        ev.sandbox_url = Some(sandbox_url);
        ev
    }

    /// Job observed active
    pub fn running(eval_id: EvalId, sequence: u64, job_name: String) -> Self {
        let mut ev = Self::base(eval_id, EventKind::Running, sequence);
        ev.job_name = Some(job_name);
        ev
    }

    /// Job finished successfully
    pub fn completed(
        eval_id: EvalId,
        sequence: u64,
        job_name: Option<String>,
        exit_code: i32,
        output: String,
    ) -> Self {
        let mut ev = Self::base(eval_id, EventKind::Completed, sequence);
        ev.job_name = job_name;
        ev.exit_code = Some(exit_code);
        ev.output = Some(output);
        ev
    }

    /// Job or scheduling failed
    pub fn failed(eval_id: EvalId, sequence: u64, error: String) -> Self {
        let mut ev = Self::base(eval_id, EventKind::Failed, sequence);
        ev.error = Some(error);
        ev
    }

    /// Job deleted before reaching a terminal state
    pub fn cancelled(eval_id: EvalId, sequence: u64) -> Self {
        Self::base(eval_id, EventKind::Cancelled, sequence)
    }

    /// Post-terminal extension carrying output that arrived after the
    /// terminal event went out; the writer extends rather than
    /// overwrites.
    pub fn log_append(
        eval_id: EvalId,
        sequence: u64,
        kind: EventKind,
        output: Option<String>,
        stderr: Option<String>,
    ) -> Self {
        let mut ev = Self::base(eval_id, kind, sequence);
        ev.append = true;
        ev.output = output;
        ev.stderr = stderr;
        ev
    }
}

/// Coordination-store key holding the per-evaluation sequence counter
pub fn sequence_key(eval_id: &EvalId) -> String {
    format!("seq:{}", eval_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        assert_eq!(EventKind::Queued.channel(), "evaluation:queued");
        assert_eq!(EventKind::Cancelled.channel(), "evaluation:cancelled");
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(EventKind::Completed.is_terminal());
        assert!(EventKind::Failed.is_terminal());
        assert!(EventKind::Cancelled.is_terminal());
        assert!(!EventKind::Running.is_terminal());
        assert!(!EventKind::Provisioning.is_terminal());
    }

    #[test]
    fn test_log_append_marks_extension() {
        let ev = LifecycleEvent::log_append(
            EvalId::generate(),
            4,
            EventKind::Completed,
            Some("tail\n".to_string()),
            None,
        );
        assert!(ev.append);
        assert_eq!(ev.kind, EventKind::Completed);
        assert_eq!(ev.output.as_deref(), Some("tail\n"));
        // No exit code or job handle rides on an extension.
        assert!(ev.exit_code.is_none());
        assert!(ev.job_name.is_none());
    }

    #[test]
    fn test_event_payload_serialization_is_sparse() {
        let ev = LifecycleEvent::cancelled(EvalId::generate(), 3);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["sequence"], 3);
        assert!(json.get("output").is_none());
        assert!(json.get("sandbox_url").is_none());

        let ev = LifecycleEvent::provisioning(EvalId::generate(), 1, "http://sb-1:8000".to_string());
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["sandbox_url"], "http://sb-1:8000");
    }
}

//! Task envelopes carried on the dispatcher task stream

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evaluation::EvalId;

/// Priority class for an evaluation
///
/// Classes map to separate task sub-streams; workers poll `high` more
/// frequently than `normal` at roughly 2:1. No strict-priority guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Default class
    Normal,
    /// Polled ahead of normal at ~2:1
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Transient task record: created by the gateway, consumed by exactly
/// one dispatcher worker, destroyed on terminal acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// Unique delivery identifier
    pub task_id: Uuid,
    /// Enqueue timestamp
    pub enqueued_at: DateTime<Utc>,
    /// Redelivery count accumulated by the stream
    pub retry_count: u32,
    /// The work itself
    pub kind: TaskKind,
}

impl TaskEnvelope {
    /// Wrap a task kind in a fresh envelope
    pub fn new(kind: TaskKind) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            enqueued_at: Utc::now(),
            retry_count: 0,
            kind,
        }
    }

    /// Evaluation this envelope belongs to
    pub fn eval_id(&self) -> &EvalId {
        match &self.kind {
            TaskKind::Execute(task) => &task.eval_id,
        }
    }

    /// Priority sub-stream this envelope rides on
    pub fn priority(&self) -> Priority {
        match &self.kind {
            TaskKind::Execute(task) => task.priority,
        }
    }
}

/// Task payload variants
///
/// New task kinds are added as variants here and dispatched by a single
/// `match` in the dispatcher; there is no name-based registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// Execute a code snippet in a sandbox
    Execute(ExecuteTask),
}

/// Parameters for a sandboxed execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteTask {
    /// Evaluation to execute
    pub eval_id: EvalId,
    /// Source text
    pub source: String,
    /// Runtime tag
    pub runtime: String,
    /// Execution deadline in seconds
    pub timeout_secs: u64,
    /// Priority class
    pub priority: Priority,
}

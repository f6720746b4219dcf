//! Dead-letter store for tasks that exhausted their retry budget
//!
//! A bounded FIFO of task ids on the coordination store (`dlq`), with a
//! metadata hash per task (`dlq:metadata:{task_id}`) carrying full
//! diagnostic context. At capacity the oldest entry is dropped and an
//! alert is logged; individual evaluations are unaffected.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::config::clamp_to;
use crate::error::{EvalError, EvalResult};
use crate::evaluation::EvalId;
use crate::infra::CoordinationStore;
use crate::task::TaskEnvelope;

const DLQ_LIST_KEY: &str = "dlq";
const DLQ_METADATA_PREFIX: &str = "dlq:metadata:";

/// Bound on the stored traceback field
const MAX_TRACEBACK_BYTES: usize = 4096;

/// A fully materialized dead-letter entry
#[derive(Debug, Clone)]
pub struct DeadLetterRecord {
    /// Task delivery id
    pub task_id: String,
    /// Owning evaluation
    pub eval_id: EvalId,
    /// Terminal error class
    pub exception_class: String,
    /// Terminal error message
    pub message: String,
    /// Truncated debug representation of the error
    pub traceback: String,
    /// Retry count at dead-letter time
    pub retry_count: u32,
    /// First failure timestamp
    pub first_failure_at: DateTime<Utc>,
    /// Most recent failure timestamp
    pub last_failure_at: DateTime<Utc>,
    /// Original task envelope, as JSON
    pub envelope_json: String,
}

/// Dead-letter store over the coordination store
pub struct DeadLetterStore {
    store: Arc<dyn CoordinationStore>,
    capacity: usize,
}

impl DeadLetterStore {
    /// Create a store bounded at `capacity` entries
    pub fn new(store: Arc<dyn CoordinationStore>, capacity: usize) -> Self {
        Self { store, capacity }
    }

    fn metadata_key(task_id: &str) -> String {
        format!("{}{}", DLQ_METADATA_PREFIX, task_id)
    }

    /// Record a terminally failed task with full context
    ///
    /// Re-recording the same task updates the last-failure timestamp
    /// and retry count while preserving the first-failure timestamp.
    pub async fn record(
        &self,
        envelope: &TaskEnvelope,
        error: &EvalError,
        retry_count: u32,
    ) -> EvalResult<()> {
        let task_id = envelope.task_id.to_string();
        let key = Self::metadata_key(&task_id);
        let now = Utc::now().to_rfc3339();

        let existing = self.store.hash_get_all(&key).await?;
        let is_new = existing.is_empty();
        let first_failure_at = existing
            .get("first_failure_at")
            .cloned()
            .unwrap_or_else(|| now.clone());

        let fields = vec![
            ("eval_id".to_string(), envelope.eval_id().to_string()),
            ("exception_class".to_string(), error.class().to_string()),
            ("message".to_string(), error.to_string()),
            (
                "traceback".to_string(),
                clamp_to(&format!("{:?}", error), MAX_TRACEBACK_BYTES),
            ),
            ("retry_count".to_string(), retry_count.to_string()),
            ("first_failure_at".to_string(), first_failure_at),
            ("last_failure_at".to_string(), now),
            (
                "envelope".to_string(),
                serde_json::to_string(envelope)?,
            ),
        ];
        self.store.hash_set(&key, &fields).await?;

        if is_new {
            if self.store.list_len(DLQ_LIST_KEY).await? >= self.capacity {
                if let Some(evicted) = self.store.pop_back(DLQ_LIST_KEY).await? {
                    self.store.delete(&Self::metadata_key(&evicted)).await?;
                    metrics::counter!("evald_dlq_evictions_total").increment(1);
                    warn!(
                        evicted_task = %evicted,
                        capacity = self.capacity,
                        "dead-letter store at capacity, dropped oldest entry"
                    );
                }
            }
            self.store.push_front(DLQ_LIST_KEY, &task_id).await?;
        }
        Ok(())
    }

    /// Fetch one entry's metadata
    pub async fn get(&self, task_id: &str) -> EvalResult<Option<DeadLetterRecord>> {
        let fields = self.store.hash_get_all(&Self::metadata_key(task_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::parse(task_id, &fields)?))
    }

    /// Task ids currently held, newest first
    pub async fn list(&self) -> EvalResult<Vec<String>> {
        self.store.list_range(DLQ_LIST_KEY).await
    }

    /// Number of entries currently held
    pub async fn len(&self) -> EvalResult<usize> {
        self.store.list_len(DLQ_LIST_KEY).await
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> EvalResult<bool> {
        Ok(self.len().await? == 0)
    }

    fn parse(task_id: &str, fields: &HashMap<String, String>) -> EvalResult<DeadLetterRecord> {
        let lookup = |name: &str| -> EvalResult<String> {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::Internal(format!("dlq metadata missing field {}", name)))
        };
        let parse_ts = |raw: &str| -> EvalResult<DateTime<Utc>> {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| EvalError::Internal(format!("dlq metadata bad timestamp: {}", e)))
        };

        Ok(DeadLetterRecord {
            task_id: task_id.to_string(),
            eval_id: EvalId::parse_str(&lookup("eval_id")?)?,
            exception_class: lookup("exception_class")?,
            message: lookup("message")?,
            traceback: lookup("traceback")?,
            retry_count: lookup("retry_count")?
                .parse()
                .map_err(|_| EvalError::Internal("dlq metadata bad retry_count".to_string()))?,
            first_failure_at: parse_ts(&lookup("first_failure_at")?)?,
            last_failure_at: parse_ts(&lookup("last_failure_at")?)?,
            envelope_json: lookup("envelope")?,
        })
    }
}

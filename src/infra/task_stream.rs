//! Durable task stream between the gateway and dispatcher workers
//!
//! At-least-once delivery with per-id single-consumer semantics: a
//! dequeued envelope sits in an in-flight table until acknowledged or
//! negatively acknowledged; an expired lease requeues it for another
//! worker.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::EvalResult;
use crate::task::{Priority, TaskEnvelope};

/// Task stream contract
#[async_trait]
pub trait TaskStream: Send + Sync {
    /// Enqueue an envelope on its priority sub-stream
    async fn enqueue(&self, envelope: TaskEnvelope) -> EvalResult<()>;

    /// Dequeue the next envelope, waiting up to `wait`
    ///
    /// Sub-streams are polled in a weighted round-robin: `high` is
    /// tried first on roughly two of every three polls. No strict
    /// priority is promised.
    async fn dequeue(&self, wait: Duration) -> EvalResult<Option<TaskEnvelope>>;

    /// Terminal acknowledgement: the envelope is destroyed
    async fn ack(&self, task_id: Uuid) -> EvalResult<()>;

    /// Negative acknowledgement: requeue for redelivery with an
    /// incremented retry count
    async fn nack(&self, task_id: Uuid) -> EvalResult<()>;
}

struct InFlight {
    envelope: TaskEnvelope,
    claimed_at: Instant,
}

#[derive(Default)]
struct StreamState {
    high: VecDeque<TaskEnvelope>,
    normal: VecDeque<TaskEnvelope>,
    in_flight: HashMap<Uuid, InFlight>,
}

impl StreamState {
    fn queue_mut(&mut self, priority: Priority) -> &mut VecDeque<TaskEnvelope> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
        }
    }

    fn requeue_expired(&mut self, lease: Duration) {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, f)| now.duration_since(f.claimed_at) >= lease)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(mut flight) = self.in_flight.remove(&id) {
                flight.envelope.retry_count += 1;
                let priority = flight.envelope.priority();
                self.queue_mut(priority).push_back(flight.envelope);
            }
        }
    }
}

/// In-process task stream
pub struct MemoryTaskStream {
    state: Mutex<StreamState>,
    notify: Notify,
    poll_tick: AtomicU64,
    lease: Duration,
}

impl MemoryTaskStream {
    /// Create a stream with the default 60s delivery lease
    pub fn new() -> Self {
        Self::with_lease(Duration::from_secs(60))
    }

    /// Create a stream with an explicit delivery lease
    pub fn with_lease(lease: Duration) -> Self {
        Self {
            state: Mutex::new(StreamState::default()),
            notify: Notify::new(),
            poll_tick: AtomicU64::new(0),
            lease,
        }
    }

    fn try_pop(&self) -> Option<TaskEnvelope> {
        let mut state = self.state.lock();
        state.requeue_expired(self.lease);

        let tick = self.poll_tick.fetch_add(1, Ordering::Relaxed);
        let order = if tick % 3 != 2 {
            [Priority::High, Priority::Normal]
        } else {
            [Priority::Normal, Priority::High]
        };
        for priority in order {
            if let Some(envelope) = state.queue_mut(priority).pop_front() {
                state.in_flight.insert(
                    envelope.task_id,
                    InFlight {
                        envelope: envelope.clone(),
                        claimed_at: Instant::now(),
                    },
                );
                return Some(envelope);
            }
        }
        None
    }
}

impl Default for MemoryTaskStream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStream for MemoryTaskStream {
    async fn enqueue(&self, envelope: TaskEnvelope) -> EvalResult<()> {
        {
            let mut state = self.state.lock();
            let priority = envelope.priority();
            state.queue_mut(priority).push_back(envelope);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> EvalResult<Option<TaskEnvelope>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(envelope) = self.try_pop() {
                return Ok(Some(envelope));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, self.notify.notified()).await;
        }
    }

    async fn ack(&self, task_id: Uuid) -> EvalResult<()> {
        let mut state = self.state.lock();
        state.in_flight.remove(&task_id);
        Ok(())
    }

    async fn nack(&self, task_id: Uuid) -> EvalResult<()> {
        let requeued = {
            let mut state = self.state.lock();
            if let Some(mut flight) = state.in_flight.remove(&task_id) {
                flight.envelope.retry_count += 1;
                let priority = flight.envelope.priority();
                state.queue_mut(priority).push_back(flight.envelope);
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
        Ok(())
    }
}

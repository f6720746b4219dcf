//! Retry and dead-letter plumbing shared across the pipeline

pub mod dlq;
pub mod retry;

pub use dlq::{DeadLetterRecord, DeadLetterStore};
pub use retry::{backoff_delay, jittered, retry_with_backoff};

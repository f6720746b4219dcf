//! Injected infrastructure adapters
//!
//! Every cross-process collaborator is a constructor-injected trait:
//! the task stream, the event bus, the coordination store, the durable
//! store and the orchestrator client. Components never reach for
//! module-level singletons.

pub mod coordination;
pub mod durable;
pub mod event_bus;
pub mod orchestrator;
#[cfg(feature = "redis-store")]
pub mod redis_store;
pub mod task_stream;

pub use coordination::{CoordinationStore, MemoryCoordinationStore, SlotRelease};
pub use durable::{DurableStore, MemoryDurableStore, SledDurableStore};
pub use event_bus::{EventBus, MemoryEventBus};
pub use orchestrator::{
    ExecuteRequest, HttpOrchestratorClient, JobEvent, JobEventStream, JobLogs, JobPhase,
    JobStatus, JobSummary, OrchestratorClient, OrchestratorError, WatchAction,
};
#[cfg(feature = "redis-store")]
pub use redis_store::RedisCoordinationStore;
pub use task_stream::{MemoryTaskStream, TaskStream};

//! Slot-based run scheduler for hourglass.
//!
//! This crate schedules a recurring extraction on a fixed calendar:
//! - **Slots**: `start + k * interval`, with optional catchup of missed slots
//! - **Runs**: one per slot, persisted with every task attempt
//! - **Ordering**: optional depends-on-past chaining and a concurrency cap
//! - **Execution**: `start -> extract -> end` with bounded retry of `extract`

mod error;
mod executor;
mod extract;
mod retry;
mod scheduler;
mod slots;
pub mod store;
mod types;

pub use error::{SchedulerError, TaskError};
pub use executor::{RunOutcome, TASK_GRAPH, TaskDescriptor, TaskGraphExecutor, TaskKind};
pub use extract::{Extractor, FnExtractor, JSON_CONTENT_TYPE, JsonFileExtractor, Payload};
pub use retry::{RetryController, TaskFailure};
pub use scheduler::{DEFAULT_POLL_INTERVAL, Scheduler, SchedulerHandle};
pub use slots::DueSlots;
pub use store::{JsonRunStore, MemoryRunStore, RunStore};
pub use types::{
    Clock, RetryPolicy, Run, RunState, TaskAttempt, TaskId, TaskState, WorkflowDefinition,
    system_clock,
};

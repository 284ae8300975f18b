//! Worker pool, the adapter that lets subtasks cross into it, and the
//! manager that drives jobs through it.
//!
//! - [`WorkerPool`]: semaphore-bounded set of worker slots with cancellation.
//! - [`WorkerAdapter`]: typed wrapper exposing a subtask as a pool job.
//! - [`WorkerPoolManager`]: queues, dispatches, polls and aborts jobs.

pub mod adapter;
pub mod manager;
pub mod workers;

pub use adapter::WorkerAdapter;
pub use manager::{
    Completion, HandleState, JobHandle, JobId, PollControl, PoolError, ResultStream, WorkerError,
    WorkerPoolManager,
};
pub use workers::{WorkerPermit, WorkerPool};

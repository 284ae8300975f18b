//! digiflow Engine Library
//!
//! Task execution and orchestration for batch digitization jobs:
//! - Task model: subtasks, composite tasks and the builder that wires them
//! - Log sinks for in-process and cross-boundary log delivery
//! - Bounded worker pool and the manager that drives jobs through it
//! - Three-phase orchestrator driving a pluggable [`Job`]

pub mod error;
pub mod job;
pub mod log;
pub mod orchestration;
pub mod pool;
pub mod progress;
pub mod task;

pub use error::EngineError;
pub use job::{Interaction, Job, JobError, Settings, ValidationError};
pub use log::{BufferLog, ChannelLog, LogLevel, LogRecord, LogSink};
pub use orchestration::{Orchestrator, RunState, RunSummary};
pub use pool::{Completion, PollControl, PoolError, WorkerAdapter, WorkerError, WorkerPoolManager};
pub use progress::{NullProgress, ProgressSink, RecordingProgress};
pub use task::{CompositeTask, Executable, Subtask, TaskBuilder, TaskError, TaskResult, TaskStatus};

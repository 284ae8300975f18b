//! Task model: subtasks, composite tasks and the builder that assembles them.
//!
//! - [`Subtask`]: smallest schedulable unit, wrapping an [`Executable`] body.
//! - [`CompositeTask`]: ordered group of subtasks with derived status.
//! - [`TaskBuilder`]: produces one composite per `build()`.

pub mod builder;
pub mod composite;
pub mod result;
pub mod status;
pub mod subtask;

pub use builder::TaskBuilder;
pub use composite::{Child, CompositeTask, StepRole};
pub use result::TaskResult;
pub use status::{StatusCell, TaskStatus};
pub use subtask::{Executable, Subtask, SubtaskState, TaskError, WorkContext};

/// Free-form key/value arguments passed across the pool boundary.
pub type Settings = serde_json::Map<String, serde_json::Value>;

//! Ordered group of subtasks with derived status.
//!
//! A [`CompositeTask`] never stores its own status. Status and progress are
//! recomputed from the children's [`StatusCell`]s on every call, and those
//! cells stay with the composite after the subtasks themselves have been
//! handed to the worker pool.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Settings;
use super::result::TaskResult;
use super::status::{StatusCell, TaskStatus};
use super::subtask::{Subtask, TaskError};
use crate::log::{BufferLog, LogLevel, LogRecord, LogSink};

/// Position of a child within its composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRole {
    Pre,
    Main,
    Post,
}

impl fmt::Display for StepRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pre => "pre",
            Self::Main => "main",
            Self::Post => "post",
        };
        f.write_str(s)
    }
}

/// One child slot. The subtask itself is absent while it runs in the pool
/// (or after a diagnostic round trip); the status cell is always present.
#[derive(Debug)]
pub struct Child {
    role: StepRole,
    id: Uuid,
    name: String,
    kind: String,
    settings: Option<Settings>,
    status: StatusCell,
    task: Option<Subtask>,
}

impl Child {
    fn new(role: StepRole, task: Subtask) -> Self {
        Self {
            role,
            id: task.id(),
            name: task.name().to_string(),
            kind: task.kind().to_string(),
            settings: task.declared_settings(),
            status: task.status_cell(),
            task: Some(task),
        }
    }

    pub const fn role(&self) -> StepRole {
        self.role
    }

    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn status(&self) -> TaskStatus {
        self.status.get()
    }

    /// Whether the subtask is still held here (not submitted).
    pub const fn is_attached(&self) -> bool {
        self.task.is_some()
    }
}

/// A task composed of an optional pre-step, main steps and an optional
/// post-step.
pub struct CompositeTask {
    label: String,
    children: Vec<Child>,
    log: Arc<dyn LogSink>,
    results: Vec<TaskResult>,
}

impl fmt::Debug for CompositeTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeTask")
            .field("label", &self.label)
            .field("children", &self.children)
            .field("results", &self.results.len())
            .finish_non_exhaustive()
    }
}

impl CompositeTask {
    pub(crate) fn new(
        label: String,
        log: Arc<dyn LogSink>,
        pre: Option<Subtask>,
        steps: Vec<Subtask>,
        post: Option<Subtask>,
    ) -> Self {
        let mut children = Vec::with_capacity(steps.len() + 2);
        children.extend(pre.map(|t| Child::new(StepRole::Pre, t)));
        children.extend(steps.into_iter().map(|t| Child::new(StepRole::Main, t)));
        children.extend(post.map(|t| Child::new(StepRole::Post, t)));
        Self {
            label,
            children,
            log,
            results: Vec::new(),
        }
    }

    /// Type label given by the builder (e.g. `"checksum:main"`).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Children in execution order: pre, main steps, post.
    pub fn children(&self) -> &[Child] {
        &self.children
    }

    pub fn pre_step(&self) -> Option<&Child> {
        self.children.iter().find(|c| c.role == StepRole::Pre)
    }

    pub fn post_step(&self) -> Option<&Child> {
        self.children.iter().find(|c| c.role == StepRole::Post)
    }

    pub fn steps(&self) -> impl Iterator<Item = &Child> {
        self.children.iter().filter(|c| c.role == StepRole::Main)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Status derived from the children; see [`TaskStatus::aggregate`].
    pub fn status(&self) -> TaskStatus {
        TaskStatus::aggregate(self.children.iter().map(Child::status))
    }

    /// Fraction of children past WORKING. An empty composite is complete.
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self) -> f64 {
        if self.children.is_empty() {
            return 1.0;
        }
        let done = self
            .children
            .iter()
            .filter(|c| c.status().is_terminal())
            .count();
        done as f64 / self.children.len() as f64
    }

    /// Detach every still-attached subtask, in execution order, so it can
    /// be submitted to the pool. Status tracking stays with the composite.
    pub fn take_subtasks(&mut self) -> Vec<Subtask> {
        self.children
            .iter_mut()
            .filter_map(|c| c.task.take())
            .collect()
    }

    /// Record a result produced by one of this composite's children.
    pub fn record_result(&mut self, result: TaskResult) {
        self.results.push(result);
    }

    /// Aggregate result of this composite.
    pub fn results(&self) -> &[TaskResult] {
        &self.results
    }

    pub fn log(&self, message: impl Into<String>) {
        self.log
            .append(LogRecord::new(LogLevel::Info, self.label.as_str(), message));
    }

    /// Run all attached children in order on the current thread.
    ///
    /// Stops at the first child that fails; an error from a child
    /// propagates and leaves the composite FAILED.
    pub fn execute(&mut self) -> Result<bool, TaskError> {
        for child in &mut self.children {
            let Some(task) = child.task.as_mut() else {
                continue;
            };
            let ok = task.run()?;
            if let Some(result) = task.take_result() {
                self.results.push(result);
            }
            if !ok {
                return Ok(false);
            }
        }
        Ok(self.status() == TaskStatus::Success)
    }

    /// Serialise type label and child state for debug replay.
    pub fn to_diagnostic(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.snapshot())
    }

    /// Rebuild a composite from [`CompositeTask::to_diagnostic`] output.
    ///
    /// The result has no executable children and logs into a fresh
    /// in-memory buffer; it is meant for inspection only.
    pub fn from_diagnostic(raw: &str) -> Result<Self, serde_json::Error> {
        let snapshot: CompositeSnapshot = serde_json::from_str(raw)?;
        let children = snapshot
            .children
            .into_iter()
            .map(|c| Child {
                role: c.role,
                id: c.id,
                name: c.name,
                kind: c.kind,
                settings: c.settings,
                status: StatusCell::with_status(c.status),
                task: None,
            })
            .collect();
        Ok(Self {
            label: snapshot.label,
            children,
            log: Arc::new(BufferLog::new()),
            results: snapshot.results,
        })
    }

    fn snapshot(&self) -> CompositeSnapshot {
        CompositeSnapshot {
            type_name: COMPOSITE_TYPE.to_string(),
            label: self.label.clone(),
            children: self
                .children
                .iter()
                .map(|c| ChildSnapshot {
                    role: c.role,
                    id: c.id,
                    name: c.name.clone(),
                    kind: c.kind.clone(),
                    status: c.status(),
                    settings: c.settings.clone(),
                })
                .collect(),
            results: self.results.clone(),
        }
    }
}

const COMPOSITE_TYPE: &str = "CompositeTask";

#[derive(Debug, Serialize, Deserialize)]
struct CompositeSnapshot {
    #[serde(rename = "type")]
    type_name: String,
    label: String,
    children: Vec<ChildSnapshot>,
    #[serde(default)]
    results: Vec<TaskResult>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChildSnapshot {
    role: StepRole,
    id: Uuid,
    name: String,
    kind: String,
    status: TaskStatus,
    #[serde(default)]
    settings: Option<Settings>,
}

//! Assembles one [`CompositeTask`] per build.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::composite::CompositeTask;
use super::subtask::{Executable, Subtask};
use crate::log::LogSink;

/// Collects steps for a single composite and wires the shared log sink and
/// working directory into each of them.
///
/// `build` consumes the builder, so steps registered for one composite
/// can never leak into the next.
pub struct TaskBuilder {
    label: String,
    log: Arc<dyn LogSink>,
    working_dir: PathBuf,
    pre: Option<Box<dyn Executable>>,
    steps: Vec<Box<dyn Executable>>,
    post: Option<Box<dyn Executable>>,
}

impl TaskBuilder {
    pub fn new(
        label: impl Into<String>,
        log: Arc<dyn LogSink>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            label: label.into(),
            log,
            working_dir: working_dir.into(),
            pre: None,
            steps: Vec::new(),
            post: None,
        }
    }

    /// Append a main step.
    pub fn add_step(&mut self, step: impl Executable) -> &mut Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Set (or replace) the pre-step.
    pub fn set_pre_step(&mut self, step: impl Executable) -> &mut Self {
        self.pre = Some(Box::new(step));
        self
    }

    /// Set (or replace) the post-step.
    pub fn set_post_step(&mut self, step: impl Executable) -> &mut Self {
        self.post = Some(Box::new(step));
        self
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Number of registered steps, including pre and post.
    pub fn step_count(&self) -> usize {
        self.steps.len() + usize::from(self.pre.is_some()) + usize::from(self.post.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.step_count() == 0
    }

    pub fn build(self) -> CompositeTask {
        let Self {
            label,
            log,
            working_dir,
            pre,
            steps,
            post,
        } = self;
        let wrap = |body: Box<dyn Executable>| {
            Subtask::from_boxed(body, Arc::clone(&log), working_dir.clone())
        };
        let pre = pre.map(&wrap);
        let steps = steps.into_iter().map(&wrap).collect();
        let post = post.map(&wrap);
        CompositeTask::new(label, log, pre, steps, post)
    }
}

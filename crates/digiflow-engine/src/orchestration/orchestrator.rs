//! Three-phase run driver.
//!
//! The [`Orchestrator`] takes a [`Job`] through `INITIAL → MAIN → COMPLETION
//! → REPORTING`, executing each phase's subtasks on a fresh
//! [`WorkerPoolManager`] and holding a barrier between phases. A phase that
//! fails or is cancelled ends the run without touching later phases; the
//! caller gets a [`RunSummary`] either way. Only option validation and a
//! broken worker pool surface as `Err`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use digiflow_core::EngineConfig;
use digiflow_core::config::load_config;
use tracing::{debug, error, info, warn};

use super::state::{Phase, PhaseFailure, PhaseOutcome, PhaseRecord, RunState};
use crate::error::EngineError;
use crate::job::{Interaction, Job, JobError, Settings};
use crate::pool::{JobId, PollControl, WorkerAdapter, WorkerError, WorkerPoolManager};
use crate::progress::ProgressSink;
use crate::task::{CompositeTask, TaskBuilder, TaskResult, TaskStatus};

/// Final account of one run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub job: String,
    pub state: RunState,
    /// One record per phase that was executed, in phase order.
    pub phases: Vec<PhaseRecord>,
    pub report: Option<String>,
    pub failure: Option<PhaseFailure>,
}

impl RunSummary {
    pub const fn is_success(&self) -> bool {
        matches!(self.state, RunState::Done)
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self.state, RunState::Cancelled)
    }

    pub const fn is_failed(&self) -> bool {
        matches!(self.state, RunState::Failed)
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseRecord> {
        self.phases.iter().find(|r| r.phase == phase)
    }

    /// Every result collected, phase by phase.
    pub fn results(&self) -> impl Iterator<Item = &TaskResult> {
        self.phases.iter().flat_map(|r| r.results.iter())
    }

    pub fn result_count(&self) -> usize {
        self.phases.iter().map(|r| r.results.len()).sum()
    }

    pub fn worker_errors(&self) -> impl Iterator<Item = &WorkerError> {
        self.phases.iter().flat_map(|r| r.errors.iter())
    }
}

/// Drives jobs through the three-phase protocol.
#[derive(Debug, Clone, Default)]
pub struct Orchestrator {
    config: EngineConfig,
}

impl Orchestrator {
    pub const fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Build an orchestrator from the layered engine configuration.
    pub fn from_project(project_dir: Option<&Path>) -> Result<Self, EngineError> {
        Ok(Self::new(load_config(project_dir)?))
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `job` to a terminal state.
    ///
    /// Options are validated before anything is built. The worker pool is
    /// opened for this run only and always shut down before returning.
    pub async fn run(
        &self,
        job: &dyn Job,
        options: &Settings,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<RunSummary, EngineError> {
        if let Err(e) = job.validate_options(options) {
            warn!(job = job.name(), error = %e, "Rejected job options");
            return Err(e.into());
        }

        info!(
            job = job.name(),
            pool_size = self.config.effective_pool_size(),
            "Starting run"
        );
        let mut manager = WorkerPoolManager::open(&self.config);
        let mut run = Run::new(job.name(), progress, self.config.resolved_working_dir());

        let driven = run.drive(&mut manager, job, options).await;
        let closed = manager.shutdown().await;
        driven?;
        closed?;

        info!(job = job.name(), state = %run.state, "Run finished");
        Ok(run.into_summary())
    }
}

/// Mutable bookkeeping for a single run.
struct Run {
    job: String,
    state: RunState,
    phases: Vec<PhaseRecord>,
    report: Option<String>,
    failure: Option<PhaseFailure>,
    progress: Arc<dyn ProgressSink>,
    working_dir: PathBuf,
}

impl Run {
    fn new(job: &str, progress: Arc<dyn ProgressSink>, working_dir: PathBuf) -> Self {
        Self {
            job: job.to_string(),
            state: RunState::Initial,
            phases: Vec::new(),
            report: None,
            failure: None,
            progress,
            working_dir,
        }
    }

    async fn drive(
        &mut self,
        manager: &mut WorkerPoolManager,
        job: &dyn Job,
        options: &Settings,
    ) -> Result<(), EngineError> {
        // INITIAL
        let mut builder = self.builder(manager, Phase::Initial);
        if let Err(e) = job.initial_task(&mut builder, options) {
            self.hook_failed(Phase::Initial, "initial_task", &e);
            return Ok(());
        }
        let record = self
            .execute_phase(manager, Phase::Initial, vec![builder.build()])
            .await?;
        if !self.settle(record) {
            return Ok(());
        }
        let pre_results = self.results_of(Phase::Initial);

        let additional = match job.get_additional_info(options, &pre_results).await {
            Interaction::Continue(data) => data,
            Interaction::Cancelled => {
                self.cancel("cancelled while gathering additional information");
                return Ok(());
            }
            Interaction::Failed(reason) => {
                self.fail(Phase::Initial, reason, None);
                return Ok(());
            }
        };
        if self.cancel_requested() {
            return Ok(());
        }

        // MAIN
        self.transition(RunState::Main);
        let metadata = match job.discover_task_metadata(&pre_results, additional.as_ref(), options)
        {
            Ok(metadata) => metadata,
            Err(e) => {
                self.hook_failed(Phase::Main, "discover_task_metadata", &e);
                return Ok(());
            }
        };
        debug!(job = %self.job, units = metadata.len(), "Discovered main-phase units");
        let mut composites = Vec::with_capacity(metadata.len());
        for job_args in &metadata {
            let mut builder = self.builder(manager, Phase::Main);
            if let Err(e) = job.create_new_task(&mut builder, job_args) {
                self.hook_failed(Phase::Main, "create_new_task", &e);
                return Ok(());
            }
            composites.push(builder.build());
        }
        let record = self.execute_phase(manager, Phase::Main, composites).await?;
        if !self.settle(record) {
            return Ok(());
        }
        if self.cancel_requested() {
            return Ok(());
        }

        // COMPLETION
        self.transition(RunState::Completion);
        let accumulated: Vec<TaskResult> = self.results_so_far();
        let mut builder = self.builder(manager, Phase::Completion);
        if let Err(e) = job.completion_task(&mut builder, &accumulated, options) {
            self.hook_failed(Phase::Completion, "completion_task", &e);
            return Ok(());
        }
        let record = self
            .execute_phase(manager, Phase::Completion, vec![builder.build()])
            .await?;
        if !self.settle(record) {
            return Ok(());
        }
        if self.cancel_requested() {
            return Ok(());
        }

        // REPORTING
        self.transition(RunState::Reporting);
        let all = self.results_so_far();
        let report = job
            .generate_report(&all, options)
            .filter(|text| !text.trim().is_empty());
        if let Some(text) = &report {
            info!(job = %self.job, "{text}");
            self.progress.set_status(text);
        }
        self.report = report;
        self.transition(RunState::Done);
        Ok(())
    }

    fn builder(&self, manager: &WorkerPoolManager, phase: Phase) -> TaskBuilder {
        TaskBuilder::new(
            format!("{}:{phase}", self.job),
            manager.log_sink(),
            self.working_dir.clone(),
        )
    }

    /// Submit every subtask of `composites`, wait for all of them to settle
    /// and tag the phase with its outcome.
    async fn execute_phase(
        &self,
        manager: &mut WorkerPoolManager,
        phase: Phase,
        mut composites: Vec<CompositeTask>,
    ) -> Result<PhaseRecord, EngineError> {
        let mut owner: HashMap<JobId, usize> = HashMap::new();
        for (i, composite) in composites.iter_mut().enumerate() {
            for task in composite.take_subtasks() {
                let adapter = WorkerAdapter::new(task);
                let settings = adapter.settings();
                owner.insert(manager.add_job(adapter, settings)?, i);
            }
        }

        let total = manager.start()?;
        info!(job = %self.job, phase = %phase, jobs = total, "Phase started");
        self.progress.set_title(&format!("{}: {phase}", self.job));
        self.progress.set_total(total);
        self.progress.set_progress(0);
        self.progress.refresh();
        manager.attach_progress(Arc::clone(&self.progress));

        let mut record = PhaseRecord::new(phase, total);
        let mut fatal = None;
        {
            let sink = Arc::clone(&self.progress);
            let mut stream = manager.results(move |completed, total| {
                sink.set_total(total);
                sink.set_progress(completed);
                sink.refresh();
                if sink.cancel_requested() {
                    PollControl::Abort
                } else {
                    PollControl::Continue
                }
            });
            while let Some(item) = stream.next().await {
                match item {
                    Ok(completion) => {
                        if let (Some(&i), Some(result)) =
                            (owner.get(&completion.job), completion.result.as_ref())
                        {
                            composites[i].record_result(result.clone());
                        }
                        record.absorb(completion);
                    }
                    Err(e) => {
                        fatal = Some(e);
                        break;
                    }
                }
            }
        }
        manager.detach_progress();

        if let Some(e) = fatal {
            error!(job = %self.job, phase = %phase, error = %e, "Worker pool failure");
            return Err(e.into());
        }

        let status = TaskStatus::aggregate(composites.iter().map(CompositeTask::status));
        record.outcome = if manager.is_aborted() {
            if self.progress.cancel_requested() {
                PhaseOutcome::Cancelled
            } else {
                PhaseOutcome::Failed {
                    reason: "the worker pool was aborted".to_string(),
                }
            }
        } else if status == TaskStatus::Failed {
            let failed = composites
                .iter()
                .flat_map(CompositeTask::children)
                .filter(|c| c.status() == TaskStatus::Failed)
                .count();
            PhaseOutcome::Failed {
                reason: format!("{failed} of {total} task(s) failed"),
            }
        } else {
            PhaseOutcome::Succeeded
        };
        Ok(record)
    }

    /// File the record. Returns `true` when the run may advance.
    fn settle(&mut self, record: PhaseRecord) -> bool {
        let phase = record.phase;
        let outcome = record.outcome.clone();
        let detail = (!record.errors.is_empty()).then(|| {
            record
                .errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n")
        });
        info!(
            job = %self.job,
            phase = %phase,
            results = record.results.len(),
            errors = record.errors.len(),
            "Phase settled"
        );
        self.phases.push(record);

        match outcome {
            PhaseOutcome::Succeeded => true,
            PhaseOutcome::Cancelled => {
                self.cancel(&format!("cancelled during the {phase} phase"));
                false
            }
            PhaseOutcome::Failed { reason } => {
                self.fail(phase, reason, detail);
                false
            }
        }
    }

    fn hook_failed(&mut self, phase: Phase, hook: &str, e: &JobError) {
        self.fail(phase, format!("{hook} failed: {e}"), None);
    }

    fn fail(&mut self, phase: Phase, reason: String, detail: Option<String>) {
        let failure = PhaseFailure {
            phase,
            reason,
            detail,
        };
        error!(
            job = %self.job,
            phase = %phase,
            reason = %failure.reason,
            "Phase failed"
        );
        self.progress.set_status(&failure.summary());
        self.failure = Some(failure);
        self.transition(RunState::Failed);
    }

    fn cancel(&mut self, reason: &str) {
        info!(job = %self.job, state = %self.state, reason, "Run cancelled");
        self.progress.set_status("Cancelled");
        self.transition(RunState::Cancelled);
    }

    /// Check the host's cancel flag at a phase boundary.
    fn cancel_requested(&mut self) -> bool {
        if self.progress.cancel_requested() {
            self.cancel("cancel requested between phases");
            return true;
        }
        false
    }

    fn transition(&mut self, next: RunState) {
        if self.state.can_transition_to(next) {
            debug!(job = %self.job, from = %self.state, to = %next, "Run state change");
            self.state = next;
        } else {
            warn!(
                job = %self.job,
                from = %self.state,
                to = %next,
                "Ignoring invalid run state change"
            );
        }
    }

    fn results_of(&self, phase: Phase) -> Vec<TaskResult> {
        self.phases
            .iter()
            .filter(|r| r.phase == phase)
            .flat_map(|r| r.results.iter().cloned())
            .collect()
    }

    fn results_so_far(&self) -> Vec<TaskResult> {
        self.phases
            .iter()
            .flat_map(|r| r.results.iter().cloned())
            .collect()
    }

    fn into_summary(self) -> RunSummary {
        RunSummary {
            job: self.job,
            state: self.state,
            phases: self.phases,
            report: self.report,
            failure: self.failure,
        }
    }
}

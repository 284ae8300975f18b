//! Worker pool manager.
//!
//! [`WorkerPoolManager`] is the coordinator that:
//! - queues adapted jobs with their submission settings
//! - dispatches them FIFO onto the [`WorkerPool`] (one permit per running job)
//! - yields completions in completion order through a polling [`ResultStream`]
//! - drains the cross-boundary log channel after every poll
//! - aborts: cancels not-yet-started jobs and waits for in-flight ones to settle
//!
//! A job's `work()` runs on Tokio's blocking thread pool. A `TaskError`
//! returned from it is captured on that job's [`Completion`]; a panic is
//! treated as a crashed worker and is fatal for the whole manager.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use digiflow_core::EngineConfig;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::adapter::WorkerAdapter;
use super::workers::{PoolLease, WorkerPermit, WorkerPool};
use crate::log::{ChannelLog, LogReceiver, LogSink, log_channel};
use crate::progress::ProgressSink;
use crate::task::{Settings, StatusCell, TaskError, TaskResult, TaskStatus};

/// Identifier assigned to every queued job.
pub type JobId = Uuid;

/// An unhandled failure inside one job, captured on its handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Job {task} ({job}) failed: {message}")]
pub struct WorkerError {
    pub job: JobId,
    pub task: String,
    pub message: String,
}

/// Errors from the pool manager.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker pool manager has been aborted")]
    Aborted,

    #[error("Worker pool has been closed")]
    Closed,

    #[error("Worker crashed while running {task} ({job}): {message}")]
    WorkerCrashed {
        job: JobId,
        task: String,
        message: String,
    },

    #[error("Completion channel closed with {pending} job(s) outstanding")]
    ChannelClosed { pending: usize },

    #[error("Jobs can only be started from within a Tokio runtime")]
    NoRuntime,
}

/// What the progress callback asks the result stream to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollControl {
    Continue,
    Abort,
}

/// Lifecycle of a job handle as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Added but `start()` not yet called.
    Queued,
    /// Handed to the dispatcher; may be waiting for a slot or running.
    Submitted,
    /// Ran to completion (successfully or not).
    Finished,
    /// Never started because of an abort.
    Cancelled,
    /// The worker running it panicked.
    Crashed,
}

impl HandleState {
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled | Self::Crashed)
    }
}

/// Read-only view of one submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    task: String,
    state: HandleState,
    status: StatusCell,
}

impl JobHandle {
    pub const fn id(&self) -> JobId {
        self.id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub const fn state(&self) -> HandleState {
        self.state
    }

    /// Live status of the underlying subtask.
    pub fn status(&self) -> TaskStatus {
        self.status.get()
    }
}

/// Terminal value of one finished job.
#[derive(Debug, Clone)]
pub struct Completion {
    pub job: JobId,
    pub task: String,
    pub status: TaskStatus,
    pub result: Option<TaskResult>,
    pub error: Option<WorkerError>,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success && self.error.is_none()
    }
}

struct QueuedJob {
    id: JobId,
    adapter: WorkerAdapter,
    settings: Settings,
}

enum Settled {
    Finished {
        job: JobId,
        outcome: Result<Option<TaskResult>, TaskError>,
    },
    Cancelled {
        job: JobId,
    },
    Crashed {
        job: JobId,
        message: String,
    },
}

enum Settlement {
    Yield(Completion),
    Skip,
    Fatal(PoolError),
}

/// Owns a worker pool, the job queue, the handle list and both ends of the
/// completion and log channels.
pub struct WorkerPoolManager {
    pool: WorkerPool,
    queue: VecDeque<QueuedJob>,
    handles: Vec<JobHandle>,
    index: HashMap<JobId, usize>,
    completion_tx: mpsc::UnboundedSender<Settled>,
    completion_rx: mpsc::UnboundedReceiver<Settled>,
    log_sink: ChannelLog,
    log_rx: LogReceiver,
    mirror: Option<Arc<dyn ProgressSink>>,
    poll_interval: Duration,
    aborted: bool,
}

impl WorkerPoolManager {
    /// Open a manager with its own pool of `pool_size` workers.
    pub fn new(pool_size: usize, poll_interval: Duration) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (log_sink, log_rx) = log_channel();
        Self {
            pool: WorkerPool::open(pool_size),
            queue: VecDeque::new(),
            handles: Vec::new(),
            index: HashMap::new(),
            completion_tx,
            completion_rx,
            log_sink,
            log_rx,
            mirror: None,
            poll_interval,
            aborted: false,
        }
    }

    /// Open a manager using the pool size and poll interval from `config`.
    pub fn open(config: &EngineConfig) -> Self {
        Self::new(config.effective_pool_size(), config.poll_interval())
    }

    /// Channel-backed log sink to build pool-bound subtasks with.
    pub fn log_sink(&self) -> Arc<dyn LogSink> {
        Arc::new(self.log_sink.clone())
    }

    /// Mirror flushed log lines and abort progress into `sink` until
    /// [`detach_progress`](Self::detach_progress) is called.
    pub fn attach_progress(&mut self, sink: Arc<dyn ProgressSink>) {
        self.mirror = Some(sink);
    }

    pub fn detach_progress(&mut self) {
        self.flush_log_buffer();
        self.mirror = None;
    }

    /// Queue a job. Nothing runs until [`start`](Self::start).
    pub fn add_job(
        &mut self,
        adapter: WorkerAdapter,
        settings: Settings,
    ) -> Result<JobId, PoolError> {
        self.ensure_open()?;
        let id = Uuid::new_v4();
        debug!(job_id = %id, task = adapter.name(), "Queueing job");
        self.index.insert(id, self.handles.len());
        self.handles.push(JobHandle {
            id,
            task: adapter.name().to_string(),
            state: HandleState::Queued,
            status: adapter.status_cell(),
        });
        self.queue.push_back(QueuedJob {
            id,
            adapter,
            settings,
        });
        Ok(id)
    }

    /// Submit every queued job and return immediately.
    ///
    /// Returns the number of jobs in the current batch. When every job from
    /// an earlier batch has settled, that batch's handles are dropped first
    /// so progress counts restart from zero. Outside a Tokio runtime nothing
    /// is submitted and [`PoolError::NoRuntime`] is returned.
    pub fn start(&mut self) -> Result<usize, PoolError> {
        self.ensure_open()?;
        let runtime = Handle::try_current().map_err(|_| PoolError::NoRuntime)?;
        if self.outstanding() == 0 {
            self.retire_settled();
        }
        let jobs: Vec<QueuedJob> = self.queue.drain(..).collect();
        for job in &jobs {
            self.set_state(job.id, HandleState::Submitted);
        }
        if !jobs.is_empty() {
            info!(
                submitted = jobs.len(),
                pool_size = self.pool.size(),
                "Submitting jobs to worker pool"
            );
            runtime.spawn(dispatch(jobs, self.pool.lease(), self.completion_tx.clone()));
        }
        Ok(self.handles.len())
    }

    /// Lazy stream of completions, in completion order.
    ///
    /// `on_progress(completed, total)` runs after every completion and on
    /// every poll timeout; returning [`PollControl::Abort`] aborts the
    /// manager and ends the stream.
    pub fn results<F>(&mut self, on_progress: F) -> ResultStream<'_, F>
    where
        F: FnMut(usize, usize) -> PollControl,
    {
        ResultStream {
            manager: self,
            on_progress,
            done: false,
        }
    }

    /// Drain the stream into a vector, stopping at the first fatal error.
    pub async fn collect_results<F>(
        &mut self,
        on_progress: F,
    ) -> Result<Vec<Completion>, PoolError>
    where
        F: FnMut(usize, usize) -> PollControl,
    {
        let mut stream = self.results(on_progress);
        let mut completions = Vec::new();
        while let Some(item) = stream.next().await {
            completions.push(item?);
        }
        Ok(completions)
    }

    /// Cancel queued and not-yet-started jobs, ask running ones to stop, and
    /// wait until every handle has settled. Afterwards the manager accepts
    /// no more work.
    ///
    /// A worker that crashes while the abort waits for it is returned as
    /// the first [`PoolError::WorkerCrashed`]; later crashes are only logged.
    pub async fn abort(&mut self) -> Result<(), PoolError> {
        if self.aborted {
            return Ok(());
        }
        self.aborted = true;
        warn!(
            outstanding = self.outstanding(),
            "Aborting worker pool manager"
        );
        self.pool.cancel();

        let never_started: Vec<JobId> = self.queue.drain(..).map(|q| q.id).collect();
        for id in never_started {
            self.set_state(id, HandleState::Cancelled);
        }

        let mut crashed = None;
        while self.outstanding() > 0 {
            match tokio::time::timeout(self.poll_interval, self.completion_rx.recv()).await {
                Ok(Some(settled)) => {
                    if let Settlement::Fatal(err) = self.settle(settled) {
                        error!(error = %err, "Worker crashed during abort");
                        if crashed.is_none() {
                            crashed = Some(err);
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {}
            }
            self.flush_log_buffer();
            let (completed, total) = self.counts();
            debug!(completed, total, "Waiting for in-flight jobs to settle");
            if let Some(mirror) = &self.mirror {
                mirror.set_progress(completed);
                mirror.refresh();
            }
        }
        self.flush_log_buffer();
        info!("Worker pool manager aborted");
        crashed.map_or(Ok(()), Err)
    }

    /// Re-emit every buffered task log record and mirror it into the
    /// attached progress sink. Returns the number of records flushed.
    pub fn flush_log_buffer(&mut self) -> usize {
        let records = self.log_rx.drain();
        for record in &records {
            record.emit();
            if let Some(mirror) = &self.mirror {
                mirror.set_status(&record.message);
            }
        }
        records.len()
    }

    /// Abort anything still outstanding and close the pool.
    ///
    /// Returns the crash of a worker that was still running, if any.
    pub async fn shutdown(mut self) -> Result<(), PoolError> {
        let aborted = if self.outstanding() > 0 || !self.queue.is_empty() {
            self.abort().await
        } else {
            Ok(())
        };
        self.flush_log_buffer();
        self.pool.shutdown();
        aborted
    }

    pub fn handles(&self) -> &[JobHandle] {
        &self.handles
    }

    pub fn handle(&self, id: JobId) -> Option<&JobHandle> {
        self.index.get(&id).map(|&i| &self.handles[i])
    }

    /// Jobs handed to the dispatcher that have not settled yet.
    pub fn outstanding(&self) -> usize {
        self.handles
            .iter()
            .filter(|h| h.state == HandleState::Submitted)
            .count()
    }

    /// `(settled, total)` for the current batch.
    pub fn counts(&self) -> (usize, usize) {
        let settled = self
            .handles
            .iter()
            .filter(|h| h.state.is_settled())
            .count();
        (settled, self.handles.len())
    }

    pub const fn pool_size(&self) -> usize {
        self.pool.size()
    }

    pub const fn is_aborted(&self) -> bool {
        self.aborted
    }

    fn ensure_open(&self) -> Result<(), PoolError> {
        if self.aborted {
            return Err(PoolError::Aborted);
        }
        if self.pool.is_closed() {
            return Err(PoolError::Closed);
        }
        Ok(())
    }

    fn retire_settled(&mut self) {
        self.handles.retain(|h| h.state == HandleState::Queued);
        self.index = self
            .handles
            .iter()
            .enumerate()
            .map(|(i, h)| (h.id, i))
            .collect();
    }

    fn set_state(&mut self, id: JobId, state: HandleState) {
        if let Some(&i) = self.index.get(&id) {
            self.handles[i].state = state;
        }
    }

    fn task_name(&self, id: JobId) -> String {
        self.handle(id)
            .map(|h| h.task.clone())
            .unwrap_or_default()
    }

    fn settle(&mut self, settled: Settled) -> Settlement {
        match settled {
            Settled::Finished { job, outcome } => {
                self.set_state(job, HandleState::Finished);
                let task = self.task_name(job);
                let status = self.handle(job).map_or(TaskStatus::Failed, JobHandle::status);
                if self.aborted {
                    debug!(
                        job_id = %job,
                        task = %task,
                        "Discarding result of job finished after abort"
                    );
                    return Settlement::Skip;
                }
                let (result, error) = match outcome {
                    Ok(result) => (result, None),
                    Err(e) => {
                        warn!(job_id = %job, task = %task, error = %e, "Job raised an error");
                        (
                            None,
                            Some(WorkerError {
                                job,
                                task: task.clone(),
                                message: e.to_string(),
                            }),
                        )
                    }
                };
                Settlement::Yield(Completion {
                    job,
                    task,
                    status,
                    result,
                    error,
                })
            }
            Settled::Cancelled { job } => {
                self.set_state(job, HandleState::Cancelled);
                debug!(job_id = %job, "Job cancelled before it started");
                Settlement::Skip
            }
            Settled::Crashed { job, message } => {
                self.set_state(job, HandleState::Crashed);
                if let Some(handle) = self.handle(job) {
                    handle.status.advance(TaskStatus::Failed);
                }
                let task = self.task_name(job);
                error!(
                    job_id = %job,
                    task = %task,
                    error = %message,
                    "Worker crashed; pool is broken"
                );
                Settlement::Fatal(PoolError::WorkerCrashed { job, task, message })
            }
        }
    }
}

/// Borrowing iterator over completions; see [`WorkerPoolManager::results`].
pub struct ResultStream<'a, F> {
    manager: &'a mut WorkerPoolManager,
    on_progress: F,
    done: bool,
}

impl<F> ResultStream<'_, F>
where
    F: FnMut(usize, usize) -> PollControl,
{
    /// Wait for the next completion, polling in bounded intervals.
    ///
    /// Returns `None` once every submitted job has settled or the stream
    /// was aborted. A crashed worker aborts the manager and is returned as
    /// `Some(Err(..))`, including one that crashes while an abort requested
    /// by `on_progress` waits for it; the stream ends after it.
    pub async fn next(&mut self) -> Option<Result<Completion, PoolError>> {
        if self.done {
            return None;
        }
        loop {
            if self.manager.outstanding() == 0 {
                self.manager.flush_log_buffer();
                self.done = true;
                return None;
            }

            let poll = self.manager.poll_interval;
            let waited = tokio::time::timeout(poll, self.manager.completion_rx.recv()).await;
            self.manager.flush_log_buffer();

            let settlement = match waited {
                Ok(Some(settled)) => Some(self.manager.settle(settled)),
                Ok(None) => {
                    self.done = true;
                    return Some(Err(PoolError::ChannelClosed {
                        pending: self.manager.outstanding(),
                    }));
                }
                Err(_elapsed) => None,
            };

            if let Some(Settlement::Fatal(err)) = settlement {
                // Later crashes during this abort are logged by `abort`.
                let _ = self.manager.abort().await;
                self.done = true;
                return Some(Err(err));
            }

            let (completed, total) = self.manager.counts();
            if (self.on_progress)(completed, total) == PollControl::Abort {
                self.done = true;
                return self.manager.abort().await.err().map(Err);
            }

            if let Some(Settlement::Yield(completion)) = settlement {
                return Some(Ok(completion));
            }
        }
    }
}

async fn dispatch(jobs: Vec<QueuedJob>, lease: PoolLease, tx: mpsc::UnboundedSender<Settled>) {
    for job in jobs {
        let Some(permit) = lease.acquire().await else {
            let _ = tx.send(Settled::Cancelled { job: job.id });
            continue;
        };
        tokio::spawn(run_job(job, permit, lease.clone(), tx.clone()));
    }
}

async fn run_job(
    job: QueuedJob,
    permit: WorkerPermit,
    lease: PoolLease,
    tx: mpsc::UnboundedSender<Settled>,
) {
    let QueuedJob {
        id,
        mut adapter,
        settings,
    } = job;
    if lease.cancel_token().is_cancelled() {
        let _ = tx.send(Settled::Cancelled { job: id });
        return;
    }

    let cancel = lease.cancel_token().clone();
    let joined =
        tokio::task::spawn_blocking(move || adapter.process(&settings, Some(&cancel))).await;

    let settled = match joined {
        Ok(outcome) => Settled::Finished { job: id, outcome },
        Err(e) if e.is_panic() => Settled::Crashed {
            job: id,
            message: panic_message(e.into_panic().as_ref()),
        },
        Err(e) => Settled::Crashed {
            job: id,
            message: e.to_string(),
        },
    };
    // Send before releasing the slot so the next job cannot overtake this
    // completion on the channel.
    let _ = tx.send(settled);
    drop(permit);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

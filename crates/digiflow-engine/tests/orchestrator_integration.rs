#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end runs of the three-phase protocol.
//!
//! Each test drives an in-test `Job` through a real `Orchestrator` backed by
//! a worker pool, and checks the resulting `RunSummary` and progress trail.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use digiflow_core::EngineConfig;
use digiflow_core::tracing_init::{engine_filter, init_tracing};
use digiflow_engine::orchestration::{Phase, PhaseOutcome};
use digiflow_engine::task::WorkContext;
use digiflow_engine::{
    EngineError, Executable, Interaction, Job, JobError, Orchestrator, PoolError, ProgressSink,
    RecordingProgress, RunState, Settings, TaskBuilder, TaskError, TaskResult, ValidationError,
};
use serde_json::{Value, json};

/// Configurable step: sleeps, logs, stores its `value` and reports `ok`.
struct Step {
    name: String,
    value: Value,
    millis: u64,
    outcome: StepOutcome,
}

#[derive(Clone, Copy)]
enum StepOutcome {
    Ok,
    ReturnFalse,
    Raise,
    Panic,
}

impl Step {
    fn ok(name: &str, value: Value) -> Self {
        Self {
            name: name.to_string(),
            value,
            millis: 0,
            outcome: StepOutcome::Ok,
        }
    }

    fn slow(mut self, millis: u64) -> Self {
        self.millis = millis;
        self
    }

    fn with(mut self, outcome: StepOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}

impl Executable for Step {
    fn kind(&self) -> &str {
        "step"
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn settings(&self) -> Option<Settings> {
        let mut settings = Settings::new();
        settings.insert("value".to_string(), self.value.clone());
        Some(settings)
    }

    #[allow(clippy::panic)]
    fn work(&mut self, ctx: &mut WorkContext<'_>) -> Result<bool, TaskError> {
        if self.millis > 0 {
            std::thread::sleep(Duration::from_millis(self.millis));
        }
        ctx.info(format!("processed {}", self.name));
        match self.outcome {
            StepOutcome::Ok => {
                let value = ctx.settings().get("value").cloned().unwrap_or(Value::Null);
                ctx.set_result(value);
                Ok(true)
            }
            StepOutcome::ReturnFalse => Ok(false),
            StepOutcome::Raise => Err(TaskError::msg(format!("{} is corrupt", self.name))),
            StepOutcome::Panic => panic!("decoder crashed on {}", self.name),
        }
    }
}

/// Counts hook calls and records what each hook was given.
#[derive(Default)]
struct Calls {
    discovered_with: Mutex<Option<usize>>,
    created: AtomicUsize,
    completion_called: AtomicUsize,
    report_with: Mutex<Option<usize>>,
}

/// Job with two pre-steps, one main unit per pre-result and optional extras.
struct ScanJob {
    calls: Arc<Calls>,
    interaction: Interaction,
    main_outcome: StepOutcome,
    main_millis: u64,
    units: usize,
    completion_step: bool,
}

impl ScanJob {
    fn new(calls: Arc<Calls>) -> Self {
        Self {
            calls,
            interaction: Interaction::Continue(None),
            main_outcome: StepOutcome::Ok,
            main_millis: 0,
            units: 2,
            completion_step: false,
        }
    }
}

#[async_trait]
impl Job for ScanJob {
    fn name(&self) -> &str {
        "scan"
    }

    fn validate_options(&self, options: &Settings) -> Result<(), ValidationError> {
        if options.get("source").and_then(Value::as_str).is_none() {
            return Err(ValidationError::new("a source folder is required"));
        }
        Ok(())
    }

    fn initial_task(&self, builder: &mut TaskBuilder, _options: &Settings) -> Result<(), JobError> {
        builder
            .add_step(Step::ok("list-a", json!("a.tif")))
            .add_step(Step::ok("list-b", json!("b.tif")));
        Ok(())
    }

    async fn get_additional_info(&self, _options: &Settings, _pre: &[TaskResult]) -> Interaction {
        self.interaction.clone()
    }

    fn discover_task_metadata(
        &self,
        pre_results: &[TaskResult],
        _additional: Option<&Value>,
        _options: &Settings,
    ) -> Result<Vec<Settings>, JobError> {
        *self.calls.discovered_with.lock().unwrap() = Some(pre_results.len());
        Ok((0..self.units)
            .map(|i| {
                let mut args = Settings::new();
                args.insert("file".to_string(), json!(format!("unit-{i}")));
                args
            })
            .collect())
    }

    fn create_new_task(
        &self,
        builder: &mut TaskBuilder,
        job_args: &Settings,
    ) -> Result<(), JobError> {
        self.calls.created.fetch_add(1, Ordering::SeqCst);
        let file = job_args["file"].as_str().unwrap_or_default();
        builder.add_step(
            Step::ok(file, json!({ "hashed": file }))
                .slow(self.main_millis)
                .with(self.main_outcome),
        );
        Ok(())
    }

    fn completion_task(
        &self,
        builder: &mut TaskBuilder,
        _results: &[TaskResult],
        _options: &Settings,
    ) -> Result<(), JobError> {
        self.calls.completion_called.fetch_add(1, Ordering::SeqCst);
        if self.completion_step {
            builder.set_post_step(Step::ok("manifest", json!("manifest.txt")));
        }
        Ok(())
    }

    fn generate_report(&self, results: &[TaskResult], _options: &Settings) -> Option<String> {
        *self.calls.report_with.lock().unwrap() = Some(results.len());
        Some(format!("Scanned {} item(s)", results.len()))
    }
}

fn options() -> Settings {
    let mut options = Settings::new();
    options.insert("source".to_string(), json!("/archive/box-12"));
    options
}

fn orchestrator(pool_size: usize) -> Orchestrator {
    init_tracing(&engine_filter("warn"), false);
    Orchestrator::new(
        EngineConfig::default()
            .with_pool_size(pool_size)
            .with_poll_interval_ms(5)
            .with_working_dir(std::env::temp_dir()),
    )
}

#[tokio::test]
async fn test_scenario_a_four_results_reach_report() {
    let calls = Arc::new(Calls::default());
    let job = ScanJob::new(Arc::clone(&calls));
    let progress = Arc::new(RecordingProgress::new());

    let summary = orchestrator(2)
        .run(&job, &options(), progress.clone())
        .await
        .unwrap();

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.result_count(), 4);
    assert_eq!(*calls.discovered_with.lock().unwrap(), Some(2));
    assert_eq!(calls.created.load(Ordering::SeqCst), 2);
    assert_eq!(*calls.report_with.lock().unwrap(), Some(4));
    assert_eq!(summary.report.as_deref(), Some("Scanned 4 item(s)"));

    let main = summary.phase(Phase::Main).unwrap();
    assert_eq!(main.submitted, 2);
    assert_eq!(main.outcome, PhaseOutcome::Succeeded);

    let snap = progress.snapshot();
    assert!(snap.statuses.iter().any(|s| s == "processed unit-0"));
    assert_eq!(snap.statuses.last().unwrap(), "Scanned 4 item(s)");
}

#[tokio::test]
async fn test_completion_step_results_are_included() {
    let calls = Arc::new(Calls::default());
    let mut job = ScanJob::new(Arc::clone(&calls));
    job.completion_step = true;

    let summary = orchestrator(1)
        .run(&job, &options(), Arc::new(RecordingProgress::new()))
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.phase(Phase::Completion).unwrap().results.len(), 1);
    assert_eq!(*calls.report_with.lock().unwrap(), Some(5));
}

#[tokio::test]
async fn test_scenario_b_failed_main_halts_run() {
    let calls = Arc::new(Calls::default());
    let mut job = ScanJob::new(Arc::clone(&calls));
    job.main_outcome = StepOutcome::ReturnFalse;

    let summary = orchestrator(2)
        .run(&job, &options(), Arc::new(RecordingProgress::new()))
        .await
        .unwrap();

    assert_eq!(summary.state, RunState::Failed);
    let failure = summary.failure.as_ref().unwrap();
    assert_eq!(failure.phase, Phase::Main);
    assert_eq!(failure.reason, "2 of 2 task(s) failed");
    assert_eq!(calls.completion_called.load(Ordering::SeqCst), 0);
    assert!(calls.report_with.lock().unwrap().is_none());
    assert!(summary.report.is_none());
    // Pre-results survive the failed phase.
    assert_eq!(summary.phase(Phase::Initial).unwrap().results.len(), 2);
}

#[tokio::test]
async fn test_task_error_surfaces_in_failure_detail() {
    let calls = Arc::new(Calls::default());
    let mut job = ScanJob::new(Arc::clone(&calls));
    job.main_outcome = StepOutcome::Raise;
    job.units = 1;

    let summary = orchestrator(1)
        .run(&job, &options(), Arc::new(RecordingProgress::new()))
        .await
        .unwrap();

    assert!(summary.is_failed());
    assert_eq!(summary.worker_errors().count(), 1);
    let detail = summary.failure.unwrap().detail.unwrap();
    assert!(detail.contains("unit-0 is corrupt"), "detail was: {detail}");
}

#[tokio::test]
async fn test_scenario_c_cancel_in_additional_info() {
    let calls = Arc::new(Calls::default());
    let mut job = ScanJob::new(Arc::clone(&calls));
    job.interaction = Interaction::Cancelled;

    let summary = orchestrator(1)
        .run(&job, &options(), Arc::new(RecordingProgress::new()))
        .await
        .unwrap();

    assert_eq!(summary.state, RunState::Cancelled);
    assert!(summary.failure.is_none());
    assert!(calls.discovered_with.lock().unwrap().is_none());
    assert_eq!(calls.created.load(Ordering::SeqCst), 0);
    assert!(summary.report.is_none());
}

#[tokio::test]
async fn test_additional_info_failure_fails_initial_phase() {
    let calls = Arc::new(Calls::default());
    let mut job = ScanJob::new(Arc::clone(&calls));
    job.interaction = Interaction::Failed("catalogue unreachable".to_string());

    let summary = orchestrator(1)
        .run(&job, &options(), Arc::new(RecordingProgress::new()))
        .await
        .unwrap();

    assert!(summary.is_failed());
    let failure = summary.failure.unwrap();
    assert_eq!(failure.phase, Phase::Initial);
    assert_eq!(failure.summary(), "The initial phase failed: catalogue unreachable");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_user_cancel_during_main_is_cancelled_not_failed() {
    let calls = Arc::new(Calls::default());
    let mut job = ScanJob::new(Arc::clone(&calls));
    job.units = 6;
    job.main_millis = 60;

    let progress = Arc::new(RecordingProgress::new());
    let trigger = Arc::clone(&progress);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(90)).await;
        trigger.request_cancel();
    });

    let summary = orchestrator(1)
        .run(&job, &options(), progress as Arc<dyn ProgressSink>)
        .await
        .unwrap();

    assert_eq!(summary.state, RunState::Cancelled);
    assert!(summary.failure.is_none());
    let main = summary.phase(Phase::Main).unwrap();
    assert_eq!(main.outcome, PhaseOutcome::Cancelled);
    assert!(main.results.len() < 6);
    assert_eq!(calls.completion_called.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_worker_panic_is_returned_as_error() {
    let calls = Arc::new(Calls::default());
    let mut job = ScanJob::new(Arc::clone(&calls));
    job.main_outcome = StepOutcome::Panic;
    job.units = 1;

    let err = orchestrator(1)
        .run(&job, &options(), Arc::new(RecordingProgress::new()))
        .await
        .unwrap_err();

    match err {
        EngineError::Pool(PoolError::WorkerCrashed { task, message, .. }) => {
            assert_eq!(task, "unit-0");
            assert_eq!(message, "decoder crashed on unit-0");
        }
        other => panic!("expected a crashed worker, got {other}"),
    }
    assert_eq!(calls.completion_called.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_panic_while_cancelling_is_still_an_error() {
    let calls = Arc::new(Calls::default());
    let mut job = ScanJob::new(Arc::clone(&calls));
    job.main_outcome = StepOutcome::Panic;
    job.main_millis = 150;

    let progress = Arc::new(RecordingProgress::new());
    let trigger = Arc::clone(&progress);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.request_cancel();
    });

    let err = orchestrator(1)
        .run(&job, &options(), progress as Arc<dyn ProgressSink>)
        .await
        .unwrap_err();

    assert!(
        matches!(err, EngineError::Pool(PoolError::WorkerCrashed { .. })),
        "expected a crashed worker, got {err}"
    );
    assert_eq!(calls.completion_called.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_options_rejected_before_any_task() {
    let calls = Arc::new(Calls::default());
    let job = ScanJob::new(Arc::clone(&calls));
    let progress = Arc::new(RecordingProgress::new());

    let err = orchestrator(1)
        .run(&job, &Settings::new(), progress.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(err.to_string(), "Invalid options: a source folder is required");
    assert!(calls.discovered_with.lock().unwrap().is_none());
    assert!(progress.snapshot().titles.is_empty());
}

#[tokio::test]
async fn test_tasks_run_in_configured_working_dir() -> anyhow::Result<()> {
    struct Touch;

    impl Executable for Touch {
        fn kind(&self) -> &str {
            "touch"
        }

        fn work(&mut self, ctx: &mut WorkContext<'_>) -> Result<bool, TaskError> {
            std::fs::write(ctx.working_dir().join("touched.txt"), "ok")?;
            Ok(true)
        }
    }

    struct TouchJob;

    #[async_trait]
    impl Job for TouchJob {
        fn name(&self) -> &str {
            "touch"
        }

        fn discover_task_metadata(
            &self,
            _pre: &[TaskResult],
            _additional: Option<&Value>,
            _options: &Settings,
        ) -> Result<Vec<Settings>, JobError> {
            Ok(vec![Settings::new()])
        }

        fn create_new_task(
            &self,
            builder: &mut TaskBuilder,
            _args: &Settings,
        ) -> Result<(), JobError> {
            builder.add_step(Touch);
            Ok(())
        }
    }

    let dir = tempfile::TempDir::new()?;
    let orchestrator = Orchestrator::new(
        EngineConfig::default()
            .with_poll_interval_ms(5)
            .with_working_dir(dir.path()),
    );
    let summary = orchestrator
        .run(&TouchJob, &Settings::new(), Arc::new(RecordingProgress::new()))
        .await?;

    assert!(summary.is_success());
    assert!(summary.report.is_none());
    assert_eq!(std::fs::read_to_string(dir.path().join("touched.txt"))?, "ok");
    Ok(())
}

//! Progress and cancellation signals exchanged with the host.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// Receiver of progress updates, and source of the user's cancel request.
///
/// Implementations are shared between the orchestrator and the pool
/// manager, so every method takes `&self`.
pub trait ProgressSink: Send + Sync {
    fn set_total(&self, total: usize);
    fn set_progress(&self, done: usize);
    fn set_status(&self, text: &str);
    fn set_title(&self, title: &str);
    fn cancel_requested(&self) -> bool;

    /// Give the host a chance to repaint.
    fn refresh(&self) {}
}

/// Sink that ignores everything and never cancels.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn set_total(&self, _total: usize) {}
    fn set_progress(&self, _done: usize) {}
    fn set_status(&self, _text: &str) {}
    fn set_title(&self, _title: &str) {}
    fn cancel_requested(&self) -> bool {
        false
    }
}

/// What a [`RecordingProgress`] has seen so far.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub title: String,
    pub titles: Vec<String>,
    pub total: usize,
    pub progress: usize,
    /// Every progress value reported, in order.
    pub history: Vec<usize>,
    pub statuses: Vec<String>,
    pub refreshes: usize,
}

/// In-memory sink that records every update and exposes a cancel switch.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    state: Mutex<ProgressSnapshot>,
    cancel: AtomicBool,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the user pressing "cancel".
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressSnapshot> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProgressSink for RecordingProgress {
    fn set_total(&self, total: usize) {
        self.lock().total = total;
    }

    fn set_progress(&self, done: usize) {
        let mut state = self.lock();
        state.progress = done;
        state.history.push(done);
    }

    fn set_status(&self, text: &str) {
        self.lock().statuses.push(text.to_string());
    }

    fn set_title(&self, title: &str) {
        let mut state = self.lock();
        state.title = title.to_string();
        state.titles.push(title.to_string());
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn refresh(&self) {
        self.lock().refreshes += 1;
    }
}

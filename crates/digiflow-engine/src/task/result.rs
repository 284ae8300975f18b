//! Output record produced by a finished subtask.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Immutable pairing of the producing unit-of-work type with its output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    source: String,
    data: Value,
}

impl TaskResult {
    pub fn new(source: impl Into<String>, data: Value) -> Self {
        Self {
            source: source.into(),
            data,
        }
    }

    /// Kind of the subtask that produced this result.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub const fn data(&self) -> &Value {
        &self.data
    }

    pub fn into_data(self) -> Value {
        self.data
    }
}

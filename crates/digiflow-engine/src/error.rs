//! Top-level engine errors.
//!
//! Only failures the host must handle surface here. Phase failures and
//! user cancellation are ordinary outcomes carried by
//! [`RunSummary`](crate::orchestration::RunSummary).

use crate::job::ValidationError;
use crate::pool::PoolError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid options: {0}")]
    Validation(#[from] ValidationError),

    #[error("Fatal worker pool failure: {0}")]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Config(#[from] digiflow_core::Error),
}

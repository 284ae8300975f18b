//! Shared tracing/logging initialization.
//!
//! Hosts embedding the engine call this once at startup; the engine itself
//! only emits events through the `tracing` macros.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"digiflow_engine=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(default_filter: &str, log_json: bool) -> bool {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .is_ok()
    }
}

/// Build the default filter string for an engine log level, e.g. `"info"`
/// becomes `"digiflow_engine=info,digiflow_core=info"`.
pub fn engine_filter(level: &str) -> String {
    format!("digiflow_engine={level},digiflow_core={level}")
}

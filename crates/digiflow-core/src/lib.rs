//! `digiflow` Core Library
//!
//! Shared functionality for `digiflow` components:
//! - Engine configuration resolution and hierarchy
//! - Tracing subscriber initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::EngineConfig;
pub use error::{Error, Result};

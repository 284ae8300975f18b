//! Configuration resolution for the digiflow engine.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/digiflow/engine.json)
//! 3. Project config (.digiflow/engine.json)
//! 4. Environment variables (highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default number of concurrent workers.
pub const DEFAULT_POOL_SIZE: usize = 1;

/// Default interval between result polls, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Engine tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of jobs allowed to run at once (0 = default).
    pub pool_size: usize,
    /// Upper bound on a single wait for completions before the host loop
    /// gets control back.
    pub poll_interval_ms: u64,
    /// Working directory injected into every built task.
    pub working_dir: Option<PathBuf>,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            working_dir: None,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl EngineConfig {
    /// Pool size with the zero fallback applied.
    pub const fn effective_pool_size(&self) -> usize {
        if self.pool_size == 0 {
            DEFAULT_POOL_SIZE
        } else {
            self.pool_size
        }
    }

    /// Poll interval as a [`Duration`]; never zero.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Resolved working directory, falling back to the process's current one.
    pub fn resolved_working_dir(&self) -> PathBuf {
        self.working_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default())
    }

    /// Set the pool size.
    #[must_use]
    pub const fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<EngineConfig> {
    let mut config = EngineConfig::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_config(&mut config, read_layer(&global_path)?);
    }

    if let Some(dir) = project_dir {
        merge_project_config(&mut config, dir)?;
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".digiflow").join("engine.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/digiflow/engine.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("digiflow").join("engine.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Keys set by one config file. Absent keys leave lower layers untouched.
#[derive(Debug, Default, Deserialize)]
struct ConfigLayer {
    pool_size: Option<usize>,
    poll_interval_ms: Option<u64>,
    working_dir: Option<PathBuf>,
    log_level: Option<String>,
    log_json: Option<bool>,
}

/// Read a single config file on top of the built-in defaults.
pub fn load_config_file(path: &Path) -> Result<EngineConfig> {
    let mut config = EngineConfig::default();
    merge_config(&mut config, read_layer(path)?);
    Ok(config)
}

fn merge_project_config(config: &mut EngineConfig, project_dir: &Path) -> Result<()> {
    let project_path = project_dir.join(".digiflow").join("engine.json");
    if project_path.exists() {
        merge_config(config, read_layer(&project_path)?);
    }
    Ok(())
}

fn read_layer(path: &Path) -> Result<ConfigLayer> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut EngineConfig, layer: ConfigLayer) {
    if let Some(size) = layer.pool_size {
        base.pool_size = size;
    }
    if let Some(ms) = layer.poll_interval_ms {
        base.poll_interval_ms = ms;
    }
    if let Some(dir) = layer.working_dir {
        base.working_dir = Some(dir);
    }
    if let Some(level) = layer.log_level {
        base.log_level = level;
    }
    if let Some(flag) = layer.log_json {
        base.log_json = flag;
    }
}

/// Apply `DIGIFLOW_*` overrides using `lookup` to read variables.
///
/// Unparseable values are ignored.
pub fn apply_env_overrides<F>(config: &mut EngineConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(n) = lookup("DIGIFLOW_POOL_SIZE").and_then(|v| v.parse().ok()) {
        config.pool_size = n;
    }
    if let Some(n) = lookup("DIGIFLOW_POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        config.poll_interval_ms = n;
    }
    if let Some(dir) = lookup("DIGIFLOW_WORKING_DIR") {
        config.working_dir = Some(PathBuf::from(dir));
    }
    if let Some(level) = lookup("DIGIFLOW_LOG_LEVEL") {
        config.log_level = level;
    }
    if let Some(flag) = lookup("DIGIFLOW_LOG_JSON").and_then(|v| parse_bool(&v)) {
        config.log_json = flag;
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

/// Dispatcher configuration. Loaded from a TOML file, from the environment,
/// or left at its defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Label used in logs and report origins.
    pub name: String,
    /// Number of recent access reports kept for inspection. 0 disables the log.
    pub report_log_capacity: usize,
    /// Queue depth past which a backlog warning is logged.
    pub queue_warn_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "keel".to_string(),
            report_log_capacity: 64,
            queue_warn_threshold: 1024,
        }
    }
}

impl EngineConfig {
    /// Load overrides from `KEEL_*` environment variables (and `.env`, if any).
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.log_settings();
        Ok(config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_report_log_capacity(mut self, capacity: usize) -> Self {
        self.report_log_capacity = capacity;
        self
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(name) = lookup("KEEL_NAME").filter(|s| !s.trim().is_empty()) {
            config.name = name.trim().to_string();
        }
        if let Some(raw) = lookup("KEEL_REPORT_LOG_CAPACITY") {
            config.report_log_capacity = parse_count("KEEL_REPORT_LOG_CAPACITY", &raw)?;
        }
        if let Some(raw) = lookup("KEEL_QUEUE_WARN_THRESHOLD") {
            config.queue_warn_threshold = parse_count("KEEL_QUEUE_WARN_THRESHOLD", &raw)?;
        }
        Ok(config)
    }

    fn log_settings(&self) {
        info!(
            name = self.name.as_str(),
            report_log_capacity = self.report_log_capacity,
            queue_warn_threshold = self.queue_warn_threshold,
            "Dispatcher config loaded"
        );
    }
}

fn parse_count(key: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse()
        .with_context(|| format!("{key} must be a non-negative integer, got {raw:?}"))
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: EngineConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config.log_settings();
    Ok(config)
}

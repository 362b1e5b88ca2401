//! # Engine Configuration
//!
//! Layered configuration: optional `zoneforge.toml` file, overridden by
//! `ZONEFORGE_`-prefixed environment variables (`__` as the nesting
//! separator, e.g. `ZONEFORGE_DOWNLOAD__TIMEOUT_SECONDS=120`). Every field
//! has a serde default so a bare environment boots with sane values.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{EngineError, EngineResult};

/// Top-level engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Postgres connection string
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Listen address for the HTTP control surface
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Ceiling for concurrent handler executions
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Scheduler tick cadence; completions also wake the loop
    #[serde(default = "default_tick_interval_seconds")]
    pub tick_interval_seconds: u64,

    /// Whether the periodic zone discovery driver is enabled
    #[serde(default = "default_auto_discovery")]
    pub auto_discovery: bool,

    /// Seconds between `discover` task enqueues
    #[serde(default = "default_discovery_interval_seconds")]
    pub discovery_interval_seconds: u64,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub scanning: ScanningConfig,

    /// Default `limit` for task listings when the caller does not pass one
    #[serde(default = "default_pagination_limit")]
    pub default_pagination_limit: i64,
}

/// Retention window for terminal task rows
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Terminal tasks older than this many days are destroyed
    #[serde(default = "default_retention_tasks_days")]
    pub tasks_days: u32,

    /// How often the cleanup driver runs
    #[serde(default = "default_retention_check_interval_hours")]
    pub check_interval_hours: u64,
}

/// Artifact download tuning
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    /// HTTP client connect/read timeout
    #[serde(default = "default_download_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Coalescing interval for download progress writes
    #[serde(default = "default_progress_update_seconds")]
    pub progress_update_seconds: u64,
}

/// Directory scan tuning
#[derive(Debug, Clone, Deserialize)]
pub struct ScanningConfig {
    /// Allowed file extensions per storage location type
    #[serde(default = "default_supported_extensions")]
    pub supported_extensions: HashMap<String, Vec<String>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            bind_address: default_bind_address(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            tick_interval_seconds: default_tick_interval_seconds(),
            auto_discovery: default_auto_discovery(),
            discovery_interval_seconds: default_discovery_interval_seconds(),
            retention: RetentionConfig::default(),
            download: DownloadConfig::default(),
            scanning: ScanningConfig::default(),
            default_pagination_limit: default_pagination_limit(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            tasks_days: default_retention_tasks_days(),
            check_interval_hours: default_retention_check_interval_hours(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_download_timeout_seconds(),
            progress_update_seconds: default_progress_update_seconds(),
        }
    }
}

impl Default for ScanningConfig {
    fn default() -> Self {
        Self {
            supported_extensions: default_supported_extensions(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `zoneforge.toml` (optional) and the
    /// environment. Environment values win.
    pub fn load() -> EngineResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("zoneforge").required(false))
            .add_source(config::Environment::with_prefix("ZONEFORGE").separator("__"))
            .build()
            .map_err(|e| EngineError::Configuration(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| EngineError::Configuration(e.to_string()))
    }

    /// Allowed extensions for a storage location type, lowercase, no dot
    pub fn allowed_extensions(&self, location_type: &str) -> &[String] {
        self.scanning
            .supported_extensions
            .get(location_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn default_database_url() -> String {
    "postgres://localhost/zoneforge".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1:5100".to_string()
}

fn default_max_concurrent_tasks() -> usize {
    5
}

fn default_tick_interval_seconds() -> u64 {
    2
}

fn default_auto_discovery() -> bool {
    true
}

fn default_discovery_interval_seconds() -> u64 {
    300
}

fn default_retention_tasks_days() -> u32 {
    30
}

fn default_retention_check_interval_hours() -> u64 {
    6
}

fn default_download_timeout_seconds() -> u64 {
    60
}

fn default_progress_update_seconds() -> u64 {
    10
}

fn default_pagination_limit() -> i64 {
    50
}

fn default_supported_extensions() -> HashMap<String, Vec<String>> {
    HashMap::from([
        (
            "iso".to_string(),
            vec!["iso".to_string(), "img".to_string()],
        ),
        (
            "image".to_string(),
            vec![
                "raw".to_string(),
                "qcow2".to_string(),
                "vmdk".to_string(),
                "zvol".to_string(),
            ],
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_tasks, 5);
        assert_eq!(config.tick_interval_seconds, 2);
        assert!(config.auto_discovery);
        assert_eq!(config.discovery_interval_seconds, 300);
        assert_eq!(config.retention.tasks_days, 30);
        assert_eq!(config.download.timeout_seconds, 60);
        assert_eq!(config.download.progress_update_seconds, 10);
        assert_eq!(config.default_pagination_limit, 50);
    }

    #[test]
    fn test_deserialize_partial_toml_fills_defaults() {
        let raw = r#"
            max_concurrent_tasks = 2

            [download]
            timeout_seconds = 120
        "#;
        let config: EngineConfig = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.max_concurrent_tasks, 2);
        assert_eq!(config.download.timeout_seconds, 120);
        // Untouched sections keep their defaults
        assert_eq!(config.download.progress_update_seconds, 10);
        assert_eq!(config.retention.tasks_days, 30);
    }

    #[test]
    fn test_allowed_extensions_lookup() {
        let config = EngineConfig::default();
        assert!(config
            .allowed_extensions("iso")
            .contains(&"iso".to_string()));
        assert!(config.allowed_extensions("unknown-type").is_empty());
    }
}

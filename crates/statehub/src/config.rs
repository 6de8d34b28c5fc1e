//! Configuration management for the statehub runner.
//!
//! Settings are loaded from a TOML file, created with defaults when missing,
//! overridden from the command line and validated before use.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use statehub_core::{
    BatchOptions, CompressionAlgorithm, CompressionConfig, ConflictResolution, DebugConfig, MemoOptions,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

fn default_log_level() -> String { "info".to_string() }
fn default_history_capacity() -> usize {
    statehub_core::bus::DEFAULT_HISTORY_CAPACITY
}
fn default_max_entries() -> usize { 1000 }
fn default_export_dir() -> PathBuf { PathBuf::from("debug-exports") }
fn default_true() -> bool { true }
fn default_max_batch_size() -> usize { 10 }
fn default_flush_interval_ms() -> u64 { 16 }
fn default_ttl_ms() -> u64 { 5 * 60 * 1000 }
fn default_max_cache_size() -> usize { 100 }
fn default_compression_threshold() -> usize { 1024 }
fn default_slice_id() -> String { "board".to_string() }
fn default_columns() -> Vec<String> {
    vec!["todo".to_string(), "doing".to_string(), "done".to_string()]
}
fn default_card_count() -> usize { 12 }
fn default_conflict_resolution() -> ConflictResolution { ConflictResolution::PromptUser }

/// Application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub bus: BusSettings,
    #[serde(default)]
    pub debug: DebugSettings,
    #[serde(default)]
    pub batching: BatchingSettings,
    #[serde(default)]
    pub memoization: MemoizationSettings,
    #[serde(default)]
    pub compression: CompressionSettings,
    #[serde(default)]
    pub session: SessionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Number of trailing events kept in the bus history
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default)]
    pub capture_stack_traces: bool,
    #[serde(default)]
    pub trace_all_events: bool,
    /// Directory receiving `state-debug-<ms>.json` exports
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
    #[serde(default = "default_true")]
    pub export_on_exit: bool,
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_max_entries(),
            capture_stack_traces: false,
            trace_all_events: false,
            export_dir: default_export_dir(),
            export_on_exit: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingSettings {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_true")]
    pub deduplicate: bool,
}

impl Default for BatchingSettings {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            deduplicate: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoizationSettings {
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,
}

impl Default for MemoizationSettings {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            max_cache_size: default_max_cache_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionSettings {
    #[serde(default)]
    pub algorithm: CompressionAlgorithm,
    #[serde(default = "default_compression_threshold")]
    pub threshold: usize,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Json,
            threshold: default_compression_threshold(),
        }
    }
}

/// Shape of the scripted board session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_slice_id")]
    pub slice_id: String,
    #[serde(default = "default_columns")]
    pub columns: Vec<String>,
    #[serde(default = "default_card_count")]
    pub card_count: usize,
    #[serde(default = "default_conflict_resolution")]
    pub conflict_resolution: ConflictResolution,
    #[serde(default = "default_true")]
    pub persist_to_session: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            slice_id: default_slice_id(),
            columns: default_columns(),
            card_count: default_card_count(),
            conflict_resolution: default_conflict_resolution(),
            persist_to_session: true,
        }
    }
}

impl AppConfig {
    /// Loads configuration from `path`, writing a default file first when it
    /// does not exist.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: AppConfig =
                toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                self.logging.level
            );
        }
        if self.bus.history_capacity == 0 {
            bail!("bus.history_capacity must be greater than 0");
        }
        if self.debug.max_entries == 0 {
            bail!("debug.max_entries must be greater than 0");
        }
        if self.batching.max_batch_size == 0 {
            bail!("batching.max_batch_size must be greater than 0");
        }
        if self.batching.flush_interval_ms == 0 {
            bail!("batching.flush_interval_ms must be greater than 0");
        }
        if self.memoization.max_cache_size == 0 {
            bail!("memoization.max_cache_size must be greater than 0");
        }
        if self.session.slice_id.is_empty() {
            bail!("session.slice_id cannot be empty");
        }
        if self.session.columns.len() < 2 {
            bail!("session.columns needs at least two columns");
        }
        if self.session.card_count == 0 {
            bail!("session.card_count must be greater than 0");
        }
        Ok(())
    }

    pub fn debug_config(&self) -> DebugConfig {
        DebugConfig {
            max_entries: self.debug.max_entries,
            capture_stack_traces: self.debug.capture_stack_traces,
            trace_all_events: self.debug.trace_all_events,
        }
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            max_batch_size: self.batching.max_batch_size,
            flush_interval: Duration::from_millis(self.batching.flush_interval_ms),
            deduplicate: self.batching.deduplicate,
        }
    }

    pub fn memo_options(&self) -> MemoOptions {
        MemoOptions::default()
            .ttl(Duration::from_millis(self.memoization.ttl_ms))
            .max_cache_size(self.memoization.max_cache_size)
    }

    pub fn compression_config(&self) -> CompressionConfig {
        CompressionConfig {
            algorithm: self.compression.algorithm,
            threshold: self.compression.threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());

        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json_format);
        assert_eq!(config.bus.history_capacity, 100);
        assert_eq!(config.debug.max_entries, 1000);
        assert_eq!(config.batching.flush_interval_ms, 16);
        assert_eq!(config.session.conflict_resolution, ConflictResolution::PromptUser);
        assert_eq!(config.compression_config().threshold, 1024);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [logging]
            level = "debug"

            [compression]
            algorithm = "diff"

            [session]
            conflict_resolution = "latest-wins"
            card_count = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.compression.algorithm, CompressionAlgorithm::Diff);
        assert_eq!(config.compression.threshold, 1024);
        assert_eq!(config.session.conflict_resolution, ConflictResolution::LatestWins);
        assert_eq!(config.session.columns.len(), 3);
        assert!(config.debug.export_on_exit);

        let config: AppConfig = toml::from_str("[session]\ncard_count = 4").unwrap();
        assert_eq!(config.session.conflict_resolution, ConflictResolution::PromptUser);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.batching.max_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.columns = vec!["only".to_string()];
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_from_nonexistent_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statehub.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.logging.level, "info");
        assert!(path.exists());

        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded.session.slice_id, config.session.slice_id);
        assert_eq!(reloaded.debug.export_dir, config.debug.export_dir);
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_toml() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "logging = [").unwrap();
        assert!(AppConfig::load_from_file(file.path()).await.is_err());
    }
}

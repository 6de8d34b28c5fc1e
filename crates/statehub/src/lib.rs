//! # Statehub - Session Runner
//!
//! Composition root for the statehub core. Parses the command line, loads
//! configuration, initialises logging and runs a scripted board session that
//! exercises slices, synchronisation, middleware and the performance utilities,
//! exporting the debug trace at the end.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration
//! statehub
//!
//! # Specify custom configuration
//! statehub --config demo.toml
//!
//! # Override specific settings
//! statehub --log-level debug --export-dir /tmp/traces
//!
//! # JSON logging, no export
//! statehub --json-logs --no-export
//! ```
//!
//! ## Configuration
//!
//! Configuration is read from a TOML file (default: `statehub.toml`). If the
//! file doesn't exist, a default configuration is written first.

use tracing::info;

pub mod app;
pub mod cli;
pub mod config;
pub mod logging;

use app::Application;
use cli::CliArgs;
use config::AppConfig;

/// Runs the session described by the process arguments.
///
/// Logging is initialised from the configuration file (or its defaults when it
/// cannot be read) before the application validates it properly.
pub async fn init() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let mut config = AppConfig::load_from_file(&args.config_path)
        .await
        .unwrap_or_default();
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    logging::setup_logging(&config.logging, args.json_logs)?;

    let report = Application::new(args).await?.run().await?;
    if !report.slices_converged || !report.copies_converged {
        anyhow::bail!("session finished with diverged state");
    }
    info!("✅ Session complete");
    Ok(())
}

pub use app::{BoardState, Card, SessionReport};
pub use config::{
    BatchingSettings, BusSettings, CompressionSettings, DebugSettings, LoggingSettings, MemoizationSettings,
    SessionSettings,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cli_overrides_reach_the_application() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("statehub.toml");
        let export_dir = dir.path().join("traces");

        let args = CliArgs::try_parse_from([
            "statehub",
            "--config",
            config_path.to_str().unwrap(),
            "--export-dir",
            export_dir.to_str().unwrap(),
        ])
        .unwrap();

        let report = Application::new(args).await.unwrap().run().await.unwrap();
        assert!(config_path.exists());
        assert!(report.export_path.unwrap().starts_with(&export_dir));
    }

    #[tokio::test]
    async fn test_no_export_flag() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("statehub.toml");

        let args = CliArgs::try_parse_from([
            "statehub",
            "--config",
            config_path.to_str().unwrap(),
            "--no-export",
        ])
        .unwrap();

        let report = Application::new(args).await.unwrap().run().await.unwrap();
        assert!(report.export_path.is_none());
        assert!(report.debug_entries > 0);
    }

    #[tokio::test]
    async fn test_invalid_log_level_override_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("statehub.toml");

        let args = CliArgs::try_parse_from([
            "statehub",
            "--config",
            config_path.to_str().unwrap(),
            "--log-level",
            "loud",
        ])
        .unwrap();

        assert!(Application::new(args).await.is_err());
    }
}

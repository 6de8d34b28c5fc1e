//! Logging system setup and configuration.
//!
//! Installs a `tracing-subscriber` registry whose output format and filter
//! come from the `[logging]` section, with `RUST_LOG` and `--json-logs`
//! taking precedence.

use crate::config::LoggingSettings;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact single-line records for terminals
    Pretty,
    /// One flattened JSON object per record
    Json,
}

impl LogFormat {
    pub fn resolve(config: &LoggingSettings, force_json: bool) -> Self {
        if force_json || config.json_format {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

/// Filter directives for a configured level.
///
/// At `debug` the bus logs every delivery, so its module stays at `info`
/// unless `trace` is requested.
fn filter_directives(level: &str) -> String {
    match level {
        "debug" => "debug,statehub_core::bus=info".to_string(),
        other => other.to_string(),
    }
}

/// Installs the global subscriber.
///
/// # Arguments
///
/// * `config` - `[logging]` section of the configuration file
/// * `force_json` - `--json-logs` from the command line
///
/// # Returns
///
/// An error when the level is not a valid filter or a global subscriber is
/// already installed.
pub fn setup_logging(config: &LoggingSettings, force_json: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter_directives(&config.level))?,
    };
    let format = LogFormat::resolve(config, force_json);
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().flatten_event(true).with_current_span(false))
            .try_init()?,
        LogFormat::Pretty => registry
            .with(fmt::layer().compact().with_target(false))
            .try_init()?,
    }

    info!(level = %config.level, ?format, "🔧 Logging initialized");
    Ok(())
}

/// Logs the name, version and components of the runner.
pub fn display_banner() {
    info!("🧩 statehub v{}", env!("CARGO_PKG_VERSION"));
    info!("   event bus | middleware | slices | sync | perf | debug trace");
}

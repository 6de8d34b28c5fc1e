//! Command-line interface handling for the statehub runner.

use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

/// Command line arguments overriding the configuration file.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Optional override for the debug export directory
    pub export_dir: Option<PathBuf>,
    /// Skip writing the debug export
    pub no_export: bool,
}

impl CliArgs {
    fn command() -> Command {
        Command::new("statehub")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Runs a scripted board session through the statehub core and exports its debug trace")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("statehub.toml"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(clap::ArgAction::SetTrue),
            )
            .arg(
                Arg::new("export-dir")
                    .short('o')
                    .long("export-dir")
                    .value_name("DIR")
                    .help("Directory for the debug trace export"),
            )
            .arg(
                Arg::new("no-export")
                    .long("no-export")
                    .help("Do not write a debug trace export")
                    .action(clap::ArgAction::SetTrue),
            )
    }

    /// Parses the process arguments.
    pub fn parse() -> Self {
        Self::from_matches(&Self::command().get_matches())
    }

    /// Parses an explicit argument list, including the binary name.
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::from_matches(&Self::command().try_get_matches_from(args)?))
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("statehub.toml")),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            export_dir: matches.get_one::<String>("export-dir").map(PathBuf::from),
            no_export: matches.get_flag("no-export"),
        }
    }
}

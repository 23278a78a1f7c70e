//! Logging setup for the `cohort` binary.
//!
//! The configuration file supplies the default level and format. `--verbose`
//! and `RUST_LOG` override the level, `--log-format` (or `COHORT_LOG_FORMAT`)
//! overrides the format.

use cohort_core::config::GeneralConfig;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const COHORT_CRATES: [&str; 5] = [
    "cohort_core",
    "cohort_repository",
    "cohort_federation",
    "cohort_cli",
    "cohort",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Resolved filter directives and output format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub filter: String,
    pub format: LogFormat,
}

/// Directives that set every cohort crate to `level` and everything else to warn
fn directives(level: &str) -> String {
    let mut parts: Vec<String> = COHORT_CRATES
        .iter()
        .map(|krate| format!("{}={}", krate, level))
        .collect();
    parts.push("warn".to_string());
    parts.join(",")
}

/// Resolve logging settings from the command line, `RUST_LOG` and the config
pub fn resolve(
    general: &GeneralConfig,
    verbose: bool,
    format_override: Option<LogFormat>,
    rust_log: Option<String>,
) -> LogSettings {
    let filter = if verbose {
        directives("debug")
    } else {
        match rust_log.filter(|value| !value.trim().is_empty()) {
            Some(value) => value,
            None => directives(&general.log_level),
        }
    };

    let format = format_override
        .or_else(|| LogFormat::parse(&general.log_format))
        .unwrap_or(LogFormat::Pretty);

    LogSettings { filter, format }
}

/// Install the global subscriber, writing to stderr
pub fn init(settings: &LogSettings) {
    let filter = EnvFilter::try_new(&settings.filter).unwrap_or_else(|_| EnvFilter::new(directives("info")));
    let registry = tracing_subscriber::registry().with(filter);

    match settings.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

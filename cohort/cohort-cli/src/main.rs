//! Cohort CLI - run and inspect a federation of metadata repositories.
//!
//! # Usage
//!
//! ```bash
//! # Write a default configuration to ~/.cohort/config.toml
//! cohort config init
//!
//! # Check a file of type definitions for conflicts
//! cohort typedefs check types.json
//!
//! # Run a five-member cohort in process with one member cut off
//! cohort simulate --members 5 --unreachable 1
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use cohort_cli::logging::{self, LogFormat};
use cohort_cli::simulation::{self, SimulationOptions};
use cohort_cli::{OutputFormat, commands, output};
use cohort_core::config::CohortConfig;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "cohort")]
#[command(about = "Cohort - federation of metadata repositories", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "COHORT_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "human")]
    format: OutputFormatArg,

    /// Log format on stderr; defaults to the configured `log_format`
    #[arg(long, global = true, env = "COHORT_LOG_FORMAT")]
    log_format: Option<LogFormatArg>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormatArg {
    Human,
    Json,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Human => OutputFormat::Human,
            OutputFormatArg::Json => OutputFormat::Json,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Type definition files
    #[command(subcommand)]
    Typedefs(TypedefCommands),

    /// Run an in-process cohort and query it
    Simulate {
        /// Number of members
        #[arg(short, long, default_value = "3")]
        members: usize,

        /// Entities created by each member
        #[arg(short, long, default_value = "5")]
        entities: usize,

        /// Members cut off before the query
        #[arg(short, long, default_value = "0")]
        unreachable: usize,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Load and validate a configuration file
    Validate,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum TypedefCommands {
    /// Load a JSON array of type definitions and report conflicts
    Check {
        /// Path to the JSON file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        output::error(format!("{:#}", e));
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    // A broken config file is reported by the command itself
    let logging_config = CohortConfig::load_or_default(config_path)
        .await
        .unwrap_or_default();
    logging::init(&logging::resolve(
        &logging_config.general,
        cli.verbose,
        cli.log_format.map(LogFormat::from),
        std::env::var("RUST_LOG").ok(),
    ));

    let format = OutputFormat::from(cli.format);

    match cli.command {
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Show => commands::config_show(config_path, format).await?,
            ConfigCommands::Validate => commands::config_validate(config_path, format).await?,
            ConfigCommands::Init { force } => commands::config_init(config_path, force, format).await?,
        },

        Commands::Typedefs(cmd) => match cmd {
            TypedefCommands::Check { file } => commands::typedefs_check(&file, format).await?,
        },

        Commands::Simulate {
            members,
            entities,
            unreachable,
        } => {
            let config = CohortConfig::load_or_default(config_path).await?;
            let options = SimulationOptions {
                members,
                entities,
                unreachable,
            };
            simulation::simulate(&config, &options, format).await?;
        }
    }

    Ok(())
}

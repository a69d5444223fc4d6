//! Tessera CLI - Command-line interface
//!
//! Fetches images through the tessera pipeline and runs synthetic load tests
//! against it.

mod commands;
mod error;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tessera::config::PipelineConfig;
use tessera::logging::{init_logging, DEFAULT_LOG_DIR, DEFAULT_LOG_FILE};

use crate::error::CliError;

#[derive(Parser)]
#[command(name = "tessera", version)]
#[command(about = "Load, process and cache images through the tessera pipeline", long_about = None)]
struct Cli {
    /// Pipeline configuration file (INI)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for the log file
    #[arg(long, global = true, default_value = DEFAULT_LOG_DIR)]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch images over HTTP, optionally processing and saving them
    Fetch(commands::fetch::FetchArgs),
    /// Run many overlapping requests against an in-memory loader
    Bench(commands::bench::BenchArgs),
}

fn main() {
    let cli = Cli::parse();

    let _logging = match init_logging(&cli.log_dir, DEFAULT_LOG_FILE) {
        Ok(guard) => guard,
        Err(e) => CliError::LoggingInit(e.to_string()).exit(),
    };

    if let Err(e) = run(cli) {
        e.exit();
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(cli.config.as_deref())?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;

    match cli.command {
        Command::Fetch(args) => runtime.block_on(commands::fetch::run(args, config)),
        Command::Bench(args) => runtime.block_on(commands::bench::run(args, config)),
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig, CliError> {
    match path {
        Some(path) => Ok(PipelineConfig::from_ini_file(path)?),
        None => Ok(PipelineConfig::default()),
    }
}

mod commands;

use std::io;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use commands::Commands;

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LoggingMode {
    #[default]
    Human,
    Json,
}

impl From<LoggingMode> for logutil::LogFormat {
    fn from(mode: LoggingMode) -> Self {
        match mode {
            LoggingMode::Human => logutil::LogFormat::HumanReadable,
            LoggingMode::Json => logutil::LogFormat::Json,
        }
    }
}

#[derive(Debug, Parser)]
#[clap(name = "shardctl")]
#[clap(version)]
#[clap(about = "Operate on a set of database shards", long_about = None)]
struct Cli {
    /// Log verbosity.
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log output format.
    #[clap(long, value_enum, default_value_t, global = true)]
    log_mode: LoggingMode,

    #[clap(subcommand)]
    command: Commands,
}

fn verbosity_level(verbose: u8) -> tracing::Level {
    match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logutil::configure_global_logger(
        verbosity_level(cli.verbose),
        cli.log_mode.into(),
        io::stderr,
    );
    cli.command.run()
}

//! enrich CLI
//!
//! Adds phone and email columns to a professional roster by querying the
//! bar directory API with a bearer token captured from headless Chrome.
//! Resumable: rows are flushed as they are written and progress is checkpointed.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roster_enrich::config::Config;
use roster_enrich::enrich::{run_enrich, RunArgs};
use roster_enrich::token::{run_token, TokenArgs};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "enrich")]
#[command(author = "RoyalBit Inc.")]
#[command(version)]
#[command(about = "Enrich a roster with contact details from a directory API")]
#[command(long_about = "Looks up every roster entry in the directory API and appends phone, email, status and notes columns.\n\nCommands:\n  run      Enrich the input roster (resumable)\n  token    Capture a bearer token and show its expiry")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (YAML, default: enrich.yaml if present)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Enrich the input roster, resuming from a checkpoint if present
    Run(RunArgs),
    /// Capture one bearer token through the browser and report its expiry
    Token(TokenArgs),
}

fn setup_logging(verbose: u8, log_file: Option<&Path>) -> Result<()> {
    let default = match verbose {
        0 => "roster_enrich=info",
        1 => "roster_enrich=debug",
        _ => "roster_enrich=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let file = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to install log subscriber")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    setup_logging(cli.verbose, config.files.log_file.as_deref())?;

    match cli.command {
        Commands::Run(args) => run_enrich(args, config).await,
        Commands::Token(args) => run_token(args, config).await,
    }
}

//! run command: Enrich the roster with directory contact data
//!
//! Progress goes to the log; the final summary is printed as compact JSON.

use crate::browser::BrowserTokenSource;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::Config;
use crate::pipeline::Pipeline;
use crate::retry::TokioSleeper;
use anyhow::Result;
use clap::Args;
use std::io::{self, BufRead, IsTerminal, Write};
use tracing::{info, warn};

/// Records processed by `--test` when no `--limit` is given
pub const DEFAULT_TEST_LIMIT: u64 = 5;

#[derive(Args)]
pub struct RunArgs {
    /// Bounded test run: only look up the first N records (see --limit)
    #[arg(short, long)]
    pub test: bool,

    /// Number of records for a test run (implies --test)
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    pub limit: Option<u64>,

    /// Resume from an existing checkpoint without asking
    #[arg(short, long, conflicts_with = "fresh")]
    pub yes: bool,

    /// Ignore any checkpoint and recreate the output
    #[arg(long)]
    pub fresh: bool,
}

impl RunArgs {
    /// Lookup cap for this invocation, if any.
    pub fn limit(&self) -> Option<u64> {
        match (self.test, self.limit) {
            (_, Some(n)) => Some(n),
            (true, None) => Some(DEFAULT_TEST_LIMIT),
            (false, None) => None,
        }
    }
}

pub async fn run_enrich(args: RunArgs, config: Config) -> Result<()> {
    if let Some(limit) = args.limit() {
        info!(limit, "Test mode: only {} records will be looked up", limit);
    }

    let store = CheckpointStore::new(&config.files.checkpoint);
    let resume = choose_resume(&store, &args)?;

    let source = BrowserTokenSource::new(config.token.clone(), config.api.base_url.clone());
    let mut pipeline = Pipeline::new(config, source, TokioSleeper)?;
    let summary = pipeline.run(resume, args.limit()).await?;

    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

/// Decide whether to continue from the stored checkpoint.
fn choose_resume(store: &CheckpointStore, args: &RunArgs) -> Result<Option<Checkpoint>> {
    if args.fresh {
        info!("Starting fresh (checkpoint ignored)");
        return Ok(None);
    }

    let checkpoint = match store.load() {
        Ok(Some(c)) => c,
        Ok(None) => return Ok(None),
        Err(e) => {
            warn!(error = %e, "Unreadable checkpoint, starting fresh");
            return Ok(None);
        }
    };

    let stdin = io::stdin();
    let resume = if args.yes || !stdin.is_terminal() {
        true
    } else {
        eprint!("Resume from row {}? (Y/n): ", checkpoint.last_processed_index);
        io::stderr().flush()?;
        let mut answer = String::new();
        stdin.lock().read_line(&mut answer)?;
        accepts(&answer)
    };

    if resume {
        info!(index = checkpoint.last_processed_index, "Resuming from checkpoint");
        Ok(Some(checkpoint))
    } else {
        info!("Starting fresh (checkpoint ignored)");
        Ok(None)
    }
}

fn accepts(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "" | "y" | "yes")
}

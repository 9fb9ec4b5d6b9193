//! Resumable, sequential enrichment loop
//!
//! One record at a time: look up, classify, append one durable output row,
//! update statistics, checkpoint periodically, pace. Only a missing first
//! token or an unopenable/unwritable file stops the run.

use crate::checkpoint::{Checkpoint, CheckpointStore, RunStatistics};
use crate::config::Config;
use crate::credential::{CredentialManager, TokenSource};
use crate::directory::{DirectoryClient, Lookup};
use crate::error::{EnrichError, Result};
use crate::extract::NOTE_INVALID_RESPONSE;
use crate::retry::{RetryPolicy, Sleeper};
use crate::roster::{existing_statuses, output_header, OutputTable, Roster};
use crate::schema::{LookupResult, LookupStatus};
use chrono::{DateTime, Local, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

/// Final report of one invocation
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    #[serde(flatten)]
    pub stats: RunStatistics,
    /// Records looked up during this invocation
    pub processed_this_run: u64,
    /// Rows found in the output past the last checkpoint and counted without a lookup
    pub reconciled: u64,
    /// Rows skipped for missing name fields
    pub skipped: u64,
    pub limit_reached: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub output: PathBuf,
}

impl RunSummary {
    pub fn log(&self) {
        info!("Enrichment complete");
        info!("Total processed: {}", self.stats.total_processed);
        info!("Found: {}", self.stats.found);
        info!("Not found: {}", self.stats.not_found);
        info!("Multiple matches: {}", self.stats.multiple_matches);
        info!("Errors: {}", self.stats.errors);
        info!("Started at: {}", self.started_at.to_rfc3339());
        info!("Ended at: {}", self.ended_at.to_rfc3339());
        info!("Output file: {}", self.output.display());
    }
}

pub struct Pipeline<S, Z> {
    config: Config,
    credentials: CredentialManager<S>,
    client: DirectoryClient,
    policy: RetryPolicy,
    sleeper: Z,
    store: CheckpointStore,
}

impl<S: TokenSource, Z: Sleeper> Pipeline<S, Z> {
    pub fn new(config: Config, source: S, sleeper: Z) -> Result<Self> {
        let client = DirectoryClient::new(&config.api, config.request_timeout())?;
        let credentials = CredentialManager::new(source, config.acquire_timeout());
        let policy = RetryPolicy::from(&config.retry);
        let store = CheckpointStore::new(&config.files.checkpoint);
        Ok(Self {
            config,
            credentials,
            client,
            policy,
            sleeper,
            store,
        })
    }

    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn credentials(&self) -> &CredentialManager<S> {
        &self.credentials
    }

    /// Process the roster. `resume` continues after its `last_processed_index`
    /// and appends to the existing output; `limit` caps lookups in this call.
    pub async fn run(&mut self, resume: Option<Checkpoint>, limit: Option<u64>) -> Result<RunSummary> {
        let mut stats = resume.as_ref().map(Checkpoint::statistics).unwrap_or_default();
        let started_at = resume.as_ref().map(|c| c.started_at).unwrap_or_else(Utc::now);
        let resume_index = resume.as_ref().map(|c| c.last_processed_index);

        info!("Obtaining initial token");
        self.credentials
            .ensure_valid(self.config.token.refresh_margin_secs)
            .await
            .map_err(EnrichError::CredentialUnavailable)?;

        let files = self.config.files.clone();
        let table = self.config.table.clone();
        let roster = Roster::open(&files.input, &table, &self.config.columns)?;

        let mut pending: VecDeque<LookupStatus> = VecDeque::new();
        let mut output = match &resume {
            Some(checkpoint) if files.output.exists() => {
                let on_disk = existing_statuses(&files.output, &table)?;
                let expected = checkpoint.total_processed as usize;
                if on_disk.len() > expected {
                    warn!(
                        rows = on_disk.len() - expected,
                        "Output has rows past the checkpoint, counting them without lookup"
                    );
                    pending.extend(on_disk[expected..].iter().copied());
                } else if on_disk.len() < expected {
                    warn!(
                        on_disk = on_disk.len(),
                        expected, "Output has fewer rows than the checkpoint records"
                    );
                }
                OutputTable::append(&files.output, &table)?
            }
            Some(_) => {
                warn!(path = %files.output.display(), "Checkpoint present but output missing, recreating it");
                OutputTable::create(&files.output, &table, &output_header(roster.headers()))?
            }
            None => {
                let output =
                    OutputTable::create(&files.output, &table, &output_header(roster.headers()))?;
                // A new output invalidates any earlier resume point
                self.store.remove()?;
                output
            }
        };

        info!("Starting enrichment");
        let mut processed_this_run = 0u64;
        let mut reconciled = 0u64;
        let mut skipped = 0u64;
        let mut limit_reached = false;
        let mut last_point: Option<(usize, String)> = None;
        let mut unsaved = false;
        let mut failure: Option<EnrichError> = None;

        for item in roster.records() {
            let record = match item {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "Error reading input, stopping");
                    failure = Some(e);
                    break;
                }
            };

            if resume_index.is_some_and(|last| record.index as i64 <= last) {
                continue;
            }

            if limit.is_some_and(|l| processed_this_run >= l) {
                info!(limit = limit.unwrap_or_default(), "Test mode: limit reached");
                limit_reached = true;
                break;
            }

            let missing = record.missing_fields(&self.config.columns);
            if !missing.is_empty() {
                let skip = EnrichError::InputMalformed {
                    row: record.index,
                    reason: format!("missing {}", missing.join(", ")),
                };
                warn!(id = %record.id, "Skipping: {}", skip);
                skipped += 1;
                continue;
            }

            if let Some(status) = pending.pop_front() {
                stats.record(status);
                reconciled += 1;
                last_point = Some((record.index, record.id.clone()));
                unsaved = true;
                continue;
            }

            let name = record.display_name();
            info!(row = record.index, id = %record.id, "[{}] Searching: {}", stats.total_processed + 1, name);
            let result = Lookup {
                client: &self.client,
                credentials: &mut self.credentials,
                policy: &self.policy,
                sleeper: &self.sleeper,
                refresh_margin_secs: self.config.token.refresh_margin_secs,
            }
            .run(&name)
            .await;

            processed_this_run += 1;
            log_result(&record.id, &result);

            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
            let mut row = record.fields.clone();
            row.extend(result.cells(&timestamp));
            if let Err(e) = output.write_row(&row) {
                error!(row = record.index, id = %record.id, error = %e, "Output write failed, stopping");
                failure = Some(e);
                break;
            }
            stats.record(result.status);
            last_point = Some((record.index, record.id.clone()));
            unsaved = true;

            if stats.total_processed % self.config.progress.log_interval == 0 {
                stats.log_progress();
            }

            if stats.total_processed % self.config.progress.checkpoint_interval == 0 {
                self.save_checkpoint(record.index, &record.id, &stats, started_at);
                unsaved = false;
            }

            self.sleeper.sleep(self.pacing_delay()).await;
        }

        if unsaved {
            if let Some((index, id)) = &last_point {
                self.save_checkpoint(*index, id, &stats, started_at);
            }
        }
        output.close();

        let summary = RunSummary {
            stats,
            processed_this_run,
            reconciled,
            skipped,
            limit_reached,
            started_at,
            ended_at: Utc::now(),
            output: files.output,
        };
        summary.log();

        match failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn save_checkpoint(&self, index: usize, id: &str, stats: &RunStatistics, started_at: DateTime<Utc>) {
        let checkpoint = Checkpoint::new(index, id, stats, started_at);
        match self.store.save(&checkpoint) {
            Ok(()) => info!(row = index, "Checkpoint saved"),
            Err(e) => error!(row = index, error = %e, "Checkpoint save failed, continuing"),
        }
    }

    fn pacing_delay(&self) -> Duration {
        let pacing = &self.config.pacing;
        let secs = if pacing.delay_max_secs > pacing.delay_min_secs {
            rand::thread_rng().gen_range(pacing.delay_min_secs..=pacing.delay_max_secs)
        } else {
            pacing.delay_min_secs
        };
        Duration::from_secs_f64(secs)
    }
}

fn log_result(id: &str, result: &LookupResult) {
    match result.status {
        LookupStatus::Found => info!(
            id,
            "Found - phone: {}, email: {}",
            result.phone_numbers.join("; "),
            result.emails.join("; ")
        ),
        LookupStatus::NotFound if result.notes == NOTE_INVALID_RESPONSE => {
            let err = EnrichError::MalformedResponse(result.notes.clone());
            warn!(id, "Not found: {}", err)
        }
        LookupStatus::NotFound => info!(id, "Not found"),
        LookupStatus::MultipleMatches => info!(id, "Multiple matches: {}", result.notes),
        LookupStatus::Error => error!(id, "Error: {}", result.notes),
    }
}

//! Run statistics and checkpoint persistence
//!
//! The checkpoint is a single JSON object overwritten on every save
//! (write to a temp file, then rename). No history is kept.

use crate::error::{EnrichError, Result};
use crate::schema::LookupStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Counters for one logical run (carried across resumes)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStatistics {
    pub total_processed: u64,
    pub found: u64,
    pub not_found: u64,
    pub multiple_matches: u64,
    pub errors: u64,
}

impl RunStatistics {
    pub fn record(&mut self, status: LookupStatus) {
        self.total_processed += 1;
        match status {
            LookupStatus::Found => self.found += 1,
            LookupStatus::NotFound => self.not_found += 1,
            LookupStatus::MultipleMatches => self.multiple_matches += 1,
            LookupStatus::Error => self.errors += 1,
        }
    }

    /// Share of processed records, in percent.
    pub fn percent(&self, count: u64) -> f64 {
        if self.total_processed == 0 {
            0.0
        } else {
            count as f64 * 100.0 / self.total_processed as f64
        }
    }

    pub fn log_progress(&self) {
        info!(
            processed = self.total_processed,
            found = self.found,
            not_found = self.not_found,
            multiple = self.multiple_matches,
            errors = self.errors,
            "Progress: {} processed | found {:.1}% | not found {:.1}% | multiple {:.1}% | errors {:.1}%",
            self.total_processed,
            self.percent(self.found),
            self.percent(self.not_found),
            self.percent(self.multiple_matches),
            self.percent(self.errors),
        );
    }
}

/// On-disk resume point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_processed_index: i64,
    pub last_processed_id: String,
    pub total_processed: u64,
    /// Records classified FOUND
    pub successful: u64,
    pub not_found: u64,
    #[serde(default)]
    pub multiple_matches: u64,
    pub errors: u64,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        index: usize,
        id: &str,
        stats: &RunStatistics,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            last_processed_index: index as i64,
            last_processed_id: id.to_string(),
            total_processed: stats.total_processed,
            successful: stats.found,
            not_found: stats.not_found,
            multiple_matches: stats.multiple_matches,
            errors: stats.errors,
            started_at,
            last_updated: Utc::now(),
        }
    }

    pub fn statistics(&self) -> RunStatistics {
        RunStatistics {
            total_processed: self.total_processed,
            found: self.successful,
            not_found: self.not_found,
            multiple_matches: self.multiple_matches,
            errors: self.errors,
        }
    }
}

/// Loads and atomically saves the checkpoint file
pub struct CheckpointStore {
    path: PathBuf,
    temp_path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: &Path) -> Self {
        let mut temp = path.as_os_str().to_owned();
        temp.push(".tmp");
        Self {
            path: path.to_path_buf(),
            temp_path: PathBuf::from(temp),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no checkpoint exists.
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let file = File::open(&self.path)
            .map_err(|e| EnrichError::io(format!("opening {}", self.path.display()), e))?;
        let checkpoint: Checkpoint = serde_json::from_reader(BufReader::new(file))?;
        info!(
            processed = checkpoint.total_processed,
            last_index = checkpoint.last_processed_index,
            "Checkpoint found"
        );
        Ok(Some(checkpoint))
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let persist = |e: std::io::Error| {
            EnrichError::persistence(format!("saving {}", self.path.display()), e)
        };

        let file = File::create(&self.temp_path).map_err(persist)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, checkpoint)?;
        writer.flush().map_err(persist)?;
        writer.get_ref().sync_all().map_err(persist)?;
        drop(writer);

        fs::rename(&self.temp_path, &self.path).map_err(persist)?;
        debug!(index = checkpoint.last_processed_index, "Checkpoint saved");
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| {
                EnrichError::persistence(format!("removing {}", self.path.display()), e)
            })?;
        }
        Ok(())
    }
}

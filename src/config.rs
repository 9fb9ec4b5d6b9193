//! Run configuration
//!
//! Every tunable has a default matching the Paris bar directory deployment,
//! so an absent or partial `enrich.yaml` is valid.

use crate::error::{EnrichError, Result};
use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file looked up when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "enrich.yaml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub token: TokenConfig,
    pub retry: RetryConfig,
    pub pacing: PacingConfig,
    pub progress: ProgressConfig,
    pub files: FilesConfig,
    pub table: TableConfig,
    pub columns: ColumnsConfig,
}

/// Remote directory search endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub search_path: String,
    /// Sent as `Origin` and `Referer`
    pub origin: String,
    pub request_timeout_secs: u64,
    /// `result` query parameter
    pub page_size: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://apiresteannuairemiddleware.avocatparis.org".to_string(),
            search_path: "/api/GetCombinedAvocatStructureFluxDatas".to_string(),
            origin: "https://www.avocatparis.org".to_string(),
            request_timeout_secs: 30,
            page_size: 30,
        }
    }
}

/// Browser-side token capture
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Public page whose own API calls carry the bearer token
    pub page_url: String,
    pub headless: bool,
    pub navigation_timeout_ms: u64,
    /// How long to keep listening for API requests after navigation
    pub capture_window_ms: u64,
    /// Upper bound on one whole acquisition (launch + navigate + capture)
    pub acquire_timeout_secs: u64,
    pub refresh_margin_secs: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            page_url: "https://www.avocatparis.org/annuaire".to_string(),
            headless: true,
            navigation_timeout_ms: 30_000,
            capture_window_ms: 5_000,
            acquire_timeout_secs: 60,
            refresh_margin_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per record
    pub max_retries: u32,
    pub backoff_factor: f64,
    /// Multiplier applied to the exponential term on HTTP 429
    pub rate_limit_base_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: 2.0,
            rate_limit_base_secs: 5.0,
        }
    }
}

/// Randomized delay between records
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub delay_min_secs: f64,
    pub delay_max_secs: f64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            delay_min_secs: 0.5,
            delay_max_secs: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub log_interval: u64,
    pub checkpoint_interval: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            log_interval: 10,
            checkpoint_interval: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub checkpoint: PathBuf,
    pub log_file: Option<PathBuf>,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("avocats.csv"),
            output: PathBuf::from("avocats_enriched.csv"),
            checkpoint: PathBuf::from("checkpoint.json"),
            log_file: Some(PathBuf::from("scraper.log")),
        }
    }
}

/// Delimited text format shared by input and output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    pub delimiter: String,
    /// WHATWG encoding label, e.g. `ISO-8859-1`, `windows-1252`, `utf-8`
    pub encoding: String,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            delimiter: ";".to_string(),
            encoding: "ISO-8859-1".to_string(),
        }
    }
}

impl TableConfig {
    pub fn delimiter_byte(&self) -> Result<u8> {
        match self.delimiter.as_bytes() {
            [b] => Ok(*b),
            _ => Err(EnrichError::Config(format!(
                "delimiter must be a single byte, got {:?}",
                self.delimiter
            ))),
        }
    }

    pub fn encoding(&self) -> Result<&'static Encoding> {
        Encoding::for_label(self.encoding.as_bytes()).ok_or_else(|| {
            EnrichError::Config(format!("unknown encoding label {:?}", self.encoding))
        })
    }
}

/// Input columns the pipeline reads; all columns are passed through
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnsConfig {
    pub id: String,
    pub family_name: String,
    pub given_name: String,
}

impl Default for ColumnsConfig {
    fn default() -> Self {
        Self {
            id: "ID_AVO".to_string(),
            family_name: "NOM".to_string(),
            given_name: "PRENOM1".to_string(),
        }
    }
}

impl Config {
    /// Load from `path`, or from [`DEFAULT_CONFIG_FILE`] when present, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EnrichError::io(format!("reading config {}", path.display()), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| EnrichError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<()> {
        self.table.delimiter_byte()?;
        self.table.encoding()?;
        url::Url::parse(&self.api.base_url)
            .map_err(|e| EnrichError::Config(format!("api.base_url: {}", e)))?;

        if self.retry.max_retries == 0 {
            return Err(EnrichError::Config("retry.max_retries must be >= 1".into()));
        }
        if self.retry.backoff_factor < 0.0 || self.retry.rate_limit_base_secs < 0.0 {
            return Err(EnrichError::Config("retry waits must be non-negative".into()));
        }
        if self.progress.log_interval == 0 || self.progress.checkpoint_interval == 0 {
            return Err(EnrichError::Config("progress intervals must be >= 1".into()));
        }
        let p = &self.pacing;
        if p.delay_min_secs < 0.0 || p.delay_min_secs > p.delay_max_secs {
            return Err(EnrichError::Config(format!(
                "pacing: need 0 <= delay_min_secs ({}) <= delay_max_secs ({})",
                p.delay_min_secs, p.delay_max_secs
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.token.acquire_timeout_secs)
    }
}

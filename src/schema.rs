//! Lookup outcomes and output table layout

use serde::{Deserialize, Serialize};

/// Columns appended after the pass-through columns, in order
pub const ENRICHMENT_COLUMNS: [&str; 6] = [
    "TELEPHONE",
    "EMAIL",
    "SCRAPE_STATUS",
    "SCRAPE_DATE",
    "API_IDENTIFIANT",
    "SCRAPE_NOTES",
];

/// Header of the status column, used when reconciling a resumed output
pub const STATUS_COLUMN: &str = "SCRAPE_STATUS";

/// Separator for multi-valued contact fields
pub const VALUE_SEPARATOR: &str = "; ";

/// Classification of one record's lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LookupStatus {
    /// Exactly one exact match
    Found,
    /// No exact match, or the payload had no usable match list
    NotFound,
    /// Several exact matches; the first one was kept
    MultipleMatches,
    /// Lookup could not be completed
    Error,
}

impl std::fmt::Display for LookupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupStatus::Found => write!(f, "FOUND"),
            LookupStatus::NotFound => write!(f, "NOT_FOUND"),
            LookupStatus::MultipleMatches => write!(f, "MULTIPLE_MATCHES"),
            LookupStatus::Error => write!(f, "ERROR"),
        }
    }
}

impl std::str::FromStr for LookupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "FOUND" => Ok(LookupStatus::Found),
            "NOT_FOUND" => Ok(LookupStatus::NotFound),
            "MULTIPLE_MATCHES" => Ok(LookupStatus::MultipleMatches),
            "ERROR" => Ok(LookupStatus::Error),
            other => Err(format!("unknown status {:?}", other)),
        }
    }
}

/// Contact data derived from one search payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResult {
    pub status: LookupStatus,
    pub phone_numbers: Vec<String>,
    pub emails: Vec<String>,
    pub remote_identifier: String,
    pub notes: String,
}

impl LookupResult {
    pub fn not_found(notes: impl Into<String>) -> Self {
        Self::empty(LookupStatus::NotFound, notes)
    }

    pub fn error(notes: impl Into<String>) -> Self {
        Self::empty(LookupStatus::Error, notes)
    }

    fn empty(status: LookupStatus, notes: impl Into<String>) -> Self {
        Self {
            status,
            phone_numbers: Vec::new(),
            emails: Vec::new(),
            remote_identifier: String::new(),
            notes: notes.into(),
        }
    }

    /// The six enrichment cells, in [`ENRICHMENT_COLUMNS`] order.
    pub fn cells(&self, timestamp: &str) -> [String; 6] {
        [
            self.phone_numbers.join(VALUE_SEPARATOR),
            self.emails.join(VALUE_SEPARATOR),
            self.status.to_string(),
            timestamp.to_string(),
            self.remote_identifier.clone(),
            self.notes.clone(),
        ]
    }
}

//! Error taxonomy
//!
//! Only `CredentialUnavailable` and failures to open the input or output
//! abort a run. Everything else degrades a single record.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// First token could not be obtained; nothing useful can be done
    #[error("Credential unavailable: {0}")]
    CredentialUnavailable(#[source] TokenError),

    /// Mid-run refresh failed; the current record is classified ERROR
    #[error("Credential refresh failed: {0}")]
    CredentialRefreshFailed(#[source] TokenError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rate limited (HTTP 429)")]
    RateLimited,

    #[error("Unauthorized (HTTP 401)")]
    Unauthorized,

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Row lacks a required column value
    #[error("Input row {row} malformed: {reason}")]
    InputMalformed { row: usize, reason: String },

    #[error("Input error: {0}")]
    Input(String),

    #[error("Persistence error: {context}")]
    Persistence {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failures of the external token source
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("browser error: {0}")]
    Browser(String),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("no bearer token observed in network traffic")]
    NotObserved,

    #[error("token payload not decodable: {0}")]
    Undecodable(String),

    #[error("token already expired at {0}")]
    Expired(chrono::DateTime<chrono::Utc>),

    #[error("token acquisition timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl EnrichError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn persistence(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Persistence {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, EnrichError>;

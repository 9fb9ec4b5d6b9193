//! Bearer credential lifecycle
//!
//! The credential is replaced wholesale on every successful refresh and kept
//! (even when stale) when a refresh fails.

use crate::error::TokenError;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A bearer token and the instant it stops being accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Seconds remaining before expiry at `now` (negative once expired).
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds()
    }
}

/// Something that can produce a fresh credential (e.g. a browser session)
pub trait TokenSource {
    fn obtain_token(&self) -> impl Future<Output = Result<Credential, TokenError>>;
}

/// Owns the single credential used by a run
pub struct CredentialManager<S> {
    source: S,
    credential: Option<Credential>,
    acquire_timeout: Duration,
    refreshes: u32,
}

impl<S: TokenSource> CredentialManager<S> {
    pub fn new(source: S, acquire_timeout: Duration) -> Self {
        Self {
            source,
            credential: None,
            acquire_timeout,
            refreshes: 0,
        }
    }

    /// True iff a credential exists and expires more than `margin_secs` from now.
    pub fn is_valid(&self, margin_secs: i64) -> bool {
        self.is_valid_at(margin_secs, Utc::now())
    }

    pub fn is_valid_at(&self, margin_secs: i64, now: DateTime<Utc>) -> bool {
        match &self.credential {
            Some(cred) => cred.expires_at - now > chrono::Duration::seconds(margin_secs),
            None => false,
        }
    }

    /// Refresh only when missing or within `margin_secs` of expiry.
    pub async fn ensure_valid(&mut self, margin_secs: i64) -> Result<(), TokenError> {
        if self.is_valid(margin_secs) {
            return Ok(());
        }
        match &self.credential {
            Some(cred) => info!(
                remaining_secs = cred.remaining_secs(Utc::now()),
                "Token near expiry, refreshing"
            ),
            None => info!("No token yet, acquiring"),
        }
        self.refresh().await
    }

    /// Refresh unconditionally (the server rejected the current token).
    pub async fn force_refresh(&mut self) -> Result<(), TokenError> {
        info!("Forcing token refresh");
        self.refresh().await
    }

    /// Stored token, without any freshness check.
    pub fn current_token(&self) -> Option<&str> {
        self.credential.as_ref().map(|c| c.token.as_str())
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Number of acquisitions attempted so far, successful or not.
    pub fn refresh_count(&self) -> u32 {
        self.refreshes
    }

    async fn refresh(&mut self) -> Result<(), TokenError> {
        self.refreshes += 1;
        let acquired = tokio::time::timeout(self.acquire_timeout, self.source.obtain_token())
            .await
            .unwrap_or(Err(TokenError::Timeout(self.acquire_timeout)));

        match acquired {
            Ok(cred) if cred.expires_at <= Utc::now() => {
                let e = TokenError::Expired(cred.expires_at);
                warn!(error = %e, "Rejecting token, keeping previous credential");
                Err(e)
            }
            Ok(cred) => {
                debug!(expires_at = %cred.expires_at, "Token acquired");
                self.credential = Some(cred);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Token acquisition failed, keeping previous credential");
                Err(e)
            }
        }
    }
}

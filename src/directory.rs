//! Remote directory search with retry, backoff and credential refresh

use crate::config::ApiConfig;
use crate::credential::{CredentialManager, TokenSource};
use crate::error::{EnrichError, Result};
use crate::extract::classify_body;
use crate::retry::{Action, Outcome, RetryPolicy, Sleeper};
use crate::schema::LookupResult;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ORIGIN, REFERER};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, error, warn};
use url::Url;

pub const NOTE_CREDENTIAL_UNAVAILABLE: &str = "Credential unavailable";
pub const NOTE_MAX_RETRIES: &str = "Max retries exceeded";

/// One HTTP attempt, before policy is applied
#[derive(Debug)]
pub struct AttemptResult {
    pub outcome: Outcome,
    pub body: Option<String>,
}

/// Thin client for the search endpoint
pub struct DirectoryClient {
    client: Client,
    search_url: Url,
    page_size: u32,
}

impl DirectoryClient {
    pub fn new(config: &ApiConfig, timeout: Duration) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| EnrichError::Config(format!("api.base_url: {}", e)))?;
        let search_url = base
            .join(&config.search_path)
            .map_err(|e| EnrichError::Config(format!("api.search_path: {}", e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        if let Ok(origin) = HeaderValue::from_str(&config.origin) {
            headers.insert(ORIGIN, origin);
        }
        if let Ok(referer) = HeaderValue::from_str(&format!("{}/", config.origin.trim_end_matches('/'))) {
            headers.insert(REFERER, referer);
        }

        let client = Client::builder()
            .user_agent(concat!("roster-enrich/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            search_url,
            page_size: config.page_size,
        })
    }

    /// Issue one search request. Never fails: transport problems become outcomes.
    pub async fn search(&self, name: &str, token: &str) -> AttemptResult {
        let page_size = self.page_size.to_string();
        let sent = self
            .client
            .get(self.search_url.clone())
            .query(&[("page", "0"), ("result", page_size.as_str()), ("nom", name)])
            .bearer_auth(token)
            .send()
            .await;

        let response = match sent {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return AttemptResult {
                    outcome: Outcome::Timeout,
                    body: None,
                }
            }
            Err(e) => {
                return AttemptResult {
                    outcome: Outcome::Transport(e.to_string()),
                    body: None,
                }
            }
        };

        let status = response.status().as_u16();
        if status != 200 {
            return AttemptResult {
                outcome: Outcome::Status(status),
                body: None,
            };
        }

        match response.text().await {
            Ok(body) => AttemptResult {
                outcome: Outcome::Status(status),
                body: Some(body),
            },
            Err(e) if e.is_timeout() => AttemptResult {
                outcome: Outcome::Timeout,
                body: None,
            },
            Err(e) => AttemptResult {
                outcome: Outcome::Transport(e.to_string()),
                body: None,
            },
        }
    }
}

/// Everything a lookup needs besides the query
pub struct Lookup<'a, S, Z> {
    pub client: &'a DirectoryClient,
    pub credentials: &'a mut CredentialManager<S>,
    pub policy: &'a RetryPolicy,
    pub sleeper: &'a Z,
    pub refresh_margin_secs: i64,
}

impl<S: TokenSource, Z: Sleeper> Lookup<'_, S, Z> {
    /// Search for `name` and classify the result. Per-record failures are
    /// folded into an ERROR result, never returned.
    pub async fn run(&mut self, name: &str) -> LookupResult {
        if let Err(e) = self.credentials.ensure_valid(self.refresh_margin_secs).await {
            let err = EnrichError::CredentialRefreshFailed(e);
            error!(query = name, error = %err, "No valid token for lookup");
            return LookupResult::error(NOTE_CREDENTIAL_UNAVAILABLE);
        }

        let max = self.policy.max_attempts;
        for attempt in 0..max {
            let Some(token) = self.credentials.current_token() else {
                return LookupResult::error(NOTE_CREDENTIAL_UNAVAILABLE);
            };
            let result = self.client.search(name, token).await;

            match self.policy.action(&result.outcome, attempt) {
                Action::Accept => {
                    debug!(query = name, attempt = attempt + 1, "Search succeeded");
                    return classify_body(result.body.as_deref().unwrap_or_default());
                }
                Action::Backoff(wait) => {
                    let reason = match result.outcome {
                        Outcome::Status(429) => EnrichError::RateLimited.to_string(),
                        _ => "Timeout".to_string(),
                    };
                    warn!(
                        query = name,
                        attempt = attempt + 1,
                        max,
                        wait_secs = wait.as_secs_f64(),
                        "{}",
                        reason
                    );
                    if self.policy.has_next(attempt) {
                        self.sleeper.sleep(wait).await;
                    }
                }
                Action::RefreshAndRetry => {
                    warn!(
                        query = name,
                        attempt = attempt + 1,
                        max,
                        "{} - refreshing token",
                        EnrichError::Unauthorized
                    );
                    if let Err(e) = self.credentials.force_refresh().await {
                        let err = EnrichError::CredentialRefreshFailed(e);
                        error!(query = name, error = %err, "Token refresh after 401 failed");
                        return LookupResult::error(err.to_string());
                    }
                }
                Action::Abandon(reason) => {
                    error!(query = name, attempt = attempt + 1, %reason, "Search abandoned");
                    return LookupResult::error(reason);
                }
            }
        }

        error!(query = name, attempts = max, "Max retries exceeded");
        LookupResult::error(NOTE_MAX_RETRIES)
    }
}

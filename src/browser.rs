//! Token capture from a headless Chrome session via chromiumoxide
//!
//! The directory API has no token endpoint: its own web page fetches a
//! short-lived JWT and attaches it to every API call. We load that page and
//! read the `Authorization` header off the outgoing requests.

use crate::config::TokenConfig;
use crate::credential::{Credential, TokenSource};
use crate::error::TokenError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chromiumoxide::cdp::browser_protocol::network::EventRequestWillBeSent;
use chromiumoxide::{Browser, BrowserConfig};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Launches a fresh browser per acquisition and closes it afterwards
pub struct BrowserTokenSource {
    config: TokenConfig,
    /// Requests to URLs starting with this prefix are inspected
    api_base_url: String,
}

impl BrowserTokenSource {
    pub fn new(config: TokenConfig, api_base_url: impl Into<String>) -> Self {
        Self {
            config,
            api_base_url: api_base_url.into(),
        }
    }

    async fn launch(&self) -> Result<Browser, TokenError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-setuid-sandbox")
            .arg("--no-first-run");
        builder = if self.config.headless {
            builder.arg("--headless=new")
        } else {
            builder.with_head()
        };
        let config = builder
            .build()
            .map_err(|e| TokenError::Browser(format!("config error: {}", e)))?;

        let (browser, mut handler) = Browser::launch(config).await.map_err(|e| {
            TokenError::Browser(format!(
                "failed to launch Chrome ({}). Is Chrome/Chromium installed?",
                e
            ))
        })?;

        // Spawn handler in background
        tokio::spawn(async move { while handler.next().await.is_some() {} });

        Ok(browser)
    }

    async fn capture(&self, browser: &Browser) -> Result<Credential, TokenError> {
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| TokenError::Browser(e.to_string()))?;

        page.execute(
            chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams::new(
                USER_AGENT,
            ),
        )
        .await
        .map_err(|e| TokenError::Browser(e.to_string()))?;

        let mut requests = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(|e| TokenError::Browser(e.to_string()))?;

        info!(url = %self.config.page_url, "Loading directory page");
        let nav = tokio::time::timeout(
            Duration::from_millis(self.config.navigation_timeout_ms),
            page.goto(self.config.page_url.as_str()),
        )
        .await;
        match nav {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(TokenError::Navigation {
                    url: self.config.page_url.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(TokenError::Navigation {
                    url: self.config.page_url.clone(),
                    reason: format!("timeout after {}ms", self.config.navigation_timeout_ms),
                })
            }
        }

        // Listen for the page's own API calls until the window closes
        let window = Duration::from_millis(self.config.capture_window_ms);
        let scan = async {
            let mut last_error = None;
            while let Some(event) = requests.next().await {
                if !event.request.url.starts_with(&self.api_base_url) {
                    continue;
                }
                let Some(token) = bearer_from_headers(event.request.headers.inner()) else {
                    continue;
                };
                info!(url = %event.request.url, "Bearer token intercepted");
                match credential_from_jwt(&token) {
                    Ok(cred) => return Ok(cred),
                    Err(e) => {
                        warn!(error = %e, "Could not decode intercepted token");
                        last_error = Some(e);
                    }
                }
            }
            Err(last_error.unwrap_or(TokenError::NotObserved))
        };

        match tokio::time::timeout(window, scan).await {
            Ok(result) => result,
            Err(_) => Err(TokenError::NotObserved),
        }
    }
}

impl TokenSource for BrowserTokenSource {
    async fn obtain_token(&self) -> Result<Credential, TokenError> {
        info!(headless = self.config.headless, "Starting token extraction");
        let mut browser = self.launch().await?;
        let result = self.capture(&browser).await;

        if let Err(e) = browser.close().await {
            debug!(error = %e, "Browser close failed");
        }
        let _ = browser.wait().await;

        if let Ok(cred) = &result {
            info!(expires_at = %cred.expires_at, "Token extracted");
        }
        result
    }
}

fn bearer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*[Bb]earer\s+(\S+)\s*$").unwrap())
}

/// Extract the bearer token from a CDP header object (header names are case-insensitive).
pub fn bearer_from_headers(headers: &Value) -> Option<String> {
    headers
        .as_object()?
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("authorization"))
        .and_then(|(_, value)| value.as_str())
        .and_then(|value| bearer_re().captures(value))
        .map(|cap| cap[1].to_string())
}

/// Read the `exp` claim of a JWT without verifying its signature.
pub fn credential_from_jwt(token: &str) -> Result<Credential, TokenError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| TokenError::Undecodable("not a JWT (no payload segment)".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| TokenError::Undecodable(format!("base64: {}", e)))?;
    let claims: Value = serde_json::from_slice(&bytes)
        .map_err(|e| TokenError::Undecodable(format!("claims: {}", e)))?;

    let exp = claims
        .get("exp")
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .ok_or_else(|| TokenError::Undecodable("no numeric exp claim".into()))?;
    let expires_at: DateTime<Utc> = DateTime::from_timestamp(exp, 0)
        .ok_or_else(|| TokenError::Undecodable(format!("exp out of range: {}", exp)))?;

    Ok(Credential {
        token: token.to_string(),
        expires_at,
    })
}

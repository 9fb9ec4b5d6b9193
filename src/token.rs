//! token command: Capture one bearer token and report its lifetime
//!
//! Smoke test for the browser side without touching any roster.

use crate::browser::BrowserTokenSource;
use crate::config::Config;
use crate::credential::CredentialManager;
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use serde::Serialize;

#[derive(Args)]
pub struct TokenArgs {
    /// Characters of the token to echo back
    #[arg(long, default_value = "24")]
    pub show: usize,
}

#[derive(Debug, Serialize)]
pub struct TokenReport {
    pub token_prefix: String,
    pub length: usize,
    pub expires_at: String,
    pub expires_in_secs: i64,
}

pub async fn run_token(args: TokenArgs, config: Config) -> Result<()> {
    let source = BrowserTokenSource::new(config.token.clone(), config.api.base_url.clone());
    let mut manager = CredentialManager::new(source, config.acquire_timeout());

    manager
        .force_refresh()
        .await
        .context("Token extraction failed")?;
    let credential = manager
        .credential()
        .context("Token source returned no credential")?;

    let report = TokenReport {
        token_prefix: prefix(&credential.token, args.show),
        length: credential.token.len(),
        expires_at: credential.expires_at.to_rfc3339(),
        expires_in_secs: credential.remaining_secs(Utc::now()),
    };
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

fn prefix(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}

//! roster-enrich: resumable contact enrichment against a token-protected directory
//!
//! Commands:
//! - run: enrich the roster, checkpointing as it goes
//! - token: capture a bearer token through headless Chrome

pub mod browser;
pub mod checkpoint;
pub mod config;
pub mod credential;
pub mod directory;
pub mod enrich;
pub mod error;
pub mod extract;
pub mod pipeline;
pub mod retry;
pub mod roster;
pub mod schema;
pub mod token;

pub use checkpoint::{Checkpoint, CheckpointStore, RunStatistics};
pub use config::Config;
pub use credential::{Credential, CredentialManager, TokenSource};
pub use error::{EnrichError, TokenError};
pub use pipeline::{Pipeline, RunSummary};
pub use retry::{RecordingSleeper, Sleeper, TokioSleeper};
pub use schema::{LookupResult, LookupStatus};

//! End-to-end enrichment runs against a mock directory

use chrono::Utc;
use roster_enrich::config::{Config, FilesConfig, PacingConfig};
use roster_enrich::{
    Checkpoint, Credential, EnrichError, Pipeline, RecordingSleeper, TokenError, TokenSource,
};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::tempdir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SEARCH_PATH: &str = "/api/search";
const HEADER: &str = "ID_AVO;NOM;PRENOM1;BARREAU";

/// Hands out `tok-1`, `tok-2`, ... or fails every time
#[derive(Default)]
struct Tokens {
    calls: Cell<u32>,
    broken: bool,
}

impl TokenSource for &Tokens {
    async fn obtain_token(&self) -> Result<Credential, TokenError> {
        let n = self.calls.get() + 1;
        self.calls.set(n);
        if self.broken {
            return Err(TokenError::NotObserved);
        }
        Ok(Credential {
            token: format!("tok-{}", n),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }
}

fn config_for(server: &MockServer, dir: &Path) -> Config {
    let mut config = Config::default();
    config.api.base_url = server.uri();
    config.api.search_path = SEARCH_PATH.to_string();
    config.retry.rate_limit_base_secs = 0.0;
    config.pacing = PacingConfig {
        delay_min_secs: 0.0,
        delay_max_secs: 0.0,
    };
    config.files = FilesConfig {
        input: dir.join("avocats.csv"),
        output: dir.join("avocats_enriched.csv"),
        checkpoint: dir.join("checkpoint.json"),
        log_file: None,
    };
    config
}

/// Write the roster in the default table encoding (latin-1, `;`).
fn write_roster(path: &Path, rows: &[&str]) {
    let mut text = format!("{}\n", HEADER);
    for row in rows {
        text.push_str(row);
        text.push('\n');
    }
    let (bytes, _, unmappable) = encoding_rs::WINDOWS_1252.encode(&text);
    assert!(!unmappable);
    fs::write(path, bytes).unwrap();
}

fn numbered_rows(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| format!("A{};NOM{};Prenom{};Paris", i, i, i))
        .collect()
}

fn read_output(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
    let bytes = fs::read(path).unwrap();
    let (text, _, _) = encoding_rs::WINDOWS_1252.decode(&bytes);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader.headers().unwrap().iter().map(String::from).collect();
    let rows = reader
        .records()
        .map(|r| r.unwrap().iter().map(String::from).collect())
        .collect();
    (headers, rows)
}

fn found_body() -> serde_json::Value {
    serde_json::json!({"list": {"exact": [
        {"telephone": ["01 42 00 00 00"], "emails": ["contact@cabinet.fr"], "identifiant": "AV123"}
    ]}})
}

async fn mount_found(server: &MockServer, expected: u64) {
    Mock::given(method("GET"))
        .and(path(SEARCH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(found_body()))
        .expect(expected)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_enriches_and_passes_columns_through() {
    let server = MockServer::start().await;
    mount_found(&server, 3).await;
    let dir = tempdir().unwrap();
    let mut config = config_for(&server, dir.path());
    config.pacing = PacingConfig {
        delay_min_secs: 0.25,
        delay_max_secs: 0.25,
    };
    write_roster(
        &config.files.input,
        &[
            "A1;DUPONT;Jean;Paris",
            "A2;LEFÈVRE;Hélène;Créteil",
            "A3;MARTIN;Marie;Paris",
        ],
    );

    let tokens = Tokens::default();
    let sleeper = RecordingSleeper::new();
    let mut pipeline = Pipeline::new(config.clone(), &tokens, &sleeper).unwrap();
    let summary = pipeline.run(None, None).await.unwrap();

    assert_eq!(summary.stats.total_processed, 3);
    assert_eq!(summary.stats.found, 3);
    assert_eq!(summary.processed_this_run, 3);
    assert!(!summary.limit_reached);

    let (headers, rows) = read_output(&config.files.output);
    assert_eq!(
        headers,
        vec![
            "ID_AVO",
            "NOM",
            "PRENOM1",
            "BARREAU",
            "TELEPHONE",
            "EMAIL",
            "SCRAPE_STATUS",
            "SCRAPE_DATE",
            "API_IDENTIFIANT",
            "SCRAPE_NOTES",
        ]
    );
    assert_eq!(rows.len(), 3);
    assert_eq!(&rows[1][..4], &["A2", "LEFÈVRE", "Hélène", "Créteil"]);
    assert_eq!(rows[1][4], "01 42 00 00 00");
    assert_eq!(rows[1][5], "contact@cabinet.fr");
    assert_eq!(rows[1][6], "FOUND");
    assert_eq!(rows[1][8], "AV123");

    // One pacing wait per looked-up record
    assert_eq!(sleeper.sleeps(), vec![Duration::from_millis(250); 3]);

    let checkpoint = pipeline.checkpoint_store().load().unwrap().unwrap();
    assert_eq!(checkpoint.last_processed_index, 2);
    assert_eq!(checkpoint.last_processed_id, "A3");
    assert_eq!(checkpoint.total_processed, 3);
    assert_eq!(checkpoint.successful, 3);
}

#[tokio::test]
async fn test_rows_without_names_are_skipped() {
    let server = MockServer::start().await;
    mount_found(&server, 2).await;
    let dir = tempdir().unwrap();
    let config = config_for(&server, dir.path());
    write_roster(
        &config.files.input,
        &["A1;DUPONT;Jean;Paris", "A2;;Paul;Paris", "A3;MARTIN;Marie;Paris"],
    );

    let tokens = Tokens::default();
    let sleeper = RecordingSleeper::new();
    let mut pipeline = Pipeline::new(config.clone(), &tokens, &sleeper).unwrap();
    let summary = pipeline.run(None, None).await.unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.stats.total_processed, 2);
    let (_, rows) = read_output(&config.files.output);
    let ids: Vec<&str> = rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(ids, vec!["A1", "A3"]);
}

#[tokio::test]
async fn test_record_errors_do_not_stop_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("nom", "Jean DUPONT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(found_body()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("nom", "Marie MARTIN"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("nom", "Luc BERNARD"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"list": {"exact": []}})),
        )
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let config = config_for(&server, dir.path());
    write_roster(
        &config.files.input,
        &[
            "A1;MARTIN;Marie;Paris",
            "A2;DUPONT;Jean;Paris",
            "A3;BERNARD;Luc;Paris",
        ],
    );

    let tokens = Tokens::default();
    let sleeper = RecordingSleeper::new();
    let mut pipeline = Pipeline::new(config.clone(), &tokens, &sleeper).unwrap();
    let summary = pipeline.run(None, None).await.unwrap();

    assert_eq!(summary.stats.errors, 1);
    assert_eq!(summary.stats.found, 1);
    assert_eq!(summary.stats.not_found, 1);

    let (_, rows) = read_output(&config.files.output);
    assert_eq!(rows[0][6], "ERROR");
    assert_eq!(rows[0][9], "HTTP 503");
    assert_eq!(rows[1][6], "FOUND");
    assert_eq!(rows[2][6], "NOT_FOUND");
    assert_eq!(rows[2][9], "No exact matches found");
}

#[tokio::test]
async fn test_checkpoint_counters_after_full_run() {
    let server = MockServer::start().await;
    mount_found(&server, 100).await;
    let dir = tempdir().unwrap();
    let config = config_for(&server, dir.path());
    let rows = numbered_rows(100);
    let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
    write_roster(&config.files.input, &rows);

    let tokens = Tokens::default();
    let sleeper = RecordingSleeper::new();
    let mut pipeline = Pipeline::new(config.clone(), &tokens, &sleeper).unwrap();
    let summary = pipeline.run(None, None).await.unwrap();

    let checkpoint = pipeline.checkpoint_store().load().unwrap().unwrap();
    assert_eq!(checkpoint.last_processed_index, 99);
    assert_eq!(checkpoint.last_processed_id, "A99");
    assert_eq!(checkpoint.total_processed, 100);
    assert_eq!(checkpoint.successful, 100);
    assert_eq!(checkpoint.not_found, 0);
    assert_eq!(checkpoint.multiple_matches, 0);
    assert_eq!(checkpoint.errors, 0);
    assert_eq!(checkpoint.statistics(), summary.stats);
    assert_eq!(tokens.calls.get(), 1);
}

/// Issues tokens like [`Tokens`] and copies the checkpoint file on every
/// refresh after the first, so a test can see what was saved mid-run.
struct CheckpointWatcher {
    tokens: Tokens,
    checkpoint: PathBuf,
    seen: RefCell<Option<Checkpoint>>,
}

impl TokenSource for &CheckpointWatcher {
    async fn obtain_token(&self) -> Result<Credential, TokenError> {
        if self.tokens.calls.get() > 0 {
            let saved = fs::read_to_string(&self.checkpoint).ok();
            *self.seen.borrow_mut() = saved.map(|json| serde_json::from_str(&json).unwrap());
        }
        (&self.tokens).obtain_token().await
    }
}

#[tokio::test]
async fn test_checkpoint_saved_at_interval_mid_run() {
    let server = MockServer::start().await;
    for i in 0..2 {
        Mock::given(method("GET"))
            .and(query_param("nom", format!("Prenom{} NOM{}", i, i)))
            .respond_with(ResponseTemplate::new(200).set_body_json(found_body()))
            .mount(&server)
            .await;
    }
    // Third record triggers a refresh, at which point the interval save must exist
    Mock::given(method("GET"))
        .and(query_param("nom", "Prenom2 NOM2"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("nom", "Prenom2 NOM2"))
        .and(header("authorization", "Bearer tok-2"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"list": {"exact": []}})),
        )
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let mut config = config_for(&server, dir.path());
    config.progress.checkpoint_interval = 2;
    let rows = numbered_rows(3);
    let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
    write_roster(&config.files.input, &rows);

    let watcher = CheckpointWatcher {
        tokens: Tokens::default(),
        checkpoint: config.files.checkpoint.clone(),
        seen: RefCell::new(None),
    };
    let sleeper = RecordingSleeper::new();
    let mut pipeline = Pipeline::new(config.clone(), &watcher, &sleeper).unwrap();
    pipeline.run(None, None).await.unwrap();

    let mid_run = watcher.seen.borrow().clone().expect("checkpoint saved before row 3");
    assert_eq!(mid_run.last_processed_index, 1);
    assert_eq!(mid_run.last_processed_id, "A1");
    assert_eq!(mid_run.total_processed, 2);
    assert_eq!(mid_run.successful, 2);
    assert_eq!(mid_run.not_found, 0);
    assert_eq!(mid_run.multiple_matches, 0);
    assert_eq!(mid_run.errors, 0);

    let last = pipeline.checkpoint_store().load().unwrap().unwrap();
    assert_eq!(last.last_processed_index, 2);
    assert_eq!(last.total_processed, 3);
    assert_eq!(last.not_found, 1);
}

#[tokio::test]
async fn test_limited_run_then_resume_has_no_duplicates() {
    let server = MockServer::start().await;
    mount_found(&server, 6).await;
    let dir = tempdir().unwrap();
    let config = config_for(&server, dir.path());
    let rows = numbered_rows(6);
    let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
    write_roster(&config.files.input, &rows);

    let tokens = Tokens::default();
    let sleeper = RecordingSleeper::new();

    let mut first = Pipeline::new(config.clone(), &tokens, &sleeper).unwrap();
    let summary = first.run(None, Some(2)).await.unwrap();
    assert!(summary.limit_reached);
    assert_eq!(summary.processed_this_run, 2);

    let checkpoint = first.checkpoint_store().load().unwrap().unwrap();
    assert_eq!(checkpoint.last_processed_index, 1);
    let started_at = checkpoint.started_at;

    let mut second = Pipeline::new(config.clone(), &tokens, &sleeper).unwrap();
    let summary = second.run(Some(checkpoint), None).await.unwrap();
    assert_eq!(summary.processed_this_run, 4);
    assert_eq!(summary.stats.total_processed, 6);
    assert_eq!(summary.started_at, started_at);

    let (headers, rows) = read_output(&config.files.output);
    assert_eq!(headers.iter().filter(|h| *h == "ID_AVO").count(), 1);
    let ids: Vec<&str> = rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(ids, vec!["A0", "A1", "A2", "A3", "A4", "A5"]);
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 6);
}

#[tokio::test]
async fn test_resume_counts_rows_written_after_checkpoint() {
    let server = MockServer::start().await;
    // Only the first run reaches the directory
    mount_found(&server, 4).await;
    let dir = tempdir().unwrap();
    let config = config_for(&server, dir.path());
    let rows = numbered_rows(4);
    let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
    write_roster(&config.files.input, &rows);

    let tokens = Tokens::default();
    let sleeper = RecordingSleeper::new();
    let mut first = Pipeline::new(config.clone(), &tokens, &sleeper).unwrap();
    first.run(None, None).await.unwrap();

    // Simulate a crash after row A3 was written but before it was checkpointed
    let mut checkpoint = first.checkpoint_store().load().unwrap().unwrap();
    checkpoint.last_processed_index = 1;
    checkpoint.last_processed_id = "A1".to_string();
    checkpoint.total_processed = 2;
    checkpoint.successful = 2;

    let mut second = Pipeline::new(config.clone(), &tokens, &sleeper).unwrap();
    let summary = second.run(Some(checkpoint), None).await.unwrap();
    assert_eq!(summary.reconciled, 2);
    assert_eq!(summary.processed_this_run, 0);
    assert_eq!(summary.stats.total_processed, 4);
    assert_eq!(summary.stats.found, 4);

    let (_, rows) = read_output(&config.files.output);
    assert_eq!(rows.len(), 4);

    let saved = second.checkpoint_store().load().unwrap().unwrap();
    assert_eq!(saved.last_processed_index, 3);
    assert_eq!(saved.total_processed, 4);
}

#[tokio::test]
async fn test_initial_token_failure_aborts_before_output() {
    let server = MockServer::start().await;
    mount_found(&server, 0).await;
    let dir = tempdir().unwrap();
    let config = config_for(&server, dir.path());
    write_roster(&config.files.input, &["A1;DUPONT;Jean;Paris"]);

    let tokens = Tokens {
        broken: true,
        ..Tokens::default()
    };
    let sleeper = RecordingSleeper::new();
    let mut pipeline = Pipeline::new(config.clone(), &tokens, &sleeper).unwrap();
    let err = pipeline.run(None, None).await.unwrap_err();

    assert!(matches!(err, EnrichError::CredentialUnavailable(_)));
    assert!(!config.files.output.exists());
    assert!(!config.files.checkpoint.exists());
}

#[tokio::test]
async fn test_unauthorized_refreshes_once_and_continues() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(header("authorization", "Bearer tok-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(found_body()))
        .expect(2)
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let config = config_for(&server, dir.path());
    write_roster(
        &config.files.input,
        &["A1;DUPONT;Jean;Paris", "A2;MARTIN;Marie;Paris"],
    );

    let tokens = Tokens::default();
    let sleeper = RecordingSleeper::new();
    let mut pipeline = Pipeline::new(config.clone(), &tokens, &sleeper).unwrap();
    let summary = pipeline.run(None, None).await.unwrap();

    assert_eq!(summary.stats.found, 2);
    assert_eq!(pipeline.credentials().refresh_count(), 2);
    assert_eq!(pipeline.credentials().current_token(), Some("tok-2"));
}

#[tokio::test]
async fn test_missing_input_is_fatal() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let config = config_for(&server, dir.path());

    let tokens = Tokens::default();
    let sleeper = RecordingSleeper::new();
    let mut pipeline = Pipeline::new(config.clone(), &tokens, &sleeper).unwrap();
    let err = pipeline.run(None, None).await.unwrap_err();

    assert!(matches!(err, EnrichError::Io { .. }));
    assert!(!config.files.output.exists());
}

#[tokio::test]
async fn test_fresh_start_keeps_checkpoint_until_token_obtained() {
    let server = MockServer::start().await;
    mount_found(&server, 1).await;
    let dir = tempdir().unwrap();
    let config = config_for(&server, dir.path());
    write_roster(&config.files.input, &["A1;DUPONT;Jean;Paris"]);
    fs::write(&config.files.checkpoint, r#"{"stale": true}"#).unwrap();

    let broken = Tokens {
        broken: true,
        ..Tokens::default()
    };
    let sleeper = RecordingSleeper::new();
    let mut pipeline = Pipeline::new(config.clone(), &broken, &sleeper).unwrap();
    assert!(pipeline.run(None, None).await.is_err());
    assert_eq!(
        fs::read_to_string(&config.files.checkpoint).unwrap(),
        r#"{"stale": true}"#
    );

    let tokens = Tokens::default();
    let mut pipeline = Pipeline::new(config.clone(), &tokens, &sleeper).unwrap();
    pipeline.run(None, None).await.unwrap();
    let checkpoint = pipeline.checkpoint_store().load().unwrap().unwrap();
    assert_eq!(checkpoint.last_processed_id, "A1");
    assert_eq!(checkpoint.total_processed, 1);
}

const FILE_LIMIT_ENV: &str = "ROSTER_ENRICH_FILE_LIMIT_RUN";

/// Runs `write_failure_under_file_size_limit` in a child test process whose
/// file size limit stops the output partway through.
#[cfg(unix)]
#[test]
fn test_output_write_failure_leaves_consistent_files() {
    let exe = std::env::current_exe().unwrap();
    let status = std::process::Command::new("sh")
        .arg("-c")
        .arg("trap '' XFSZ; ulimit -f 8; exec \"$0\" --ignored --exact write_failure_under_file_size_limit --nocapture")
        .arg(exe)
        .env(FILE_LIMIT_ENV, "1")
        .status()
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
#[ignore = "run by test_output_write_failure_leaves_consistent_files"]
async fn write_failure_under_file_size_limit() {
    if std::env::var_os(FILE_LIMIT_ENV).is_none() {
        return;
    }
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(found_body()))
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let mut config = config_for(&server, dir.path());
    config.progress.checkpoint_interval = 7;
    // Input stays under the limit, output does not
    let rows = numbered_rows(100);
    let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
    write_roster(&config.files.input, &rows);

    let tokens = Tokens::default();
    let sleeper = RecordingSleeper::new();
    let mut pipeline = Pipeline::new(config.clone(), &tokens, &sleeper).unwrap();
    let err = pipeline.run(None, None).await.unwrap_err();
    assert!(matches!(err, EnrichError::Persistence { .. }));

    let raw = fs::read(&config.files.output).unwrap();
    assert_eq!(raw.last(), Some(&b'\n'));
    let (_, written) = read_output(&config.files.output);
    assert!(!written.is_empty() && written.len() < 100);
    assert!(written.iter().all(|row| row.len() == 10));

    let checkpoint = pipeline.checkpoint_store().load().unwrap().unwrap();
    assert_eq!(checkpoint.total_processed, written.len() as u64);
    assert_eq!(checkpoint.successful, written.len() as u64);
    assert_eq!(checkpoint.last_processed_index, written.len() as i64 - 1);
}

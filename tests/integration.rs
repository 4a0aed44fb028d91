use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn relay_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("relay");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("models")).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/relay.sqlite"

[embedding]
provider = "disabled"

[scoring]
model_dir = "{root}/models"

[broadcast]
retention_days = 30
"#,
        root = root.display()
    );

    let config_path = config_dir.join("relay.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

/// Run raw SQL against the test database (after `relay init`).
fn seed_database(root: &Path, statements: &[&str]) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let url = format!("sqlite://{}", root.join("data/relay.sqlite").display());
        let pool = sqlx::SqlitePool::connect(&url).await.unwrap();
        for sql in statements {
            sqlx::query(sql).execute(&pool).await.unwrap();
        }
        pool.close().await;
    });
}

fn run_relay(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = relay_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run relay binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_relay(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Database initialized"));
    assert!(tmp.path().join("data/relay.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_relay(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_relay(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_run_on_empty_database() {
    let (_tmp, config_path) = setup_test_env();

    run_relay(&config_path, &["init"]);
    let (stdout, stderr, success) = run_relay(&config_path, &["run"]);
    assert!(success, "run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Embedded: 0"));
    assert!(stdout.contains("Cleared: 0"));
}

#[test]
fn test_clear_old() {
    let (_tmp, config_path) = setup_test_env();

    run_relay(&config_path, &["init"]);
    let (stdout, _, success) = run_relay(&config_path, &["clear-old", "--days", "45"]);
    assert!(success);
    assert!(stdout.contains("Removed 0 delivered records older than 45 days"));
}

#[test]
fn test_clear_old_rejects_window_below_retention() {
    let (_tmp, config_path) = setup_test_env();

    run_relay(&config_path, &["init"]);
    let (_, stderr, success) = run_relay(&config_path, &["clear-old", "--days", "7"]);
    assert!(!success);
    assert!(stderr.contains("retention_days"));
}

#[test]
fn test_embed_errors_when_disabled() {
    let (_tmp, config_path) = setup_test_env();

    run_relay(&config_path, &["init"]);
    let (_, stderr, success) = run_relay(&config_path, &["embed"]);
    assert!(!success);
    assert!(stderr.contains("No embedding provider configured"));
}

#[test]
fn test_score_unknown_model() {
    let (_tmp, config_path) = setup_test_env();

    run_relay(&config_path, &["init"]);
    let (_, stderr, success) = run_relay(&config_path, &["score", "--model", "42"]);
    assert!(!success);
    assert!(stderr.contains("Unknown model: 42"));
}

#[test]
fn test_score_feeds_requires_model() {
    let (_tmp, config_path) = setup_test_env();

    run_relay(&config_path, &["init"]);
    let (_, stderr, success) = run_relay(&config_path, &["score", "--feeds", "1,2"]);
    assert!(!success);
    assert!(stderr.contains("--feeds requires --model"));
}

#[test]
fn test_broadcast_unknown_channel() {
    let (_tmp, config_path) = setup_test_env();

    run_relay(&config_path, &["init"]);
    let (_, stderr, success) = run_relay(&config_path, &["broadcast", "--channel", "9"]);
    assert!(!success);
    assert!(stderr.contains("Unknown channel: 9"));
}

#[test]
fn test_broadcast_continues_past_failing_channel() {
    let (tmp, config_path) = setup_test_env();

    run_relay(&config_path, &["init"]);
    seed_database(
        tmp.path(),
        &[
            "INSERT INTO models (id, name) VALUES (1, 'm')",
            "INSERT INTO channels (id, name, endpoint, model_id, broadcast_hours) \
             VALUES (1, 'mail', 'mailto:ops@example.org', 1, '')",
            "INSERT INTO channels (id, name, endpoint, model_id, broadcast_hours) \
             VALUES (2, 'chat', 'https://hooks.slack.com/services/T/B/X', 1, '')",
        ],
    );

    let (stdout, stderr, success) = run_relay(&config_path, &["broadcast"]);
    assert!(!success);
    assert!(stdout.contains("Channel 1 (mail): failed"), "stdout={}", stdout);
    assert!(stdout.contains("notify.smtp"));
    assert!(stdout.contains("Channel 2 (chat): admitted 0"));
    assert!(stdout.contains("(outside hours)"));
    assert!(stderr.contains("1 of 2 channels failed"));
}

#[test]
fn test_hours_canonicalizes_without_config() {
    let missing = Path::new("/nonexistent/relay.toml");

    let (stdout, stderr, success) = run_relay(missing, &["hours", "22-2, 9,10,11", "--at", "23"]);
    assert!(success, "hours failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Canonical: \"0-2,9-11,22-23\""));
    assert!(stdout.contains("Hours: [0, 1, 2, 9, 10, 11, 22, 23]"));
    assert!(stdout.contains("Hour 23: allowed"));
}

#[test]
fn test_hours_empty_spec_blocks_everything() {
    let missing = Path::new("/nonexistent/relay.toml");

    let (stdout, _, success) = run_relay(missing, &["hours", "", "--at", "12"]);
    assert!(success);
    assert!(stdout.contains("Canonical: \"\""));
    assert!(stdout.contains("Hour 12: blocked"));
}

#[test]
fn test_missing_config_fails() {
    let missing = Path::new("/nonexistent/relay.toml");

    let (_, stderr, success) = run_relay(missing, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

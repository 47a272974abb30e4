use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn gchat_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("gchat");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    fs::write(
        root.join("handbook.txt"),
        "New hires get twenty vacation days.\n\nLaptops are ordered through IT.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/gchat.sqlite"

[server]
bind = "127.0.0.1:5099"

[embedding]
provider = "disabled"

[rerank]
enabled = false
"#,
        root.display()
    );

    let config_path = config_dir.join("gchat.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_gchat(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = gchat_binary();
    let workdir = config_path.parent().unwrap().parent().unwrap();
    let output = Command::new(&binary)
        .current_dir(workdir)
        .env_remove("GEMINI_API_KEYS")
        .env_remove("GEMINI_API_KEY")
        .env_remove("COHERE_API_KEYS")
        .env_remove("COHERE_API_KEY")
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run gchat binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_gchat(&config, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized successfully."));
    assert!(tmp.path().join("data").join("gchat.sqlite").exists());

    // idempotent
    let (_, stderr, success) = run_gchat(&config, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_empty_listings_after_init() {
    let (_tmp, config) = setup_test_env();
    run_gchat(&config, &["init"]);

    let (stdout, stderr, success) = run_gchat(&config, &["documents", "list"]);
    assert!(success, "documents list failed: {}", stderr);
    assert!(stdout.contains("No documents ingested."));

    let (stdout, stderr, success) = run_gchat(&config, &["sessions", "list"]);
    assert!(success, "sessions list failed: {}", stderr);
    assert!(stdout.contains("No chat sessions."));
}

#[test]
fn test_missing_records_fail() {
    let (_tmp, config) = setup_test_env();
    run_gchat(&config, &["init"]);

    let (_, stderr, success) = run_gchat(&config, &["sessions", "show", "42"]);
    assert!(!success);
    assert!(stderr.contains("Session 42 not found"));

    let (_, stderr, success) = run_gchat(&config, &["documents", "delete", "ghost.txt"]);
    assert!(!success);
    assert!(stderr.contains("No document named 'ghost.txt'"));
}

#[test]
fn test_ingest_without_api_keys_explains_how_to_configure() {
    let (tmp, config) = setup_test_env();
    run_gchat(&config, &["init"]);

    let file = tmp.path().join("handbook.txt");
    let (_, stderr, success) = run_gchat(&config, &["ingest", file.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("GEMINI_API_KEYS"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_config_rejected() {
    let (_tmp, config) = setup_test_env();
    let content = fs::read_to_string(&config).unwrap();
    fs::write(&config, format!("{}\n[retrieval]\nvector_weight = 1.5\n", content)).unwrap();

    let (_, stderr, success) = run_gchat(&config, &["init"]);
    assert!(!success);
    assert!(stderr.contains("vector_weight"));
}

#[test]
fn test_missing_config_file() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_gchat(&tmp.path().join("config").join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

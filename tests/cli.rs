use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn cidx_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("cidx");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("node_modules")).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt covers cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.",
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file.\n\nNotes about deployment, Kubernetes and Docker.",
    )
    .unwrap();
    fs::write(files_dir.join("node_modules").join("vendored.md"), "should never be indexed").unwrap();
    fs::write(files_dir.join("image.png"), [0u8, 1, 2, 3]).unwrap();

    let config_content = format!(
        r#"[storage]
data_dir = "{root}/data"

[index]
roots = ["{root}/files"]

[chunking]
target_tokens = 200
overlap_tokens = 20

[embedding]
provider = "offline"
dims = 512
"#,
        root = root.display()
    );

    let config_path = config_dir.join("cidx.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_cidx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = cidx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run cidx binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn json(stdout: &str) -> serde_json::Value {
    serde_json::from_str(stdout).unwrap_or_else(|e| panic!("stdout is not JSON ({}): {}", e, stdout))
}

#[test]
fn test_init_creates_databases() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_cidx(&config, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Initialized"));
    assert!(tmp.path().join("data/ledger.sqlite").exists());
    assert!(tmp.path().join("data/vectors/index.sqlite").exists());
    assert!(tmp.path().join("data/checkpoints/index.sqlite").exists());

    // Idempotent
    let (_, stderr, success) = run_cidx(&config, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_index_then_reindex_is_incremental() {
    let (_tmp, config) = setup_test_env();

    let (stdout, stderr, success) = run_cidx(&config, &["--json", "index"]);
    assert!(success, "index failed: {}", stderr);
    let first = json(&stdout);
    assert_eq!(first["stats"]["discovered"], 3);
    assert_eq!(first["stats"]["changed"], 3);
    assert_eq!(first["stats"]["committed"], 3);
    assert_eq!(first["errors"].as_array().unwrap().len(), 0);

    let (stdout, stderr, success) = run_cidx(&config, &["--json", "index"]);
    assert!(success, "reindex failed: {}", stderr);
    let second = json(&stdout);
    assert_eq!(second["stats"]["changed"], 0);

    let (stdout, _, success) = run_cidx(&config, &["--json", "index", "--full"]);
    assert!(success);
    assert_eq!(json(&stdout)["stats"]["changed"], 3);
}

#[test]
fn test_search_returns_ranked_hits() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_cidx(&config, &["index"]);
    assert!(success, "index failed: {}", stderr);

    let (stdout, stderr, success) = run_cidx(
        &config,
        &["--json", "search", "kubernetes docker deployment", "--top-k", "2", "--user", "ops"],
    );
    assert!(success, "search failed: {}", stderr);
    let response = json(&stdout);
    let hits = response["hits"].as_array().unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits[0]["meta"]["path"].as_str().unwrap().ends_with("gamma.txt"));
    assert!(response["query_id"].as_i64().unwrap() > 0);

    let (stdout, _, success) = run_cidx(&config, &["search", "rust cargo crates"]);
    assert!(success);
    assert!(stdout.starts_with("1. ["));
    assert!(stdout.contains("alpha.md"));
}

#[test]
fn test_search_filter_restricts_extension() {
    let (_tmp, config) = setup_test_env();
    run_cidx(&config, &["index"]);

    let (stdout, stderr, success) = run_cidx(
        &config,
        &["--json", "search", "document", "--filter", "ext=.txt"],
    );
    assert!(success, "search failed: {}", stderr);
    let hits = json(&stdout)["hits"].as_array().unwrap().clone();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["meta"]["ext"], ".txt");
}

#[test]
fn test_search_before_index_prints_no_results() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_cidx(&config, &["search", "anything"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_stats_reports_counts() {
    let (_tmp, config) = setup_test_env();
    run_cidx(&config, &["index"]);
    run_cidx(&config, &["search", "python"]);

    let (stdout, stderr, success) = run_cidx(&config, &["--json", "stats"]);
    assert!(success, "stats failed: {}", stderr);
    let report = json(&stdout);
    assert_eq!(report["ledger"]["files"], 3);
    assert_eq!(report["ledger"]["queries"], 1);
    assert_eq!(report["vectors"], 3);
    assert_eq!(report["collection"], "docs_v1");
    assert_eq!(report["recent_runs"][0]["stage"], "done");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_cidx(&tmp.path().join("nope.toml"), &["stats"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

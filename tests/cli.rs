use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use tempfile::TempDir;

fn kb_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_kb"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("sub")).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.",
    )
    .unwrap();
    fs::write(
        files_dir.join("sub/gamma.txt"),
        "Gamma plain text file.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();

    let config_content = format!(
        r#"[storage]
data_root = "{}/data"

[worker]
binary = "{}"
call_timeout_ms = 30000
import_timeout_ms = 60000

[logging]
level = "warn"
"#,
        root.display(),
        env!("CARGO_BIN_EXE_kb-worker")
    );

    let config_path = config_dir.join("kb.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_kb(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = kb_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run kb binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn run_json(config_path: &Path, args: &[&str]) -> Value {
    let (stdout, stderr, success) = run_kb(config_path, args);
    assert!(success, "kb {:?} failed: {}", args, stderr);
    serde_json::from_str(&stdout)
        .unwrap_or_else(|e| panic!("kb {:?} printed invalid JSON ({}): {}", args, e, stdout))
}

fn create_kb(config_path: &Path, name: &str) -> String {
    let manifest = run_json(config_path, &["create", name]);
    assert_eq!(manifest["name"], name);
    manifest["id"].as_str().unwrap().to_string()
}

#[test]
fn test_create_and_list() {
    let (_tmp, config_path) = setup_test_env();

    let id = create_kb(&config_path, "Docs");
    let listed = run_json(&config_path, &["list"]);
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], id.as_str());
}

#[test]
fn test_import_and_search() {
    let (tmp, config_path) = setup_test_env();
    let id = create_kb(&config_path, "Docs");
    let files = tmp.path().join("files");

    let job = run_json(
        &config_path,
        &["import", &id, files.to_str().unwrap(), "--recursive"],
    );
    assert_eq!(job["status"], "done");
    assert_eq!(job["progressTotal"], 3);
    assert_eq!(job["progressCurrent"], 3);

    let found = run_json(&config_path, &["search", &id, "Kubernetes"]);
    let results = found["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["documentTitle"], "gamma.txt");

    let stats = run_json(&config_path, &["stats", &id]);
    assert_eq!(stats["documents"], 3);
    assert_eq!(stats["jobs"], 1);

    let jobs = run_json(&config_path, &["jobs", &id]);
    let job_id = jobs[0]["id"].as_str().unwrap();
    let items = run_json(&config_path, &["items", &id, job_id]);
    assert_eq!(items.as_array().unwrap().len(), 3);
}

#[test]
fn test_shallow_import_skips_subdirectories() {
    let (tmp, config_path) = setup_test_env();
    let id = create_kb(&config_path, "Shallow");
    let files = tmp.path().join("files");

    let job = run_json(&config_path, &["import", &id, files.to_str().unwrap()]);
    assert_eq!(job["progressTotal"], 2);
}

#[test]
fn test_import_of_nothing_fails() {
    let (tmp, config_path) = setup_test_env();
    let id = create_kb(&config_path, "Empty");
    let empty = tmp.path().join("empty");
    fs::create_dir_all(&empty).unwrap();

    let (_stdout, stderr, success) = run_kb(&config_path, &["import", &id, empty.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("no files found"), "stderr: {}", stderr);
}

#[test]
fn test_note_is_searchable() {
    let (_tmp, config_path) = setup_test_env();
    let id = create_kb(&config_path, "Notes");

    let created = run_json(
        &config_path,
        &[
            "note",
            &id,
            "--title",
            "Standup",
            "--content",
            "Discussed the quarterly roadmap.",
        ],
    );
    assert!(created["documentId"].is_string());

    let found = run_json(&config_path, &["search", &id, "roadmap"]);
    assert_eq!(found["results"][0]["documentTitle"], "Standup");
}

#[test]
fn test_delete_requires_yes() {
    let (_tmp, config_path) = setup_test_env();
    let id = create_kb(&config_path, "Doomed");

    let (_stdout, stderr, success) = run_kb(&config_path, &["delete", &id]);
    assert!(!success);
    assert!(stderr.contains("precondition failed"), "stderr: {}", stderr);

    run_json(&config_path, &["delete", &id, "--yes"]);
    let listed = run_json(&config_path, &["list"]);
    assert!(listed.as_array().unwrap().is_empty());
}

#[test]
fn test_update_renames_and_clears_description() {
    let (_tmp, config_path) = setup_test_env();
    let manifest = run_json(
        &config_path,
        &["create", "Draft", "--description", "temporary"],
    );
    let id = manifest["id"].as_str().unwrap();

    let updated = run_json(
        &config_path,
        &["update", id, "--name", "Final", "--description", ""],
    );
    assert_eq!(updated["name"], "Final");
    assert!(updated.get("description").is_none());
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_stdout, stderr, success) = run_kb(&tmp.path().join("nope.toml"), &["list"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "stderr: {}", stderr);
}

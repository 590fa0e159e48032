use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn paperline_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("paperline");
    path
}

fn raw_invoice(lines: &[(&str, &str)], total: &str, due_date: Option<&str>) -> Value {
    let mut fields = vec![
        json!({"name": "Invoice No", "value": "INV-100", "confidence": 0.97}),
        json!({"name": "Vendor", "value": "Acme Consulting", "confidence": 0.96}),
        json!({"name": "Invoice Date", "value": "04/01/2024", "confidence": 0.93}),
        json!({"name": "Total", "value": total, "confidence": 0.98}),
    ];
    if let Some(due) = due_date {
        fields.push(json!({"name": "Due Date", "value": due, "confidence": 0.92}));
    }

    let mut rows = vec![json!([{"text": "Description"}, {"text": "Amount"}])];
    for (description, amount) in lines {
        rows.push(json!([{"text": description}, {"text": amount}]));
    }

    json!({
        "document_type": "invoice",
        "fields": fields,
        "tables": [{"rows": rows}],
        "text": "Invoice\n\nServices rendered under the platform build agreement.",
    })
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let extractions = root.join("extractions");
    fs::create_dir_all(&extractions).unwrap();
    fs::write(
        extractions.join("inv-clean.json"),
        raw_invoice(
            &[("Discovery workshop", "$400.00"), ("Design review", "$350.00")],
            "$750.00",
            Some("05/01/2024"),
        )
        .to_string(),
    )
    .unwrap();
    fs::write(
        extractions.join("inv-over.json"),
        raw_invoice(
            &[
                ("Travel and expenses", "$500.00"),
                ("Discovery workshop", "$400.00"),
                ("Design review", "$350.00"),
            ],
            "$1,250.00",
            Some("05/01/2024"),
        )
        .to_string(),
    )
    .unwrap();
    fs::write(extractions.join("inv-garbled.json"), "{ not json").unwrap();

    fs::write(
        root.join("reference.toml"),
        r#"
[[vendors]]
id = "v-acme"
name = "Acme Consulting LLC"

[[sows]]
id = "sow-1"
vendor_id = "v-acme"
sow_number = "SOW-2024-001"
title = "Platform build"
total_value = 1000.00

[[milestones]]
id = "m-1"
sow_id = "sow-1"
name = "Discovery workshop"
budget = 400.00

[[milestones]]
id = "m-2"
sow_id = "sow-1"
name = "Design review"
budget = 350.00
"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/paperline.sqlite"

[pipeline]
retry_ceiling = 1
backoff_base_ms = 1
backoff_max_ms = 1

[chunking]
max_tokens = 200

[extraction]
provider = "fixture"
fixture_dir = "{root}/extractions"

[server]
bind = "127.0.0.1:7341"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("paperline.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_paperline(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = paperline_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run paperline binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn seeded_env() -> (TempDir, PathBuf) {
    let (tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_paperline(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);

    let reference = tmp.path().join("reference.toml");
    let (stdout, stderr, success) = run_paperline(
        &config_path,
        &["reference", "import", reference.to_str().unwrap()],
    );
    assert!(success, "import failed: {}", stderr);
    assert!(stdout.contains("Imported 1 vendors, 1 SOWs, 2 milestones"));
    (tmp, config_path)
}

fn submit(config_path: &Path, args: &[&str]) -> Value {
    let mut full = vec!["submit"];
    full.extend_from_slice(args);
    let (stdout, stderr, success) = run_paperline(config_path, &full);
    assert!(success, "submit failed: stdout={}, stderr={}", stdout, stderr);
    serde_json::from_str(&stdout).unwrap_or_else(|e| panic!("bad JSON {:?}: {}", stdout, e))
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_paperline(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_paperline(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_paperline(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_submit_clean_invoice_is_validated() {
    let (_tmp, config_path) = seeded_env();

    let out = submit(&config_path, &["inv-clean", "--type", "invoice"]);
    assert_eq!(out["submission"]["disposition"], "started");
    assert_eq!(out["status"]["state"], "validated");
    assert_eq!(out["status"]["validation_summary"]["errors"], 0);
}

#[test]
fn test_submit_over_budget_invoice_needs_review() {
    let (_tmp, config_path) = seeded_env();

    let out = submit(&config_path, &["inv-over"]);
    assert_eq!(out["status"]["state"], "needs_review");
    assert_eq!(out["status"]["doc_type"], "invoice");
    assert_eq!(out["status"]["validation_summary"]["errors"], 1);
}

#[test]
fn test_resubmit_completed_requires_force() {
    let (_tmp, config_path) = seeded_env();

    let first = submit(&config_path, &["inv-clean"]);
    let again = submit(&config_path, &["inv-clean"]);
    assert_eq!(again["submission"]["disposition"], "completed");
    assert_eq!(
        again["submission"]["attempt_id"],
        first["submission"]["attempt_id"]
    );

    let forced = submit(&config_path, &["inv-clean", "--force"]);
    assert_eq!(forced["submission"]["disposition"], "started");
    assert_eq!(forced["status"]["attempt_no"], 2);
    assert_eq!(forced["status"]["state"], "validated");
}

#[test]
fn test_missing_fixture_fails_permanently() {
    let (_tmp, config_path) = seeded_env();

    let out = submit(&config_path, &["inv-missing"]);
    assert_eq!(out["status"]["state"], "failed");
    assert_eq!(out["status"]["retryable"], false);
    assert!(out["status"]["last_error"]
        .as_str()
        .unwrap()
        .contains("not_found"));

    let again = submit(&config_path, &["inv-missing"]);
    assert_eq!(again["submission"]["disposition"], "exhausted");
}

#[test]
fn test_garbled_fixture_fails() {
    let (_tmp, config_path) = seeded_env();

    let out = submit(&config_path, &["inv-garbled"]);
    assert_eq!(out["status"]["state"], "failed");
}

#[test]
fn test_no_process_then_work_once() {
    let (_tmp, config_path) = seeded_env();

    let out = submit(&config_path, &["inv-clean", "--no-process"]);
    assert_eq!(out["status"]["state"], "uploaded");

    let (stdout, stderr, success) = run_paperline(&config_path, &["work", "--once"]);
    assert!(success, "work failed: {}", stderr);
    let summary: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(summary["claimed"], 1);
    assert_eq!(summary["validated"], 1);

    let (stdout, _, success) = run_paperline(&config_path, &["status", "inv-clean"]);
    assert!(success);
    let status: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(status["state"], "validated");
}

#[test]
fn test_status_unknown_document() {
    let (_tmp, config_path) = seeded_env();

    let (_, stderr, success) = run_paperline(&config_path, &["status", "nope"]);
    assert!(!success, "status for an unknown ref should fail");
    assert!(stderr.contains("no document with ref"), "got: {}", stderr);
}

#[test]
fn test_stats_reports_states() {
    let (_tmp, config_path) = seeded_env();
    submit(&config_path, &["inv-clean"]);
    submit(&config_path, &["inv-over"]);

    let (stdout, _, success) = run_paperline(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Documents:   2"));
    assert!(stdout.contains("validated"));
    assert!(stdout.contains("needs_review"));
    assert!(stdout.contains("1 errors"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let (tmp, _) = setup_test_env();
    let bad = tmp.path().join("config/bad.toml");
    fs::write(&bad, "[embedding]\nprovider = \"quantum\"\n").unwrap();

    let (_, stderr, success) = run_paperline(&bad, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Unknown embedding provider"), "got: {}", stderr);
}

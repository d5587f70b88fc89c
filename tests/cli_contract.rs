use std::fs;
use std::path::Path;
use std::process::Command;

use serde_json::Value;
use tempfile::tempdir;

fn run_framelift(cwd: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_framelift"))
        .current_dir(cwd)
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("framelift command should run")
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout should be valid JSON")
}

#[test]
fn chain_json_lists_catalog_effects_in_order() {
    let dir = tempdir().expect("tempdir should create");
    let output = run_framelift(dir.path(), &["chain", "A+A", "--tier", "performance", "--json"]);
    assert!(
        output.status.success(),
        "chain --json should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let effects = stdout_json(&output);
    let effects = effects.as_array().expect("chain output should be an array");
    assert!(!effects.is_empty());
    assert_eq!(effects[0]["algorithm"], "ClampHighlights");
    for effect in effects {
        assert!(effect["id"].is_string());
        assert!(effect["name"].is_string());
    }

    let again = run_framelift(dir.path(), &["chain", "A+A", "--tier", "performance", "--json"]);
    assert_eq!(output.stdout, again.stdout, "chain output should be deterministic");
}

#[test]
fn chain_accepts_builtin_mode_ids() {
    let dir = tempdir().expect("tempdir should create");
    let output = run_framelift(dir.path(), &["chain", "builtin-mode-a"]);
    assert!(output.status.success(), "chain by mode id should succeed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ClampHighlights"), "{stdout}");
}

#[test]
fn plan_json_reports_stages_ending_at_target() {
    let dir = tempdir().expect("tempdir should create");
    let output = run_framelift(
        dir.path(),
        &[
            "plan",
            "--native",
            "960x540",
            "--target",
            "1920x1080",
            "--mode",
            "A",
            "--tier",
            "performance",
            "--json",
        ],
    );
    assert!(
        output.status.success(),
        "plan --json should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let report = stdout_json(&output);
    assert_eq!(report["native"]["width"], 960);
    assert_eq!(report["target"]["width"], 1920);
    let stages = report["stages"].as_array().expect("stages array");
    assert!(!stages.is_empty());
    assert_eq!(stages[0]["input"]["width"], 960);
    assert_eq!(stages[0]["input"]["height"], 540);
    for pair in stages.windows(2) {
        assert_eq!(pair[0]["output"], pair[1]["input"], "stages should chain");
    }
}

#[test]
fn settings_json_reflects_the_settings_file() {
    let dir = tempdir().expect("tempdir should create");
    fs::write(
        dir.path().join("framelift.yaml"),
        "synced:\n  selected_mode_id: builtin-mode-b\n  cross_origin_fix: true\nlocal:\n  performance_tier: quality\n",
    )
    .expect("settings should write");

    let output = run_framelift(dir.path(), &["settings", "--json"]);
    assert!(output.status.success(), "settings --json should succeed");
    let document = stdout_json(&output);
    assert_eq!(document["synced"]["selected_mode_id"], "builtin-mode-b");
    assert_eq!(document["synced"]["cross_origin_fix"], true);
    assert_eq!(document["local"]["performance_tier"], "quality");
}

#[test]
fn settings_flag_points_at_another_file() {
    let dir = tempdir().expect("tempdir should create");
    let path = dir.path().join("profiles").join("laptop.yaml");
    fs::create_dir_all(path.parent().expect("parent")).expect("profiles dir should create");
    fs::write(&path, "local:\n  performance_tier: ultra\n").expect("settings should write");

    let output = run_framelift(
        dir.path(),
        &["settings", "--settings", "profiles/laptop.yaml"],
    );
    assert!(output.status.success(), "settings should succeed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ultra"), "{stdout}");
}

#[test]
fn unknown_mode_exits_with_error() {
    let dir = tempdir().expect("tempdir should create");
    let output = run_framelift(dir.path(), &["chain", "not-a-mode"]);
    assert!(!output.status.success(), "unknown mode should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error["), "{stderr}");
    assert!(stderr.contains("unknown mode 'not-a-mode'"), "{stderr}");
}

#[test]
fn corrupt_settings_file_is_reported() {
    let dir = tempdir().expect("tempdir should create");
    fs::write(dir.path().join("framelift.yaml"), "synced: [unterminated\n")
        .expect("settings should write");
    let output = run_framelift(dir.path(), &["settings"]);
    assert!(!output.status.success(), "corrupt settings should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("framelift.yaml"), "{stderr}");
}

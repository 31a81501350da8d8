//! Integration tests for the command-line runner

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use image::{GrayImage, Luma};
use predicates::prelude::*;
use tempfile::TempDir;

/// White sheet with one dark fixture symbol at (100, 150)..(200, 200).
fn write_page(path: &Path) {
    let mut gray = GrayImage::from_pixel(480, 360, Luma([255]));
    for y in 150..200 {
        for x in 100..200 {
            gray.put_pixel(x, y, Luma([40]));
        }
    }
    gray.save(path).unwrap();
}

fn write_tokens(dir: &Path, sheet: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(
        dir.join(format!("{sheet}.json")),
        r#"[
            {"text": "EL501", "bounding_box": [210, 165, 250, 185], "confidence": 0.93},
            {"text": "EMERGENCY", "bounding_box": [100, 210, 180, 226], "confidence": 0.9}
        ]"#,
    )
    .unwrap();
}

#[test]
fn test_help_lists_options() {
    cargo_bin_cmd!("egress_tester")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--tokens").and(predicate::str::contains("--overlay")));
}

#[test]
fn test_pages_are_required() {
    cargo_bin_cmd!("egress_tester").assert().failure();
}

#[test]
fn test_report_and_overlay_are_written() {
    let temp = TempDir::new().unwrap();
    let page = temp.path().join("E-101.png");
    let tokens = temp.path().join("tokens");
    let report_path = temp.path().join("report.json");
    let overlays = temp.path().join("overlays");
    write_page(&page);
    write_tokens(&tokens, "E-101");

    cargo_bin_cmd!("egress_tester")
        .arg(&page)
        .arg("--tokens")
        .arg(&tokens)
        .arg("--out")
        .arg(&report_path)
        .arg("--overlay")
        .arg(&overlays)
        .assert()
        .success();

    let report: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["status"], "complete");

    let fixtures = report["fixtures"].as_array().unwrap();
    let labelled: Vec<&serde_json::Value> = fixtures.iter().filter(|f| f["symbol"] == "EL501").collect();
    assert_eq!(labelled.len(), 1);
    assert_eq!(labelled[0]["type"], "emergency_light");
    assert_eq!(labelled[0]["source_sheet"], "E-101");
    assert_eq!(labelled[0]["text_nearby"], serde_json::json!(["EMERGENCY"]));

    let group = &report["summary"]["Emergency Lighting Fixture"];
    assert_eq!(group["count"], 1);
    assert_eq!(group["symbols"], serde_json::json!(["EL501"]));

    assert!(overlays.join("E-101.overlay.png").is_file());
}

#[test]
fn test_unreadable_page_gives_partial_report() {
    let temp = TempDir::new().unwrap();
    let good = temp.path().join("E-101.png");
    let bad = temp.path().join("E-102.png");
    write_page(&good);
    std::fs::write(&bad, b"not a png").unwrap();

    let output = cargo_bin_cmd!("egress_tester")
        .arg(&good)
        .arg(&bad)
        .assert()
        .code(2)
        .get_output()
        .stdout
        .clone();

    let report: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(report["status"], "partial");
    assert_eq!(report["pages"][0]["status"]["state"], "complete");
    assert_eq!(report["pages"][1]["status"]["state"], "failed");
    assert!(!report["fixtures"].as_array().unwrap().is_empty());
}

#[test]
fn test_missing_token_directory_is_an_error() {
    let temp = TempDir::new().unwrap();
    let page = temp.path().join("E-101.png");
    write_page(&page);

    cargo_bin_cmd!("egress_tester")
        .arg(&page)
        .arg("--tokens")
        .arg(temp.path().join("missing"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_refinements_replace_descriptions() {
    let temp = TempDir::new().unwrap();
    let page = temp.path().join("E-101.png");
    let tokens = temp.path().join("tokens");
    let revisions = temp.path().join("revisions.json");
    write_page(&page);
    write_tokens(&tokens, "E-101");
    std::fs::write(
        &revisions,
        r#"[{"index": 0, "type": "emergency_exit", "description": "Exit/Emergency Combo Unit"}]"#,
    )
    .unwrap();

    let output = cargo_bin_cmd!("egress_tester")
        .arg(&page)
        .arg("--tokens")
        .arg(&tokens)
        .arg("--refinements")
        .arg(&revisions)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let report: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(report["fixtures"][0]["type"], "emergency_exit");
    assert_eq!(report["fixtures"][0]["description"], "Exit/Emergency Combo Unit");
    assert!(report["summary"]["Exit/Emergency Combo Unit"].is_object());
}

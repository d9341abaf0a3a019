#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

fn abt_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_abt"))
}

fn abt_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(abt_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run abt command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn temp_db_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("abt-contract-{label}-{}.sqlite3", Ulid::new()))
}

fn track(db_path: &Path, kind: &str, test_name: &str, variant: &str) {
    let output = abt_output(
        db_path,
        &[
            "track",
            kind,
            "--test-name",
            test_name,
            "--variant",
            variant,
        ],
    );
    assert!(
        output.status.success(),
        "track {kind} failed: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(abt_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["track", "stats", "export"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn track_then_stats_list_json_contract() {
    let db_path = temp_db_path("stats-json");

    track(&db_path, "view", "button_color", "blue");
    track(&db_path, "view", "button_color", "blue");
    track(&db_path, "view", "button_color", "red");
    track(&db_path, "conversion", "button_color", "blue");

    let output = abt_output(&db_path, &["stats", "list", "--json"]);
    assert!(output.status.success());
    let value = stdout_json(&output);

    let tests = match value["tests"].as_array() {
        Some(tests) => tests,
        None => panic!("missing tests array in stats output: {value}"),
    };
    assert_eq!(tests.len(), 1);
    assert_eq!(tests[0]["test_name"], "button_color");

    let variants = match tests[0]["variants"].as_array() {
        Some(variants) => variants,
        None => panic!("missing variants array in stats output: {value}"),
    };
    assert_eq!(variants.len(), 2);
    assert_eq!(variants[0]["variant"], "blue");
    assert_eq!(variants[0]["views"], 2);
    assert_eq!(variants[0]["conversions"], 1);
    assert_eq!(variants[0]["conversion_rate"], 50.0);
    assert_eq!(variants[1]["variant"], "red");
    assert_eq!(variants[1]["views"], 1);
    assert_eq!(variants[1]["conversions"], 0);

    assert_eq!(tests[0]["totals"]["views"], 3);
    assert_eq!(tests[0]["totals"]["conversions"], 1);
    assert_eq!(tests[0]["totals"]["conversion_rate"], 33.33);

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn stats_list_filters_by_test_name() {
    let db_path = temp_db_path("stats-filter");

    track(&db_path, "view", "banner", "A");
    track(&db_path, "view", "cta", "red");

    let output = abt_output(
        &db_path,
        &["stats", "list", "--test-name", "banner", "--json"],
    );
    assert!(output.status.success());
    let value = stdout_json(&output);

    let tests = match value["tests"].as_array() {
        Some(tests) => tests,
        None => panic!("missing tests array in stats output: {value}"),
    };
    assert_eq!(tests.len(), 1);
    assert_eq!(tests[0]["test_name"], "banner");

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn empty_test_name_is_rejected_without_mutation() {
    let db_path = temp_db_path("invalid-input");

    let output = abt_output(
        &db_path,
        &["track", "view", "--test-name", "  ", "--variant", "A"],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("invalid input"),
        "expected invalid input error, got: {stderr}"
    );

    let stats = abt_output(&db_path, &["stats", "list"]);
    assert!(stats.status.success());
    let stdout = String::from_utf8_lossy(&stats.stdout);
    assert!(
        stdout.contains("No A/B test data recorded yet."),
        "expected empty-store notice, got: {stdout}"
    );

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn csv_export_row_count_matches_counters() {
    let db_path = temp_db_path("export-csv");

    track(&db_path, "view", "banner", "A");
    track(&db_path, "view", "banner", "B");
    track(&db_path, "view", "cta", "red");
    track(&db_path, "conversion", "cta", "red");

    let export_path = std::env::temp_dir().join(format!("abt-export-{}.csv", Ulid::new()));
    let export_path_str = match export_path.to_str() {
        Some(value) => value.to_string(),
        None => panic!("temp export path must be valid UTF-8"),
    };

    let output = abt_output(&db_path, &["export", "csv", "--output", &export_path_str]);
    assert!(
        output.status.success(),
        "export csv failed: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );

    let bytes = match std::fs::read(&export_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to read exported CSV: {err}"),
    };
    assert_eq!(&bytes[..3], &[0xEF, 0xBB, 0xBF]);

    let text = String::from_utf8_lossy(&bytes[3..]).to_string();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4, "3 counter rows plus one header expected");
    assert_eq!(
        lines[0],
        "Test Name,Variant,Views,Conversions,Conversion Rate (%)"
    );
    assert_eq!(lines[3], "cta,red,1,1,100");

    let _ = std::fs::remove_file(&db_path);
    let _ = std::fs::remove_file(&export_path);
}

#[test]
fn json_export_totals_sum_variants() {
    let db_path = temp_db_path("export-json");

    track(&db_path, "view", "banner", "A");
    track(&db_path, "view", "banner", "A");
    track(&db_path, "view", "banner", "B");
    track(&db_path, "conversion", "banner", "A");

    let export_path = std::env::temp_dir().join(format!("abt-export-{}.json", Ulid::new()));
    let export_path_str = match export_path.to_str() {
        Some(value) => value.to_string(),
        None => panic!("temp export path must be valid UTF-8"),
    };

    let output = abt_output(&db_path, &["export", "json", "--output", &export_path_str]);
    assert!(
        output.status.success(),
        "export json failed: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );

    let bytes = match std::fs::read(&export_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to read exported JSON: {err}"),
    };
    let value: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => panic!("exported JSON is invalid: {err}"),
    };

    assert!(value["exported_at"].is_string());
    let tests = match value["tests"].as_array() {
        Some(tests) => tests,
        None => panic!("missing tests array in export: {value}"),
    };
    assert_eq!(tests.len(), 1);

    let variants = match tests[0]["variants"].as_array() {
        Some(variants) => variants,
        None => panic!("missing variants array in export: {value}"),
    };
    let variant_views: u64 = variants
        .iter()
        .map(|variant| variant["views"].as_u64().unwrap_or(0))
        .sum();
    assert_eq!(tests[0]["totals"]["views"].as_u64(), Some(variant_views));
    assert_eq!(tests[0]["totals"]["conversions"], 1);

    let _ = std::fs::remove_file(&db_path);
    let _ = std::fs::remove_file(&export_path);
}

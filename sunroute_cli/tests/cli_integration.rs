use assert_cmd::prelude::*;
use predicates::prelude::*;
use rstest::rstest;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tempfile::tempdir;

// One dimmed water heater on the simulated board
const VALID: &str = r#"
[grid]
nominal_frequency_hz = 50

[zcd]
pin = 35

[[outputs]]
name = "water"
dimmer_pin = 25
resistance_ohm = 52.9

[[relays]]
name = "pool"
pin = 27
nominal_load_w = 800
"#;

fn write_config(dir: &tempfile::TempDir, toml: &str) -> PathBuf {
    let path = dir.path().join("cfg.toml");
    fs::write(&path, toml).unwrap();
    path
}

#[rstest]
#[case(&["--help"], VALID, 0, "Usage:", "stdout")]
#[case(&["run", "--duration-s", "5"], VALID, 0, "simulation complete", "stdout")]
#[case(&["run", "--duration-s", "5"], VALID, 0, "output water", "stdout")]
#[case(&["self-check"], VALID, 0, "self-check ok", "stdout")]
#[case(&["run"], "[grid]\nnominal_frequency_hz = 55\n", 3, "Invalid configuration", "stderr")]
#[case(&["run"], "[pid\nkp = 1\n", 3, "not valid TOML", "stderr")]
#[case(&["self-check"], "[[relays]]\nname = \"pool\"\npin = 36\n", 4, "relay 'pool'", "stderr")]
#[case(&["run", "--solar-w"], VALID, 2, "value is required", "stderr")]
fn cli_table_cases(
    #[case] args: &[&str],
    #[case] config: &str,
    #[case] exit_code: i32,
    #[case] needle: &str,
    #[case] stream: &str,
) {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, config);

    let mut cmd = Command::cargo_bin("sunroute").unwrap();
    cmd.arg("--config").arg(&cfg);
    for a in args {
        cmd.arg(a);
    }

    let assert = cmd.assert().code(exit_code);
    match stream {
        "stdout" => {
            assert.stdout(predicate::str::contains(needle));
        }
        "stderr" => {
            assert.stderr(predicate::str::contains(needle));
        }
        other => panic!("unknown stream: {other}"),
    }
}

#[test]
fn run_json_reports_routed_energy() {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, VALID);

    let out = Command::cargo_bin("sunroute")
        .unwrap()
        .arg("--config")
        .arg(&cfg)
        .arg("--json")
        .args(["run", "--duration-s", "10", "--solar-w", "2500", "--house-w", "400"])
        .output()
        .unwrap();
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let stdout = String::from_utf8(out.stdout).unwrap();
    let line = stdout.lines().last().expect("summary line");
    let v: serde_json::Value = serde_json::from_str(line).unwrap();
    assert!(v["simulated_ms"].as_u64().unwrap() >= 10_000);
    assert!(v["passes"].as_u64().unwrap() > 500);
    assert!(v["routed_wh"].as_f64().unwrap() > 0.0);
    assert!(v["counters"]["divert_runs"].as_u64().unwrap() > 0);
    assert_eq!(v["outputs"][0]["name"], "water");
    assert_eq!(v["relays"][0]["name"], "pool");
}

#[test]
fn missing_config_file_is_explained() {
    let dir = tempdir().unwrap();
    Command::cargo_bin("sunroute")
        .unwrap()
        .arg("--config")
        .arg(dir.path().join("nope.toml"))
        .arg("self-check")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn json_errors_carry_a_reason() {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, "[pid]\nkp = -1.0\n");
    let out = Command::cargo_bin("sunroute")
        .unwrap()
        .arg("--config")
        .arg(&cfg)
        .arg("--json")
        .arg("self-check")
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(3));
    let stderr = String::from_utf8(out.stderr).unwrap();
    let line = stderr.lines().last().unwrap();
    let v: serde_json::Value = serde_json::from_str(line).unwrap();
    assert_eq!(v["reason"], "invalid_config");
    assert!(v["message"].as_str().unwrap().contains("pid.kp"));
}

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const SETTINGS: &str = r#"
agent_configurations:
  vanilla:
    persuader: gpt
  fallacy:
    persuader: gpt
    helper: fallacy-checker
  mixed:
    persuader: claude
"#;

fn bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_debate-batch"));
    cmd.env_remove("RUST_LOG");
    cmd
}

fn write_settings(dir: &Path) -> PathBuf {
    let path = dir.join("settings.yaml");
    fs::write(&path, SETTINGS).expect("write settings");
    path
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// Debate stand-in: records its arguments and fails for the `fallacy` helper.
fn fake_debate_args(dir: &Path) -> Vec<String> {
    vec![
        "--workdir".to_string(),
        dir.display().to_string(),
        "--command".to_string(),
        "sh".to_string(),
        "--command".to_string(),
        "-c".to_string(),
        "--command".to_string(),
        "printf '%s\\n' \"$*\" >> calls.txt; test \"$2\" != fallacy".to_string(),
        "--command".to_string(),
        "debate".to_string(),
    ]
}

#[test]
fn list_helpers_prints_settings_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = write_settings(dir.path());
    let output = bin()
        .arg("list-helpers")
        .arg("--settings-path")
        .arg(&settings)
        .output()
        .expect("run");
    assert!(output.status.success());
    assert_eq!(
        stdout(&output),
        "Available helper types:\n  - vanilla\n  - fallacy\n  - mixed\n"
    );
}

#[test]
fn run_list_helpers_flag_accepts_underscore_spelling() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = write_settings(dir.path());
    let output = bin()
        .args(["run", "--list_helpers", "--settings_path"])
        .arg(&settings)
        .output()
        .expect("run");
    assert!(output.status.success());
    assert!(stdout(&output).contains("  - fallacy"));
}

#[cfg(unix)]
#[test]
fn failing_helper_makes_the_batch_exit_nonzero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = write_settings(dir.path());
    let output = bin()
        .arg("run")
        .arg("--settings-path")
        .arg(&settings)
        .args(fake_debate_args(dir.path()))
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(1));

    let out = stdout(&output);
    assert!(out.contains("No helper types specified, using all available"));
    assert!(out.contains("Planning to run 3 debate configurations:"));
    assert!(out.contains("  2. fallacy - all claims"));
    assert!(out.contains("Total runs: 3\nSuccessful: 2\nFailed: 1\n"));
    assert!(!out.contains("All runs completed successfully!"));

    let calls = fs::read_to_string(dir.path().join("calls.txt")).expect("calls");
    let helpers: Vec<&str> = calls
        .lines()
        .map(|l| l.split_whitespace().nth(1).unwrap_or_default())
        .collect();
    assert_eq!(helpers, vec!["vanilla", "fallacy", "mixed"]);
}

#[cfg(unix)]
#[test]
fn sequential_claims_run_one_process_each() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = write_settings(dir.path());
    let output = bin()
        .arg("run")
        .arg("--settings-path")
        .arg(&settings)
        .args(["--helper-types", "vanilla", "--claim-indexes", "1", "2", "--sequential"])
        .args(fake_debate_args(dir.path()))
        .output()
        .expect("run");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let out = stdout(&output);
    assert!(out.contains("  1. vanilla - claim 1\n  2. vanilla - claim 2\n"));
    assert!(out.contains("All runs completed successfully!"));

    let calls = fs::read_to_string(dir.path().join("calls.txt")).expect("calls");
    let lines: Vec<&str> = calls.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("--helper_type vanilla --claim_index 1 --settings_path "));
    assert!(lines[1].starts_with("--helper_type vanilla --claim_index 2 --settings_path "));
}

#[cfg(unix)]
#[test]
fn unknown_helper_type_runs_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = write_settings(dir.path());
    let output = bin()
        .arg("run")
        .arg("--settings-path")
        .arg(&settings)
        .args(["--helper-types", "vanilla", "bogus"])
        .args(fake_debate_args(dir.path()))
        .output()
        .expect("run");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("bogus"), "{}", stderr);
    assert!(!dir.path().join("calls.txt").exists());
}

#[test]
fn missing_settings_file_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = bin()
        .args(["run", "--json", "--settings-path"])
        .arg(dir.path().join("absent.yaml"))
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(1));
    let payload: Value = serde_json::from_str(stdout(&output).trim()).expect("json");
    assert_eq!(payload["ok"], Value::Bool(false));
    assert_eq!(payload["command"], "run");
    assert_eq!(payload["error"]["code"], "settings_invalid");
    assert!(payload["error"]["message"]
        .as_str()
        .unwrap_or_default()
        .contains("absent.yaml"));
}

#[test]
fn json_failure_names_the_rejected_helper_type() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = write_settings(dir.path());
    let output = bin()
        .args(["run", "--json", "--helper-types", "bogus", "--settings-path"])
        .arg(&settings)
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(1));
    let payload: Value = serde_json::from_str(stdout(&output).trim()).expect("json");
    assert_eq!(payload["error"]["code"], "unknown_helper_type");
    assert!(payload["error"]["message"]
        .as_str()
        .unwrap_or_default()
        .contains("bogus"));
}

#[cfg(unix)]
#[test]
fn json_run_reports_plan_and_summary() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = write_settings(dir.path());
    let output = bin()
        .args(["run", "--json", "--helper-types", "mixed", "--claim-indexes", "3"])
        .arg("--settings-path")
        .arg(&settings)
        .args(fake_debate_args(dir.path()))
        .output()
        .expect("run");
    assert!(output.status.success());
    let payload: Value = serde_json::from_str(stdout(&output).trim()).expect("json");
    assert_eq!(payload["ok"], Value::Bool(true));
    assert_eq!(payload["plan"][0]["helper_type"], "mixed");
    assert_eq!(payload["plan"][0]["claim_index"], 3);
    assert_eq!(payload["summary"]["total"], 1);
    assert_eq!(payload["summary"]["failed"], 0);
}

#[cfg(unix)]
#[test]
fn log_config_routes_system_events_to_a_channel_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = write_settings(dir.path());
    let log_config = dir.path().join("logging.yaml");
    let system_log = dir.path().join("logs/system.jsonl");
    fs::write(
        &log_config,
        format!(
            "channels:\n  - name: system\n    path: {}\n    filter: {{ tag: system }}\n    fmt_keys:\n      level: levelname\n      message: message\n",
            system_log.display()
        ),
    )
    .expect("write log config");

    let output = bin()
        .arg("--log-config")
        .arg(&log_config)
        .args(["run", "--helper-types", "vanilla", "--settings-path"])
        .arg(&settings)
        .args(fake_debate_args(dir.path()))
        .output()
        .expect("run");
    assert!(output.status.success());

    let written = fs::read_to_string(&system_log).expect("system log");
    let lines: Vec<Value> = written
        .lines()
        .map(|l| serde_json::from_str(l).expect("json line"))
        .collect();
    assert!(lines
        .iter()
        .any(|l| l["message"].as_str() == Some("[1/1] Running vanilla all claims")));
    assert!(lines.iter().all(|l| l["msg_type"] == "system"));
}

#[test]
fn record_appends_rows_to_the_table() {
    let dir = tempfile::tempdir().expect("tempdir");
    let table = dir.path().join("out/summary.csv");
    for (chat, result) in [("chat-1", "1"), ("chat-2", "0")] {
        let output = bin()
            .arg("record")
            .arg("--table")
            .arg(&table)
            .args([
                "--topic-id",
                "t7",
                "--claim",
                "Cats, not dogs",
                "--helper-type",
                "vanilla",
                "--result",
                result,
                "--rounds",
                "4",
                "--chat-id",
                chat,
            ])
            .output()
            .expect("run");
        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    }
    let written = fs::read_to_string(&table).expect("table");
    assert_eq!(
        written.lines().collect::<Vec<_>>(),
        vec![
            "topic_id,claim,helper_type,result,rounds,chat_id",
            "t7,\"Cats, not dogs\",vanilla,1,4,chat-1",
            "t7,\"Cats, not dogs\",vanilla,0,4,chat-2",
        ]
    );
}

#[test]
fn record_rejects_out_of_range_result() {
    let dir = tempfile::tempdir().expect("tempdir");
    let table = dir.path().join("summary.csv");
    let output = bin()
        .args(["record", "--json", "--table"])
        .arg(&table)
        .args([
            "--topic-id", "t1", "--claim", "c", "--helper-type", "vanilla", "--result", "7",
            "--rounds", "1", "--chat-id", "x",
        ])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(1));
    let payload: Value = serde_json::from_str(stdout(&output).trim()).expect("json");
    assert_eq!(payload["ok"], Value::Bool(false));
    assert_eq!(payload["command"], "record");
    assert_eq!(payload["error"]["message"], "invalid --result");
    assert!(payload["error"]["causes"][0]
        .as_str()
        .unwrap_or_default()
        .contains("invalid outcome code 7"));
    assert!(!table.exists());
}

#[test]
fn parallel_record_processes_each_land_one_row() {
    let dir = tempfile::tempdir().expect("tempdir");
    let table = dir.path().join("shared/summary.csv");
    let writers = 20;

    let children: Vec<_> = (0..writers)
        .map(|i| {
            bin()
                .arg("record")
                .arg("--table")
                .arg(&table)
                .args(["--topic-id", &format!("t{}", i), "--claim", "shared claim"])
                .args(["--helper-type", "vanilla", "--result", "1", "--rounds", "3"])
                .args(["--chat-id", &format!("chat-{}", i)])
                .spawn()
                .expect("spawn record")
        })
        .collect();
    for child in children {
        let output = child.wait_with_output().expect("wait");
        assert!(output.status.success());
    }

    let written = fs::read_to_string(&table).expect("table");
    let mut lines = written.lines();
    assert_eq!(
        lines.next(),
        Some("topic_id,claim,helper_type,result,rounds,chat_id")
    );
    let mut chats: Vec<String> = lines
        .map(|line| {
            let fields: Vec<&str> = line.split(',').collect();
            assert_eq!(fields.len(), 6, "malformed row {:?}", line);
            fields[5].to_string()
        })
        .collect();
    assert_eq!(chats.len(), writers);
    chats.sort();
    chats.dedup();
    assert_eq!(chats.len(), writers);
}

use std::fs;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

fn area_args(root: &Path) -> Vec<String> {
    let mut args = Vec::new();
    for (flag, dir) in [
        ("--tasks", "a_tasks"),
        ("--running", "b_running"),
        ("--finished", "c_finished"),
        ("--failed", "d_failed"),
        ("--logs", "logs"),
    ] {
        args.push(flag.to_string());
        args.push(root.join(dir).display().to_string());
    }
    args
}

fn fast_args() -> Vec<&'static str> {
    vec!["--poll", "0.1", "--jitter", "0", "--post-move-delay", "0"]
}

fn dirqueue(root: &Path, extra: &[&str]) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_dirqueue"));
    command
        .args(area_args(root))
        .args(extra)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command
}

fn add_task(root: &Path, file: &str, command: &str) {
    let pending = root.join("a_tasks");
    fs::create_dir_all(&pending).expect("create pending");
    fs::write(pending.join(file), format!("{}\n", command)).expect("write task");
}

fn names_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter_map(|entry| entry.file_name().into_string().ok())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

fn wait_for_file(path: &Path, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

#[cfg(unix)]
fn send_sigint(child: &Child) {
    let status = Command::new("kill")
        .arg("-INT")
        .arg(child.id().to_string())
        .status()
        .expect("run kill");
    assert!(status.success(), "kill -INT failed");
}

fn finish(child: Child) -> Output {
    child.wait_with_output().expect("wait for dirqueue")
}

#[test]
fn two_workers_sort_tasks_into_finished_and_failed() {
    let temp = TempDir::new().expect("temp dir");
    let root = temp.path();
    add_task(root, "A.txt", "true");
    add_task(root, "B.txt", "echo B ran");
    add_task(root, "C.txt", "exit 1");

    let mut args = fast_args();
    args.extend(["--workers", "2", "--idle-timeout", "1"]);
    let output = dirqueue(root, &args).output().expect("run dirqueue");

    assert!(
        output.status.success(),
        "expected exit 0, got {:?}; stderr: {}",
        output.status.code(),
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(names_in(&root.join("c_finished")), vec!["A.txt", "B.txt"]);
    assert_eq!(names_in(&root.join("d_failed")), vec!["C.txt"]);
    assert!(names_in(&root.join("a_tasks")).is_empty());
    assert!(names_in(&root.join("b_running")).is_empty());

    let record = fs::read_to_string(root.join("logs/B.log")).expect("run record");
    assert!(record.contains("B ran"), "got: {record}");
    assert!(record.contains("RETURN_CODE: 0"), "got: {record}");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("claim worker="), "got: {stdout}");
    assert!(stdout.contains("shutdown reason=idle_timeout"), "got: {stdout}");
}

#[test]
fn empty_queue_exits_once_idle_timeout_elapses() {
    let temp = TempDir::new().expect("temp dir");
    let root = temp.path();

    let mut args = fast_args();
    args.extend(["--workers", "2", "--idle-timeout", "2", "--poll", "0.5"]);
    let started = Instant::now();
    let output = dirqueue(root, &args).output().expect("run dirqueue");
    let elapsed = started.elapsed();

    assert_eq!(output.status.code(), Some(0));
    assert!(elapsed >= Duration::from_secs(2), "exited early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(6), "exited late: {elapsed:?}");
    for dir in ["a_tasks", "b_running", "c_finished", "d_failed"] {
        assert!(root.join(dir).is_dir(), "{dir} should have been created");
    }
}

#[test]
fn status_json_reports_area_counts() {
    let temp = TempDir::new().expect("temp dir");
    let root = temp.path();
    add_task(root, "one.txt", "true");
    add_task(root, "two.txt", "true");
    for dir in ["b_running", "c_finished", "d_failed"] {
        fs::create_dir_all(root.join(dir)).expect("create area");
    }
    fs::write(root.join("b_running/busy.txt"), "sleep 5\n").expect("write running");

    let output = dirqueue(root, &["status", "--json"])
        .output()
        .expect("run dirqueue status");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("status output is JSON");
    assert_eq!(value["pending"], 2);
    assert_eq!(value["running"], 1);
    assert_eq!(value["finished"], 0);
    assert_eq!(value["failed"], 0);
    assert_eq!(value["running_tasks"][0], "busy.txt");
    assert_eq!(names_in(&root.join("b_running")), vec!["busy.txt"]);
}

#[test]
fn invalid_config_exits_with_code_one() {
    let temp = TempDir::new().expect("temp dir");
    let config = temp.path().join("dirqueue.yml");
    fs::write(&config, "tasks_dir: a\nworkers: many\n").expect("write config");

    let output = Command::new(env!("CARGO_BIN_EXE_dirqueue"))
        .arg("--config")
        .arg(&config)
        .stdin(Stdio::null())
        .output()
        .expect("run dirqueue");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("workers"), "got: {stderr:?}");
}

#[test]
fn unwritable_store_root_exits_with_code_one() {
    let temp = TempDir::new().expect("temp dir");
    let blocker = temp.path().join("not-a-dir");
    fs::write(&blocker, "").expect("write file");

    let output = Command::new(env!("CARGO_BIN_EXE_dirqueue"))
        .arg("--tasks")
        .arg(blocker.join("a"))
        .arg("--running")
        .arg(blocker.join("b"))
        .arg("--finished")
        .arg(blocker.join("c"))
        .stdin(Stdio::null())
        .output()
        .expect("run dirqueue");

    assert_eq!(output.status.code(), Some(1));
}

#[cfg(unix)]
#[test]
fn first_signal_drains_in_flight_task() {
    let temp = TempDir::new().expect("temp dir");
    let root = temp.path();
    add_task(root, "slow.txt", "sleep 1");

    let mut args = fast_args();
    args.extend(["--idle-timeout", "0"]);
    let child = dirqueue(root, &args).spawn().expect("spawn dirqueue");

    assert!(wait_for_file(&root.join("b_running/slow.txt"), Duration::from_secs(10)));
    send_sigint(&child);
    let output = finish(child);

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(names_in(&root.join("c_finished")), vec!["slow.txt"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("shutdown reason=signal"), "got: {stdout}");
}

#[cfg(unix)]
#[test]
fn second_signal_terminates_and_leaves_task_running() {
    let temp = TempDir::new().expect("temp dir");
    let root = temp.path();
    let marker = root.join("survived");
    add_task(
        root,
        "stuck.txt",
        &format!("(sleep 2; touch '{}'); sleep 60", marker.display()),
    );

    let mut args = fast_args();
    args.extend(["--idle-timeout", "0"]);
    let started = Instant::now();
    let child = dirqueue(root, &args).spawn().expect("spawn dirqueue");

    assert!(wait_for_file(&root.join("b_running/stuck.txt"), Duration::from_secs(10)));
    send_sigint(&child);
    thread::sleep(Duration::from_millis(300));
    send_sigint(&child);
    let output = finish(child);

    assert_eq!(output.status.code(), Some(130));
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(names_in(&root.join("b_running")), vec!["stuck.txt"]);
    thread::sleep(Duration::from_millis(2500));
    assert!(!marker.exists(), "job subshell outlived the runner");
}

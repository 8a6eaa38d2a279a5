use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn appvisor(home: &Path) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("appvisor").into();
    cmd.env("APPVISOR_HOME", home);
    cmd.env_remove("APPVISOR_LOG");
    cmd.timeout(Duration::from_secs(30));
    cmd
}

fn kill_daemon(home: &Path) {
    let _ = appvisor(home).arg("kill").output();
    std::thread::sleep(Duration::from_millis(300));
}

fn add_sleeper(home: &Path, id: &str, instances: &str) {
    appvisor(home)
        .args(["add", "-i", instances, "--start", id, "sleep", "999"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("created {id}")));
}

fn status_json(home: &Path, id: &str) -> serde_json::Value {
    let output = appvisor(home)
        .args(["--json", "status", id])
        .output()
        .unwrap();
    assert!(output.status.success(), "status failed: {output:?}");
    serde_json::from_slice(&output.stdout).unwrap()
}

fn worker_ids(info: &serde_json::Value) -> Vec<u64> {
    info["status"]["workers"]
        .as_array()
        .map(|workers| workers.iter().filter_map(|w| w["id"].as_u64()).collect())
        .unwrap_or_default()
}

#[test]
fn test_e2e_add_start_and_list() {
    let dir = TempDir::new().unwrap();
    let home = dir.path();

    add_sleeper(home, "web", "2");
    appvisor(home)
        .args(["add", "worker", "sleep", "999"])
        .assert()
        .success();

    let output = appvisor(home).arg("list").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);

    let web_line = stdout
        .lines()
        .find(|l| l.contains("web"))
        .expect("web should appear in list output");
    assert!(
        web_line.contains("online") && web_line.contains("2/2"),
        "web should be online with 2 workers, got: {web_line}"
    );

    let worker_line = stdout
        .lines()
        .find(|l| l.contains("worker"))
        .expect("worker should appear in list output");
    assert!(
        worker_line.contains("stopped"),
        "worker was never started, got: {worker_line}"
    );

    appvisor(home).args(["rm", "web"]).assert().success();
    kill_daemon(home);
}

#[test]
fn test_e2e_reload_replaces_workers() {
    let dir = TempDir::new().unwrap();
    let home = dir.path();

    add_sleeper(home, "web", "2");
    let before = status_json(home, "web");
    assert_eq!(worker_ids(&before), vec![1, 2]);

    appvisor(home)
        .args(["reload", "web"])
        .assert()
        .success()
        .stdout(predicate::str::contains("reloaded web"));

    let after = status_json(home, "web");
    assert_eq!(after["status"]["killCount"], 2);
    assert_eq!(after["status"]["pid"], before["status"]["pid"]);
    assert_eq!(worker_ids(&after), vec![3, 4]);

    appvisor(home)
        .args(["reload", "--instant", "web"])
        .assert()
        .success();
    assert_eq!(worker_ids(&status_json(home, "web")), vec![5, 6]);

    appvisor(home).args(["rm", "web"]).assert().success();
    kill_daemon(home);
}

#[test]
fn test_e2e_stop_and_restart() {
    let dir = TempDir::new().unwrap();
    let home = dir.path();

    add_sleeper(home, "web", "1");
    let first_pid = status_json(home, "web")["status"]["pid"].clone();

    appvisor(home)
        .args(["stop", "web"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stopped web"));
    assert!(status_json(home, "web")["status"].is_null());

    appvisor(home)
        .args(["restart", "--force", "web"])
        .assert()
        .success()
        .stdout(predicate::str::contains("restarted web"));
    let restarted = status_json(home, "web");
    assert_eq!(restarted["status"]["status"], "ONLINE");
    assert_ne!(restarted["status"]["pid"], first_pid);

    appvisor(home).args(["rm", "web"]).assert().success();
    kill_daemon(home);
}

#[test]
fn test_e2e_status_shows_config() {
    let dir = TempDir::new().unwrap();
    let home = dir.path();

    appvisor(home)
        .args(["add", "-i", "3", "-e", "PORT=8080", "api", "node", "server.js"])
        .assert()
        .success();

    appvisor(home)
        .args(["status", "api"])
        .assert()
        .success()
        .stdout(predicate::str::contains("api"))
        .stdout(predicate::str::contains("stopped"))
        .stdout(predicate::str::contains("PORT=8080"));

    let info = status_json(home, "api");
    assert_eq!(info["config"]["execPath"], "node");
    assert_eq!(info["config"]["args"], serde_json::json!(["server.js"]));
    assert_eq!(info["config"]["instances"], 3);

    kill_daemon(home);
}

#[test]
fn test_e2e_errors() {
    let dir = TempDir::new().unwrap();
    let home = dir.path();

    appvisor(home)
        .args(["stop", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("app 'ghost' not found"));

    appvisor(home)
        .args(["add", "x", "sleep", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid id"));

    appvisor(home).args(["add", "api", "sleep", "1"]).assert().success();
    appvisor(home)
        .args(["add", "--create-only", "api", "sleep", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    appvisor(home)
        .args(["add", "--start", "broken", "/definitely/not/here"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to start"));

    kill_daemon(home);
}

#[test]
fn test_e2e_kill_without_daemon() {
    let dir = TempDir::new().unwrap();

    appvisor(dir.path())
        .arg("kill")
        .assert()
        .success()
        .stdout(predicate::str::contains("daemon is not running"));
}

#[test]
fn test_e2e_remove_deletes_app() {
    let dir = TempDir::new().unwrap();
    let home = dir.path();

    add_sleeper(home, "web", "1");
    appvisor(home)
        .args(["remove", "web"])
        .assert()
        .success()
        .stdout(predicate::str::contains("removed web"));

    appvisor(home)
        .args(["status", "web"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
    assert!(!home.join("apps").join("web").exists());

    kill_daemon(home);
}

#[test]
fn test_e2e_add_resolves_against_the_invoking_directory() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let home = dir.path().join("home");
    let work = dir.path().join("site");
    std::fs::create_dir_all(&work).unwrap();
    let work = work.canonicalize().unwrap();
    let script = work.join("server");
    std::fs::write(&script, "#!/bin/sh\necho \"listening on $PORT\"\nexec sleep 999\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    appvisor(&home)
        .current_dir(&work)
        .args(["add", "-i", "1", "--port", "8080", "--start", "web", "./server"])
        .assert()
        .success()
        .stdout(predicate::str::contains("created web"));

    let info = status_json(&home, "web");
    let cwd = info["config"]["cwd"].as_str().unwrap();
    let exec_path = info["config"]["execPath"].as_str().unwrap();
    assert_eq!(Path::new(cwd), work);
    assert!(Path::new(exec_path).is_absolute(), "exec path: {exec_path}");
    assert!(exec_path.starts_with(cwd), "exec path: {exec_path}");
    assert_eq!(info["config"]["env"]["PORT"], "8080");
    assert_eq!(info["status"]["status"], "ONLINE");
    assert_eq!(worker_ids(&info), vec![1]);

    // A bare program name is still looked up on PATH
    appvisor(&home)
        .current_dir(&work)
        .args(["add", "--cwd", "logs", "tail", "sleep", "999"])
        .assert()
        .success();
    let info = status_json(&home, "tail");
    assert_eq!(info["config"]["execPath"], "sleep");
    assert_eq!(Path::new(info["config"]["cwd"].as_str().unwrap()), work.join("logs"));

    appvisor(&home).args(["rm", "web"]).assert().success();
    kill_daemon(&home);
}

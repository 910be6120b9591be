//! End-to-end tests of the `fieldscan` binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn fieldscan() -> Command {
    let mut cmd = Command::cargo_bin("fieldscan").unwrap();
    cmd.env_remove("FIELDSCAN_CONFIG").env("RUST_LOG", "warn");
    cmd
}

#[test]
fn test_config_prints_defaults() {
    fieldscan()
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[cycle]"))
        .stdout(predicate::str::contains("interval_secs = 30"))
        .stdout(predicate::str::contains("confidence_floor = 0.5"));
}

#[test]
fn test_config_check_rejects_invalid_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fieldscan.toml");
    std::fs::write(&path, "[classifier]\nconfidence_floor = 1.5\n").unwrap();

    fieldscan()
        .args(["config", "--check", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("confidence_floor"));
}

#[test]
fn test_status_requires_snapshot_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fieldscan.toml");
    std::fs::write(&path, "[cycle]\ninterval_secs = 10\n").unwrap();

    fieldscan()
        .args(["status", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("snapshot_path"));
}

#[test]
fn test_scan_once_then_status() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fieldscan.toml");
    let db = dir.path().join("fieldscan.redb");
    std::fs::write(
        &path,
        format!("[registry]\nsnapshot_path = {:?}\n", db.display().to_string()),
    )
    .unwrap();

    fieldscan()
        .args(["status", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("no cycle has completed yet"));

    fieldscan()
        .args(["scan-once", "--json", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"cycle\": 1"));

    fieldscan()
        .env("FIELDSCAN_CONFIG", &path)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("last successful cycle: 1"))
        .stdout(predicate::str::contains("unclassified devices:  0"));
}

#[test]
fn test_status_while_store_is_locked() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fieldscan.toml");
    let db = dir.path().join("fieldscan.redb");
    std::fs::write(
        &path,
        format!("[registry]\nsnapshot_path = {:?}\n", db.display().to_string()),
    )
    .unwrap();

    fieldscan()
        .args(["scan-once", "--config"])
        .arg(&path)
        .assert()
        .success();
    assert!(dir.path().join("fieldscan.status.json").exists());

    // Stands in for a long-running `fieldscan run` holding the database.
    let _held = fieldscan_storage::SnapshotStore::open(&db, 5).unwrap();

    fieldscan()
        .args(["status", "--json", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"last_successful_cycle\": 1"));
}

use std::process::{Command, Output};

fn emudrop(db: &std::path::Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_emudrop-cli"))
        .args(args)
        .current_dir(db.parent().unwrap())
        .env("EMUDROP_DB", db)
        .env_remove("EMUDROP_CONFIG")
        .env_remove("EMUDROP_LOG_DIR")
        .output()
        .unwrap()
}

#[test]
fn failing_command_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("queue.db");

    let bad_id = emudrop(&db, &["pause", "not-a-request"]);
    assert_eq!(bad_id.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&bad_id.stderr).contains("invalid request id"));

    let unknown = emudrop(&db, &["remove", "00000000-0000-0000-0000-000000000001"]);
    assert_eq!(unknown.status.code(), Some(1));
}

#[test]
fn successful_command_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let listed = emudrop(&dir.path().join("queue.db"), &["list"]);
    assert!(listed.status.success());
    assert!(listed.stdout.is_empty());
}

use std::fs;

use canary_core::{BackupEngine, BackupError, FsBackupEngine, RestoreError};
use tempfile::TempDir;

fn setup() -> (TempDir, FsBackupEngine) {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("app.sqlite");
    fs::write(&source, b"state-v1: the good configuration").unwrap();
    let engine = FsBackupEngine::new(&source, temp.path().join("backups"));
    (temp, engine)
}

#[test]
fn backup_then_restore_returns_original_bytes() {
    let (temp, engine) = setup();
    let source = temp.path().join("app.sqlite");

    let mut backup = engine.backup().unwrap();
    assert!(backup.archive_path.exists());
    assert!(!backup.consumed);
    assert_eq!(backup.sha256.len(), 64);

    fs::write(&source, b"state-v2: broken by the canary").unwrap();
    engine.restore(&mut backup).unwrap();

    assert_eq!(
        fs::read(&source).unwrap(),
        b"state-v1: the good configuration"
    );
    assert!(backup.consumed);
    assert!(backup.consumed_at.is_some());
}

#[test]
fn restore_is_at_most_once() {
    let (_temp, engine) = setup();
    let mut backup = engine.backup().unwrap();

    engine.restore(&mut backup).unwrap();
    let err = engine.restore(&mut backup).unwrap_err();
    assert!(matches!(err, RestoreError::AlreadyConsumed(id) if id == backup.backup_id));
}

#[test]
fn consumed_flag_survives_in_the_manifest() {
    let (_temp, engine) = setup();
    let mut backup = engine.backup().unwrap();
    engine.restore(&mut backup).unwrap();

    // A fresh load of the manifest must refuse a second restore even if the
    // in-memory record was lost.
    let mut reloaded = engine.load_manifest(&backup.backup_id).unwrap();
    assert!(reloaded.consumed);
    let err = engine.restore(&mut reloaded).unwrap_err();
    assert!(matches!(err, RestoreError::AlreadyConsumed(_)));
}

#[test]
fn tampered_archive_fails_checksum_verification() {
    let (temp, engine) = setup();
    let source = temp.path().join("app.sqlite");
    let mut backup = engine.backup().unwrap();

    fs::write(&backup.archive_path, b"not the archive").unwrap();
    let before = fs::read(&source).unwrap();

    let err = engine.restore(&mut backup).unwrap_err();
    assert!(matches!(err, RestoreError::ChecksumMismatch { .. }));
    // The target file is untouched by the failed restore.
    assert_eq!(fs::read(&source).unwrap(), before);
    assert!(!backup.consumed);
}

#[test]
fn missing_archive_is_reported() {
    let (_temp, engine) = setup();
    let mut backup = engine.backup().unwrap();
    fs::remove_file(&backup.archive_path).unwrap();

    let err = engine.restore(&mut backup).unwrap_err();
    assert!(matches!(err, RestoreError::ArchiveMissing(_)));
}

#[test]
fn missing_source_fails_backup() {
    let temp = TempDir::new().unwrap();
    let engine = FsBackupEngine::new(temp.path().join("absent.sqlite"), temp.path().join("backups"));
    let err = engine.backup().unwrap_err();
    assert!(matches!(err, BackupError::SourceMissing(_)));
}

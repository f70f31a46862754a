use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup source missing: {0}")]
    SourceMissing(PathBuf),
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("manifest serialization error: {0}")]
    Manifest(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("backup {0} already consumed by a previous restore")]
    AlreadyConsumed(String),
    #[error("backup archive missing: {0}")]
    ArchiveMissing(PathBuf),
    #[error("checksum mismatch for backup {backup_id}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        backup_id: String,
        expected: String,
        actual: String,
    },
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("manifest serialization error: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Point-in-time capture of persistent state. Consumed at most once by a
/// restore; retained on disk for audit afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
    pub source_path: PathBuf,
    pub archive_path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
    pub consumed: bool,
    #[serde(default)]
    pub consumed_at: Option<DateTime<Utc>>,
}

pub trait BackupEngine: Send + Sync {
    fn backup(&self) -> Result<Backup, BackupError>;
    fn restore(&self, backup: &mut Backup) -> Result<(), RestoreError>;
}

/// Gzip dump of the application state file plus a JSON manifest carrying the
/// checksum, size, and consumption record.
pub struct FsBackupEngine {
    source_path: PathBuf,
    backup_dir: PathBuf,
}

impl FsBackupEngine {
    pub fn new(source_path: impl AsRef<Path>, backup_dir: impl AsRef<Path>) -> Self {
        Self {
            source_path: source_path.as_ref().to_path_buf(),
            backup_dir: backup_dir.as_ref().to_path_buf(),
        }
    }

    fn manifest_path(&self, backup_id: &str) -> PathBuf {
        self.backup_dir.join(format!("{backup_id}.json"))
    }

    fn persist_manifest(&self, backup: &Backup) -> Result<(), BackupError> {
        let path = self.manifest_path(&backup.backup_id);
        let payload = serde_json::to_vec_pretty(backup)?;
        fs::write(&path, payload).map_err(|source| BackupError::Io { source, path })
    }

    pub fn load_manifest(&self, backup_id: &str) -> Result<Backup, BackupError> {
        let path = self.manifest_path(backup_id);
        let raw = fs::read(&path).map_err(|source| BackupError::Io {
            source,
            path: path.clone(),
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

fn sha256_of(path: &Path) -> io::Result<(String, u64)> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

impl BackupEngine for FsBackupEngine {
    fn backup(&self) -> Result<Backup, BackupError> {
        if !self.source_path.exists() {
            return Err(BackupError::SourceMissing(self.source_path.clone()));
        }
        fs::create_dir_all(&self.backup_dir).map_err(|source| BackupError::Io {
            source,
            path: self.backup_dir.clone(),
        })?;
        let backup_id = format!("bk-{}", Uuid::new_v4().simple());
        let archive_path = self.backup_dir.join(format!("{backup_id}.gz"));

        let source = File::open(&self.source_path).map_err(|source| BackupError::Io {
            source,
            path: self.source_path.clone(),
        })?;
        let archive = File::create(&archive_path).map_err(|source| BackupError::Io {
            source,
            path: archive_path.clone(),
        })?;
        let mut encoder = GzEncoder::new(BufWriter::new(archive), Compression::default());
        let mut reader = BufReader::new(source);
        io::copy(&mut reader, &mut encoder).map_err(|source| BackupError::Io {
            source,
            path: archive_path.clone(),
        })?;
        encoder
            .finish()
            .and_then(|writer| writer.into_inner().map_err(|err| err.into_error()))
            .and_then(|file| file.sync_all())
            .map_err(|source| BackupError::Io {
                source,
                path: archive_path.clone(),
            })?;

        let (sha256, size_bytes) = sha256_of(&archive_path).map_err(|source| BackupError::Io {
            source,
            path: archive_path.clone(),
        })?;
        let backup = Backup {
            backup_id,
            created_at: Utc::now(),
            source_path: self.source_path.clone(),
            archive_path,
            sha256,
            size_bytes,
            consumed: false,
            consumed_at: None,
        };
        self.persist_manifest(&backup)?;
        Ok(backup)
    }

    fn restore(&self, backup: &mut Backup) -> Result<(), RestoreError> {
        if backup.consumed {
            return Err(RestoreError::AlreadyConsumed(backup.backup_id.clone()));
        }
        if !backup.archive_path.exists() {
            return Err(RestoreError::ArchiveMissing(backup.archive_path.clone()));
        }
        let (actual, _) = sha256_of(&backup.archive_path).map_err(|source| RestoreError::Io {
            source,
            path: backup.archive_path.clone(),
        })?;
        if actual != backup.sha256 {
            return Err(RestoreError::ChecksumMismatch {
                backup_id: backup.backup_id.clone(),
                expected: backup.sha256.clone(),
                actual,
            });
        }

        // Decompress next to the target, then swap in, so a failed restore
        // never leaves a half-written state file.
        let staging = backup.source_path.with_extension("restore-tmp");
        let archive = File::open(&backup.archive_path).map_err(|source| RestoreError::Io {
            source,
            path: backup.archive_path.clone(),
        })?;
        let mut decoder = GzDecoder::new(BufReader::new(archive));
        let mut target = BufWriter::new(File::create(&staging).map_err(|source| {
            RestoreError::Io {
                source,
                path: staging.clone(),
            }
        })?);
        io::copy(&mut decoder, &mut target).map_err(|source| RestoreError::Io {
            source,
            path: staging.clone(),
        })?;
        target.flush().map_err(|source| RestoreError::Io {
            source,
            path: staging.clone(),
        })?;
        drop(target);
        fs::rename(&staging, &backup.source_path).map_err(|source| RestoreError::Io {
            source,
            path: backup.source_path.clone(),
        })?;

        backup.consumed = true;
        backup.consumed_at = Some(Utc::now());
        // Keep the on-disk manifest in sync so the consumed flag survives
        // process restart.
        let manifest = self.manifest_path(&backup.backup_id);
        let payload = serde_json::to_vec_pretty(&backup)?;
        fs::write(&manifest, payload).map_err(|source| RestoreError::Io {
            source,
            path: manifest,
        })?;
        Ok(())
    }
}

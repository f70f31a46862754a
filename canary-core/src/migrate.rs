use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::{info, warn};

use crate::sqlite::configure_connection;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to open database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to read migrations dir {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("migration {id} failed: {source}")]
    Apply {
        source: rusqlite::Error,
        id: String,
    },
    #[error("migration ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

pub trait MigrationDriver: Send + Sync {
    /// Lists migrations not yet recorded in the ledger.
    fn pending(&self) -> Result<Vec<String>, MigrationError>;
    /// Applies all pending migrations. Idempotent: already-applied ids are
    /// skipped, and each migration runs inside its own transaction.
    fn migrate(&self) -> Result<MigrationReport, MigrationError>;
}

const LEDGER_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (\n\
     id TEXT PRIMARY KEY,\n\
     applied_at TEXT NOT NULL\n\
 );";

/// Applies ordered `.sql` files from a migrations directory against the
/// application database, recording each applied id in `schema_migrations`.
pub struct SqliteMigrationRunner {
    db_path: PathBuf,
    migrations_dir: PathBuf,
}

impl SqliteMigrationRunner {
    pub fn new(db_path: impl AsRef<Path>, migrations_dir: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            migrations_dir: migrations_dir.as_ref().to_path_buf(),
        }
    }

    fn open(&self) -> Result<Connection, MigrationError> {
        let conn = Connection::open(&self.db_path).map_err(|source| MigrationError::Open {
            source,
            path: self.db_path.clone(),
        })?;
        configure_connection(&conn).map_err(|source| MigrationError::Open {
            source,
            path: self.db_path.clone(),
        })?;
        conn.execute_batch(LEDGER_SCHEMA)?;
        Ok(conn)
    }

    fn migration_files(&self) -> Result<Vec<(String, PathBuf)>, MigrationError> {
        if !self.migrations_dir.exists() {
            warn!(
                target: "migrations",
                dir = %self.migrations_dir.display(),
                "migrations directory missing; nothing to apply"
            );
            return Ok(Vec::new());
        }
        let mut files = fs::read_dir(&self.migrations_dir)
            .map_err(|source| MigrationError::Io {
                source,
                path: self.migrations_dir.clone(),
            })?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().map(|ext| ext == "sql").unwrap_or(false))
            .filter_map(|path| {
                path.file_stem()
                    .map(|stem| (stem.to_string_lossy().into_owned(), path.clone()))
            })
            .collect::<Vec<_>>();
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }

    fn applied_ids(&self, conn: &Connection) -> Result<Vec<String>, MigrationError> {
        let mut statement = conn.prepare("SELECT id FROM schema_migrations ORDER BY id")?;
        let rows = statement
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl MigrationDriver for SqliteMigrationRunner {
    fn pending(&self) -> Result<Vec<String>, MigrationError> {
        let conn = self.open()?;
        let applied = self.applied_ids(&conn)?;
        Ok(self
            .migration_files()?
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| !applied.contains(id))
            .collect())
    }

    fn migrate(&self) -> Result<MigrationReport, MigrationError> {
        let mut conn = self.open()?;
        let applied = self.applied_ids(&conn)?;
        let mut report = MigrationReport::default();
        for (id, path) in self.migration_files()? {
            if applied.contains(&id) {
                report.skipped.push(id);
                continue;
            }
            let sql = fs::read_to_string(&path).map_err(|source| MigrationError::Io {
                source,
                path: path.clone(),
            })?;
            let tx = conn.transaction()?;
            tx.execute_batch(&sql)
                .map_err(|source| MigrationError::Apply {
                    source,
                    id: id.clone(),
                })?;
            tx.execute(
                "INSERT INTO schema_migrations (id, applied_at) VALUES (?1, ?2)",
                params![id, Utc::now()],
            )?;
            tx.commit()?;
            info!(target: "migrations", id = %id, "migration applied");
            report.applied.push(id);
        }
        Ok(report)
    }
}

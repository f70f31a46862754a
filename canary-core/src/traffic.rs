use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use thiserror::Error;

use crate::sqlite::configure_connection;

const FLAGS_SCHEMA: &str = include_str!("../../sql/flags.sql");

/// Flag key the routing layer reads to split traffic.
pub const TRAFFIC_WEIGHT_FLAG: &str = "canary.traffic_weight";

#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("invalid canary weight {0}: must be between 0 and 100")]
    InvalidWeight(u8),
    #[error("failed to open flag store {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("flag store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("stored weight {0:?} is not a percentage")]
    Corrupt(String),
}

/// Control surface for the canary traffic weight. The routing layer reads
/// the same state outside this system's control; the orchestrator owns it
/// for writes while a session is active.
pub trait TrafficController: Send + Sync {
    fn set_weight(&self, percent: u8) -> Result<(), TrafficError>;
    /// Current weight; an unset flag reads as 0 (no canary traffic).
    fn weight(&self) -> Result<u8, TrafficError>;
    /// Drops session-scoped derived keys during rollback. The weight flag
    /// itself is left in place at its terminal value.
    fn clear_canary_keys(&self) -> Result<(), TrafficError> {
        Ok(())
    }
}

/// Persists the weight as a key in the shared feature-flag table.
#[derive(Debug, Clone)]
pub struct FlagTrafficController {
    path: PathBuf,
}

impl FlagTrafficController {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn initialize(&self) -> Result<(), TrafficError> {
        let conn = self.open()?;
        conn.execute_batch(FLAGS_SCHEMA)?;
        Ok(())
    }

    fn open(&self) -> Result<Connection, TrafficError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn =
            Connection::open_with_flags(&self.path, flags).map_err(|source| TrafficError::Open {
                source,
                path: self.path.clone(),
            })?;
        configure_connection(&conn).map_err(|source| TrafficError::Open {
            source,
            path: self.path.clone(),
        })?;
        conn.execute_batch(FLAGS_SCHEMA)?;
        Ok(conn)
    }
}

impl TrafficController for FlagTrafficController {
    fn set_weight(&self, percent: u8) -> Result<(), TrafficError> {
        if percent > 100 {
            return Err(TrafficError::InvalidWeight(percent));
        }
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO feature_flags (key, value, updated_at) VALUES (?1, ?2, ?3)\n\
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![TRAFFIC_WEIGHT_FLAG, percent.to_string(), Utc::now()],
        )?;
        Ok(())
    }

    fn weight(&self) -> Result<u8, TrafficError> {
        let conn = self.open()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM feature_flags WHERE key = ?1",
                params![TRAFFIC_WEIGHT_FLAG],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            None => Ok(0),
            Some(raw) => raw
                .parse::<u8>()
                .ok()
                .filter(|weight| *weight <= 100)
                .ok_or(TrafficError::Corrupt(raw)),
        }
    }

    fn clear_canary_keys(&self) -> Result<(), TrafficError> {
        let conn = self.open()?;
        conn.execute(
            "DELETE FROM feature_flags WHERE key LIKE 'canary.%' AND key != ?1",
            params![TRAFFIC_WEIGHT_FLAG],
        )?;
        Ok(())
    }
}

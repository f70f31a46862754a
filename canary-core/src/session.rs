use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::sqlite::configure_connection;

const SESSION_SCHEMA: &str = include_str!("../../sql/sessions.sql");

pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session store path not configured")]
    MissingStore,
    #[error("failed to open session store {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("session store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session {active} is still open for environment {environment}")]
    ActiveSession { active: String, environment: String },
    #[error("corrupt session row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Validating,
    BackingUp,
    Migrating,
    CanaryDeploying,
    Monitoring,
    Promoting,
    RollingBack,
    Stable,
    RolledBack,
    Failed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::BackingUp => "backing_up",
            Self::Migrating => "migrating",
            Self::CanaryDeploying => "canary_deploying",
            Self::Monitoring => "monitoring",
            Self::Promoting => "promoting",
            Self::RollingBack => "rolling_back",
            Self::Stable => "stable",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "validating" => Self::Validating,
            "backing_up" => Self::BackingUp,
            "migrating" => Self::Migrating,
            "canary_deploying" => Self::CanaryDeploying,
            "monitoring" => Self::Monitoring,
            "promoting" => Self::Promoting,
            "rolling_back" => Self::RollingBack,
            "stable" => Self::Stable,
            "rolled_back" => Self::RolledBack,
            "failed" => Self::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stable | Self::RolledBack | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Stable,
    RolledBack,
    Failed,
    FailedPartialRollback,
}

impl SessionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
            Self::FailedPartialRollback => "failed_partial_rollback",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "stable" => Self::Stable,
            "rolled_back" => Self::RolledBack,
            "failed" => Self::Failed,
            "failed_partial_rollback" => Self::FailedPartialRollback,
            _ => return None,
        })
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rollout attempt. Mutated only by the orchestrator; terminal once the
/// outcome is set.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentSession {
    pub session_id: String,
    pub environment: String,
    pub rehearsal: bool,
    pub state: SessionState,
    pub weight: u8,
    pub outcome: Option<SessionOutcome>,
    pub abort_requested: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl DeploymentSession {
    pub fn new(environment: impl Into<String>, rehearsal: bool) -> Self {
        Self {
            session_id: format!("dep-{}", Uuid::new_v4().simple()),
            environment: environment.into(),
            rehearsal,
            state: SessionState::Validating,
            weight: 0,
            outcome: None,
            abort_requested: false,
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionTransition {
    pub state: SessionState,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SqliteSessionStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteSessionStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteSessionStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> SessionResult<SqliteSessionStore> {
        let path = self.path.ok_or(SessionError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteSessionStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteSessionStore {
    pub fn builder() -> SqliteSessionStoreBuilder {
        SqliteSessionStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> SessionResult<Self> {
        SqliteSessionStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> SessionResult<Connection> {
        let conn =
            Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
                SessionError::Open {
                    path: self.path.clone(),
                    source,
                }
            })?;
        configure_connection(&conn).map_err(|source| SessionError::Open {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> SessionResult<()> {
        let conn = self.open()?;
        conn.execute_batch(SESSION_SCHEMA)?;
        Ok(())
    }

    pub fn create(&self, session: &DeploymentSession) -> SessionResult<()> {
        let conn = self.open()?;
        insert_session(&conn, session)?;
        Ok(())
    }

    /// Creates the session only if no other non-terminal session exists for
    /// the same environment. Check and insert share one immediate
    /// transaction, so two controllers racing over a shared store cannot
    /// both get past it.
    pub fn create_exclusive(&self, session: &DeploymentSession) -> SessionResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let active: Option<String> = tx
            .query_row(
                "SELECT session_id FROM deployment_sessions\n\
                 WHERE environment = ?1\n\
                   AND state NOT IN ('stable', 'rolled_back', 'failed')\n\
                 LIMIT 1",
                params![session.environment],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(active) = active {
            return Err(SessionError::ActiveSession {
                active,
                environment: session.environment.clone(),
            });
        }
        insert_session(&tx, session)?;
        tx.commit()?;
        Ok(())
    }

    pub fn update(&self, session: &DeploymentSession) -> SessionResult<()> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE deployment_sessions\n\
             SET state = ?2, weight = ?3, outcome = ?4, ended_at = ?5\n\
             WHERE session_id = ?1",
            params![
                session.session_id,
                session.state.as_str(),
                session.weight,
                session.outcome.map(|outcome| outcome.as_str()),
                session.ended_at,
            ],
        )?;
        if changed == 0 {
            return Err(SessionError::NotFound(session.session_id.clone()));
        }
        Ok(())
    }

    pub fn record_transition(
        &self,
        session_id: &str,
        state: SessionState,
        detail: Option<&str>,
    ) -> SessionResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO session_transitions (session_id, state, detail, created_at)\n\
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, state.as_str(), detail, Utc::now()],
        )?;
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> SessionResult<DeploymentSession> {
        let conn = self.open()?;
        conn.query_row(
            "SELECT session_id, environment, rehearsal, state, weight, outcome,\n\
                    abort_requested, started_at, ended_at\n\
             FROM deployment_sessions WHERE session_id = ?1",
            params![session_id],
            row_to_session,
        )
        .optional()?
        .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?
        .into_session()
    }

    pub fn list(&self, limit: usize) -> SessionResult<Vec<DeploymentSession>> {
        let conn = self.open()?;
        let mut statement = conn.prepare(
            "SELECT session_id, environment, rehearsal, state, weight, outcome,\n\
                    abort_requested, started_at, ended_at\n\
             FROM deployment_sessions ORDER BY started_at DESC LIMIT ?1",
        )?;
        let rows = statement
            .query_map(params![limit as i64], row_to_session)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// Non-terminal sessions left behind by a crashed or killed controller.
    pub fn unresolved(&self) -> SessionResult<Vec<DeploymentSession>> {
        let conn = self.open()?;
        let mut statement = conn.prepare(
            "SELECT session_id, environment, rehearsal, state, weight, outcome,\n\
                    abort_requested, started_at, ended_at\n\
             FROM deployment_sessions\n\
             WHERE state NOT IN ('stable', 'rolled_back', 'failed')\n\
             ORDER BY started_at ASC",
        )?;
        let rows = statement
            .query_map([], row_to_session)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    pub fn transitions(&self, session_id: &str) -> SessionResult<Vec<SessionTransition>> {
        let conn = self.open()?;
        let mut statement = conn.prepare(
            "SELECT state, detail, created_at FROM session_transitions\n\
             WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = statement
            .query_map(params![session_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, DateTime<Utc>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(state, detail, created_at)| {
                let state = SessionState::parse(&state)
                    .ok_or_else(|| SessionError::Corrupt(format!("state {state:?}")))?;
                Ok(SessionTransition {
                    state,
                    detail,
                    created_at,
                })
            })
            .collect()
    }

    pub fn request_abort(&self, session_id: &str) -> SessionResult<()> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE deployment_sessions SET abort_requested = 1\n\
             WHERE session_id = ?1 AND state NOT IN ('stable', 'rolled_back', 'failed')",
            params![session_id],
        )?;
        if changed == 0 {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    pub fn abort_requested(&self, session_id: &str) -> SessionResult<bool> {
        let conn = self.open()?;
        conn.query_row(
            "SELECT abort_requested FROM deployment_sessions WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }
}

fn insert_session(conn: &Connection, session: &DeploymentSession) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO deployment_sessions\n\
         (session_id, environment, rehearsal, state, weight, outcome, abort_requested, started_at, ended_at)\n\
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            session.session_id,
            session.environment,
            session.rehearsal,
            session.state.as_str(),
            session.weight,
            session.outcome.map(|outcome| outcome.as_str()),
            session.abort_requested,
            session.started_at,
            session.ended_at,
        ],
    )?;
    Ok(())
}

/// Raw row image; state and outcome stay as stored text until
/// `into_session` parses them.
struct SessionRow {
    session_id: String,
    environment: String,
    rehearsal: bool,
    state: String,
    weight: i64,
    outcome: Option<String>,
    abort_requested: bool,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl SessionRow {
    fn into_session(self) -> SessionResult<DeploymentSession> {
        let state = SessionState::parse(&self.state)
            .ok_or_else(|| SessionError::Corrupt(format!("state {:?}", self.state)))?;
        let outcome = match self.outcome.as_deref() {
            Some(raw) => Some(
                SessionOutcome::parse(raw)
                    .ok_or_else(|| SessionError::Corrupt(format!("outcome {raw:?}")))?,
            ),
            None => None,
        };
        Ok(DeploymentSession {
            session_id: self.session_id,
            environment: self.environment,
            rehearsal: self.rehearsal,
            state,
            weight: self.weight as u8,
            outcome,
            abort_requested: self.abort_requested,
            started_at: self.started_at,
            ended_at: self.ended_at,
        })
    }
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        session_id: row.get(0)?,
        environment: row.get(1)?,
        rehearsal: row.get(2)?,
        state: row.get(3)?,
        weight: row.get(4)?,
        outcome: row.get(5)?,
        abort_requested: row.get(6)?,
        started_at: row.get(7)?,
        ended_at: row.get(8)?,
    })
}

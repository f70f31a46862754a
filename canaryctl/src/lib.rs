use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use canary_core::{
    load_canary_config, CanaryConfig, DeploymentSession, FlagTrafficController, FsBackupEngine,
    HttpMetricsProbe, Notifier, NullNotifier, Orchestrator, OrchestratorError, RollbackCause,
    SessionOutcome, SessionRunSummary, SessionState, SessionTransition, SqliteMigrationRunner,
    SqliteSessionStore, TrafficController, WebhookNotifier,
};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] canary_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session store error: {0}")]
    Session(#[from] canary_core::SessionError),
    #[error("traffic control error: {0}")]
    Traffic(#[from] canary_core::TrafficError),
    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Canary deployment control interface", long_about = None)]
pub struct Cli {
    /// Path to the main canary.toml
    #[arg(long, default_value = "configs/canary.toml")]
    pub config: PathBuf,
    /// Override for the session database
    #[arg(long)]
    pub sessions_db: Option<PathBuf>,
    /// Override for the feature-flag database
    #[arg(long)]
    pub flags_db: Option<PathBuf>,
    /// Override for the evidence report directory
    #[arg(long)]
    pub reports_dir: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs a full canary deployment session
    Start(StartArgs),
    /// Shows one session with its transition history
    Status(SessionArgs),
    /// Requests a rollback of a running session
    Abort(SessionArgs),
    /// Lists recent deployment sessions
    Sessions(SessionsArgs),
    /// Marks sessions orphaned by a dead controller as failed
    Resolve,
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Target environment (defaults to deploy.environment from config)
    #[arg(long)]
    pub environment: Option<String>,
    /// Label the session as a rehearsal run in the store and the report
    #[arg(long, default_value_t = false)]
    pub rehearsal: bool,
    /// Start the staged plan at this weight instead of the configured first stage
    #[arg(long)]
    pub initial_weight: Option<u8>,
    /// Override for the staged weight plan, e.g. 10,50,100
    #[arg(long, value_delimiter = ',')]
    pub weights: Option<Vec<u8>>,
}

#[derive(Args, Debug)]
pub struct SessionArgs {
    /// Session identifier (dep-…)
    pub session: String,
}

#[derive(Args, Debug)]
pub struct SessionsArgs {
    /// Maximum rows returned
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

/// Runs one CLI invocation and returns the process exit code. Deployment
/// outcomes map to codes: 0 stable, 1 rolled back, 2 failed.
pub fn run(cli: Cli) -> Result<i32> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Start(args) => {
            let outcome = context.start(args)?;
            render(&outcome, cli.format)?;
            Ok(exit_code(outcome.outcome))
        }
        Commands::Status(args) => {
            let detail = context.status(args)?;
            render(&detail, cli.format)?;
            Ok(0)
        }
        Commands::Abort(args) => {
            let result = context.abort(args)?;
            render(&result, cli.format)?;
            Ok(0)
        }
        Commands::Sessions(args) => {
            let list = context.sessions(args)?;
            render(&list, cli.format)?;
            Ok(0)
        }
        Commands::Resolve => {
            let result = context.resolve()?;
            render(&result, cli.format)?;
            Ok(0)
        }
    }
}

pub fn exit_code(outcome: SessionOutcome) -> i32 {
    match outcome {
        SessionOutcome::Stable => 0,
        SessionOutcome::RolledBack => 1,
        SessionOutcome::Failed | SessionOutcome::FailedPartialRollback => 2,
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: CanaryConfig,
    sessions_db: PathBuf,
    flags_db: PathBuf,
    reports_dir: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_canary_config(&cli.config)?;
        let sessions_db = cli
            .sessions_db
            .clone()
            .unwrap_or_else(|| config.resolve_path(&config.paths.sessions_db));
        let flags_db = cli
            .flags_db
            .clone()
            .unwrap_or_else(|| config.resolve_path(&config.paths.flags_db));
        let reports_dir = cli
            .reports_dir
            .clone()
            .unwrap_or_else(|| config.resolve_path(&config.paths.reports_dir));
        Ok(Self {
            config,
            sessions_db,
            flags_db,
            reports_dir,
        })
    }

    fn open_store(&self) -> Result<SqliteSessionStore> {
        let store = SqliteSessionStore::new(&self.sessions_db)?;
        store.initialize()?;
        Ok(store)
    }

    fn start(&self, args: &StartArgs) -> Result<StartOutcome> {
        let environment = args
            .environment
            .clone()
            .unwrap_or_else(|| self.config.deploy.environment.clone());
        let mut weights = args
            .weights
            .clone()
            .unwrap_or_else(|| self.config.deploy.stage_weights.clone());
        if let Some(initial) = args.initial_weight {
            // Later stages keep their place; earlier ones are skipped.
            weights.retain(|weight| *weight > initial);
            weights.insert(0, initial);
        }

        let store = self.open_store()?;
        let traffic = FlagTrafficController::new(&self.flags_db);
        traffic.initialize()?;

        let probe = HttpMetricsProbe::with_default_client(
            &self.config.monitoring.metrics_endpoint,
            Duration::from_secs(self.config.monitoring.probe_timeout_seconds),
        );
        let source_db = self.config.resolve_path(&self.config.backup.source_db);
        let backup_dir = self.config.resolve_path(&self.config.backup.backup_dir);
        let migrations_dir = self.config.resolve_path(&self.config.paths.migrations_dir);
        let notifier: Arc<dyn Notifier> = if self.config.notify.enabled {
            Arc::new(WebhookNotifier::with_default_client(
                &self.config.notify.webhook_url,
            ))
        } else {
            Arc::new(NullNotifier)
        };

        let orchestrator = Orchestrator::builder()
            .metrics(Arc::new(probe))
            .backup(Arc::new(FsBackupEngine::new(&source_db, &backup_dir)))
            .migrations(Arc::new(SqliteMigrationRunner::new(
                &source_db,
                &migrations_dir,
            )))
            .traffic(Arc::new(traffic))
            .notifier(notifier)
            .sessions(store)
            .thresholds(self.config.thresholds())
            .stage_weights(weights)
            .reports_dir(&self.reports_dir)
            .build()?;

        let runtime = tokio::runtime::Runtime::new()?;
        let summary = runtime.block_on(orchestrator.run(&environment, args.rehearsal))?;
        Ok(StartOutcome::from(summary))
    }

    fn status(&self, args: &SessionArgs) -> Result<SessionDetail> {
        let store = self.open_store()?;
        let session = store.get(&args.session)?;
        let transitions = store.transitions(&args.session)?;
        Ok(SessionDetail {
            session,
            transitions,
        })
    }

    fn abort(&self, args: &SessionArgs) -> Result<AbortResult> {
        let store = self.open_store()?;
        store.request_abort(&args.session)?;
        Ok(AbortResult {
            session_id: args.session.clone(),
            status: "abort_requested".to_string(),
        })
    }

    fn sessions(&self, args: &SessionsArgs) -> Result<SessionList> {
        let store = self.open_store()?;
        Ok(SessionList {
            rows: store.list(args.limit)?,
        })
    }

    /// Sweeps sessions left non-terminal by a crashed controller. They are
    /// closed as failed; no restore is attempted here, the operator decides
    /// from the session record and the on-disk backup.
    fn resolve(&self) -> Result<ResolveResult> {
        let store = self.open_store()?;
        let unresolved = store.unresolved()?;
        if !unresolved.is_empty() {
            // The dead controller may have left canary traffic flowing.
            let traffic = FlagTrafficController::new(&self.flags_db);
            traffic.initialize()?;
            traffic.set_weight(0)?;
        }
        let mut resolved = Vec::new();
        for mut session in unresolved {
            session.state = SessionState::Failed;
            session.outcome = Some(SessionOutcome::Failed);
            session.ended_at = Some(Utc::now());
            store.update(&session)?;
            store.record_transition(
                &session.session_id,
                SessionState::Failed,
                Some("closed by operator sweep"),
            )?;
            resolved.push(session.session_id);
        }
        Ok(ResolveResult { resolved })
    }
}

#[derive(Debug, Serialize)]
pub struct StartOutcome {
    pub session_id: String,
    pub environment: String,
    pub rehearsal: bool,
    pub outcome: SessionOutcome,
    pub weight: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_cause: Option<RollbackCause>,
    pub report_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl From<SessionRunSummary> for StartOutcome {
    fn from(summary: SessionRunSummary) -> Self {
        Self {
            session_id: summary.session.session_id,
            environment: summary.session.environment,
            rehearsal: summary.session.rehearsal,
            outcome: summary.outcome,
            weight: summary.session.weight,
            rollback_cause: summary.rollback_cause,
            report_path: summary.report_path,
            failure: summary.failure,
        }
    }
}

impl DisplayFallback for StartOutcome {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "{} ({}) finished: {} at weight {}%",
            self.session_id,
            self.environment,
            self.outcome.as_str(),
            self.weight
        )];
        if let Some(cause) = &self.rollback_cause {
            lines.push(format!(
                "  rollback cause: {}",
                serde_json::to_value(cause)
                    .ok()
                    .and_then(|value| value.as_str().map(str::to_string))
                    .unwrap_or_default()
            ));
        }
        if let Some(failure) = &self.failure {
            lines.push(format!("  failure: {failure}"));
        }
        lines.push(format!("  evidence: {}", self.report_path.display()));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SessionDetail {
    pub session: DeploymentSession,
    pub transitions: Vec<SessionTransition>,
}

impl DisplayFallback for SessionDetail {
    fn display(&self) -> String {
        let session = &self.session;
        let outcome = session
            .outcome
            .map(|outcome| outcome.as_str().to_string())
            .unwrap_or_else(|| "-".to_string());
        let mut lines = vec![format!(
            "{} env={} state={} weight={}% outcome={} abort_requested={}",
            session.session_id,
            session.environment,
            session.state,
            session.weight,
            outcome,
            session.abort_requested
        )];
        for transition in &self.transitions {
            let detail = transition.detail.as_deref().unwrap_or("-");
            lines.push(format!(
                "  {} {} {}",
                transition.created_at.format("%Y-%m-%d %H:%M:%S"),
                transition.state,
                detail
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct AbortResult {
    pub session_id: String,
    pub status: String,
}

impl DisplayFallback for AbortResult {
    fn display(&self) -> String {
        format!("{}: {}", self.session_id, self.status)
    }
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub rows: Vec<DeploymentSession>,
}

impl DisplayFallback for SessionList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No sessions recorded".to_string();
        }
        let mut lines = Vec::new();
        for session in &self.rows {
            let outcome = session
                .outcome
                .map(|outcome| outcome.as_str().to_string())
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "{} | env={} | state={} | weight={}% | outcome={} | started={}",
                session.session_id,
                session.environment,
                session.state,
                session.weight,
                outcome,
                session.started_at.format("%Y-%m-%d %H:%M:%S")
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ResolveResult {
    pub resolved: Vec<String>,
}

impl DisplayFallback for ResolveResult {
    fn display(&self) -> String {
        if self.resolved.is_empty() {
            "No unresolved sessions".to_string()
        } else {
            format!("Closed as failed: {}", self.resolved.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(root: &std::path::Path) -> PathBuf {
        let configs_dir = root.join("configs");
        fs::create_dir_all(&configs_dir).unwrap();
        let contents = format!(
            r#"
[deploy]
environment = "staging"
stage_weights = [10, 50]

[slo]
latency_p50_baseline_ms = 120.0
latency_p95_baseline_ms = 300.0
latency_p99_baseline_ms = 600.0
latency_p95_max_ms = 500.0
latency_p99_max_ms = 900.0
error_rate_baseline = 0.002
error_rate_max = 0.01
throughput_baseline_rps = 220.0
throughput_min_rps = 100.0
breach_ceiling = 3

[monitoring]
metrics_endpoint = "http://127.0.0.1:9200/metrics"
probe_timeout_seconds = 10
sample_interval_seconds = 30
duration_seconds = 900

[backup]
source_db = "data/app.sqlite"
backup_dir = "data/backups"

[notify]
enabled = false
webhook_url = ""

[paths]
base_dir = "{base}"
data_dir = "data"
reports_dir = "reports"
sessions_db = "data/sessions.sqlite"
flags_db = "data/flags.sqlite"
migrations_dir = "migrations"
"#,
            base = root.display()
        );
        let path = configs_dir.join("canary.toml");
        fs::write(&path, contents).unwrap();
        path
    }

    fn prepare_test_context() -> (TempDir, AppContext) {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("data")).unwrap();
        let config = write_config(root);
        let cli = Cli {
            config,
            sessions_db: None,
            flags_db: None,
            reports_dir: None,
            format: OutputFormat::Json,
            command: Commands::Resolve,
        };
        let context = AppContext::new(&cli).unwrap();
        (temp, context)
    }

    #[test]
    fn paths_resolve_against_base_dir() {
        let (temp, context) = prepare_test_context();
        assert_eq!(
            context.sessions_db,
            temp.path().join("data/sessions.sqlite")
        );
        assert_eq!(context.reports_dir, temp.path().join("reports"));
    }

    #[test]
    fn sessions_listing_returns_rows() {
        let (_temp, context) = prepare_test_context();
        let store = context.open_store().unwrap();
        let session = DeploymentSession::new("staging", false);
        store.create(&session).unwrap();

        let list = context.sessions(&SessionsArgs { limit: 10 }).unwrap();
        assert_eq!(list.rows.len(), 1);
        assert_eq!(list.rows[0].session_id, session.session_id);
    }

    #[test]
    fn abort_flags_running_session() {
        let (_temp, context) = prepare_test_context();
        let store = context.open_store().unwrap();
        let session = DeploymentSession::new("staging", false);
        store.create(&session).unwrap();

        context
            .abort(&SessionArgs {
                session: session.session_id.clone(),
            })
            .unwrap();
        assert!(store.abort_requested(&session.session_id).unwrap());
    }

    #[test]
    fn abort_rejects_unknown_session() {
        let (_temp, context) = prepare_test_context();
        context.open_store().unwrap();
        let err = context
            .abort(&SessionArgs {
                session: "dep-missing".to_string(),
            })
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Session(canary_core::SessionError::NotFound(_))
        ));
    }

    #[test]
    fn resolve_closes_only_non_terminal_sessions() {
        use canary_core::TrafficController;

        let (_temp, context) = prepare_test_context();
        let store = context.open_store().unwrap();
        let traffic = FlagTrafficController::new(&context.flags_db);
        traffic.initialize().unwrap();
        traffic.set_weight(30).unwrap();

        let stale = DeploymentSession::new("staging", false);
        store.create(&stale).unwrap();

        let mut done = DeploymentSession::new("staging", false);
        store.create(&done).unwrap();
        done.state = SessionState::Stable;
        done.outcome = Some(SessionOutcome::Stable);
        done.ended_at = Some(Utc::now());
        store.update(&done).unwrap();

        let result = context.resolve().unwrap();
        assert_eq!(result.resolved, vec![stale.session_id.clone()]);
        assert_eq!(traffic.weight().unwrap(), 0);

        let closed = store.get(&stale.session_id).unwrap();
        assert_eq!(closed.state, SessionState::Failed);
        assert_eq!(closed.outcome, Some(SessionOutcome::Failed));
        assert!(closed.ended_at.is_some());
    }

    #[test]
    fn exit_codes_map_outcomes() {
        assert_eq!(exit_code(SessionOutcome::Stable), 0);
        assert_eq!(exit_code(SessionOutcome::RolledBack), 1);
        assert_eq!(exit_code(SessionOutcome::Failed), 2);
        assert_eq!(exit_code(SessionOutcome::FailedPartialRollback), 2);
    }
}

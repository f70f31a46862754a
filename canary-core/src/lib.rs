pub mod backup;
pub mod config;
pub mod error;
pub mod migrate;
pub mod notify;
pub mod orchestrator;
pub mod probe;
pub mod report;
pub mod session;
pub mod slo;
pub mod sqlite;
pub mod traffic;

pub use backup::{Backup, BackupEngine, BackupError, FsBackupEngine, RestoreError};
pub use config::{
    load_canary_config, BackupSection, CanaryConfig, DeploySection, MonitoringSection,
    NotifySection, PathsSection, SloSection,
};
pub use error::{ConfigError, Result};
pub use migrate::{MigrationDriver, MigrationError, MigrationReport, SqliteMigrationRunner};
pub use notify::{
    DeploymentNotification, Notifier, NotifyError, NotifySeverity, NullNotifier, WebhookNotifier,
};
pub use orchestrator::{
    Orchestrator, OrchestratorBuilder, OrchestratorError, SessionRunSummary, ValidationError,
};
pub use probe::{HttpMetricsProbe, MetricSample, MetricsSource, ProbeError};
pub use report::{
    averages, EvidenceReport, RecoveryBreakdown, ReportError, RollbackCause, RollbackRecord,
    SampleAverages,
};
pub use session::{
    DeploymentSession, SessionError, SessionOutcome, SessionResult, SessionState,
    SessionTransition, SqliteSessionStore, SqliteSessionStoreBuilder,
};
pub use slo::{
    evaluate, BreachObservation, BreachPhase, BreachTraceEntry, BreachTracker, SloDimension,
    SloEvaluation, SloThresholdSet,
};
pub use traffic::{
    FlagTrafficController, TrafficController, TrafficError, TRAFFIC_WEIGHT_FLAG,
};

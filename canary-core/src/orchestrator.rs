use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::time::{interval_at, sleep_until, timeout, Instant};
use tracing::{info, warn};

use crate::backup::{Backup, BackupEngine};
use crate::migrate::{MigrationDriver, MigrationError};
use crate::notify::{DeploymentNotification, Notifier, NotifySeverity};
use crate::probe::{MetricSample, MetricsSource, ProbeError};
use crate::report::{EvidenceReport, ReportError, RollbackCause, RollbackRecord};
use crate::session::{
    DeploymentSession, SessionError, SessionOutcome, SessionState, SqliteSessionStore,
};
use crate::slo::{evaluate, BreachTracker, SloThresholdSet};
use crate::traffic::{TrafficController, TrafficError};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator missing component: {0}")]
    MissingComponent(&'static str),
    #[error("invalid stage plan: {0}")]
    InvalidStagePlan(String),
    #[error("session store error: {0}")]
    Session(#[from] SessionError),
    #[error("evidence report error: {0}")]
    Report(#[from] ReportError),
}

/// Preflight failure. The session fails closed before any traffic or
/// state-changing work.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("traffic control surface unavailable: {0}")]
    Traffic(#[from] TrafficError),
    #[error("migration preflight failed: {0}")]
    Preflight(#[from] MigrationError),
    #[error("health endpoint unreachable: {0}")]
    Health(#[from] ProbeError),
}

/// Terminal record of one orchestrator run. Deployment failures are encoded
/// here, not raised as errors; `OrchestratorError` is reserved for the
/// controller's own plumbing (session store, report write).
#[derive(Debug, Clone, Serialize)]
pub struct SessionRunSummary {
    pub session: DeploymentSession,
    pub outcome: SessionOutcome,
    pub rollback_cause: Option<RollbackCause>,
    pub report_path: PathBuf,
    pub failure: Option<String>,
}

enum MonitorVerdict {
    DurationElapsed,
    RollbackRequired,
    AbortRequested,
}

struct RunState {
    session: DeploymentSession,
    samples: Vec<MetricSample>,
    tracker: BreachTracker,
    backup: Option<Backup>,
    rollback: Option<RollbackRecord>,
}

#[derive(Default)]
pub struct OrchestratorBuilder {
    metrics: Option<Arc<dyn MetricsSource>>,
    backup: Option<Arc<dyn BackupEngine>>,
    migrations: Option<Arc<dyn MigrationDriver>>,
    traffic: Option<Arc<dyn TrafficController>>,
    notifier: Option<Arc<dyn Notifier>>,
    sessions: Option<SqliteSessionStore>,
    thresholds: Option<SloThresholdSet>,
    stage_weights: Vec<u8>,
    reports_dir: Option<PathBuf>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSource>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn backup(mut self, backup: Arc<dyn BackupEngine>) -> Self {
        self.backup = Some(backup);
        self
    }

    pub fn migrations(mut self, migrations: Arc<dyn MigrationDriver>) -> Self {
        self.migrations = Some(migrations);
        self
    }

    pub fn traffic(mut self, traffic: Arc<dyn TrafficController>) -> Self {
        self.traffic = Some(traffic);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn sessions(mut self, sessions: SqliteSessionStore) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn thresholds(mut self, thresholds: SloThresholdSet) -> Self {
        self.thresholds = Some(thresholds);
        self
    }

    pub fn stage_weights(mut self, weights: Vec<u8>) -> Self {
        self.stage_weights = weights;
        self
    }

    pub fn reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let mut stage_weights = self.stage_weights;
        if stage_weights.is_empty() {
            return Err(OrchestratorError::InvalidStagePlan(
                "no stage weights configured".to_string(),
            ));
        }
        for window in stage_weights.windows(2) {
            if window[1] <= window[0] {
                return Err(OrchestratorError::InvalidStagePlan(format!(
                    "weights must strictly increase ({} then {})",
                    window[0], window[1]
                )));
            }
        }
        let last = *stage_weights.last().unwrap_or(&0);
        if last > 100 {
            return Err(OrchestratorError::InvalidStagePlan(format!(
                "weight {last} exceeds 100"
            )));
        }
        // Every session must end at a terminal weight; pad the plan so the
        // final promotion always lands on 100.
        if last < 100 {
            stage_weights.push(100);
        }
        Ok(Orchestrator {
            metrics: self
                .metrics
                .ok_or(OrchestratorError::MissingComponent("metrics source"))?,
            backup: self
                .backup
                .ok_or(OrchestratorError::MissingComponent("backup engine"))?,
            migrations: self
                .migrations
                .ok_or(OrchestratorError::MissingComponent("migration driver"))?,
            traffic: self
                .traffic
                .ok_or(OrchestratorError::MissingComponent("traffic controller"))?,
            notifier: self
                .notifier
                .ok_or(OrchestratorError::MissingComponent("notifier"))?,
            sessions: self
                .sessions
                .ok_or(OrchestratorError::MissingComponent("session store"))?,
            thresholds: self
                .thresholds
                .ok_or(OrchestratorError::MissingComponent("threshold set"))?,
            stage_weights,
            reports_dir: self
                .reports_dir
                .ok_or(OrchestratorError::MissingComponent("reports dir"))?,
        })
    }
}

/// Drives one deployment session through the state machine:
/// Validating → BackingUp → Migrating → CanaryDeploying → Monitoring →
/// {Promoting | RollingBack} → {Stable | RolledBack} | Failed.
///
/// Sole mutator of the session and the breach state; the traffic-weight
/// surface is owned-for-write for the whole run and left at 0 or 100 on
/// every exit path.
pub struct Orchestrator {
    metrics: Arc<dyn MetricsSource>,
    backup: Arc<dyn BackupEngine>,
    migrations: Arc<dyn MigrationDriver>,
    traffic: Arc<dyn TrafficController>,
    notifier: Arc<dyn Notifier>,
    sessions: SqliteSessionStore,
    thresholds: SloThresholdSet,
    stage_weights: Vec<u8>,
    reports_dir: PathBuf,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("stage_weights", &self.stage_weights)
            .field("reports_dir", &self.reports_dir)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn thresholds(&self) -> &SloThresholdSet {
        &self.thresholds
    }

    pub async fn run(
        &self,
        environment: &str,
        rehearsal: bool,
    ) -> Result<SessionRunSummary, OrchestratorError> {
        let mut run = RunState {
            session: DeploymentSession::new(environment, rehearsal),
            samples: Vec::new(),
            tracker: BreachTracker::new(self.thresholds.breach_ceiling),
            backup: None,
            rollback: None,
        };
        self.sessions.initialize()?;
        // One controller per environment at a time; a leftover non-terminal
        // session must be aborted or swept with `resolve` first.
        self.sessions.create_exclusive(&run.session)?;
        info!(
            target: "orchestrator",
            session_id = %run.session.session_id,
            environment = %run.session.environment,
            rehearsal = run.session.rehearsal,
            "deployment session started"
        );

        self.transition(&mut run.session, SessionState::Validating, None, NotifySeverity::Medium)
            .await?;
        if let Err(err) = self.validate().await {
            return self.finish_failed(run, err.to_string()).await;
        }

        self.transition(&mut run.session, SessionState::BackingUp, None, NotifySeverity::Medium)
            .await?;
        match self.backup.backup() {
            Ok(backup) => {
                info!(
                    target: "orchestrator",
                    session_id = %run.session.session_id,
                    backup_id = %backup.backup_id,
                    size_bytes = backup.size_bytes,
                    "backup stored"
                );
                run.backup = Some(backup);
            }
            Err(err) => {
                return self.finish_failed(run, format!("backup failed: {err}")).await;
            }
        }

        self.transition(&mut run.session, SessionState::Migrating, None, NotifySeverity::Medium)
            .await?;
        if let Err(err) = self.migrations.migrate() {
            let record = RollbackRecord::new(RollbackCause::MigrationFailure, Vec::new(), None);
            return self
                .rollback(run, record, format!("migration failed: {err}"))
                .await;
        }

        let stages = self.stage_weights.clone();
        for (index, weight) in stages.iter().copied().enumerate() {
            let detail = format!("weight {weight}%");
            self.transition(
                &mut run.session,
                SessionState::CanaryDeploying,
                Some(detail.as_str()),
                NotifySeverity::Medium,
            )
            .await?;
            if let Err(err) = self.traffic.set_weight(weight) {
                let record = RollbackRecord::new(RollbackCause::DeployFailure, Vec::new(), None);
                return self
                    .rollback(
                        run,
                        record,
                        format!("failed to set canary weight to {weight}%: {err}"),
                    )
                    .await;
            }
            run.session.weight = weight;
            self.sessions.update(&run.session)?;
            if weight >= 100 {
                break;
            }

            let detail = format!("stage {} at {weight}%", index + 1);
            self.transition(
                &mut run.session,
                SessionState::Monitoring,
                Some(detail.as_str()),
                NotifySeverity::Medium,
            )
            .await?;
            match self
                .monitor(&run.session, &mut run.tracker, &mut run.samples)
                .await?
            {
                MonitorVerdict::DurationElapsed => {
                    self.transition(
                        &mut run.session,
                        SessionState::Promoting,
                        None,
                        NotifySeverity::Medium,
                    )
                    .await?;
                }
                MonitorVerdict::RollbackRequired => {
                    let record = RollbackRecord::new(
                        RollbackCause::SloBreach,
                        run.tracker.trip_violations().to_vec(),
                        run.tracker.trip_sample_index(),
                    );
                    return self
                        .rollback(run, record, "sustained SLO breach during monitoring".to_string())
                        .await;
                }
                MonitorVerdict::AbortRequested => {
                    let record = RollbackRecord::new(RollbackCause::OperatorAbort, Vec::new(), None);
                    return self
                        .rollback(run, record, "operator abort requested".to_string())
                        .await;
                }
            }
        }

        self.finish_stable(run).await
    }

    async fn validate(&self) -> Result<(), ValidationError> {
        self.traffic.weight()?;
        let pending = self.migrations.pending()?;
        info!(target: "orchestrator", pending = pending.len(), "migration preflight complete");
        self.metrics.fetch().await?;
        Ok(())
    }

    /// Sampling loop for one monitoring window. Two independent exit
    /// conditions are raced each iteration: wall-clock deadline and the
    /// latched rollback requirement; the operator abort flag is honored at
    /// each tick.
    async fn monitor(
        &self,
        session: &DeploymentSession,
        tracker: &mut BreachTracker,
        samples: &mut Vec<MetricSample>,
    ) -> Result<MonitorVerdict, OrchestratorError> {
        let tick_every = self.thresholds.sample_interval();
        // Probe budget stays below the tick interval so a slow probe can
        // never overlap the next tick.
        let probe_budget = tick_every.mul_f64(0.8);
        let deadline = Instant::now() + self.thresholds.monitor_duration();
        let mut ticker = interval_at(Instant::now() + tick_every, tick_every);
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return Ok(MonitorVerdict::DurationElapsed),
                _ = ticker.tick() => {}
            }
            if self.sessions.abort_requested(&session.session_id)? {
                return Ok(MonitorVerdict::AbortRequested);
            }
            match timeout(probe_budget, self.metrics.fetch()).await {
                Err(_) => {
                    tracker.observe_probe_error("probe exceeded the tick budget");
                    warn!(
                        target: "monitoring",
                        session_id = %session.session_id,
                        "probe overran the tick budget; sample is neutral"
                    );
                }
                Ok(Err(err)) => {
                    tracker.observe_probe_error(&err.to_string());
                    warn!(
                        target: "monitoring",
                        session_id = %session.session_id,
                        error = %err,
                        "probe failed; sample is neutral"
                    );
                }
                Ok(Ok(sample)) => {
                    let evaluation = evaluate(&sample, &self.thresholds);
                    tracker.observe(&evaluation);
                    info!(
                        target: "monitoring",
                        session_id = %session.session_id,
                        p95 = sample.latency_p95_ms,
                        p99 = sample.latency_p99_ms,
                        error_rate = sample.error_rate,
                        throughput = sample.throughput_rps,
                        compliant = evaluation.is_compliant(),
                        consecutive = tracker.consecutive(),
                        "sample evaluated"
                    );
                    samples.push(sample);
                    if tracker.rollback_required() {
                        return Ok(MonitorVerdict::RollbackRequired);
                    }
                }
            }
        }
    }

    /// Compensating path. Runs at most once per session; any failure inside
    /// surfaces as a partial-rollback terminal instead of a retry loop.
    async fn rollback(
        &self,
        mut run: RunState,
        mut record: RollbackRecord,
        detail: String,
    ) -> Result<SessionRunSummary, OrchestratorError> {
        record.before_snapshot = run.samples.last().cloned();
        self.transition(
            &mut run.session,
            SessionState::RollingBack,
            Some(detail.as_str()),
            NotifySeverity::High,
        )
        .await?;

        let mut partial: Option<String> = None;

        match self.traffic.set_weight(0) {
            Ok(()) => {
                run.session.weight = 0;
                self.sessions.update(&run.session)?;
                record.traffic_zeroed_at = Some(Utc::now());
            }
            Err(err) => partial = Some(format!("failed to zero canary weight: {err}")),
        }

        if partial.is_none() {
            match run.backup.as_mut() {
                Some(backup) => match self.backup.restore(backup) {
                    Ok(()) => record.state_restored_at = Some(Utc::now()),
                    Err(err) => partial = Some(format!("restore failed: {err}")),
                },
                None => partial = Some("no backup available to restore".to_string()),
            }
        }

        if partial.is_none() {
            if let Err(err) = self.traffic.clear_canary_keys() {
                partial = Some(format!("failed to clear canary flags: {err}"));
            }
        }

        if partial.is_none() {
            match self.metrics.fetch().await {
                Ok(sample) => {
                    record.after_snapshot = Some(sample);
                    record.verified_at = Some(Utc::now());
                }
                Err(err) => {
                    partial = Some(format!("post-rollback health verification failed: {err}"));
                }
            }
        }

        run.rollback = Some(record);
        match partial {
            None => {
                run.session.outcome = Some(SessionOutcome::RolledBack);
                run.session.ended_at = Some(Utc::now());
                self.transition(
                    &mut run.session,
                    SessionState::RolledBack,
                    Some(detail.as_str()),
                    NotifySeverity::High,
                )
                .await?;
                let report_path = self.write_report(&run)?;
                Ok(summarize(run, SessionOutcome::RolledBack, report_path, None))
            }
            Some(failure) => {
                run.session.outcome = Some(SessionOutcome::FailedPartialRollback);
                run.session.ended_at = Some(Utc::now());
                self.transition(
                    &mut run.session,
                    SessionState::Failed,
                    Some(failure.as_str()),
                    NotifySeverity::Critical,
                )
                .await?;
                // Loudest channel: the system may be left inconsistent and
                // needs an operator.
                self.send(
                    &run.session,
                    NotifySeverity::Critical,
                    format!("PARTIAL ROLLBACK — operator intervention required: {failure}"),
                )
                .await;
                let report_path = self.write_report(&run)?;
                Ok(summarize(
                    run,
                    SessionOutcome::FailedPartialRollback,
                    report_path,
                    Some(failure),
                ))
            }
        }
    }

    async fn finish_failed(
        &self,
        mut run: RunState,
        detail: String,
    ) -> Result<SessionRunSummary, OrchestratorError> {
        run.session.outcome = Some(SessionOutcome::Failed);
        run.session.ended_at = Some(Utc::now());
        self.transition(
            &mut run.session,
            SessionState::Failed,
            Some(detail.as_str()),
            NotifySeverity::High,
        )
        .await?;
        let report_path = self.write_report(&run)?;
        Ok(summarize(run, SessionOutcome::Failed, report_path, Some(detail)))
    }

    async fn finish_stable(
        &self,
        mut run: RunState,
    ) -> Result<SessionRunSummary, OrchestratorError> {
        run.session.outcome = Some(SessionOutcome::Stable);
        run.session.ended_at = Some(Utc::now());
        self.transition(
            &mut run.session,
            SessionState::Stable,
            Some("canary promoted to 100% traffic"),
            NotifySeverity::Low,
        )
        .await?;
        let report_path = self.write_report(&run)?;
        Ok(summarize(run, SessionOutcome::Stable, report_path, None))
    }

    async fn transition(
        &self,
        session: &mut DeploymentSession,
        state: SessionState,
        detail: Option<&str>,
        severity: NotifySeverity,
    ) -> Result<(), OrchestratorError> {
        session.state = state;
        self.sessions.update(session)?;
        self.sessions
            .record_transition(&session.session_id, state, detail)?;
        info!(
            target: "orchestrator",
            session_id = %session.session_id,
            state = %state,
            detail = detail.unwrap_or(""),
            "state transition"
        );
        let message = match detail {
            Some(detail) => format!("{state}: {detail}"),
            None => state.to_string(),
        };
        self.send(session, severity, message).await;
        Ok(())
    }

    async fn send(
        &self,
        session: &DeploymentSession,
        severity: NotifySeverity,
        message: impl Into<String>,
    ) {
        let notification = DeploymentNotification::new(
            &session.session_id,
            &session.environment,
            session.state.as_str(),
            severity,
            message,
        );
        if let Err(err) = self.notifier.notify(&notification).await {
            warn!(
                target: "orchestrator",
                session_id = %session.session_id,
                error = %err,
                "notification delivery failed"
            );
        }
    }

    fn write_report(&self, run: &RunState) -> Result<PathBuf, OrchestratorError> {
        let report = EvidenceReport::build(
            run.session.clone(),
            self.thresholds.clone(),
            run.backup.clone(),
            run.samples.clone(),
            run.tracker.trace().to_vec(),
            run.rollback.clone(),
        );
        let path = report.write(&self.reports_dir)?;
        info!(
            target: "orchestrator",
            session_id = %run.session.session_id,
            path = %path.display(),
            "evidence report written"
        );
        Ok(path)
    }
}

fn summarize(
    run: RunState,
    outcome: SessionOutcome,
    report_path: PathBuf,
    failure: Option<String>,
) -> SessionRunSummary {
    SessionRunSummary {
        rollback_cause: run.rollback.as_ref().map(|record| record.cause),
        session: run.session,
        outcome,
        report_path,
        failure,
    }
}

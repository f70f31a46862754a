use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backup::Backup;
use crate::probe::MetricSample;
use crate::session::DeploymentSession;
use crate::slo::{BreachTraceEntry, SloDimension, SloThresholdSet};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackCause {
    SloBreach,
    MigrationFailure,
    DeployFailure,
    OperatorAbort,
}

/// Why and how a rollback executed. Created only when a rollback runs;
/// immutable once the evidence report is written.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackRecord {
    pub cause: RollbackCause,
    pub violations: Vec<SloDimension>,
    pub triggered_at_sample: Option<usize>,
    pub triggered_at: DateTime<Utc>,
    pub traffic_zeroed_at: Option<DateTime<Utc>>,
    pub state_restored_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub before_snapshot: Option<MetricSample>,
    pub after_snapshot: Option<MetricSample>,
}

impl RollbackRecord {
    pub fn new(
        cause: RollbackCause,
        violations: Vec<SloDimension>,
        triggered_at_sample: Option<usize>,
    ) -> Self {
        Self {
            cause,
            violations,
            triggered_at_sample,
            triggered_at: Utc::now(),
            traffic_zeroed_at: None,
            state_restored_at: None,
            verified_at: None,
            before_snapshot: None,
            after_snapshot: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleAverages {
    pub sample_count: usize,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub error_rate: f64,
    pub throughput_rps: f64,
}

pub fn averages(samples: &[MetricSample]) -> SampleAverages {
    let count = samples.len();
    let avg = |select: fn(&MetricSample) -> f64| {
        if count == 0 {
            0.0
        } else {
            samples.iter().map(select).sum::<f64>() / count as f64
        }
    };
    SampleAverages {
        sample_count: count,
        latency_p50_ms: avg(|sample| sample.latency_p50_ms),
        latency_p95_ms: avg(|sample| sample.latency_p95_ms),
        latency_p99_ms: avg(|sample| sample.latency_p99_ms),
        error_rate: avg(|sample| sample.error_rate),
        throughput_rps: avg(|sample| sample.throughput_rps),
    }
}

/// Recovery time broken down by rollback phase: detection → traffic zeroed
/// → state restored → verified stable.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryBreakdown {
    pub detection_to_traffic_zeroed_ms: Option<i64>,
    pub traffic_zeroed_to_restored_ms: Option<i64>,
    pub restored_to_verified_ms: Option<i64>,
    pub total_ms: Option<i64>,
}

impl RecoveryBreakdown {
    pub fn from_record(record: &RollbackRecord) -> Self {
        let gap = |from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>| match (from, to) {
            (Some(from), Some(to)) => Some((to - from).num_milliseconds()),
            _ => None,
        };
        Self {
            detection_to_traffic_zeroed_ms: gap(Some(record.triggered_at), record.traffic_zeroed_at),
            traffic_zeroed_to_restored_ms: gap(record.traffic_zeroed_at, record.state_restored_at),
            restored_to_verified_ms: gap(record.state_restored_at, record.verified_at),
            total_ms: gap(Some(record.triggered_at), record.verified_at),
        }
    }
}

/// Audit artifact of one session: metadata, thresholds, the full ordered
/// sample sequence, the breach trace, and the rollback record if one exists.
/// Written from in-memory state even when notification delivery fails.
#[derive(Debug, Clone, Serialize)]
pub struct EvidenceReport {
    pub session: DeploymentSession,
    pub thresholds: SloThresholdSet,
    pub backup: Option<Backup>,
    pub samples: Vec<MetricSample>,
    pub breach_trace: Vec<BreachTraceEntry>,
    pub rollback: Option<RollbackRecord>,
    pub averages: SampleAverages,
    pub recovery: Option<RecoveryBreakdown>,
    pub generated_at: DateTime<Utc>,
}

impl EvidenceReport {
    pub fn build(
        session: DeploymentSession,
        thresholds: SloThresholdSet,
        backup: Option<Backup>,
        samples: Vec<MetricSample>,
        breach_trace: Vec<BreachTraceEntry>,
        rollback: Option<RollbackRecord>,
    ) -> Self {
        let averages = averages(&samples);
        let recovery = rollback.as_ref().map(RecoveryBreakdown::from_record);
        Self {
            session,
            thresholds,
            backup,
            samples,
            breach_trace,
            rollback,
            averages,
            recovery,
            generated_at: Utc::now(),
        }
    }

    pub fn file_name(&self) -> String {
        format!("evidence_{}.json", self.session.session_id)
    }

    pub fn write(&self, reports_dir: impl AsRef<Path>) -> Result<PathBuf, ReportError> {
        let reports_dir = reports_dir.as_ref();
        fs::create_dir_all(reports_dir).map_err(|source| ReportError::Io {
            source,
            path: reports_dir.to_path_buf(),
        })?;
        let path = reports_dir.join(self.file_name());
        let payload = serde_json::to_string_pretty(self)?;
        fs::write(&path, payload).map_err(|source| ReportError::Io {
            source,
            path: path.clone(),
        })?;
        Ok(path)
    }
}

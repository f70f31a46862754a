use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::slo::SloThresholdSet;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CanaryConfig {
    pub deploy: DeploySection,
    pub slo: SloSection,
    pub monitoring: MonitoringSection,
    pub backup: BackupSection,
    pub notify: NotifySection,
    pub paths: PathsSection,
}

impl CanaryConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    /// Materializes the immutable per-session threshold set handed to the
    /// orchestrator. Loaded once at session start; never mutated afterwards.
    pub fn thresholds(&self) -> SloThresholdSet {
        SloThresholdSet {
            latency_p50_baseline_ms: self.slo.latency_p50_baseline_ms,
            latency_p95_baseline_ms: self.slo.latency_p95_baseline_ms,
            latency_p99_baseline_ms: self.slo.latency_p99_baseline_ms,
            latency_p95_max_ms: self.slo.latency_p95_max_ms,
            latency_p99_max_ms: self.slo.latency_p99_max_ms,
            error_rate_baseline: self.slo.error_rate_baseline,
            error_rate_max: self.slo.error_rate_max,
            throughput_baseline_rps: self.slo.throughput_baseline_rps,
            throughput_min_rps: self.slo.throughput_min_rps,
            breach_ceiling: self.slo.breach_ceiling,
            sample_interval_secs: self.monitoring.sample_interval_seconds,
            monitor_duration_secs: self.monitoring.duration_seconds,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeploySection {
    pub environment: String,
    pub stage_weights: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SloSection {
    pub latency_p50_baseline_ms: f64,
    pub latency_p95_baseline_ms: f64,
    pub latency_p99_baseline_ms: f64,
    pub latency_p95_max_ms: f64,
    pub latency_p99_max_ms: f64,
    pub error_rate_baseline: f64,
    pub error_rate_max: f64,
    pub throughput_baseline_rps: f64,
    pub throughput_min_rps: f64,
    pub breach_ceiling: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringSection {
    pub metrics_endpoint: String,
    pub probe_timeout_seconds: u64,
    pub sample_interval_seconds: u64,
    pub duration_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupSection {
    pub source_db: String,
    pub backup_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifySection {
    pub enabled: bool,
    pub webhook_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub data_dir: String,
    pub reports_dir: String,
    pub sessions_db: String,
    pub flags_db: String,
    pub migrations_dir: String,
}

fn read_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

pub fn load_canary_config(path: impl AsRef<Path>) -> Result<CanaryConfig> {
    read_config(path.as_ref())
}

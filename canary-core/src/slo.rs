use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::probe::MetricSample;

/// Immutable per-session SLO configuration. Baselines are informational
/// context for reports; the `*_max`/`*_min` values are the hard gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloThresholdSet {
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
    pub sample_interval_secs: u64,
    pub monitor_duration_secs: u64,
}

impl SloThresholdSet {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn monitor_duration(&self) -> Duration {
        Duration::from_secs(self.monitor_duration_secs)
    }
}

/// Dimensions evaluated against the hard thresholds. p50 latency is carried
/// in samples and reports but is not a breach dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SloDimension {
    #[serde(rename = "p95")]
    LatencyP95,
    #[serde(rename = "p99")]
    LatencyP99,
    #[serde(rename = "error_rate")]
    ErrorRate,
    #[serde(rename = "throughput")]
    Throughput,
}

impl SloDimension {
    pub fn label(self) -> &'static str {
        match self {
            Self::LatencyP95 => "p95",
            Self::LatencyP99 => "p99",
            Self::ErrorRate => "error_rate",
            Self::Throughput => "throughput",
        }
    }
}

impl fmt::Display for SloDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Verdict for a single sample. Compliant iff zero dimensions violate;
/// simultaneous violations are all recorded, not just the first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SloEvaluation {
    pub violations: Vec<SloDimension>,
}

impl SloEvaluation {
    pub fn is_compliant(&self) -> bool {
        self.violations.is_empty()
    }
}

pub fn evaluate(sample: &MetricSample, thresholds: &SloThresholdSet) -> SloEvaluation {
    let mut violations = Vec::new();
    if sample.latency_p95_ms > thresholds.latency_p95_max_ms {
        violations.push(SloDimension::LatencyP95);
    }
    if sample.latency_p99_ms > thresholds.latency_p99_max_ms {
        violations.push(SloDimension::LatencyP99);
    }
    if sample.error_rate > thresholds.error_rate_max {
        violations.push(SloDimension::ErrorRate);
    }
    // Inverse direction: throughput breaches below the floor.
    if sample.throughput_rps < thresholds.throughput_min_rps {
        violations.push(SloDimension::Throughput);
    }
    SloEvaluation { violations }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachPhase {
    Clear,
    Accumulating(u32),
    RollbackRequired,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BreachObservation {
    Compliant,
    Breaching { violations: Vec<SloDimension> },
    ProbeError { detail: String },
}

/// One row of the per-session evaluation trace kept for the evidence report.
#[derive(Debug, Clone, Serialize)]
pub struct BreachTraceEntry {
    pub sample_index: usize,
    pub timestamp: DateTime<Utc>,
    pub observation: BreachObservation,
    pub consecutive: u32,
}

/// Consecutive-breach counter with hysteresis. Any compliant sample resets
/// the counter; a probe error is neutral (neither resets nor advances).
/// Reaching the ceiling latches `RollbackRequired` for the session; later
/// observations are ignored so a second rollback can never be requested.
#[derive(Debug)]
pub struct BreachTracker {
    ceiling: u32,
    consecutive: u32,
    tripped: bool,
    trip_index: Option<usize>,
    trip_violations: Vec<SloDimension>,
    last_evaluation: Option<SloEvaluation>,
    observations: usize,
    trace: Vec<BreachTraceEntry>,
}

impl BreachTracker {
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling: ceiling.max(1),
            consecutive: 0,
            tripped: false,
            trip_index: None,
            trip_violations: Vec::new(),
            last_evaluation: None,
            observations: 0,
            trace: Vec::new(),
        }
    }

    pub fn observe(&mut self, evaluation: &SloEvaluation) -> BreachPhase {
        if self.tripped {
            return BreachPhase::RollbackRequired;
        }
        let index = self.observations;
        self.observations += 1;
        self.last_evaluation = Some(evaluation.clone());
        let observation = if evaluation.is_compliant() {
            self.consecutive = 0;
            BreachObservation::Compliant
        } else {
            self.consecutive += 1;
            if self.consecutive >= self.ceiling {
                self.tripped = true;
                self.trip_index = Some(index);
                self.trip_violations = evaluation.violations.clone();
            }
            BreachObservation::Breaching {
                violations: evaluation.violations.clone(),
            }
        };
        self.trace.push(BreachTraceEntry {
            sample_index: index,
            timestamp: Utc::now(),
            observation,
            consecutive: self.consecutive,
        });
        self.phase()
    }

    pub fn observe_probe_error(&mut self, detail: &str) -> BreachPhase {
        if self.tripped {
            return BreachPhase::RollbackRequired;
        }
        let index = self.observations;
        self.observations += 1;
        self.trace.push(BreachTraceEntry {
            sample_index: index,
            timestamp: Utc::now(),
            observation: BreachObservation::ProbeError {
                detail: detail.to_string(),
            },
            consecutive: self.consecutive,
        });
        self.phase()
    }

    pub fn phase(&self) -> BreachPhase {
        if self.tripped {
            BreachPhase::RollbackRequired
        } else if self.consecutive == 0 {
            BreachPhase::Clear
        } else {
            BreachPhase::Accumulating(self.consecutive)
        }
    }

    pub fn rollback_required(&self) -> bool {
        self.tripped
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn trip_sample_index(&self) -> Option<usize> {
        self.trip_index
    }

    pub fn trip_violations(&self) -> &[SloDimension] {
        &self.trip_violations
    }

    pub fn last_evaluation(&self) -> Option<&SloEvaluation> {
        self.last_evaluation.as_ref()
    }

    pub fn trace(&self) -> &[BreachTraceEntry] {
        &self.trace
    }
}

use canary_core::{
    averages, DeploymentSession, EvidenceReport, MetricSample, RecoveryBreakdown, RollbackCause,
    RollbackRecord, SloThresholdSet,
};
use chrono::{Duration, Utc};
use tempfile::TempDir;

fn thresholds() -> SloThresholdSet {
    SloThresholdSet {
        latency_p50_baseline_ms: 120.0,
        latency_p95_baseline_ms: 300.0,
        latency_p99_baseline_ms: 600.0,
        latency_p95_max_ms: 500.0,
        latency_p99_max_ms: 900.0,
        error_rate_baseline: 0.002,
        error_rate_max: 0.01,
        throughput_baseline_rps: 220.0,
        throughput_min_rps: 100.0,
        breach_ceiling: 3,
        sample_interval_secs: 30,
        monitor_duration_secs: 900,
    }
}

fn sample(p95: f64, throughput: f64) -> MetricSample {
    MetricSample {
        captured_at: Utc::now(),
        latency_p50_ms: 120.0,
        latency_p95_ms: p95,
        latency_p99_ms: 600.0,
        error_rate: 0.002,
        throughput_rps: throughput,
    }
}

#[test]
fn averages_are_per_dimension_means() {
    let samples = vec![sample(300.0, 200.0), sample(500.0, 240.0)];
    let averages = averages(&samples);
    assert_eq!(averages.sample_count, 2);
    assert_eq!(averages.latency_p95_ms, 400.0);
    assert_eq!(averages.throughput_rps, 220.0);
}

#[test]
fn averages_of_no_samples_are_zero() {
    let averages = averages(&[]);
    assert_eq!(averages.sample_count, 0);
    assert_eq!(averages.latency_p95_ms, 0.0);
}

#[test]
fn recovery_breakdown_measures_each_phase() {
    let mut record = RollbackRecord::new(RollbackCause::SloBreach, Vec::new(), Some(3));
    record.traffic_zeroed_at = Some(record.triggered_at + Duration::milliseconds(150));
    record.state_restored_at = Some(record.triggered_at + Duration::milliseconds(2_150));
    record.verified_at = Some(record.triggered_at + Duration::milliseconds(2_650));

    let breakdown = RecoveryBreakdown::from_record(&record);
    assert_eq!(breakdown.detection_to_traffic_zeroed_ms, Some(150));
    assert_eq!(breakdown.traffic_zeroed_to_restored_ms, Some(2_000));
    assert_eq!(breakdown.restored_to_verified_ms, Some(500));
    assert_eq!(breakdown.total_ms, Some(2_650));
}

#[test]
fn partial_rollback_leaves_later_phases_unmeasured() {
    let mut record = RollbackRecord::new(RollbackCause::MigrationFailure, Vec::new(), None);
    record.traffic_zeroed_at = Some(record.triggered_at + Duration::milliseconds(100));

    let breakdown = RecoveryBreakdown::from_record(&record);
    assert_eq!(breakdown.detection_to_traffic_zeroed_ms, Some(100));
    assert_eq!(breakdown.traffic_zeroed_to_restored_ms, None);
    assert_eq!(breakdown.total_ms, None);
}

#[test]
fn report_file_is_named_after_the_session() {
    let session = DeploymentSession::new("production", false);
    let report = EvidenceReport::build(
        session.clone(),
        thresholds(),
        None,
        Vec::new(),
        Vec::new(),
        None,
    );
    assert_eq!(
        report.file_name(),
        format!("evidence_{}.json", session.session_id)
    );
}

#[test]
fn written_report_is_valid_json_with_the_full_record() {
    let temp = TempDir::new().unwrap();
    let session = DeploymentSession::new("production", false);
    let mut record = RollbackRecord::new(RollbackCause::SloBreach, Vec::new(), Some(2));
    record.traffic_zeroed_at = Some(Utc::now());

    let report = EvidenceReport::build(
        session,
        thresholds(),
        None,
        vec![sample(300.0, 200.0), sample(650.0, 180.0)],
        Vec::new(),
        Some(record),
    );
    let path = report.write(temp.path().join("reports")).unwrap();
    assert!(path.exists());

    let raw = std::fs::read_to_string(&path).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["rollback"]["cause"], "slo_breach");
    assert_eq!(value["rollback"]["triggered_at_sample"], 2);
    assert_eq!(value["averages"]["sample_count"], 2);
    assert!(value["recovery"]["detection_to_traffic_zeroed_ms"].is_number());
    assert!(value["recovery"]["total_ms"].is_null());
}

use canary_core::{FlagTrafficController, TrafficController, TrafficError, TRAFFIC_WEIGHT_FLAG};
use rusqlite::{params, Connection};
use tempfile::TempDir;

fn setup() -> (TempDir, FlagTrafficController) {
    let temp = TempDir::new().unwrap();
    let controller = FlagTrafficController::new(temp.path().join("flags.sqlite"));
    controller.initialize().unwrap();
    (temp, controller)
}

#[test]
fn unset_weight_reads_as_zero() {
    let (_temp, controller) = setup();
    assert_eq!(controller.weight().unwrap(), 0);
}

#[test]
fn weight_round_trips_through_the_flag_store() {
    let (_temp, controller) = setup();
    controller.set_weight(25).unwrap();
    assert_eq!(controller.weight().unwrap(), 25);
    controller.set_weight(100).unwrap();
    assert_eq!(controller.weight().unwrap(), 100);
    controller.set_weight(0).unwrap();
    assert_eq!(controller.weight().unwrap(), 0);
}

#[test]
fn weight_above_hundred_is_rejected() {
    let (_temp, controller) = setup();
    let err = controller.set_weight(101).unwrap_err();
    assert!(matches!(err, TrafficError::InvalidWeight(101)));
    assert_eq!(controller.weight().unwrap(), 0);
}

#[test]
fn corrupt_stored_weight_is_an_error() {
    let (temp, controller) = setup();
    controller.set_weight(10).unwrap();

    let conn = Connection::open(temp.path().join("flags.sqlite")).unwrap();
    conn.execute(
        "UPDATE feature_flags SET value = 'lots' WHERE key = ?1",
        params![TRAFFIC_WEIGHT_FLAG],
    )
    .unwrap();

    let err = controller.weight().unwrap_err();
    assert!(matches!(err, TrafficError::Corrupt(value) if value == "lots"));
}

#[test]
fn clearing_canary_keys_spares_the_weight_flag() {
    let (temp, controller) = setup();
    controller.set_weight(0).unwrap();

    let conn = Connection::open(temp.path().join("flags.sqlite")).unwrap();
    conn.execute(
        "INSERT INTO feature_flags (key, value, updated_at) VALUES ('canary.experiment_cohort', 'b', datetime('now'))",
        [],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO feature_flags (key, value, updated_at) VALUES ('search.ranking_v2', 'on', datetime('now'))",
        [],
    )
    .unwrap();

    controller.clear_canary_keys().unwrap();

    let keys = {
        let mut stmt = conn
            .prepare("SELECT key FROM feature_flags ORDER BY key")
            .unwrap();
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        rows
    };
    assert_eq!(
        keys,
        vec![
            TRAFFIC_WEIGHT_FLAG.to_string(),
            "search.ranking_v2".to_string()
        ]
    );
}

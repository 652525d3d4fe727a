use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use zw_engine::alerts::{BackoffConfig, ZoneConfig};
use zw_engine::PersonKey;
use zw_kernel::Kernel;
use zw_worker::config::WorkerConfig;
use zw_worker::coordinator::{run_alert_job, run_occupancy_job};

fn test_config(dir: &TempDir) -> WorkerConfig {
    WorkerConfig {
        worker_id: "worker-it".to_string(),
        state_dir: PathBuf::from(dir.path()),
        chunk_size: 100,
        occupancy_interval: Duration::from_secs(10),
        alert_interval: Duration::from_secs(5),
        backoff: BackoffConfig::default(),
        alert_freshness: chrono::Duration::days(1),
    }
}

fn ts(min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 30, 9, min, 0).unwrap()
}

#[tokio::test]
async fn full_run_reconstructs_timelines_and_alerts() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    let kernel = Kernel::open(dir.path()).unwrap();

    kernel.upsert_zone(1, "lobby", None).unwrap();
    kernel.upsert_zone(2, "lab", None).unwrap();
    // Known person 7 moves lobby -> lab; unknown person 3 stays put.
    kernel.insert_detection(1, ts(0), PersonKey::Known(7)).unwrap();
    kernel.insert_detection(1, ts(2), PersonKey::Unknown(3)).unwrap();
    kernel.insert_detection(2, ts(30), PersonKey::Known(7)).unwrap();

    let report = run_occupancy_job(&kernel, &cfg).await.unwrap();
    assert_eq!(report.logs_processed, 3);
    assert_eq!(report.people_processed, 2);
    assert_eq!(report.alerts.unknown, 1);

    let history = kernel.intervals_for(PersonKey::Known(7)).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].zone_id, 1);
    assert_eq!(history[0].to, Some(ts(30)));
    assert_eq!(history[1].zone_id, 2);
    assert_eq!(history[1].to, None);

    // At most one open interval per person.
    assert_eq!(kernel.open_intervals().unwrap().len(), 2);
}

#[tokio::test]
async fn rerunning_with_no_new_events_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    let kernel = Kernel::open(dir.path()).unwrap();

    kernel.upsert_zone(1, "lobby", None).unwrap();
    kernel.insert_detection(1, ts(0), PersonKey::Known(7)).unwrap();

    run_occupancy_job(&kernel, &cfg).await.unwrap();
    let before = kernel.intervals_for(PersonKey::Known(7)).unwrap().len();

    let report = run_occupancy_job(&kernel, &cfg).await.unwrap();
    assert_eq!(report.logs_processed, 0);
    assert_eq!(kernel.intervals_for(PersonKey::Known(7)).unwrap().len(), before);
}

#[tokio::test]
async fn phase_two_failure_rolls_back_the_claim() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    let kernel = Kernel::open(dir.path()).unwrap();

    kernel.upsert_zone(1, "lobby", None).unwrap();
    kernel.insert_detection(1, ts(0), PersonKey::Known(7)).unwrap();

    // Sabotage phase two: the alert step joins zones, so dropping the
    // table makes the second transaction fail after the claim commits.
    let conn = rusqlite::Connection::open(kernel.db_path()).unwrap();
    conn.execute("DROP TABLE zones", []).unwrap();

    let err = run_occupancy_job(&kernel, &cfg).await.unwrap_err();
    assert!(format!("{err:#}").contains("claim rolled back"));
    // The rollback left nothing reconciled.
    assert!(kernel.intervals_for(PersonKey::Known(7)).unwrap().is_empty());

    // Restore the table; the compensated batch is claimable again and
    // the next run succeeds end to end.
    conn.execute(
        "CREATE TABLE zones (id INTEGER PRIMARY KEY, name TEXT NOT NULL, config TEXT)",
        [],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO zones(id, name, config) VALUES(1, 'lobby', NULL)",
        [],
    )
    .unwrap();

    let report = run_occupancy_job(&kernel, &cfg).await.unwrap();
    assert_eq!(report.logs_processed, 1);
    assert_eq!(kernel.intervals_for(PersonKey::Known(7)).unwrap().len(), 1);
}

#[tokio::test]
async fn alert_job_applies_backoff_across_runs() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    let kernel = Kernel::open(dir.path()).unwrap();

    kernel
        .upsert_zone(
            5,
            "vault",
            Some(&ZoneConfig {
                is_active: Some(false),
                ..Default::default()
            }),
        )
        .unwrap();
    kernel.insert_detection(5, ts(0), PersonKey::Known(9)).unwrap();

    // The occupancy run already alerts once; an immediate alert run
    // falls inside the backoff window and inserts nothing.
    let report = run_occupancy_job(&kernel, &cfg).await.unwrap();
    assert_eq!(report.alerts.unauthorized, 1);
    let counts = run_alert_job(&kernel, &cfg).await.unwrap();
    assert_eq!(counts.total(), 0);
    assert_eq!(kernel.list_alerts(10).unwrap().len(), 1);
}

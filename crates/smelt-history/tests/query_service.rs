//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Batch history query tests against the in-memory store."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use smelt_common::{ArcSnapshot, EmergencyStop, FeedingRecord, PhaseValues};
use smelt_history::{
    arc_points, feeding_point, HistoryQueryService, MemoryStore, QueryRange, TimeSeriesStore,
};

const MEASUREMENT: &str = "sensor_data";

fn base() -> DateTime<Utc> {
    Utc::now() - Duration::days(2)
}

fn arc_at(time: DateTime<Utc>, energy: f64) -> ArcSnapshot {
    ArcSnapshot {
        arc_current: PhaseValues::new(5000.0, 5000.0, 5000.0),
        arc_voltage: PhaseValues::new(90.0, 90.0, 90.0),
        setpoints: PhaseValues::new(5200.0, 5200.0, 5200.0),
        manual_deadzone_percent: 5.0,
        power_total: 1147.5,
        energy_total: energy,
        emergency_stop: EmergencyStop::default(),
        timestamp: time,
    }
}

fn local(time: DateTime<Utc>) -> NaiveDateTime {
    smelt_common::time::to_local(time).naive_local()
}

async fn seeded() -> (MemoryStore, HistoryQueryService, DateTime<Utc>) {
    let store = MemoryStore::new();
    let t0 = base();
    for step in 0..7 {
        let time = t0 + Duration::seconds(step * 10);
        store
            .write(&arc_points(MEASUREMENT, "A", &arc_at(time, 100.0 + step as f64)))
            .await
            .unwrap();
    }
    for step in 0..3 {
        let time = t0 + Duration::hours(1) + Duration::seconds(step * 10);
        store
            .write(&arc_points(MEASUREMENT, "B", &arc_at(time, 200.0)))
            .await
            .unwrap();
    }
    for (offset, weight) in [(15, 120.0), (45, 85.0)] {
        let record = FeedingRecord {
            timestamp: t0 + Duration::seconds(offset),
            discharge_weight: weight,
        };
        store.write(&feeding_point("A", &record)).await.unwrap();
    }
    let service = HistoryQueryService::new(Arc::new(store.clone()), MEASUREMENT);
    (store, service, t0)
}

#[tokio::test]
async fn batch_list_is_most_recent_first_in_local_time() {
    let (_store, service, t0) = seeded().await;
    let batches = service.get_batch_list(10).await.unwrap();
    let codes: Vec<&str> = batches.iter().map(|b| b.batch_code.as_str()).collect();
    assert_eq!(codes, vec!["B", "A"]);
    assert_eq!(batches[1].start_time.offset().local_minus_utc(), 8 * 3600);
    assert_eq!(batches[1].start_time.naive_local(), local(t0));

    let limited = service.get_batch_list(1).await.unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].batch_code, "B");
}

#[tokio::test]
async fn range_queries_filter_by_batch_and_aggregate() {
    let (_store, service, t0) = seeded().await;
    let range = QueryRange::new(local(t0), local(t0 + Duration::hours(2))).batch("A");
    let raw = service.query_arc_data(&range).await.unwrap();
    assert_eq!(raw["energy_total"].len(), 7);
    assert_eq!(raw["arc_current_U"][0].value, 5000.0);
    assert!(raw["energy_total"]
        .windows(2)
        .all(|pair| pair[0].time < pair[1].time));

    let unfiltered = QueryRange::new(local(t0), local(t0 + Duration::hours(2)));
    let all = service.query_arc_data(&unfiltered).await.unwrap();
    assert_eq!(all["energy_total"].len(), 10);

    // a two hour span averages over five minute windows
    let aggregated = service.query_arc_data(&range.aggregated()).await.unwrap();
    let windows = &aggregated["energy_total"];
    assert!(windows.len() <= 2);
    let total: f64 = windows.iter().map(|w| w.value).sum();
    assert!(total > 0.0);
    assert!(service
        .query_valve_openness(&unfiltered)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn inverted_range_is_rejected() {
    let (_store, service, t0) = seeded().await;
    let range = QueryRange::new(local(t0), local(t0 - Duration::minutes(1)));
    assert!(service.query_hopper(&range).await.is_err());
}

#[tokio::test]
async fn batch_range_and_statistics_use_first_and_last_points() {
    let (_store, service, t0) = seeded().await;
    let range = service.query_batch_time_range("A").await.unwrap().unwrap();
    assert_eq!(range.start.naive_local(), local(t0));
    assert_eq!(range.duration_seconds, 60.0);

    let stats = service.query_batch_statistics("A").await.unwrap().unwrap();
    assert_eq!(stats.energy_consumed_kwh, Some(6.0));
    assert_eq!(stats.feeding_events, 2);
    assert_eq!(stats.discharged_weight, 205.0);
    assert_eq!(stats.shell_water_total, None);

    let feeding = service.query_feeding_records("A").await.unwrap();
    let weights: Vec<f64> = feeding.iter().map(|e| e.discharge_weight).collect();
    assert_eq!(weights, vec![120.0, 85.0]);

    assert!(service.query_batch_time_range("missing").await.unwrap().is_none());
    assert!(service.query_batch_statistics("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn deleting_a_batch_removes_all_of_its_points() {
    let (store, service, _t0) = seeded().await;
    let before = store.len();
    service.delete_batch_data("A").await.unwrap();
    assert!(store.len() < before);
    let codes: Vec<String> = service
        .get_batch_list(10)
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.batch_code)
        .collect();
    assert_eq!(codes, vec!["B".to_owned()]);
    assert!(service.query_feeding_records("A").await.unwrap().is_empty());
}

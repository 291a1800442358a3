//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Batch-tagged time-series history for the furnace."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Historical queries for the batch and trend screens.
//!
//! Callers speak plant-local time (UTC+8); the store holds UTC. Every
//! conversion happens here.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde::Serialize;
use smelt_common::time::{local_naive_to_utc, seconds_between, to_local};
use tracing::info;

use crate::point::{fields, FEEDING_MEASUREMENT, FIELD_DISCHARGE_WEIGHT, TAG_BATCH_CODE};
use crate::store::{Aggregation, SeriesPoint, SeriesQuery, TimeSeriesStore};
use crate::{HistoryError, Result};

/// How far back the batch list looks.
pub const BATCH_LOOKBACK_DAYS: i64 = 90;

/// Number of points an aggregated query aims for.
pub const TARGET_POINTS: u64 = 100;

const INTERVAL_LADDER_SECS: [u64; 9] = [10, 30, 60, 300, 600, 1800, 3600, 7200, 14400];

/// Mean window for a query span: the smallest ladder step yielding at most
/// about [`TARGET_POINTS`] windows, capped at four hours.
pub fn aggregation_interval(span: chrono::Duration) -> Duration {
    let seconds = u64::try_from(span.num_seconds()).unwrap_or(0);
    let wanted = seconds.div_ceil(TARGET_POINTS);
    let step = INTERVAL_LADDER_SECS
        .iter()
        .copied()
        .find(|step| *step >= wanted)
        .unwrap_or(INTERVAL_LADDER_SECS[INTERVAL_LADDER_SECS.len() - 1]);
    Duration::from_secs(step)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeValue {
    pub time: DateTime<FixedOffset>,
    pub value: f64,
}

/// Samples keyed by field name, each series in time order.
pub type Series = BTreeMap<String, Vec<TimeValue>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch_code: String,
    pub start_time: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchTimeRange {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStatistics {
    pub batch_code: String,
    pub range: BatchTimeRange,
    /// Energy drawn during the batch, from the first and last energy totals.
    pub energy_consumed_kwh: Option<f64>,
    pub shell_water_total: Option<f64>,
    pub cover_water_total: Option<f64>,
    pub feeding_total: Option<f64>,
    pub feeding_events: usize,
    pub discharged_weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedingEvent {
    pub time: DateTime<FixedOffset>,
    pub discharge_weight: f64,
}

/// A local-time query window, optionally restricted to one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRange {
    pub batch_code: Option<String>,
    pub start: NaiveDateTime,
    pub stop: NaiveDateTime,
    /// Reduce to means over [`aggregation_interval`] windows.
    pub aggregate: bool,
}

impl QueryRange {
    pub fn new(start: NaiveDateTime, stop: NaiveDateTime) -> Self {
        Self {
            batch_code: None,
            start,
            stop,
            aggregate: false,
        }
    }

    pub fn batch(mut self, batch_code: impl Into<String>) -> Self {
        self.batch_code = Some(batch_code.into());
        self
    }

    pub fn aggregated(mut self) -> Self {
        self.aggregate = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct HistoryQueryService {
    store: Arc<dyn TimeSeriesStore>,
    measurement: String,
}

impl HistoryQueryService {
    pub fn new(store: Arc<dyn TimeSeriesStore>, measurement: impl Into<String>) -> Self {
        Self {
            store,
            measurement: measurement.into(),
        }
    }

    /// Most recent batches first, each stamped with its earliest point.
    pub async fn get_batch_list(&self, limit: usize) -> Result<Vec<BatchSummary>> {
        let since = Utc::now() - chrono::Duration::days(BATCH_LOOKBACK_DAYS);
        let mut batches = self
            .store
            .first_seen_by_tag(&self.measurement, TAG_BATCH_CODE, since)
            .await?;
        batches.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        batches.truncate(limit);
        Ok(batches
            .into_iter()
            .map(|(batch_code, start)| BatchSummary {
                batch_code,
                start_time: to_local(start),
            })
            .collect())
    }

    pub async fn query_series(&self, range: &QueryRange, names: &[&str]) -> Result<Series> {
        let start = local_naive_to_utc(range.start);
        let stop = local_naive_to_utc(range.stop);
        if stop <= start {
            return Err(HistoryError::Query(format!(
                "empty range {} .. {}",
                range.start, range.stop
            )));
        }
        let mut query = SeriesQuery::new(self.measurement.as_str(), start, stop)
            .fields(names.iter().copied());
        if let Some(batch_code) = &range.batch_code {
            query = query.tag(TAG_BATCH_CODE, batch_code.as_str());
        }
        if range.aggregate {
            query = query.aggregation(Aggregation::Mean(aggregation_interval(stop - start)));
        }
        Ok(group(self.store.query(&query).await?))
    }

    pub async fn query_arc_data(&self, range: &QueryRange) -> Result<Series> {
        let mut names: Vec<&str> = Vec::with_capacity(12);
        names.extend(fields::ARC_CURRENT);
        names.extend(fields::ARC_VOLTAGE);
        names.extend(fields::SETPOINT);
        names.extend([fields::DEADZONE, fields::POWER_TOTAL, fields::ENERGY_TOTAL]);
        self.query_series(range, &names).await
    }

    pub async fn query_electrode_depths(&self, range: &QueryRange) -> Result<Series> {
        self.query_series(range, &fields::ELECTRODE_DEPTH).await
    }

    pub async fn query_cooling_water(&self, range: &QueryRange) -> Result<Series> {
        let mut names: Vec<&str> = Vec::with_capacity(7);
        names.extend(fields::WATER_FLOW);
        names.extend(fields::WATER_PRESS);
        names.extend([fields::PRESSURE_DIFF, fields::SHELL_TOTAL, fields::COVER_TOTAL]);
        self.query_series(range, &names).await
    }

    pub async fn query_hopper(&self, range: &QueryRange) -> Result<Series> {
        self.query_series(
            range,
            &[fields::HOPPER_WEIGHT, fields::FEEDING_TOTAL, fields::UPPER_LIMIT],
        )
        .await
    }

    pub async fn query_valve_openness(&self, range: &QueryRange) -> Result<Series> {
        self.query_series(range, &fields::VALVE_OPENNESS).await
    }

    /// Every discharge recorded for a batch, oldest first.
    pub async fn query_feeding_records(&self, batch_code: &str) -> Result<Vec<FeedingEvent>> {
        let (start, stop) = all_time();
        let query = SeriesQuery::new(FEEDING_MEASUREMENT, start, stop)
            .fields([FIELD_DISCHARGE_WEIGHT])
            .tag(TAG_BATCH_CODE, batch_code);
        Ok(self
            .store
            .query(&query)
            .await?
            .into_iter()
            .map(|point| FeedingEvent {
                time: to_local(point.time),
                discharge_weight: point.value,
            })
            .collect())
    }

    /// First and last timestamps of a batch, or `None` when it has no points.
    pub async fn query_batch_time_range(&self, batch_code: &str) -> Result<Option<BatchTimeRange>> {
        let first = self.edge(batch_code, Aggregation::First, &[]).await?;
        let last = self.edge(batch_code, Aggregation::Last, &[]).await?;
        let start = first.iter().map(|point| point.time).min();
        let end = last.iter().map(|point| point.time).max();
        Ok(match (start, end) {
            (Some(start), Some(end)) => Some(BatchTimeRange {
                start: to_local(start),
                end: to_local(end),
                duration_seconds: seconds_between(start, end),
            }),
            _ => None,
        })
    }

    pub async fn query_batch_statistics(&self, batch_code: &str) -> Result<Option<BatchStatistics>> {
        let Some(range) = self.query_batch_time_range(batch_code).await? else {
            return Ok(None);
        };
        let first = self
            .edge(batch_code, Aggregation::First, &[fields::ENERGY_TOTAL])
            .await?;
        let last = self
            .edge(
                batch_code,
                Aggregation::Last,
                &[
                    fields::ENERGY_TOTAL,
                    fields::SHELL_TOTAL,
                    fields::COVER_TOTAL,
                    fields::FEEDING_TOTAL,
                ],
            )
            .await?;
        let value = |points: &[SeriesPoint], field: &str| {
            points
                .iter()
                .find(|point| point.field == field)
                .map(|point| point.value)
        };
        let energy_consumed_kwh = match (
            value(&first, fields::ENERGY_TOTAL),
            value(&last, fields::ENERGY_TOTAL),
        ) {
            (Some(first), Some(last)) => Some((last - first).max(0.0)),
            _ => None,
        };
        let feeding = self.query_feeding_records(batch_code).await?;
        Ok(Some(BatchStatistics {
            batch_code: batch_code.to_owned(),
            range,
            energy_consumed_kwh,
            shell_water_total: value(&last, fields::SHELL_TOTAL),
            cover_water_total: value(&last, fields::COVER_TOTAL),
            feeding_total: value(&last, fields::FEEDING_TOTAL),
            feeding_events: feeding.len(),
            discharged_weight: feeding.iter().map(|event| event.discharge_weight).sum(),
        }))
    }

    /// Remove every point tagged with the batch, feeding records included.
    pub async fn delete_batch_data(&self, batch_code: &str) -> Result<()> {
        self.store
            .delete_by_tag(&self.measurement, TAG_BATCH_CODE, batch_code)
            .await?;
        self.store
            .delete_by_tag(FEEDING_MEASUREMENT, TAG_BATCH_CODE, batch_code)
            .await?;
        info!(batch_code, "batch history deleted");
        Ok(())
    }

    async fn edge(
        &self,
        batch_code: &str,
        aggregation: Aggregation,
        names: &[&str],
    ) -> Result<Vec<SeriesPoint>> {
        let (start, stop) = all_time();
        let query = SeriesQuery::new(self.measurement.as_str(), start, stop)
            .fields(names.iter().copied())
            .tag(TAG_BATCH_CODE, batch_code)
            .aggregation(aggregation);
        self.store.query(&query).await
    }
}

fn all_time() -> (DateTime<Utc>, DateTime<Utc>) {
    (DateTime::<Utc>::UNIX_EPOCH, Utc::now() + chrono::Duration::days(1))
}

fn group(points: Vec<SeriesPoint>) -> Series {
    let mut series = Series::new();
    for point in points {
        series.entry(point.field).or_default().push(TimeValue {
            time: to_local(point.time),
            value: point.value,
        });
    }
    series
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_ladder_targets_about_a_hundred_points() {
        let secs = |s: u64| Duration::from_secs(s);
        assert_eq!(aggregation_interval(chrono::Duration::minutes(10)), secs(10));
        assert_eq!(aggregation_interval(chrono::Duration::minutes(30)), secs(30));
        assert_eq!(aggregation_interval(chrono::Duration::hours(1)), secs(60));
        assert_eq!(aggregation_interval(chrono::Duration::hours(8)), secs(300));
        assert_eq!(aggregation_interval(chrono::Duration::hours(24)), secs(1800));
        assert_eq!(aggregation_interval(chrono::Duration::days(30)), secs(14400));
        assert_eq!(aggregation_interval(chrono::Duration::seconds(-5)), secs(10));
    }
}

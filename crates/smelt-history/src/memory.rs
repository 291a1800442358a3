//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Batch-tagged time-series history for the furnace."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;

use crate::point::Point;
use crate::store::{Aggregation, SeriesPoint, SeriesQuery, TimeSeriesStore};
use crate::Result;

/// Process-local store. Backs mock mode, tests and deployments without InfluxDB.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    points: Arc<RwLock<Vec<Point>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.read().is_empty()
    }
}

fn window_start(time: DateTime<Utc>, window_ms: i64) -> DateTime<Utc> {
    let millis = time.timestamp_millis();
    let start = millis - millis.rem_euclid(window_ms);
    Utc.timestamp_millis_opt(start).single().unwrap_or(time)
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn write(&self, points: &[Point]) -> Result<()> {
        self.points.write().extend_from_slice(points);
        Ok(())
    }

    async fn query(&self, query: &SeriesQuery) -> Result<Vec<SeriesPoint>> {
        let mut by_field: BTreeMap<String, Vec<(DateTime<Utc>, f64)>> = BTreeMap::new();
        for point in self.points.read().iter().filter(|point| query.matches(point)) {
            by_field
                .entry(point.field.clone())
                .or_default()
                .push((point.time, point.value));
        }

        let mut out = Vec::new();
        for (field, mut samples) in by_field {
            samples.sort_by_key(|(time, _)| *time);
            match query.aggregation {
                Aggregation::Raw => {
                    out.extend(samples.into_iter().map(|(time, value)| SeriesPoint {
                        field: field.clone(),
                        time,
                        value,
                    }));
                }
                Aggregation::First | Aggregation::Last => {
                    let pick = if query.aggregation == Aggregation::First {
                        samples.first()
                    } else {
                        samples.last()
                    };
                    if let Some(&(time, value)) = pick {
                        out.push(SeriesPoint { field, time, value });
                    }
                }
                Aggregation::Mean(window) => {
                    let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX).max(1);
                    let mut windows: BTreeMap<DateTime<Utc>, (f64, u32)> = BTreeMap::new();
                    for (time, value) in samples {
                        let slot = windows.entry(window_start(time, window_ms)).or_default();
                        slot.0 += value;
                        slot.1 += 1;
                    }
                    out.extend(windows.into_iter().map(|(time, (sum, count))| SeriesPoint {
                        field: field.clone(),
                        time,
                        value: sum / f64::from(count),
                    }));
                }
            }
        }
        Ok(out)
    }

    async fn first_seen_by_tag(
        &self,
        measurement: &str,
        tag: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>> {
        let mut first: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
        for point in self.points.read().iter() {
            if point.measurement != measurement || point.time < since {
                continue;
            }
            if let Some(value) = point.tag(tag) {
                first
                    .entry(value.to_owned())
                    .and_modify(|seen| *seen = (*seen).min(point.time))
                    .or_insert(point.time);
            }
        }
        Ok(first.into_iter().collect())
    }

    async fn delete_by_tag(&self, measurement: &str, tag: &str, value: &str) -> Result<()> {
        self.points
            .write()
            .retain(|point| point.measurement != measurement || point.tag(tag) != Some(value));
        Ok(())
    }
}

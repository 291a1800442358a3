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
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::point::Point;
use crate::Result;

/// How the samples inside a query range are reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// Every stored sample.
    Raw,
    /// Mean per window, windows aligned to the Unix epoch and stamped with their start.
    Mean(Duration),
    /// Earliest sample per field.
    First,
    /// Latest sample per field.
    Last,
}

/// A time-bounded read of one measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesQuery {
    pub measurement: String,
    /// Empty means every field.
    pub fields: Vec<String>,
    /// Exact tag matches.
    pub tags: BTreeMap<String, String>,
    pub start: DateTime<Utc>,
    /// Exclusive.
    pub stop: DateTime<Utc>,
    pub aggregation: Aggregation,
}

impl SeriesQuery {
    pub fn new(measurement: impl Into<String>, start: DateTime<Utc>, stop: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            fields: Vec::new(),
            tags: BTreeMap::new(),
            start,
            stop,
            aggregation: Aggregation::Raw,
        }
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Whether a stored point falls inside this query.
    pub fn matches(&self, point: &Point) -> bool {
        point.measurement == self.measurement
            && point.time >= self.start
            && point.time < self.stop
            && (self.fields.is_empty() || self.fields.iter().any(|field| *field == point.field))
            && self
                .tags
                .iter()
                .all(|(key, value)| point.tag(key) == Some(value.as_str()))
    }
}

/// A value returned by a query.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPoint {
    pub field: String,
    pub time: DateTime<Utc>,
    pub value: f64,
}

/// Backend holding batch-tagged points.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    async fn write(&self, points: &[Point]) -> Result<()>;

    /// Samples ordered by field, then time.
    async fn query(&self, query: &SeriesQuery) -> Result<Vec<SeriesPoint>>;

    /// Earliest time each value of `tag` appears in `measurement` since `since`.
    async fn first_seen_by_tag(
        &self,
        measurement: &str,
        tag: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>>;

    /// Remove every point of `measurement` whose `tag` equals `value`.
    async fn delete_by_tag(&self, measurement: &str, tag: &str, value: &str) -> Result<()>;
}

/// Store used when history is disabled: accepts and forgets everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl TimeSeriesStore for NullStore {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn write(&self, _points: &[Point]) -> Result<()> {
        Ok(())
    }

    async fn query(&self, _query: &SeriesQuery) -> Result<Vec<SeriesPoint>> {
        Ok(Vec::new())
    }

    async fn first_seen_by_tag(
        &self,
        _measurement: &str,
        _tag: &str,
        _since: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>> {
        Ok(Vec::new())
    }

    async fn delete_by_tag(&self, _measurement: &str, _tag: &str, _value: &str) -> Result<()> {
        Ok(())
    }
}

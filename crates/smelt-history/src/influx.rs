//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Batch-tagged time-series history for the furnace."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! InfluxDB 2.x backend over the HTTP API.
//!
//! Writes use line protocol with nanosecond precision. Queries are Flux
//! scripts whose annotated-CSV answers are parsed back into points.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::json;
use smelt_common::HistoryConfig;
use tracing::debug;
use url::Url;

use crate::point::Point;
use crate::store::{Aggregation, SeriesPoint, SeriesQuery, TimeSeriesStore};
use crate::{HistoryError, Result};

#[derive(Debug, Clone)]
pub struct InfluxStore {
    client: Client,
    base: Url,
    org: String,
    bucket: String,
    token: Option<String>,
}

impl InfluxStore {
    pub fn new(
        base: Url,
        org: impl Into<String>,
        bucket: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base,
            org: org.into(),
            bucket: bucket.into(),
            token,
        })
    }

    pub fn from_config(config: &HistoryConfig) -> Result<Self> {
        Self::new(
            Url::parse(&config.url)?,
            config.org.clone(),
            config.bucket.clone(),
            config.token.clone(),
            config.request_timeout,
        )
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Url {
        let mut url = self.base.clone();
        let joined = format!("{}/{}", self.base.path().trim_end_matches('/'), path);
        url.set_path(&joined);
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        url
    }

    fn authorised(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Token {token}")),
            None => request,
        }
    }

    async fn run_flux(&self, flux: String) -> Result<Vec<BTreeMap<String, String>>> {
        debug!(%flux, "running flux query");
        let url = self.endpoint("api/v2/query", &[("org", self.org.as_str())]);
        let request = self
            .client
            .post(url)
            .header("Accept", "application/csv")
            .json(&json!({
                "query": flux,
                "type": "flux",
                "dialect": { "header": true, "annotations": [] },
            }));
        let response = check(self.authorised(request).send().await?).await?;
        parse_csv(&response.text().await?)
    }
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(HistoryError::Status {
        status: status.as_u16(),
        body,
    })
}

fn escape(value: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch == '\\' || special.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn nanos(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt()
        .unwrap_or_else(|| time.timestamp().saturating_mul(1_000_000_000))
}

/// Render points as line protocol, one line each. Influx rejects the whole
/// request on a NaN or infinite field, so those points are left out.
pub fn line_protocol(points: &[Point]) -> String {
    let mut body = String::new();
    for point in points {
        if !point.value.is_finite() {
            debug!(field = %point.field, value = point.value, "skipping non-finite history field");
            continue;
        }
        body.push_str(&escape(&point.measurement, &[',', ' ']));
        for (key, value) in &point.tags {
            if value.is_empty() {
                continue;
            }
            let _ = write!(
                body,
                ",{}={}",
                escape(key, &[',', '=', ' ']),
                escape(value, &[',', '=', ' '])
            );
        }
        let _ = writeln!(
            body,
            " {}={} {}",
            escape(&point.field, &[',', '=', ' ']),
            point.value,
            nanos(point.time)
        );
    }
    body
}

fn flux_string(value: &str) -> String {
    format!("\"{}\"", escape(value, &['"']))
}

fn flux_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn flux_duration(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs().max(1))
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Flux script equivalent to a [`SeriesQuery`].
pub fn build_flux(bucket: &str, query: &SeriesQuery) -> String {
    let mut flux = format!(
        "from(bucket: {})\n  |> range(start: {}, stop: {})\n  |> filter(fn: (r) => r._measurement == {})",
        flux_string(bucket),
        flux_time(query.start),
        flux_time(query.stop),
        flux_string(&query.measurement),
    );
    if !query.fields.is_empty() {
        let predicate = query
            .fields
            .iter()
            .map(|field| format!("r._field == {}", flux_string(field)))
            .collect::<Vec<_>>()
            .join(" or ");
        let _ = write!(flux, "\n  |> filter(fn: (r) => {predicate})");
    }
    for (key, value) in &query.tags {
        let _ = write!(
            flux,
            "\n  |> filter(fn: (r) => r[{}] == {})",
            flux_string(key),
            flux_string(value)
        );
    }
    flux.push_str("\n  |> group(columns: [\"_field\"])\n  |> sort(columns: [\"_time\"])");
    match query.aggregation {
        Aggregation::Raw => {}
        Aggregation::Mean(every) => {
            let _ = write!(
                flux,
                "\n  |> aggregateWindow(every: {}, fn: mean, createEmpty: false, timeSrc: \"_start\")",
                flux_duration(every)
            );
        }
        Aggregation::First => flux.push_str("\n  |> first()"),
        Aggregation::Last => flux.push_str("\n  |> last()"),
    }
    flux.push_str("\n  |> keep(columns: [\"_time\", \"_field\", \"_value\"])");
    flux
}

fn build_first_seen_flux(
    bucket: &str,
    measurement: &str,
    tag: &str,
    since: DateTime<Utc>,
) -> String {
    format!(
        "from(bucket: {bucket})\n  |> range(start: {since})\n  |> filter(fn: (r) => r._measurement == {measurement})\n  |> filter(fn: (r) => exists r[{tag}])\n  |> keep(columns: [\"_time\", {tag}])\n  |> group(columns: [{tag}])\n  |> min(column: \"_time\")\n  |> group()",
        bucket = flux_string(bucket),
        since = flux_time(since),
        measurement = flux_string(measurement),
        tag = flux_string(tag),
    )
}

/// Parse an annotated-CSV query answer into rows keyed by column name.
///
/// Each table may repeat its header; annotation rows and blank rows are skipped.
pub fn parse_csv(body: &str) -> Result<Vec<BTreeMap<String, String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());
    let mut header: Vec<String> = Vec::new();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.iter().all(str::is_empty) {
            header.clear();
            continue;
        }
        if record.get(0).is_some_and(|cell| cell.starts_with('#')) {
            continue;
        }
        if record.iter().any(|cell| cell == "_time" || cell == "_value") {
            header = record.iter().map(str::to_owned).collect();
            continue;
        }
        if header.is_empty() {
            continue;
        }
        let row = header
            .iter()
            .zip(record.iter())
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, cell)| (name.clone(), cell.to_owned()))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

fn column<'a>(row: &'a BTreeMap<String, String>, name: &str) -> Result<&'a str> {
    row.get(name)
        .map(String::as_str)
        .ok_or_else(|| HistoryError::Query(format!("missing column {name}")))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|err| HistoryError::Query(format!("bad _time {value:?}: {err}")))
}

fn series_points(rows: &[BTreeMap<String, String>]) -> Result<Vec<SeriesPoint>> {
    let mut points = Vec::with_capacity(rows.len());
    for row in rows {
        let raw = column(row, "_value")?;
        let value = raw
            .parse::<f64>()
            .map_err(|err| HistoryError::Query(format!("bad _value {raw:?}: {err}")))?;
        points.push(SeriesPoint {
            field: column(row, "_field")?.to_owned(),
            time: parse_time(column(row, "_time")?)?,
            value,
        });
    }
    points.sort_by(|a, b| a.field.cmp(&b.field).then(a.time.cmp(&b.time)));
    Ok(points)
}

#[async_trait]
impl TimeSeriesStore for InfluxStore {
    fn name(&self) -> &'static str {
        "influx"
    }

    async fn write(&self, points: &[Point]) -> Result<()> {
        let body = line_protocol(points);
        if body.is_empty() {
            return Ok(());
        }
        let url = self.endpoint(
            "api/v2/write",
            &[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ],
        );
        let request = self
            .client
            .post(url)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body);
        check(self.authorised(request).send().await?).await?;
        Ok(())
    }

    async fn query(&self, query: &SeriesQuery) -> Result<Vec<SeriesPoint>> {
        let rows = self.run_flux(build_flux(&self.bucket, query)).await?;
        series_points(&rows)
    }

    async fn first_seen_by_tag(
        &self,
        measurement: &str,
        tag: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>> {
        let rows = self
            .run_flux(build_first_seen_flux(&self.bucket, measurement, tag, since))
            .await?;
        rows.iter()
            .map(|row| {
                Ok::<_, HistoryError>((
                    column(row, tag)?.to_owned(),
                    parse_time(column(row, "_time")?)?,
                ))
            })
            .collect()
    }

    async fn delete_by_tag(&self, measurement: &str, tag: &str, value: &str) -> Result<()> {
        let url = self.endpoint(
            "api/v2/delete",
            &[("org", self.org.as_str()), ("bucket", self.bucket.as_str())],
        );
        let predicate = format!(
            "_measurement={} AND {}={}",
            flux_string(measurement),
            tag,
            flux_string(value)
        );
        let request = self.client.post(url).json(&json!({
            "start": "1970-01-01T00:00:00Z",
            "stop": flux_time(Utc::now() + chrono::Duration::days(1)),
            "predicate": predicate,
        }));
        check(self.authorised(request).send().await?).await?;
        Ok(())
    }
}

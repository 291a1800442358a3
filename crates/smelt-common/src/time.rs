//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the furnace acquisition core."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Time helpers. Storage is always UTC; operators work in plant-local time (UTC+8).

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};

/// Plant-local offset from UTC, in seconds.
pub const LOCAL_OFFSET_SECS: i32 = 8 * 3600;

/// Format accepted by [`parse_local`].
pub const LOCAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The plant-local fixed offset.
pub fn local_offset() -> FixedOffset {
    FixedOffset::east_opt(LOCAL_OFFSET_SECS).expect("UTC+8 is a valid offset")
}

/// Convert a stored UTC instant into plant-local time.
pub fn to_local(instant: DateTime<Utc>) -> DateTime<FixedOffset> {
    instant.with_timezone(&local_offset())
}

/// Interpret a naive wall-clock reading as plant-local time and convert it to UTC.
pub fn local_naive_to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&(naive - chrono::Duration::seconds(LOCAL_OFFSET_SECS.into())))
}

/// Parse `YYYY-mm-dd HH:MM:SS` as plant-local time.
pub fn parse_local(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(text.trim(), LOCAL_FORMAT).map(local_naive_to_utc)
}

/// Seconds elapsed between two instants; negative when the clock stepped backwards.
pub fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0
}

/// Unix timestamp with sub-second precision.
pub fn unix_seconds(instant: DateTime<Utc>) -> f64 {
    instant.timestamp() as f64 + f64::from(instant.timestamp_subsec_micros()) / 1_000_000.0
}

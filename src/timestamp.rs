// src/timestamp.rs
//! Reading timestamps are stored as naive wall-clock time at whole-second
//! precision. Any UTC offset on the input is dropped, not applied.

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{de, Deserialize, Deserializer};

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Drop sub-second precision.
pub fn truncate(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_nanosecond(0).unwrap_or(ts)
}

/// Current UTC time in stored form.
pub fn now() -> NaiveDateTime {
    truncate(Utc::now().naive_utc())
}

/// Parse an RFC 3339 or naive ISO 8601 timestamp into stored form.
pub fn parse(s: &str) -> Result<NaiveDateTime, String> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(truncate(dt.naive_local()));
    }
    let naive = lost_plus_offset(s).unwrap_or(s);
    for fmt in NAIVE_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(naive, fmt) {
            return Ok(truncate(ts));
        }
    }
    Err(format!("invalid timestamp {s:?}"))
}

/// `2024-01-01T10:00:00 02:00` is what an unencoded `+02:00` becomes in a
/// query string. Returns the part before the offset.
fn lost_plus_offset(s: &str) -> Option<&str> {
    let (head, offset) = s.rsplit_once(' ')?;
    let bytes = offset.as_bytes();
    let is_offset = bytes.len() == 5
        && bytes[2] == b':'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 2 || b.is_ascii_digit());
    (is_offset && head.contains('T')).then_some(head)
}

pub fn deserialize<'de, D>(d: D) -> Result<NaiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(d)?;
    parse(&s).map_err(de::Error::custom)
}

pub fn deserialize_opt<'de, D>(d: D) -> Result<Option<NaiveDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(d)? {
        Some(s) if !s.trim().is_empty() => parse(&s).map(Some).map_err(de::Error::custom),
        _ => Ok(None),
    }
}

//! Timestamp normalization.
//!
//! Events arrive with whichever timestamp encoding their source version
//! produced: a structured time object, epoch milliseconds, a locale string
//! with a 12-hour clock, or an ISO-like string. Every event must normalize
//! to one orderable instant; an unparseable value falls back to the
//! caller's "now" with a synthetic flag and a warning, never an error and
//! never a dropped event.
//!
//! This module is pure: given the same input and the same `now`, it always
//! returns the same instant.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// A timestamp as found on a raw feed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    /// Structured time object with a direct to-instant conversion
    /// (`{ "seconds": …, "nanos": … }`).
    Structured { seconds: i64, nanos: u32 },
    /// Epoch milliseconds.
    EpochMillis(i64),
    /// Free-form string; tried against the known text formats.
    Text(String),
}

impl RawTimestamp {
    /// Interpret a raw JSON field as a timestamp encoding.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(map) => {
                let seconds = map.get("seconds")?.as_i64()?;
                let nanos = map.get("nanos").and_then(Value::as_u64).unwrap_or(0) as u32;
                Some(Self::Structured { seconds, nanos })
            }
            Value::Number(n) => n.as_i64().map(Self::EpochMillis),
            Value::String(s) if !s.is_empty() => Some(Self::Text(s.clone())),
            _ => None,
        }
    }
}

/// Normalize a raw timestamp into `(instant, is_synthetic)`.
///
/// Encodings are tried in order: structured object, epoch milliseconds,
/// locale string (`DD/MM/YYYY HH:MM AM|PM`), then generic ISO-like strings.
/// Naive text timestamps are read as UTC. On failure the result is
/// `(now, true)` and the anomaly is logged.
pub fn normalize_timestamp(raw: Option<&RawTimestamp>, now: DateTime<Utc>) -> (DateTime<Utc>, bool) {
    let parsed = match raw {
        Some(RawTimestamp::Structured { seconds, nanos }) => {
            Utc.timestamp_opt(*seconds, *nanos).single()
        }
        Some(RawTimestamp::EpochMillis(ms)) => Utc.timestamp_millis_opt(*ms).single(),
        Some(RawTimestamp::Text(s)) => parse_text(s),
        None => None,
    };

    match parsed {
        Some(instant) => (instant, false),
        None => {
            warn!(?raw, "unparseable timestamp, substituting now");
            (now, true)
        }
    }
}

/// Text formats tried in order. The locale pattern comes first because a
/// `20/06/2025` date is valid input to no other format here.
fn parse_text(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();

    // "20/06/2025 11:23 AM", a 12-hour clock with meridiem marker.
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%d/%m/%Y %I:%M %p") {
        return Some(naive.and_utc());
    }

    if let Ok(fixed) = DateTime::parse_from_rfc3339(s) {
        return Some(fixed.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }

    None
}

//! Mapping between [`EventEnvelope`] and the JSON carried on the bus, plus the timestamp
//! rewriting the analytics store expects.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::warn;

use crate::model::{empty_metadata, EventEnvelope};

/// Literal form accepted by the analytics store: `YYYY-MM-DD HH:MM:SS.sss`.
pub const SINK_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("malformed event json: {0}")]
    Malformed(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
}

pub fn decode(payload: &[u8]) -> Result<EventEnvelope, DecodeError> {
    if payload.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(DecodeError::Empty);
    }
    let event: EventEnvelope =
        serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if event.event_id.trim().is_empty() {
        return Err(DecodeError::MissingField("event_id"));
    }
    if event.event_type.trim().is_empty() {
        return Err(DecodeError::MissingField("event_type"));
    }
    Ok(event)
}

pub fn encode(event: &EventEnvelope) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(event)
}

/// Rewrites `event_time` into the store's literal form and stamps `ingested_at`.
pub fn normalize_for_sink(event: &mut EventEnvelope, now: DateTime<Utc>) {
    if !event.event_time.trim().is_empty() && parse_event_time(&event.event_time).is_none() {
        warn!(event_id = %event.event_id, event_time = %event.event_time, "unparseable event_time; using ingest time");
    }
    event.event_time = normalize_timestamp(&event.event_time, now);
    event.ingested_at = format_sink_time(now);
}

/// `2026-01-21T00:21:40.524Z` becomes `2026-01-21 00:21:40.524`. Empty or unparseable
/// input becomes `now`, so every row carries a value the store accepts.
pub fn normalize_timestamp(raw: &str, now: DateTime<Utc>) -> String {
    format_sink_time(parse_event_time(raw).unwrap_or(now))
}

/// RFC 3339 with any offset, or a naive UTC time separated by `T` or a space.
pub fn parse_event_time(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .map(|naive| naive.and_utc())
}

pub fn format_sink_time(at: DateTime<Utc>) -> String {
    at.format(SINK_TIME_FORMAT).to_string()
}

pub fn format_wire_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn string_or_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Producers send metadata either as a JSON object or as an already-serialized string.
pub(crate) fn metadata_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => empty_metadata(),
        serde_json::Value::String(s) if s.trim().is_empty() => empty_metadata(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn zulu_timestamp_rewritten_to_sink_literal() {
        assert_eq!(normalize_timestamp("2026-01-21T00:21:40.524Z", fixed_now()), "2026-01-21 00:21:40.524");
        assert_eq!(normalize_timestamp("2026-01-21T00:21:40Z", fixed_now()), "2026-01-21 00:21:40.000");
        assert_eq!(normalize_timestamp("2026-01-21T00:21:40.524", fixed_now()), "2026-01-21 00:21:40.524");
    }

    #[test]
    fn empty_timestamp_becomes_now() {
        let out = normalize_timestamp("   ", fixed_now());
        assert_eq!(out, "2026-03-01 12:00:00.000");
        assert!(!out.contains('T') && !out.contains('Z'));
    }

    #[test]
    fn offset_timestamp_converted_to_utc() {
        assert_eq!(normalize_timestamp("2026-01-21T02:21:40.524+02:00", fixed_now()), "2026-01-21 00:21:40.524");
    }

    #[test]
    fn already_normalized_timestamp_untouched() {
        assert_eq!(normalize_timestamp("2026-01-21 00:21:40.524", fixed_now()), "2026-01-21 00:21:40.524");
    }

    #[test]
    fn garbage_timestamp_replaced_with_now() {
        assert_eq!(normalize_timestamp("not-a-timestamp", fixed_now()), "2026-03-01 12:00:00.000");
        assert_eq!(normalize_timestamp("2026-13-45T99:00:00Z", fixed_now()), "2026-03-01 12:00:00.000");
        let out = normalize_timestamp("yesterday", fixed_now());
        assert!(NaiveDateTime::parse_from_str(&out, SINK_TIME_FORMAT).is_ok(), "{out}");
    }

    #[test]
    fn decode_accepts_object_and_string_metadata() {
        let as_object = json!({
            "event_id": "e-1", "event_type": "INJECT_SUCCESS", "event_category": "access",
            "org_id": "org-1", "agent_id": null, "metadata": {"tokens": 12}
        });
        let ev = decode(as_object.to_string().as_bytes()).expect("decode");
        assert_eq!(ev.metadata, r#"{"tokens":12}"#);
        assert_eq!(ev.agent_id, "");
        assert_eq!(ev.org_id, "org-1");

        let as_string = json!({
            "event_id": "e-2", "event_type": "INJECT_SUCCESS", "event_category": "access",
            "metadata": "{\"tokens\":12}"
        });
        let ev = decode(as_string.to_string().as_bytes()).expect("decode");
        assert_eq!(ev.metadata, r#"{"tokens":12}"#);
        assert_eq!(ev.event_time, "");
    }

    #[test]
    fn decode_rejects_garbage_and_missing_ids() {
        assert!(matches!(decode(b"not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(b""), Err(DecodeError::Empty)));
        assert!(matches!(decode(b"[1,2]"), Err(DecodeError::Malformed(_))));
        let missing = json!({"event_id": " ", "event_type": "X", "event_category": "policy"});
        assert!(matches!(decode(missing.to_string().as_bytes()), Err(DecodeError::MissingField("event_id"))));
    }

    #[test]
    fn normalize_for_sink_stamps_ingest_time() {
        let mut ev = decode(br#"{"event_id":"e","event_type":"T","event_category":"agent","event_time":"2026-01-21T00:21:40.524Z"}"#).unwrap();
        normalize_for_sink(&mut ev, fixed_now());
        assert_eq!(ev.event_time, "2026-01-21 00:21:40.524");
        assert_eq!(ev.ingested_at, "2026-03-01 12:00:00.000");
    }
}

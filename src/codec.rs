//! Conversion between property values and the text that crosses the SQLite
//! boundary.
//!
//! Stored text formats:
//! - integers: decimal
//! - reals: shortest text that parses back to the same `f64`
//! - booleans: `1` / `0`
//! - timestamps: RFC 3339 in UTC with nanosecond precision, e.g.
//!   `2024-01-02T03:04:05.000000000Z`. Fixed width for years `0000..=9999`,
//!   so text order is time order there. Other years carry a sign and more
//!   digits (`+12000-01-01T..`); they round-trip but do not sort as text.
//! - blobs: lowercase hex
//! - JSON aggregates: compact `serde_json` text
//!
//! `NULL` is represented as `None` on both sides.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use thiserror::Error;

use crate::value::{Value, ValueKind};

/// Parse format for timestamps whose year needs a sign.
const EXTENDED_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

/// Stored text could not be read back as the declared kind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot decode {text:?} as {kind}")]
pub struct CodecError {
    pub kind: ValueKind,
    pub text: String,
}

/// Encode a value as the text stored in its column.
pub fn encode(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Integer(v) => Some(v.to_string()),
        Value::Real(v) => Some(v.to_string()),
        Value::Text(v) => Some(v.clone()),
        Value::Blob(v) => Some(hex::encode(v)),
        Value::Boolean(v) => Some(if *v { "1" } else { "0" }.to_string()),
        Value::Timestamp(v) => Some(encode_timestamp(v)),
        Value::Json(v) => Some(v.to_string()),
    }
}

/// Decode stored column text as a value of `kind`.
pub fn decode(kind: ValueKind, text: Option<&str>) -> Result<Value, CodecError> {
    let Some(text) = text else {
        return Ok(Value::Null);
    };
    let fail = || CodecError {
        kind,
        text: text.to_string(),
    };
    match kind {
        ValueKind::Null => Ok(Value::Null),
        ValueKind::Integer => text.trim().parse().map(Value::Integer).map_err(|_| fail()),
        ValueKind::Real => text.trim().parse().map(Value::Real).map_err(|_| fail()),
        ValueKind::Text => Ok(Value::Text(text.to_string())),
        ValueKind::Blob => hex::decode(text).map(Value::Blob).map_err(|_| fail()),
        ValueKind::Boolean => match text.trim() {
            "1" | "true" => Ok(Value::Boolean(true)),
            "0" | "false" => Ok(Value::Boolean(false)),
            _ => Err(fail()),
        },
        ValueKind::Timestamp => decode_timestamp(text).map(Value::Timestamp).ok_or_else(fail),
        ValueKind::Json => serde_json::from_str(text).map(Value::Json).map_err(|_| fail()),
    }
}

/// Render a value as an SQL literal suitable for splicing into a statement.
pub fn to_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(v) => v.to_string(),
        Value::Real(v) if v.is_finite() => v.to_string(),
        Value::Real(v) => quote_text(&v.to_string()),
        Value::Boolean(v) => if *v { "1" } else { "0" }.to_string(),
        Value::Blob(v) => quote_text(&hex::encode(v)),
        Value::Text(v) => quote_text(v),
        Value::Timestamp(v) => quote_text(&encode_timestamp(v)),
        Value::Json(v) => quote_text(&v.to_string()),
    }
}

/// Wrap text in single quotes, doubling embedded quotes.
pub fn quote_text(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn encode_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// RFC 3339 text, or the signed extended-year form (`+12000-01-01T..Z`)
/// written for years outside `0000..=9999`.
fn decode_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, EXTENDED_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(value: Value) {
        let kind = value.kind();
        let text = encode(&value);
        assert_eq!(decode(kind, text.as_deref()).unwrap(), value, "text: {text:?}");
    }

    #[test]
    fn primitives_round_trip() {
        for v in [0, 1, -1, 42, i64::MIN, i64::MAX] {
            round_trip(Value::Integer(v));
        }
        for v in [0.0, 0.1, -2.5, 1e-300, 1e300, f64::MAX, f64::MIN_POSITIVE] {
            round_trip(Value::Real(v));
        }
        round_trip(Value::Boolean(true));
        round_trip(Value::Boolean(false));
        round_trip(Value::Text(String::new()));
        round_trip(Value::Text("it's \"quoted\"\n".to_string()));
        round_trip(Value::Blob(vec![0, 1, 0xab, 0xff]));
        round_trip(Value::Timestamp(
            Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 58).unwrap() + chrono::Duration::nanoseconds(123),
        ));
        round_trip(Value::Json(json!({"tags": ["a", "b"], "n": 3})));
        round_trip(Value::Null);
    }

    #[test]
    fn timestamps_have_fixed_width() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            encode(&Value::Timestamp(ts)).unwrap(),
            "2024-01-02T03:04:05.000000000Z"
        );
    }

    #[test]
    fn extended_years_round_trip() {
        let far = Utc.with_ymd_and_hms(12000, 1, 1, 0, 0, 0).unwrap();
        let text = encode(&Value::Timestamp(far)).unwrap();
        assert_eq!(text, "+12000-01-01T00:00:00.000000000Z");
        assert_eq!(
            decode(ValueKind::Timestamp, Some(&text)).unwrap(),
            Value::Timestamp(far)
        );
        round_trip(Value::Timestamp(Utc.with_ymd_and_hms(-44, 3, 15, 12, 0, 0).unwrap()));
    }

    #[test]
    fn malformed_text_is_an_error() {
        assert!(decode(ValueKind::Integer, Some("abc")).is_err());
        assert!(decode(ValueKind::Boolean, Some("yes")).is_err());
        assert!(decode(ValueKind::Blob, Some("abc")).is_err());
        assert!(decode(ValueKind::Blob, Some("zz")).is_err());
        assert!(decode(ValueKind::Timestamp, Some("yesterday")).is_err());
        let err = decode(ValueKind::Json, Some("{")).unwrap_err();
        assert_eq!(err.kind, ValueKind::Json);
    }

    #[test]
    fn literals_are_escaped() {
        assert_eq!(to_literal(&Value::Text("O'Brien".into())), "'O''Brien'");
        assert_eq!(to_literal(&Value::Integer(18)), "18");
        assert_eq!(to_literal(&Value::Boolean(true)), "1");
        assert_eq!(to_literal(&Value::Null), "NULL");
        assert_eq!(to_literal(&Value::Blob(vec![0xde, 0xad])), "'dead'");
        assert_eq!(to_literal(&Value::Real(f64::INFINITY)), "'inf'");
    }
}

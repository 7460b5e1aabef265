//! AutoFocus timestamp handling
//!
//! AutoFocus reports sample dates as `2019-06-28T10:22:41` and bucket starts as
//! `2019-07-29 19:40:12`, both without an offset. They are read as UTC. Values
//! written back by us are RFC 3339.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serializer};

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];

/// Parse any timestamp shape AutoFocus or the cache produces
pub fn parse(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&value.to_rfc3339())
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_parse_sample_date() {
        let dt = parse("2019-06-28T10:22:41").unwrap();
        assert_eq!((dt.year(), dt.month(), dt.day()), (2019, 6, 28));
        assert_eq!((dt.hour(), dt.minute(), dt.second()), (10, 22, 41));
    }

    #[test]
    fn test_parse_bucket_start() {
        let dt = parse("2019-07-29 19:40:12").unwrap();
        assert_eq!(dt.hour(), 19);
    }

    #[test]
    fn test_parse_rfc3339_with_offset() {
        let dt = parse("2019-07-01T04:00:52-07:00").unwrap();
        assert_eq!(dt.hour(), 11);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse("yesterday").is_none());
        assert!(parse("").is_none());
    }
}

//! Canonical timestamp handling.
//!
//! In memory every timestamp is a `DateTime<Utc>`. On the wire and in the record store it is an
//! ISO-8601 string with an explicit `+00:00` offset. Parsing is lenient about the input shape
//! (trailing `Z`, numeric offsets, naive date-times, bare dates) but always lands on UTC.

#![forbid(unsafe_code)]

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

use crate::ValidationError;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Parse an ISO-8601 timestamp into UTC.
///
/// Accepted shapes:
/// - RFC 3339 with `Z` or a numeric offset (`2024-05-01T09:00:00Z`, `...+02:00`)
/// - naive date-time, interpreted as UTC (`2024-05-01T09:00:00`)
/// - bare date, interpreted as midnight UTC (`2024-05-01`)
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, ValidationError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ValidationError::Timestamp(s.to_string()));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }
    Err(ValidationError::Timestamp(s.to_string()))
}

/// Render a timestamp in the stored representation (`+00:00` offset, sub-seconds only when present).
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

/// Serde adapter for `DateTime<Utc>` fields using the canonical string form.
pub mod iso {
    use chrono::{DateTime, Utc};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&super::format_timestamp(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(de)?;
        super::parse_timestamp(&s).map_err(D::Error::custom)
    }
}

/// Serde adapter for `Option<DateTime<Utc>>`; `null` and missing both map to `None`.
pub mod iso_opt {
    use chrono::{DateTime, Utc};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &Option<DateTime<Utc>>, ser: S) -> Result<S::Ok, S::Error> {
        match dt {
            Some(dt) => ser.serialize_some(&super::format_timestamp(dt)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<String>::deserialize(de)? {
            Some(s) => super::parse_timestamp(&s).map(Some).map_err(D::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_trailing_z_as_utc() {
        let dt = parse_timestamp("2024-05-01T09:00:00Z").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
    }

    #[test]
    fn converts_offsets_to_utc() {
        let dt = parse_timestamp("2024-05-01T11:30:00+02:00").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap());
    }

    #[test]
    fn naive_inputs_are_utc() {
        assert_eq!(parse_timestamp("2024-05-01T09:00:00").unwrap(), Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
        assert_eq!(parse_timestamp("2024-05-01").unwrap(), Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_timestamp("").is_err());
        assert!(parse_timestamp("tomorrow at nine").is_err());
        assert!(parse_timestamp("2024-13-01T00:00:00Z").is_err());
    }

    #[test]
    fn stored_form_round_trips() {
        for input in ["2024-05-01T09:00:00Z", "2024-05-01T09:00:00.250Z", "2023-12-31T23:59:59-05:00"] {
            let dt = parse_timestamp(input).unwrap();
            let stored = format_timestamp(&dt);
            assert!(stored.ends_with("+00:00"), "{stored}");
            assert_eq!(parse_timestamp(&stored).unwrap(), dt);
        }
    }
}

use chrono::{DateTime, NaiveDateTime, Utc};

/// Format used for timestamps at rest (millisecond precision, naive).
pub const STORED_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Format used for timestamps in API responses.
pub const API_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

pub fn format_stored(ts: DateTime<Utc>) -> String {
    ts.naive_utc().format(STORED_FORMAT).to_string()
}

pub fn parse_stored(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, STORED_FORMAT)
        .ok()
        .map(|n| n.and_utc())
}

pub fn format_api(ts: DateTime<Utc>) -> String {
    ts.naive_utc().format(API_FORMAT).to_string()
}

pub fn format_api_opt(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(format_api)
}

/// Human remaining-lifetime string for an expiry instant.
/// Static leases (no expiry) read as "never".
pub fn time_to_expiry(expire_at: Option<DateTime<Utc>>) -> String {
    time_to_expiry_at(expire_at, Utc::now())
}

pub fn time_to_expiry_at(expire_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let expire_at = match expire_at {
        Some(ts) => ts,
        None => return "never".to_string(),
    };
    if expire_at <= now {
        return "expired".to_string();
    }
    let seconds = (expire_at - now).num_seconds();
    if seconds < 60 {
        return format!("{seconds} sec");
    }
    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{minutes} min");
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("{hours} h");
    }
    let days = hours / 24;
    if days < 30 {
        return format!("{days} d");
    }
    let months = days / 30;
    if months < 12 {
        return format!("{months} mo");
    }
    format!("{} y", months / 12)
}

/// Serde adapter for required stored-format timestamps.
pub mod stored {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_stored(*ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse_stored(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("bad timestamp: {raw}")))
    }
}

/// Serde adapter for optional stored-format timestamps.
pub mod stored_opt {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        ts: &Option<DateTime<Utc>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match ts {
            Some(ts) => s.serialize_some(&format_stored(*ts)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw {
            Some(raw) => parse_stored(&raw)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("bad timestamp: {raw}"))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_stored_roundtrip() {
        let ts = parse_stored("2025-03-01 14:30:00.250").unwrap();
        assert_eq!(format_stored(ts), "2025-03-01 14:30:00.250");
    }

    #[test]
    fn test_api_format() {
        let ts = parse_stored("2025-03-01 14:30:00.250").unwrap();
        assert_eq!(format_api(ts), "01.03.2025 14:30:00");
    }

    #[test]
    fn test_time_to_expiry() {
        let now = parse_stored("2025-03-01 12:00:00.000").unwrap();
        assert_eq!(time_to_expiry_at(None, now), "never");
        assert_eq!(
            time_to_expiry_at(Some(now - Duration::seconds(5)), now),
            "expired"
        );
        assert_eq!(
            time_to_expiry_at(Some(now + Duration::seconds(42)), now),
            "42 sec"
        );
        assert_eq!(
            time_to_expiry_at(Some(now + Duration::minutes(5)), now),
            "5 min"
        );
        assert_eq!(
            time_to_expiry_at(Some(now + Duration::hours(3)), now),
            "3 h"
        );
        assert_eq!(
            time_to_expiry_at(Some(now + Duration::days(12)), now),
            "12 d"
        );
        assert_eq!(
            time_to_expiry_at(Some(now + Duration::days(90)), now),
            "3 mo"
        );
        assert_eq!(
            time_to_expiry_at(Some(now + Duration::days(400)), now),
            "1 y"
        );
    }
}

//! RFC 3339 (de)serialization of `SystemTime` for operation records.
use chrono::{DateTime, Local};
use serde::{self, Deserialize, Deserializer, Serializer};
use std::time::SystemTime;

/// Serializes a `SystemTime` to an RFC 3339 string.
pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&to_rfc3339(*time))
}

/// Deserializes an RFC 3339 string to a `SystemTime`.
pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_rfc3339(&s).map_err(serde::de::Error::custom)
}

/// Format a `SystemTime` in local time with RFC 3339 layout.
pub fn to_rfc3339(time: SystemTime) -> String {
    let datetime: DateTime<Local> = time.into();
    datetime.to_rfc3339()
}

pub fn parse_rfc3339(s: &str) -> Result<SystemTime, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(SystemTime::from)
}

/// `Option<SystemTime>` counterpart, for fields that may be unset.
pub mod option {
    use super::*;

    pub fn serialize<S>(time: &Option<SystemTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match time {
            Some(t) => serializer.serialize_some(&to_rfc3339(*t)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SystemTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wrapped(#[serde(with = "super")] SystemTime);

        let opt: Option<Wrapped> = Option::deserialize(deserializer)?;
        Ok(opt.map(|Wrapped(t)| t))
    }
}

use std::fmt;

use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Deserializer, Serialize};

use crate::utils::error::{DecodeError, EncodeError};

/// The record relayed from producer to consumer.
///
/// `timestamp` keeps the producer's UTC offset, so a consumer in another
/// timezone prints the time the operator saw. Timestamps decoded without an
/// offset are taken as local time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub first_name: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<FixedOffset>,
}

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<FixedOffset>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| {
        serde::de::Error::custom(format!("invalid timestamp `{raw}`, expected ISO-8601"))
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Some(timestamp);
    }
    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())?;
    // Wall-clock times skipped by a DST change have no local instant.
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.fixed_offset())
}

impl Message {
    /// A message stamped with the local clock.
    pub fn new(first_name: impl Into<String>) -> Self {
        Self::at(first_name, Local::now().fixed_offset())
    }

    pub fn at(first_name: impl Into<String>, timestamp: DateTime<FixedOffset>) -> Self {
        Self {
            first_name: first_name.into(),
            timestamp,
        }
    }

    /// Short date and time, e.g. `2024-03-01 09:15`.
    pub fn display_time(&self) -> String {
        self.timestamp.format("%Y-%m-%d %H:%M").to_string()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.first_name, self.display_time())
    }
}

pub fn encode(message: &Message) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let text = std::str::from_utf8(bytes)?;
    let message: Message = serde_json::from_str(text)?;
    if message.first_name.trim().is_empty() {
        return Err(DecodeError::EmptyFirstName);
    }
    Ok(message)
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Result, SepiaError},
    ulid::Ulid,
};

/// A persisted log event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique, time-ordered identifier (assigned on append).
    pub id: Ulid,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Category of the event (e.g. "request", "error", "metric").
    #[serde(rename = "type")]
    pub event_type: String,
    /// Key-value pairs for filtering (e.g. service=api, env=prod).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Arbitrary payload fields.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Input to an append: an event before it is stamped with an identifier.
#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub event_type: String,
    /// `None` stamps the current wall clock.
    pub timestamp: Option<DateTime<Utc>>,
    pub tags: BTreeMap<String, String>,
    pub data: Value,
}

impl NewEvent {
    /// Checks required fields and rejects bytes reserved by the key layout.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.event_type.is_empty() {
            return Err(SepiaError::EmptyType);
        }
        if self.event_type.contains(':') {
            return Err(SepiaError::InvalidField(format!(
                "event type {:?} contains reserved byte ':'",
                self.event_type
            )));
        }
        for (key, value) in &self.tags {
            if key.contains(':') || key.contains('=') {
                return Err(SepiaError::InvalidField(format!(
                    "tag name {key:?} contains a reserved byte (':' or '=')"
                )));
            }
            if value.contains(':') {
                return Err(SepiaError::InvalidField(format!(
                    "tag value {value:?} for {key:?} contains reserved byte ':'"
                )));
            }
        }
        Ok(())
    }

    /// Stamps the identifier and resolves the timestamp into a stored event.
    pub(crate) fn into_event(self, id: Ulid, timestamp: DateTime<Utc>) -> Event {
        Event {
            id,
            timestamp,
            event_type: self.event_type,
            tags: self.tags,
            data: self.data,
        }
    }
}

//! Audit events
//!
//! Events are append-only. The store assigns `id` and `timestamp`; callers
//! build a [`NewEvent`] and get the stamped [`Event`] back.

use crate::domain::types::{PanelId, SiteId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Source tag for events produced by geofence evaluation
pub const SOURCE_GEOFENCE: &str = "geofence";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    Arm,
    Disarm,
    GeofencePrompt,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Arm => "arm",
            EventType::Disarm => "disarm",
            EventType::GeofencePrompt => "geofence_prompt",
            EventType::Other(s) => s,
        }
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "arm" => EventType::Arm,
            "disarm" => EventType::Disarm,
            "geofence_prompt" => EventType::GeofencePrompt,
            _ => EventType::Other(value),
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event as submitted to the event store, before id and timestamp exist
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub panel_id: PanelId,
    pub site_id: SiteId,
    pub event_type: EventType,
    pub source: String,
    pub user_id: Option<String>,
    pub partition_id: Option<String>,
    pub details: String,
}

impl NewEvent {
    /// Event raised by automation: no user, not tied to a single partition
    pub fn automated(
        panel_id: PanelId,
        site_id: SiteId,
        event_type: EventType,
        source: &str,
        details: &str,
    ) -> Self {
        Self {
            panel_id,
            site_id,
            event_type,
            source: source.to_string(),
            user_id: None,
            partition_id: None,
            details: details.to_string(),
        }
    }

    /// Attach store-assigned identity and timestamp
    pub fn stamp(self, id: Uuid, timestamp: DateTime<Utc>) -> Event {
        Event {
            id,
            panel_id: self.panel_id,
            site_id: self.site_id,
            timestamp,
            event_type: self.event_type,
            source: self.source,
            user_id: self.user_id,
            partition_id: self.partition_id,
            details: self.details,
        }
    }
}

/// Immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    pub panel_id: PanelId,
    pub site_id: SiteId,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub source: String,
    pub user_id: Option<String>,
    pub partition_id: Option<String>,
    pub details: String,
}

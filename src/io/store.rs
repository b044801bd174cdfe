//! Store interfaces consumed by the geofence evaluator
//!
//! Sites, panels and events live in external document stores. The evaluator
//! only sees these traits, so production backends and test doubles are
//! interchangeable.

use crate::domain::{Event, NewEvent, Panel, PanelId, Partition, Site, SiteId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;

/// Store operation failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("record not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("write conflict on {entity} {id}")]
    Conflict { entity: &'static str, id: String },

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: &str) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }
}

#[async_trait]
pub trait SiteStore: Send + Sync {
    /// Fetch a site by id, `None` when it does not exist
    async fn get_site(&self, site_id: &SiteId) -> Result<Option<Site>, StoreError>;
}

#[async_trait]
pub trait PanelStore: Send + Sync {
    /// Find the panel bound to a site. At most one is expected; if several
    /// match, the first one is returned.
    async fn find_panel_by_site(
        &self,
        site_id: &SiteId,
    ) -> Result<Option<(PanelId, Panel)>, StoreError>;

    /// Replace the full partition sequence of a panel
    async fn update_panel_partitions(
        &self,
        panel_id: &PanelId,
        partitions: Vec<Partition>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event. The store assigns id and timestamp.
    async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError>;
}

/// Wall clock that never goes backwards for a single writer
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current UTC time, clamped to the last value handed out
    pub fn now(&self) -> DateTime<Utc> {
        let mut last = self.last.lock();
        let now = Utc::now();
        let stamped = match *last {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        *last = Some(stamped);
        stamped
    }
}

//! Audit event recording

use crate::domain::{Event, EventType, NewEvent, PanelId, SiteId};
use crate::io::store::{EventStore, StoreError};
use std::sync::Arc;
use tracing::{error, info};

/// Appends automated audit events (no user, no partition) to the event store
#[derive(Clone)]
pub struct EventLogger {
    store: Arc<dyn EventStore>,
}

impl EventLogger {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Record one event. Failures are logged and returned to the caller;
    /// nothing already written elsewhere is undone.
    pub async fn record(
        &self,
        panel_id: &PanelId,
        site_id: &SiteId,
        event_type: EventType,
        source: &str,
        details: &str,
    ) -> Result<Event, StoreError> {
        let new_event = NewEvent::automated(
            panel_id.clone(),
            site_id.clone(),
            event_type,
            source,
            details,
        );

        match self.store.append_event(new_event).await {
            Ok(event) => {
                info!(
                    event_id = %event.id,
                    panel_id = %event.panel_id,
                    site_id = %event.site_id,
                    event_type = %event.event_type,
                    source = %event.source,
                    "event_recorded"
                );
                Ok(event)
            }
            Err(e) => {
                error!(
                    panel_id = %panel_id,
                    site_id = %site_id,
                    error = %e,
                    "event_record_failed"
                );
                Err(e)
            }
        }
    }
}

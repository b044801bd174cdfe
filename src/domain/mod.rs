//! Domain models - core business types
//!
//! This module contains the canonical data types used throughout the system:
//! - `Site`, `Panel`, `Partition` - security configuration and arm state
//! - `PresenceState` - per-site member presence snapshot
//! - `Event` - append-only audit record
//! - `GeofenceAction` - policy decisions

pub mod action;
pub mod event;
pub mod types;

// Re-export commonly used types at module level
pub use action::{GeofenceAction, PromptKind};
pub use event::{Event, EventType, NewEvent, SOURCE_GEOFENCE};
pub use types::{
    GeofenceConfig, GeofenceMode, MemberPresence, Panel, PanelId, Partition, PartitionState,
    PresenceState, PresenceUpdate, Site, SiteId,
};

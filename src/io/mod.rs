//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `store` - Site/panel/event store traits and `StoreError`
//! - `memory_store` - In-memory stores seeded from TOML
//! - `event_log` - Append-only JSONL event store
//! - `notifier` - Notification dispatch capability and channel dispatcher
//! - `mqtt` - MQTT client for receiving presence documents
//! - `mqtt_notifier` - MQTT publisher for prompt notifications
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod event_log;
pub mod memory_store;
pub mod mqtt;
pub mod mqtt_notifier;
pub mod notifier;
pub mod prometheus;
pub mod store;

// Re-export commonly used types
pub use event_log::JsonlEventStore;
pub use memory_store::{MemoryStore, SeedData};
pub use mqtt_notifier::MqttNotifier;
pub use notifier::{
    create_notification_channel, ChannelDispatcher, NoopDispatcher, Notification,
    NotificationDispatcher,
};
pub use store::{EventStore, PanelStore, SiteStore, StoreError};

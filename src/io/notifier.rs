//! Notification dispatch capability
//!
//! Prompts are announced through a [`NotificationDispatcher`]. Dispatch is
//! synchronous and fire-and-forget: implementations must never block, and the
//! evaluator never waits on delivery.

use crate::domain::types::epoch_ms;
use crate::domain::{PanelId, PromptKind, SiteId};
use crate::infra::metrics::Metrics;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Push payload describing a geofence prompt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub site: String,
    pub panel: String,
    /// arm_prompt or disarm_prompt
    pub kind: String,
    pub title: String,
    pub body: String,
    /// Timestamp (epoch ms)
    pub ts: u64,
}

impl Notification {
    pub fn prompt(site_id: &SiteId, panel_id: &PanelId, kind: PromptKind) -> Self {
        Self {
            site: site_id.0.clone(),
            panel: panel_id.0.clone(),
            kind: kind.as_str().to_string(),
            title: kind.title().to_string(),
            body: kind.body().to_string(),
            ts: epoch_ms(),
        }
    }
}

pub trait NotificationDispatcher: Send + Sync {
    /// Hand a notification off for delivery. Must not block.
    fn notify(&self, topic: &str, notification: Notification);
}

/// Default dispatcher: logs and drops
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDispatcher;

impl NotificationDispatcher for NoopDispatcher {
    fn notify(&self, topic: &str, notification: Notification) {
        debug!(topic = %topic, kind = %notification.kind, "notification_discarded");
    }
}

/// Notification queued for an outbound publisher
#[derive(Debug, Clone)]
pub struct OutboundNotification {
    pub topic: String,
    pub notification: Notification,
}

/// Dispatcher that enqueues onto a bounded channel
///
/// Clone this to share across producers. If the channel is full, the
/// notification is dropped.
#[derive(Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<OutboundNotification>,
    metrics: Option<Arc<Metrics>>,
}

impl ChannelDispatcher {
    pub fn new(tx: mpsc::Sender<OutboundNotification>, metrics: Option<Arc<Metrics>>) -> Self {
        Self { tx, metrics }
    }
}

impl NotificationDispatcher for ChannelDispatcher {
    fn notify(&self, topic: &str, notification: Notification) {
        let outbound = OutboundNotification { topic: topic.to_string(), notification };
        match self.tx.try_send(outbound) {
            Ok(()) => {
                if let Some(ref metrics) = self.metrics {
                    metrics.record_notification_dispatched();
                }
            }
            Err(TrySendError::Full(dropped)) => {
                if let Some(ref metrics) = self.metrics {
                    metrics.record_notification_dropped();
                }
                warn!(topic = %dropped.topic, "notification_dropped: channel full");
            }
            Err(TrySendError::Closed(dropped)) => {
                if let Some(ref metrics) = self.metrics {
                    metrics.record_notification_dropped();
                }
                warn!(topic = %dropped.topic, "notification_dropped: channel closed");
            }
        }
    }
}

/// Create a notification channel pair
///
/// Returns (dispatcher, receiver); the receiver feeds an outbound publisher.
pub fn create_notification_channel(
    buffer_size: usize,
    metrics: Option<Arc<Metrics>>,
) -> (ChannelDispatcher, mpsc::Receiver<OutboundNotification>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (ChannelDispatcher::new(tx, metrics), rx)
}

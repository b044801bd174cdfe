//! MQTT client for receiving presence documents
//!
//! Each publish on `presence/{siteId}` carries the full presence snapshot for
//! one site. Subscriptions use QoS 1, so the broker may redeliver; the
//! evaluator tolerates duplicates.

use crate::domain::{PresenceState, PresenceUpdate, SiteId};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Why a presence publish could not be turned into an update
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresenceParseError {
    #[error("topic has no site id")]
    NoSiteId,
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid presence JSON: {0}")]
    InvalidJson(String),
}

/// Site id from a presence topic: the last non-empty segment
pub fn site_id_from_topic(topic: &str) -> Option<SiteId> {
    topic.rsplit('/').find(|segment| !segment.is_empty()).map(SiteId::from)
}

/// Parse one presence publish
///
/// An empty (or whitespace-only) payload means the presence document was
/// cleared and yields an update with `presence = None`.
pub fn parse_presence_message(
    topic: &str,
    payload: &[u8],
    received_at: Instant,
) -> Result<PresenceUpdate, PresenceParseError> {
    let site_id = site_id_from_topic(topic).ok_or(PresenceParseError::NoSiteId)?;
    let text = std::str::from_utf8(payload).map_err(|_| PresenceParseError::InvalidUtf8)?;

    let presence = if text.trim().is_empty() {
        None
    } else {
        let state: PresenceState = serde_json::from_str(text)
            .map_err(|e| PresenceParseError::InvalidJson(e.to_string()))?;
        Some(state)
    };

    Ok(PresenceUpdate { site_id, presence, received_at })
}

/// Start the presence listener and forward updates to the worker channel
///
/// Updates are sent via try_send to avoid blocking the MQTT eventloop.
/// Dropped updates are counted in metrics and logged (rate-limited).
pub async fn start_presence_listener(
    config: &Config,
    presence_tx: mpsc::Sender<PresenceUpdate>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut mqttoptions =
        MqttOptions::new(config.mqtt_client_id(), config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client.subscribe(config.mqtt_presence_topic(), QoS::AtLeastOnce).await?;

    info!(
        topic = %config.mqtt_presence_topic(),
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        "presence_listener_subscribed"
    );

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("presence_listener_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let update = match parse_presence_message(
                            &publish.topic,
                            &publish.payload,
                            Instant::now(),
                        ) {
                            Ok(update) => update,
                            Err(e) => {
                                metrics.record_presence_invalid();
                                warn!(topic = %publish.topic, error = %e, "presence_invalid");
                                continue;
                            }
                        };

                        debug!(
                            site_id = %update.site_id,
                            cleared = %update.presence.is_none(),
                            "presence_received"
                        );
                        metrics.record_presence_received();

                        match presence_tx.try_send(update) {
                            Ok(()) => {}
                            Err(TrySendError::Full(dropped)) => {
                                metrics.record_presence_dropped();
                                if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                    warn!(site_id = %dropped.site_id, "presence_dropped: channel full");
                                    last_drop_warn = Instant::now();
                                }
                            }
                            Err(TrySendError::Closed(_)) => {
                                warn!("presence channel closed");
                                return Ok(());
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_connected");
                        // Resubscribe after reconnects; clean sessions drop subscriptions
                        if let Err(e) =
                            client.try_subscribe(config.mqtt_presence_topic(), QoS::AtLeastOnce)
                        {
                            warn!(error = %e, "presence_resubscribe_failed");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

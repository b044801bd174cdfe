//! MQTT publisher for prompt notifications
//!
//! Drains the notification channel fed by [`ChannelDispatcher`] and publishes
//! each prompt as JSON on its site topic (`site_{siteId}` by default) at QoS 0.
//! Delivery is best effort; a failed publish is logged and forgotten.
//!
//! [`ChannelDispatcher`]: crate::io::notifier::ChannelDispatcher

use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::notifier::OutboundNotification;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// MQTT notification publisher actor
pub struct MqttNotifier {
    client: AsyncClient,
    rx: mpsc::Receiver<OutboundNotification>,
    metrics: Option<Arc<Metrics>>,
}

impl MqttNotifier {
    /// Create a new notifier connected to the configured MQTT host/port
    pub fn new(config: &Config, rx: mpsc::Receiver<OutboundNotification>) -> Self {
        let client_id = format!("{}-notify-{}", config.mqtt_client_id(), std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_notifier_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_notifier_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self { client, rx, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run the publisher loop until shutdown, then drain what is queued
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("mqtt_notifier_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_notifier_shutdown");
                        while let Ok(outbound) = self.rx.try_recv() {
                            self.publish(outbound).await;
                        }
                        return;
                    }
                }
                maybe_outbound = self.rx.recv() => {
                    match maybe_outbound {
                        Some(outbound) => self.publish(outbound).await,
                        None => {
                            info!("mqtt_notifier_channel_closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn publish(&self, outbound: OutboundNotification) {
        let json = match serde_json::to_vec(&outbound.notification) {
            Ok(json) => json,
            Err(e) => {
                error!(topic = %outbound.topic, error = %e, "notification_encode_failed");
                return;
            }
        };

        match self.client.publish(&outbound.topic, QoS::AtMostOnce, false, json).await {
            Ok(()) => {
                debug!(
                    topic = %outbound.topic,
                    kind = %outbound.notification.kind,
                    "notification_published"
                );
            }
            Err(e) => {
                if let Some(ref metrics) = self.metrics {
                    metrics.record_notification_dropped();
                }
                warn!(topic = %outbound.topic, error = %e, "notification_publish_failed");
            }
        }
    }
}

//! Geofence gateway - automated arming and arm/disarm prompts from presence
//!
//! Listens for per-site presence documents over MQTT and runs the geofence
//! evaluator on every change: auto-arm when everyone leaves an auto-mode site,
//! prompt otherwise, and prompt (never disarm) when someone arrives.
//!
//! Module structure:
//! - `domain/` - Core types (Site, Panel, Partition, Presence, Event)
//! - `io/` - External interfaces (stores, MQTT, notifications, Prometheus)
//! - `services/` - Decision logic (Evaluator, policies, worker)
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use clap::Parser;
use geofence_gateway::infra::{Config, Metrics};
use geofence_gateway::io::{
    create_notification_channel, EventStore, JsonlEventStore, MemoryStore, MqttNotifier,
    NoopDispatcher, NotificationDispatcher, SeedData,
};
use geofence_gateway::services::{create_presence_worker, GeofenceEvaluator, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Geofence gateway - presence-driven arming decisions
#[derive(Parser, Debug)]
#[command(name = "geofence-gateway", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Structured logging, level via RUST_LOG (default: info)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("GIT_HASH"),
        "geofence_gateway_starting"
    );

    let args = Args::parse();
    let config = match args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(&[]),
    };

    info!(
        config_file = %config.config_file(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        presence_topic = %config.mqtt_presence_topic(),
        seed_file = ?config.seed_file(),
        events_file = ?config.events_file(),
        max_attempts = %config.max_attempts(),
        retry_backoff_ms = %config.retry_backoff_ms(),
        notifications = %config.notifications_enabled(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    geofence_gateway::infra::broker::start_embedded_broker(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Stores: sites and panels in memory, events in memory or JSONL
    let seed = match config.seed_file() {
        Some(path) => SeedData::from_file(path)?,
        None => {
            warn!("no seed file configured, store starts empty");
            SeedData::default()
        }
    };
    let store = Arc::new(MemoryStore::from_seed(seed));
    let events: Arc<dyn EventStore> = match config.events_file() {
        Some(path) => Arc::new(JsonlEventStore::new(path)),
        None => store.clone() as Arc<dyn EventStore>,
    };

    // Notifications: MQTT publisher fed by a bounded channel
    let notifier: Arc<dyn NotificationDispatcher> = if config.notifications_enabled() {
        let (dispatcher, notification_rx) =
            create_notification_channel(config.notification_buffer(), Some(metrics.clone()));
        let publisher = MqttNotifier::new(&config, notification_rx).with_metrics(metrics.clone());
        let publisher_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            publisher.run(publisher_shutdown).await;
        });
        Arc::new(dispatcher)
    } else {
        Arc::new(NoopDispatcher)
    };

    let evaluator = Arc::new(
        GeofenceEvaluator::new(store.clone(), store.clone(), events)
            .with_notifier(notifier)
            .with_topic_prefix(config.notification_topic_prefix()),
    );

    let retry = RetryPolicy::new(
        config.max_attempts(),
        Duration::from_millis(config.retry_backoff_ms()),
    );
    let (presence_tx, worker) =
        create_presence_worker(evaluator, metrics.clone(), retry, config.queue_size());
    let worker_handle = tokio::spawn(worker.run());

    // Presence listener owns the only sender; the worker stops once it exits
    let mqtt_config = config.clone();
    let mqtt_metrics = metrics.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = geofence_gateway::io::mqtt::start_presence_listener(
            &mqtt_config,
            presence_tx,
            mqtt_metrics,
            mqtt_shutdown,
        )
        .await
        {
            error!(error = %e, "presence_listener_error");
        }
    });

    // Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = geofence_gateway::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_metrics_server_error");
            }
        });
    }

    // Periodic metrics log
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    // Let in-flight evaluations finish
    if let Err(e) = worker_handle.await {
        error!(error = %e, "presence_worker_join_failed");
    }

    info!("geofence_gateway_shutdown_complete");
    Ok(())
}

//! Integration tests for configuration and seed loading

use geofence_gateway::domain::{GeofenceMode, PanelId, SiteId};
use geofence_gateway::infra::Config;
use geofence_gateway::io::{MemoryStore, PanelStore, SeedData, SiteStore};
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[mqtt]
host = "test-host"
port = 1884
presence_topic = "homes/+/presence"
username = "gw"
password = "secret"

[broker]
enabled = true
port = 1885

[store]
seed_file = "seed.toml"
events_file = "/var/lib/geofence/events.jsonl"

[evaluator]
max_attempts = 4
retry_backoff_ms = 50
queue_size = 64

[notifications]
enabled = false
topic_prefix = "alerts/"

[metrics]
interval_secs = 15
prometheus_port = 9091
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt_host(), "test-host");
    assert_eq!(config.mqtt_port(), 1884);
    assert_eq!(config.mqtt_presence_topic(), "homes/+/presence");
    assert_eq!(config.mqtt_username(), Some("gw"));
    assert_eq!(config.mqtt_password(), Some("secret"));
    assert!(config.broker_enabled());
    assert_eq!(config.broker_port(), 1885);
    assert_eq!(config.seed_file(), Some("seed.toml"));
    assert_eq!(config.events_file(), Some("/var/lib/geofence/events.jsonl"));
    assert_eq!(config.max_attempts(), 4);
    assert_eq!(config.retry_backoff_ms(), 50);
    assert_eq!(config.queue_size(), 64);
    assert!(!config.notifications_enabled());
    assert_eq!(config.notification_topic_prefix(), "alerts/");
    assert_eq!(config.notification_buffer(), 256);
    assert_eq!(config.metrics_interval_secs(), 15);
    assert_eq!(config.prometheus_port(), 9091);
    assert_eq!(config.config_file(), temp_file.path().display().to_string());
}

#[test]
fn test_invalid_config_is_an_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[mqtt]\nport = \"not a port\"\n").unwrap();
    temp_file.flush().unwrap();

    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse config file"));
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.mqtt_host(), "localhost");
    assert_eq!(config.mqtt_port(), 1883);
    assert_eq!(config.config_file(), "default");
}

#[tokio::test]
async fn test_seed_file_populates_memory_store() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file
        .write_all(
            br#"
[[sites]]
id = "S1"
geofence = { enabled = true, mode = "prompt" }

[[panels]]
id = "P1"
site_id = "S1"
partitions = [{ state = "disarmed" }, { state = "armed_stay" }]
"#,
        )
        .unwrap();
    temp_file.flush().unwrap();

    let seed = SeedData::from_file(temp_file.path()).unwrap();
    let store = MemoryStore::from_seed(seed);

    let site = store.get_site(&SiteId::from("S1")).await.unwrap().unwrap();
    assert_eq!(site.active_geofence().map(|g| &g.mode), Some(&GeofenceMode::Prompt));

    let (panel_id, panel) = store.find_panel_by_site(&SiteId::from("S1")).await.unwrap().unwrap();
    assert_eq!(panel_id, PanelId::from("P1"));
    assert_eq!(panel.partitions.len(), 2);
    assert!(panel.partitions[0].id.is_none());
    assert!(panel.is_armed());
}

#[test]
fn test_missing_seed_file_is_an_error() {
    let err = SeedData::from_file("/nonexistent/seed.toml").unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to read seed file"));
}

//! In-memory site, panel and event store
//!
//! Seeded from a TOML file at startup. Panel writes are last-write-wins:
//! concurrent evaluations for the same panel are resolved by whichever
//! `update_panel_partitions` call lands last.

use crate::domain::{Event, NewEvent, Panel, PanelId, Partition, Site, SiteId};
use crate::io::store::{EventStore, MonotonicClock, PanelStore, SiteStore, StoreError};
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

/// Seed file layout:
///
/// ```toml
/// [[sites]]
/// id = "S1"
/// geofence = { enabled = true, mode = "auto" }
///
/// [[panels]]
/// id = "P1"
/// siteId = "S1"
/// partitions = [{ id = "A", state = "disarmed" }]
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub sites: Vec<Site>,
    #[serde(default)]
    pub panels: Vec<Panel>,
}

impl SeedData {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read seed file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse seed file {}", path.display()))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    sites: RwLock<FxHashMap<SiteId, Site>>,
    /// Insertion order decides which panel wins a site lookup
    panels: RwLock<Vec<Panel>>,
    events: Mutex<Vec<Event>>,
    clock: MonotonicClock,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: SeedData) -> Self {
        let store = Self::new();
        for site in seed.sites {
            store.insert_site(site);
        }
        for panel in seed.panels {
            store.insert_panel(panel);
        }
        info!(
            sites = %store.sites.read().len(),
            panels = %store.panels.read().len(),
            "memory_store_seeded"
        );
        store
    }

    pub fn insert_site(&self, site: Site) {
        self.sites.write().insert(site.id.clone(), site);
    }

    /// Insert a panel, replacing any existing panel with the same id
    pub fn insert_panel(&self, panel: Panel) {
        let mut panels = self.panels.write();
        match panels.iter_mut().find(|p| p.id == panel.id) {
            Some(existing) => *existing = panel,
            None => panels.push(panel),
        }
    }

    pub fn panel(&self, panel_id: &PanelId) -> Option<Panel> {
        self.panels.read().iter().find(|p| &p.id == panel_id).cloned()
    }

    /// Snapshot of all recorded events in append order
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl SiteStore for MemoryStore {
    async fn get_site(&self, site_id: &SiteId) -> Result<Option<Site>, StoreError> {
        Ok(self.sites.read().get(site_id).cloned())
    }
}

#[async_trait]
impl PanelStore for MemoryStore {
    async fn find_panel_by_site(
        &self,
        site_id: &SiteId,
    ) -> Result<Option<(PanelId, Panel)>, StoreError> {
        let panels = self.panels.read();
        Ok(panels.iter().find(|p| &p.site_id == site_id).map(|p| (p.id.clone(), p.clone())))
    }

    async fn update_panel_partitions(
        &self,
        panel_id: &PanelId,
        partitions: Vec<Partition>,
    ) -> Result<(), StoreError> {
        let mut panels = self.panels.write();
        let panel = panels
            .iter_mut()
            .find(|p| &p.id == panel_id)
            .ok_or_else(|| StoreError::not_found("panel", &panel_id.0))?;
        panel.partitions = partitions;
        debug!(panel_id = %panel_id, "panel_partitions_updated");
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError> {
        // Stamp under the lock so append order matches timestamp order
        let mut events = self.events.lock();
        let event = event.stamp(Uuid::now_v7(), self.clock.now());
        events.push(event.clone());
        Ok(event)
    }
}

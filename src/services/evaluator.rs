//! Geofence evaluator
//!
//! Entry point for every presence change. Loads the site and its panel,
//! derives occupancy, asks the arming or disarming policy for a decision and
//! applies it: panel write first, then the audit event, then a fire-and-forget
//! notification for prompts.
//!
//! The evaluator keeps no state between calls. Each call reads fresh from the
//! stores, so duplicated or reordered deliveries converge on the same panel
//! state; write conflicts between concurrent calls are left to the panel store.

use crate::domain::{
    EventType, GeofenceAction, Panel, PanelId, PresenceState, PromptKind, Site, SiteId,
    SOURCE_GEOFENCE,
};
use crate::io::notifier::{Notification, NotificationDispatcher, NoopDispatcher};
use crate::io::store::{EventStore, PanelStore, SiteStore, StoreError};
use crate::services::arming::on_everyone_left;
use crate::services::disarming::on_someone_arrived;
use crate::services::event_logger::EventLogger;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

/// Audit detail for an automatic arm
pub const AUTO_ARM_DETAILS: &str = "Auto-armed: everyone left the geofence";

/// Default notification topic prefix; the site id is appended
pub const DEFAULT_TOPIC_PREFIX: &str = "site_";

/// Why an evaluation did nothing. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Presence absent or without a member set
    NoPresence,
    SiteNotFound,
    /// Geofence block missing or disabled for the site
    GeofenceDisabled,
    PanelNotFound,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoPresence => "no_presence",
            SkipReason::SiteNotFound => "site_not_found",
            SkipReason::GeofenceDisabled => "geofence_disabled",
            SkipReason::PanelNotFound => "panel_not_found",
        }
    }
}

/// Outcome of one evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    Skipped(SkipReason),
    /// Someone is present and nothing is armed
    NoAction { panel_id: PanelId },
    AutoArmed { panel_id: PanelId, newly_armed: usize },
    Prompted { panel_id: PanelId, kind: PromptKind },
}

impl Evaluation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Evaluation::Skipped(_) => "skipped",
            Evaluation::NoAction { .. } => "no_action",
            Evaluation::AutoArmed { .. } => "auto_armed",
            Evaluation::Prompted { kind: PromptKind::ArmPrompt, .. } => "arm_prompted",
            Evaluation::Prompted { kind: PromptKind::DisarmPrompt, .. } => "disarm_prompted",
        }
    }
}

/// Store failures during evaluation, tagged with the step that failed.
/// All of them are worth retrying with the same presence snapshot.
#[derive(Debug, Error)]
pub enum EvaluateError {
    #[error("site lookup failed for {site_id}: {source}")]
    SiteLookup { site_id: SiteId, source: StoreError },

    #[error("panel lookup failed for site {site_id}: {source}")]
    PanelLookup { site_id: SiteId, source: StoreError },

    #[error("partition update failed for panel {panel_id}: {source}")]
    PanelUpdate { panel_id: PanelId, source: StoreError },

    #[error("event append failed for panel {panel_id}: {source}")]
    EventAppend { panel_id: PanelId, source: StoreError },
}

pub struct GeofenceEvaluator {
    sites: Arc<dyn SiteStore>,
    panels: Arc<dyn PanelStore>,
    logger: EventLogger,
    notifier: Arc<dyn NotificationDispatcher>,
    topic_prefix: String,
}

impl GeofenceEvaluator {
    /// Create an evaluator with a no-op notification dispatcher
    pub fn new(
        sites: Arc<dyn SiteStore>,
        panels: Arc<dyn PanelStore>,
        events: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            sites,
            panels,
            logger: EventLogger::new(events),
            notifier: Arc::new(NoopDispatcher),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationDispatcher>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_topic_prefix(mut self, prefix: &str) -> Self {
        self.topic_prefix = prefix.to_string();
        self
    }

    /// Notification topic for a site
    pub fn topic_for(&self, site_id: &SiteId) -> String {
        format!("{}{}", self.topic_prefix, site_id)
    }

    /// Evaluate one presence snapshot for a site
    pub async fn evaluate(
        &self,
        site_id: &SiteId,
        presence: Option<&PresenceState>,
    ) -> Result<Evaluation, EvaluateError> {
        let Some(anyone_home) = presence.and_then(PresenceState::occupancy) else {
            return Ok(skipped(site_id, SkipReason::NoPresence));
        };
        let member_count = presence.map_or(0, PresenceState::member_count);

        let site = self
            .sites
            .get_site(site_id)
            .await
            .map_err(|source| EvaluateError::SiteLookup { site_id: site_id.clone(), source })?;
        let Some(site) = site else {
            return Ok(skipped(site_id, SkipReason::SiteNotFound));
        };

        if site.active_geofence().is_none() {
            return Ok(skipped(site_id, SkipReason::GeofenceDisabled));
        }

        let found = self
            .panels
            .find_panel_by_site(site_id)
            .await
            .map_err(|source| EvaluateError::PanelLookup { site_id: site_id.clone(), source })?;
        let Some((panel_id, panel)) = found else {
            return Ok(skipped(site_id, SkipReason::PanelNotFound));
        };

        let action =
            if anyone_home { on_someone_arrived(&panel) } else { on_everyone_left(&panel, &site) };

        let evaluation = self.apply(action, &panel_id, &panel, &site).await?;

        info!(
            site_id = %site_id,
            panel_id = %panel_id,
            anyone_home = %anyone_home,
            members = %member_count,
            outcome = %evaluation.as_str(),
            "geofence_evaluated"
        );

        Ok(evaluation)
    }

    async fn apply(
        &self,
        action: GeofenceAction,
        panel_id: &PanelId,
        panel: &Panel,
        site: &Site,
    ) -> Result<Evaluation, EvaluateError> {
        match action {
            GeofenceAction::AutoArm { partitions, newly_armed } => {
                let partition_count = partitions.len();
                self.panels.update_panel_partitions(panel_id, partitions).await.map_err(
                    |source| {
                        error!(panel_id = %panel_id, error = %source, "geofence_arm_update_failed");
                        EvaluateError::PanelUpdate { panel_id: panel_id.clone(), source }
                    },
                )?;
                info!(
                    panel_id = %panel_id,
                    site_id = %site.id,
                    newly_armed = %newly_armed,
                    partitions = %partition_count,
                    "geofence_auto_armed"
                );

                // The arm stays in place even if the audit write fails
                self.logger
                    .record(panel_id, &site.id, EventType::Arm, SOURCE_GEOFENCE, AUTO_ARM_DETAILS)
                    .await
                    .map_err(|source| EvaluateError::EventAppend {
                        panel_id: panel_id.clone(),
                        source,
                    })?;

                Ok(Evaluation::AutoArmed { panel_id: panel_id.clone(), newly_armed })
            }
            GeofenceAction::Prompt(kind) => {
                self.logger
                    .record(
                        panel_id,
                        &site.id,
                        EventType::GeofencePrompt,
                        SOURCE_GEOFENCE,
                        kind.details(),
                    )
                    .await
                    .map_err(|source| EvaluateError::EventAppend {
                        panel_id: panel_id.clone(),
                        source,
                    })?;

                let topic = self.topic_for(&site.id);
                self.notifier.notify(&topic, Notification::prompt(&site.id, &panel.id, kind));
                debug!(topic = %topic, kind = %kind.as_str(), "geofence_prompt_dispatched");

                Ok(Evaluation::Prompted { panel_id: panel_id.clone(), kind })
            }
            GeofenceAction::NoAction => Ok(Evaluation::NoAction { panel_id: panel_id.clone() }),
        }
    }
}

fn skipped(site_id: &SiteId, reason: SkipReason) -> Evaluation {
    info!(site_id = %site_id, reason = %reason.as_str(), "geofence_skipped");
    Evaluation::Skipped(reason)
}

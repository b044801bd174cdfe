//! Disarming policy: what to do when someone arrives
//!
//! Arrival never disarms. An armed panel gets a prompt; a disarmed panel
//! needs nothing. Site mode does not matter here.

use crate::domain::{GeofenceAction, Panel, PromptKind};

/// Decide the action for an occupied site
pub fn on_someone_arrived(panel: &Panel) -> GeofenceAction {
    if panel.is_armed() {
        GeofenceAction::Prompt(PromptKind::DisarmPrompt)
    } else {
        GeofenceAction::NoAction
    }
}

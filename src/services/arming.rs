//! Arming policy: what to do when everyone has left the geofence
//!
//! Auto mode arms every disarmed partition without confirmation; any other
//! mode asks a human. Partitions already in an armed sub-state are left as
//! they are, so re-running on an armed panel changes nothing.

use crate::domain::{GeofenceAction, Panel, Partition, PartitionState, PromptKind, Site};

/// Decide the action for an unoccupied site
pub fn on_everyone_left(panel: &Panel, site: &Site) -> GeofenceAction {
    let auto = site.geofence.as_ref().is_some_and(|g| g.mode.is_auto());
    if !auto {
        return GeofenceAction::Prompt(PromptKind::ArmPrompt);
    }

    let (partitions, newly_armed) = arm_disarmed(&panel.partitions);
    GeofenceAction::AutoArm { partitions, newly_armed }
}

/// Copy of `partitions` with every disarmed partition set to armed.
/// Returns the new sequence and how many partitions changed.
pub fn arm_disarmed(partitions: &[Partition]) -> (Vec<Partition>, usize) {
    let mut newly_armed = 0;
    let updated = partitions
        .iter()
        .map(|p| {
            if p.state.is_disarmed() {
                newly_armed += 1;
                Partition { state: PartitionState::Armed, ..p.clone() }
            } else {
                p.clone()
            }
        })
        .collect();
    (updated, newly_armed)
}

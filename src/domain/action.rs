//! Decisions produced by the arming and disarming policies
//!
//! No variant can carry a disarm. Arrival only ever produces a prompt.

use crate::domain::types::Partition;

/// Kind of confirmation request sent to the site's occupants/owners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// Everyone left a prompt-mode site
    ArmPrompt,
    /// Someone arrived while a partition was armed
    DisarmPrompt,
}

impl PromptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptKind::ArmPrompt => "arm_prompt",
            PromptKind::DisarmPrompt => "disarm_prompt",
        }
    }

    /// Audit detail text recorded with the prompt event
    pub fn details(&self) -> &'static str {
        match self {
            PromptKind::ArmPrompt => "Everyone left \u{2014} arm prompt sent",
            PromptKind::DisarmPrompt => "Someone arrived \u{2014} disarm prompt sent",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            PromptKind::ArmPrompt => "Everyone has left",
            PromptKind::DisarmPrompt => "Welcome back",
        }
    }

    pub fn body(&self) -> &'static str {
        match self {
            PromptKind::ArmPrompt => "Nobody is home. Arm the system?",
            PromptKind::DisarmPrompt => "Someone arrived while the system is armed. Disarm?",
        }
    }
}

/// Action decided by a policy, applied by the evaluator
#[derive(Debug, Clone, PartialEq)]
pub enum GeofenceAction {
    /// Replace the panel's partition sequence; every disarmed partition is now armed
    AutoArm { partitions: Vec<Partition>, newly_armed: usize },
    /// Record a prompt event and notify, no panel mutation
    Prompt(PromptKind),
    /// Nothing to record
    NoAction,
}

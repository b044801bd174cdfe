//! Services - geofence business logic
//!
//! This module contains the core decision logic:
//! - `evaluator` - Loads site/panel state and applies policy decisions
//! - `arming` - Everyone-left policy (auto arm or arm prompt)
//! - `disarming` - Someone-arrived policy (disarm prompt, never a disarm)
//! - `event_logger` - Audit event recording
//! - `presence_worker` - Async evaluation worker with retries

pub mod arming;
pub mod disarming;
pub mod evaluator;
pub mod event_logger;
pub mod presence_worker;

// Re-export commonly used types
pub use evaluator::{EvaluateError, Evaluation, GeofenceEvaluator, SkipReason};
pub use event_logger::EventLogger;
pub use presence_worker::{create_presence_worker, PresenceWorker, RetryPolicy};

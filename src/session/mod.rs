//! Recording session management
//!
//! The `SessionController` owns the lifecycle of one recording at a time:
//! - Launching and supervising the encoder subprocess
//! - Tracking the segment files it writes
//! - Enforcing the optional time limit
//! - Writing the session audit trail and the final summary

mod config;
mod controller;
mod limit;
mod stats;

pub use config::{
    make_session_id, BoundaryMode, SessionConfig, SupervisorSettings, TimeLimitPolicy,
};
pub use controller::{SessionController, SessionHandle, StopHandle};
pub use limit::{LimitEnforcer, LimitPlan, LimitWarning};
pub use stats::{SessionSnapshot, SessionState, SessionSummary, StopReason};

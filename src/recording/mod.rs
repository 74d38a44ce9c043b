//! Encoder subprocess supervision
//!
//! - `ProcessSupervisor`: launch in a dedicated process group, exit watch,
//!   graceful-then-forced termination
//! - `diagnostics`: stderr line classification and forwarding into the
//!   session log

pub mod diagnostics;
mod supervisor;

pub use supervisor::{ExitRecord, ProcessSupervisor, Termination};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::audio::Chunk;
use crate::recording::ExitRecord;

/// Lifecycle of a recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Recording,
    Stopping,
    Stopped,
    Errored,
}

impl SessionState {
    /// Whether a session in this state blocks a new `start`
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Recording | SessionState::Stopping
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Errored)
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    UserRequest,
    TimeLimit,
    Signal,
    SubprocessExit,
    DiskFull,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::UserRequest => "user_request",
            StopReason::TimeLimit => "time_limit",
            StopReason::Signal => "signal",
            StopReason::SubprocessExit => "subprocess_exit",
            StopReason::DiskFull => "disk_full",
        }
    }

    /// Reasons that end the session in `Errored` and a non-zero exit
    pub fn is_error(&self) -> bool {
        matches!(self, StopReason::SubprocessExit | StopReason::DiskFull)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final accounting of a session, returned by `stop()`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub session_name: String,
    pub reason: StopReason,
    pub final_state: SessionState,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub chunks: Vec<Chunk>,
    pub total_bytes: u64,
    pub exit: Option<ExitRecord>,
    pub log_path: Option<PathBuf>,
}

impl SessionSummary {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

/// Point-in-time view for status surfaces
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub session_id: Option<String>,
    pub session_name: Option<String>,
    pub device: Option<String>,
    pub elapsed_secs: f64,
    pub chunk_count: usize,
    /// Sequence of the segment the encoder is currently writing
    pub current_chunk: Option<u32>,
    pub segment_duration_secs: Option<u64>,
    pub log_path: Option<PathBuf>,
    pub time_limit_secs: u64,
    pub time_limit_remaining_secs: Option<u64>,
    pub process_id: Option<u32>,
    pub disk_free_bytes: Option<u64>,
}

impl SessionSnapshot {
    pub fn idle(state: SessionState) -> Self {
        Self {
            state,
            session_id: None,
            session_name: None,
            device: None,
            elapsed_secs: 0.0,
            chunk_count: 0,
            current_chunk: None,
            segment_duration_secs: None,
            log_path: None,
            time_limit_secs: 0,
            time_limit_remaining_secs: None,
            process_id: None,
            disk_free_bytes: None,
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::audio::EncoderParams;
use crate::device::DeviceRequest;
use crate::error::{RecorderError, RecorderResult};
use crate::logging::LogSettings;

/// Whether a time-limit stop may cut the segment in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryMode {
    /// Stop exactly at the limit
    #[default]
    Immediate,
    /// Let the segment open at the limit close naturally, then stop
    EndSegment,
}

impl fmt::Display for BoundaryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundaryMode::Immediate => f.write_str("immediate"),
            BoundaryMode::EndSegment => f.write_str("end_segment"),
        }
    }
}

impl FromStr for BoundaryMode {
    type Err = RecorderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "immediate" => Ok(BoundaryMode::Immediate),
            "end_segment" | "segment" => Ok(BoundaryMode::EndSegment),
            other => Err(RecorderError::config(format!("unknown boundary mode: {other:?}"))),
        }
    }
}

/// Longest accepted time limit (one year)
pub const MAX_TIME_LIMIT_SECS: u64 = 365 * 24 * 60 * 60;

/// Total-duration cap for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TimeLimitPolicy {
    /// 0 disables the limit
    pub limit_secs: u64,
    pub boundary: BoundaryMode,
}

impl TimeLimitPolicy {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(limit_secs: u64, boundary: BoundaryMode) -> Self {
        Self {
            limit_secs,
            boundary,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limit_secs > 0
    }
}

/// Timing knobs for subprocess supervision and chunk polling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// SIGTERM to SIGKILL escalation window
    pub grace_period: Duration,
    pub poll_interval: Duration,
    /// How long a chunk's size must be unchanged before it may be finalized
    pub stability_window: Duration,
    /// Open chunk not growing this long means the encoder cannot write; zero disables
    pub stall_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            stability_window: Duration::from_secs(1),
            stall_timeout: Duration::from_secs(30),
        }
    }
}

/// Fully-resolved configuration for one recording session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Human-facing name; arbitrary characters allowed
    pub session_name: String,

    /// Root directory; the session gets `<output_dir>/<session_id>/`
    pub output_dir: PathBuf,

    pub device: DeviceRequest,

    pub encoder: EncoderParams,

    pub time_limit: TimeLimitPolicy,

    pub logging: LogSettings,

    pub supervisor: SupervisorSettings,

    /// `key=value` overrides applied on top of the config file, for the audit trail
    pub overrides: Vec<(String, String)>,
}

impl SessionConfig {
    pub fn new(session_name: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_name: session_name.into(),
            output_dir: output_dir.into(),
            device: DeviceRequest::Auto,
            encoder: EncoderParams::default(),
            time_limit: TimeLimitPolicy::disabled(),
            logging: LogSettings::default(),
            supervisor: SupervisorSettings::default(),
            overrides: Vec::new(),
        }
    }

    /// Checks that need no filesystem or subprocess access
    pub fn validate(&self) -> RecorderResult<()> {
        if self.session_name.trim().is_empty() {
            return Err(RecorderError::config("session name must not be empty"));
        }
        self.encoder.validate()?;
        if self.supervisor.poll_interval.is_zero() {
            return Err(RecorderError::config("poll interval must be positive"));
        }
        if self.time_limit.limit_secs > MAX_TIME_LIMIT_SECS {
            return Err(RecorderError::config(format!(
                "time limit {}s exceeds the maximum of {MAX_TIME_LIMIT_SECS}s",
                self.time_limit.limit_secs
            )));
        }
        Ok(())
    }
}

/// Build the stable session id: `<slug>_<YYYYMMDD>_<HHMMSS>`.
///
/// Characters outside `[A-Za-z0-9_-]` become `-` so the id is always a
/// single safe path component.
pub fn make_session_id(session_name: &str, created_at: DateTime<Utc>) -> String {
    let slug: String = session_name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{}_{}", slug, created_at.format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn session_id_keeps_underscores_and_sanitizes_separators() {
        let at = Utc.with_ymd_and_hms(2026, 1, 11, 10, 10, 10).unwrap();
        assert_eq!(
            make_session_id("my_meeting_notes", at),
            "my_meeting_notes_20260111_101010"
        );
        assert_eq!(make_session_id("team/sync: q1", at), "team-sync--q1_20260111_101010");
    }

    #[test]
    fn boundary_mode_parsing() {
        assert_eq!("immediate".parse::<BoundaryMode>().unwrap(), BoundaryMode::Immediate);
        assert_eq!("end_segment".parse::<BoundaryMode>().unwrap(), BoundaryMode::EndSegment);
        assert_eq!("end-segment".parse::<BoundaryMode>().unwrap(), BoundaryMode::EndSegment);
        assert!("later".parse::<BoundaryMode>().is_err());
    }

    #[test]
    fn validation_rejects_zero_segment_duration() {
        let mut config = SessionConfig::new("s", "/tmp");
        config.encoder.segment_duration_secs = 0;
        assert!(matches!(config.validate(), Err(RecorderError::Config { .. })));
    }

    #[test]
    fn validation_caps_the_time_limit() {
        let mut config = SessionConfig::new("s", "/tmp");
        config.time_limit = TimeLimitPolicy::new(MAX_TIME_LIMIT_SECS, BoundaryMode::Immediate);
        assert!(config.validate().is_ok());

        for limit in [MAX_TIME_LIMIT_SECS + 1, u64::MAX] {
            config.time_limit = TimeLimitPolicy::new(limit, BoundaryMode::EndSegment);
            assert!(matches!(config.validate(), Err(RecorderError::Config { .. })));
        }
    }
}

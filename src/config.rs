use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::{Codec, EncoderParams};
use crate::device::DeviceRequest;
use crate::duration::parse_duration_secs;
use crate::logging::{Level, LogSettings, Rollover, RotationKind, RotationPolicy};
use crate::session::{BoundaryMode, SessionConfig, SupervisorSettings, TimeLimitPolicy};

/// Environment variables override file values: `ECHOLOG__RECORDING__FORMAT=opus`
pub const ENV_PREFIX: &str = "ECHOLOG";

/// Segment length forced by `--test`
pub const TEST_SEGMENT_SECS: u64 = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub recording: RecordingConfig,
    pub audio: AudioConfig,
    pub logging: LoggingConfig,
    pub limits: LimitsConfig,
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    pub segment_duration: u64,
    pub sample_rate: u32,
    pub channels: u16,
    /// flac, mp3, opus or wav
    pub format: String,
    pub output_dir: String,
    pub encoder: String,
    pub input_format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    /// `auto` or a source name
    pub device: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub rotation: RotationKind,
    pub max_bytes: u64,
    pub backup_count: u32,
    /// Boundary for time rotation
    pub when: Rollover,
    pub encoder_output_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// `0`, `90`, `45m`, `1h30m`...
    pub time_limit: String,
    pub boundary: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    pub grace_period_secs: u64,
    pub poll_interval_ms: u64,
    /// Defaults to the poll interval
    pub stability_window_ms: Option<u64>,
    pub stall_timeout_secs: u64,
}

impl Config {
    /// Built-in defaults, then the optional file, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_overrides(path, &[])
    }

    /// Like `load`, with `section.key=value` overrides applied last
    pub fn load_with_overrides(path: Option<&Path>, overrides: &[(String, String)]) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("recording.segment_duration", 300)?
            .set_default("recording.sample_rate", 44100)?
            .set_default("recording.channels", 2)?
            .set_default("recording.format", "flac")?
            .set_default("recording.output_dir", "~/recordings")?
            .set_default("recording.encoder", "ffmpeg")?
            .set_default("recording.input_format", "pulse")?
            .set_default("audio.device", "auto")?
            .set_default("logging.level", "info")?
            .set_default("logging.rotation", "size")?
            .set_default("logging.max_bytes", 5 * 1024 * 1024)?
            .set_default("logging.backup_count", 3)?
            .set_default("logging.when", "daily")?
            .set_default("logging.encoder_output_level", "debug")?
            .set_default("limits.time_limit", "0")?
            .set_default("limits.boundary", "immediate")?
            .set_default("supervisor.grace_period_secs", 10)?
            .set_default("supervisor.poll_interval_ms", 1000)?
            .set_default("supervisor.stall_timeout_secs", 30)?;

        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => match default_config_path() {
                Some(path) => builder.add_source(config::File::from(path).required(false)),
                None => builder,
            },
        };

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        for (key, value) in overrides {
            builder = builder
                .set_override(key.as_str(), value.as_str())
                .with_context(|| format!("invalid override {key}={value}"))?;
        }

        let settings = builder.build().context("failed to load configuration")?;
        Ok(settings.try_deserialize()?)
    }

    /// `output_dir` with `~` expanded
    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.recording.output_dir).as_ref())
    }

    /// Resolve into the controller's input, recording `overrides` for the audit trail
    pub fn to_session_config(
        &self,
        session_name: &str,
        overrides: &[(String, String)],
    ) -> Result<SessionConfig> {
        let codec: Codec = self.recording.format.parse()?;
        let encoder = EncoderParams {
            binary: PathBuf::from(shellexpand::tilde(&self.recording.encoder).as_ref()),
            input_format: self.recording.input_format.clone(),
            sample_rate: self.recording.sample_rate,
            channels: self.recording.channels,
            codec,
            segment_duration_secs: self.recording.segment_duration,
        };

        let limit_secs = parse_duration_secs(&self.limits.time_limit)
            .with_context(|| format!("invalid time limit {:?}", self.limits.time_limit))?;
        let boundary: BoundaryMode = self.limits.boundary.parse()?;

        let rotation = match self.logging.rotation {
            RotationKind::Off => RotationPolicy::Off,
            RotationKind::Size => RotationPolicy::Size {
                max_bytes: self.logging.max_bytes,
                backup_count: self.logging.backup_count,
            },
            RotationKind::Time => RotationPolicy::Time {
                every: self.logging.when,
                backup_count: self.logging.backup_count,
            },
        };
        let logging = LogSettings {
            level: self.logging.level.parse::<Level>()?,
            rotation,
            encoder_output_level: self.logging.encoder_output_level.parse::<Level>()?,
        };

        let poll_ms = self.supervisor.poll_interval_ms;
        let supervisor = SupervisorSettings {
            grace_period: Duration::from_secs(self.supervisor.grace_period_secs),
            poll_interval: Duration::from_millis(poll_ms),
            stability_window: Duration::from_millis(
                self.supervisor.stability_window_ms.unwrap_or(poll_ms),
            ),
            stall_timeout: Duration::from_secs(self.supervisor.stall_timeout_secs),
        };

        let mut session = SessionConfig::new(session_name, self.output_dir());
        session.device = DeviceRequest::parse(&self.audio.device);
        session.encoder = encoder;
        session.time_limit = TimeLimitPolicy::new(limit_secs, boundary);
        session.logging = logging;
        session.supervisor = supervisor;
        session.overrides = overrides.to_vec();
        session.validate()?;
        Ok(session)
    }
}

/// `~/.config/echolog/config.toml`
fn default_config_path() -> Option<PathBuf> {
    let path = shellexpand::tilde("~/.config/echolog/config.toml");
    let path = PathBuf::from(path.as_ref());
    path.is_absolute().then_some(path)
}

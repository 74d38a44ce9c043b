use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{RecorderError, RecorderResult};

/// Output codec for segment files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Flac,
    Mp3,
    Opus,
    Wav,
}

impl Codec {
    /// ffmpeg `-c:a` value
    pub fn ffmpeg_codec(&self) -> &'static str {
        match self {
            Codec::Flac => "flac",
            Codec::Mp3 => "libmp3lame",
            Codec::Opus => "libopus",
            Codec::Wav => "pcm_s16le",
        }
    }

    /// ffmpeg `-segment_format` value
    pub fn segment_format(&self) -> &'static str {
        match self {
            Codec::Flac => "flac",
            Codec::Mp3 => "mp3",
            Codec::Opus => "ogg",
            Codec::Wav => "wav",
        }
    }

    /// File extension of segment files
    pub fn extension(&self) -> &'static str {
        self.segment_format()
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Codec::Flac => "flac",
            Codec::Mp3 => "mp3",
            Codec::Opus => "opus",
            Codec::Wav => "wav",
        };
        f.write_str(name)
    }
}

impl FromStr for Codec {
    type Err = RecorderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flac" => Ok(Codec::Flac),
            "mp3" => Ok(Codec::Mp3),
            "opus" | "ogg" => Ok(Codec::Opus),
            "wav" => Ok(Codec::Wav),
            other => Err(RecorderError::config(format!("unsupported format: {other:?}"))),
        }
    }
}

/// Encoder parameters for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncoderParams {
    /// Encoder binary (name on PATH or explicit path)
    pub binary: PathBuf,
    /// ffmpeg input format (`pulse`, `alsa`, ...)
    pub input_format: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub codec: Codec,
    /// Length of each segment in seconds
    pub segment_duration_secs: u64,
}

impl Default for EncoderParams {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
            input_format: "pulse".to_string(),
            sample_rate: 44100,
            channels: 2,
            codec: Codec::Flac,
            segment_duration_secs: 300,
        }
    }
}

impl EncoderParams {
    pub fn validate(&self) -> RecorderResult<()> {
        if self.segment_duration_secs == 0 {
            return Err(RecorderError::config("segment duration must be positive"));
        }
        if self.sample_rate == 0 {
            return Err(RecorderError::config("sample rate must be positive"));
        }
        if self.channels == 0 {
            return Err(RecorderError::config("channel count must be positive"));
        }
        Ok(())
    }
}

/// `<session_id>_chunk_` prefix shared by every segment file of a session
pub fn chunk_prefix(session_id: &str) -> String {
    format!("{session_id}_chunk_")
}

/// File name of segment `sequence`
pub fn chunk_file_name(session_id: &str, sequence: u32, codec: Codec) -> String {
    format!("{}{:03}.{}", chunk_prefix(session_id), sequence, codec.extension())
}

/// Sequence number of a segment file belonging to `session_id`, if it is one.
///
/// Matching uses the full session id as prefix and requires an all-digit
/// sequence, so names from other sessions never match even when the session
/// names share underscores.
pub fn parse_chunk_sequence(file_name: &str, session_id: &str, codec: Codec) -> Option<u32> {
    let rest = file_name.strip_prefix(&chunk_prefix(session_id))?;
    let digits = rest.strip_suffix(codec.extension())?.strip_suffix('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// The exact encoder invocation for one session
#[derive(Debug, Clone)]
pub struct EncoderCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl EncoderCommand {
    /// Build the ffmpeg segment-muxer command line
    pub fn build(params: &EncoderParams, device: &str, session_dir: &Path, session_id: &str) -> Self {
        let pattern = session_dir.join(format!(
            "{}%03d.{}",
            chunk_prefix(session_id),
            params.codec.extension()
        ));

        let mut args: Vec<OsString> = [
            "-hide_banner",
            "-nostdin",
            "-nostats",
            "-f",
            params.input_format.as_str(),
            "-i",
            device,
            "-ac",
        ]
        .iter()
        .map(OsString::from)
        .collect();
        args.push(params.channels.to_string().into());
        args.push("-ar".into());
        args.push(params.sample_rate.to_string().into());
        args.push("-c:a".into());
        args.push(params.codec.ffmpeg_codec().into());
        args.push("-f".into());
        args.push("segment".into());
        args.push("-segment_time".into());
        args.push(params.segment_duration_secs.to_string().into());
        args.push("-segment_format".into());
        args.push(params.codec.segment_format().into());
        args.push("-reset_timestamps".into());
        args.push("1".into());
        args.push("-y".into());
        args.push(pattern.into_os_string());

        Self {
            program: params.binary.clone(),
            args,
        }
    }

    /// Shell-like rendering for logs
    pub fn display(&self) -> String {
        let mut rendered = self.program.display().to_string();
        for arg in &self.args {
            rendered.push(' ');
            let arg = arg.to_string_lossy();
            if arg.contains(char::is_whitespace) {
                rendered.push('\'');
                rendered.push_str(&arg);
                rendered.push('\'');
            } else {
                rendered.push_str(&arg);
            }
        }
        rendered
    }
}

/// Locate the encoder binary: explicit paths must exist, bare names are
/// searched on `PATH`.
pub fn locate_binary(binary: &Path) -> RecorderResult<PathBuf> {
    if binary.components().count() > 1 || binary.is_absolute() {
        if binary.is_file() {
            return Ok(binary.to_path_buf());
        }
        return Err(RecorderError::dependency(format!(
            "encoder binary not found: {}",
            binary.display()
        )));
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            RecorderError::dependency(format!(
                "encoder binary {} not found on PATH; please install it",
                binary.display()
            ))
        })
}

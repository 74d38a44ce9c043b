//! Capture device resolution and disk-space queries.
//!
//! Device enumeration is an external collaborator: the recorder only needs a
//! device identifier for the encoder's `-i` argument.

use serde::Serialize;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{RecorderError, RecorderResult};

/// What the caller asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRequest {
    /// Pick the best available monitor source, else the first source
    Auto,
    /// Use this identifier as-is
    Named(String),
}

impl DeviceRequest {
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("auto") {
            DeviceRequest::Auto
        } else {
            DeviceRequest::Named(value.to_string())
        }
    }
}

/// A capture source as reported by the sound server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    /// RUNNING, SUSPENDED, IDLE...
    pub status: String,
}

impl DeviceInfo {
    pub fn is_monitor(&self) -> bool {
        self.name.to_lowercase().contains("monitor")
    }
}

/// Resolves a device request to an identifier the encoder understands
#[async_trait::async_trait]
pub trait DeviceResolver: Send + Sync {
    async fn list(&self) -> RecorderResult<Vec<DeviceInfo>>;

    async fn resolve(&self, request: &DeviceRequest) -> RecorderResult<String> {
        match request {
            DeviceRequest::Named(name) => Ok(name.clone()),
            DeviceRequest::Auto => {
                let devices = self.list().await?;
                let device = pick_default(&devices).ok_or(RecorderError::NoDeviceFound)?;
                info!(device = %device.name, status = %device.status, "Selected capture device");
                Ok(device.name.clone())
            }
        }
    }
}

/// Prefer a running monitor, then any monitor, then the first source
pub fn pick_default(devices: &[DeviceInfo]) -> Option<&DeviceInfo> {
    devices
        .iter()
        .find(|d| d.is_monitor() && d.status == "RUNNING")
        .or_else(|| devices.iter().find(|d| d.is_monitor()))
        .or_else(|| devices.first())
}

/// PulseAudio / PipeWire-pulse sources via `pactl list short sources`
#[derive(Debug, Default, Clone)]
pub struct PulseDeviceResolver;

#[async_trait::async_trait]
impl DeviceResolver for PulseDeviceResolver {
    async fn list(&self) -> RecorderResult<Vec<DeviceInfo>> {
        let output = Command::new("pactl")
            .args(["list", "short", "sources"])
            .output()
            .await
            .map_err(|e| RecorderError::dependency(format!("failed to run pactl: {e}")))?;

        if !output.status.success() {
            return Err(RecorderError::dependency(format!(
                "pactl exited with {}",
                output.status
            )));
        }

        let devices = parse_pactl_sources(&String::from_utf8_lossy(&output.stdout));
        debug!(count = devices.len(), "Listed pulse sources");
        Ok(devices)
    }
}

/// Parse tab-separated `pactl list short sources` output
pub fn parse_pactl_sources(stdout: &str) -> Vec<DeviceInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() < 5 {
                return None;
            }
            Some(DeviceInfo {
                id: parts[0].to_string(),
                name: parts[1].to_string(),
                status: parts[4].trim().to_string(),
            })
        })
        .collect()
}

/// Always resolves to a fixed device list; explicit device setups and tests
#[derive(Debug, Clone, Default)]
pub struct FixedDeviceResolver {
    devices: Vec<DeviceInfo>,
}

impl FixedDeviceResolver {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self { devices }
    }

    pub fn single(name: impl Into<String>) -> Self {
        Self::new(vec![DeviceInfo {
            id: "0".to_string(),
            name: name.into(),
            status: "RUNNING".to_string(),
        }])
    }
}

#[async_trait::async_trait]
impl DeviceResolver for FixedDeviceResolver {
    async fn list(&self) -> RecorderResult<Vec<DeviceInfo>> {
        Ok(self.devices.clone())
    }
}

/// Free bytes available to unprivileged users on the filesystem holding `path`
#[cfg(unix)]
pub fn free_bytes(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
pub fn free_bytes(_path: &Path) -> Option<u64> {
    None
}

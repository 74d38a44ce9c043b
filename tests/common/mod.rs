// Shared helpers for controller tests: a fake ffmpeg that mimics the
// segment muxer closely enough for the chunk tracker.
//
// The fake reads `-segment_time`, `-i` and the trailing output pattern,
// appends a few bytes to the current segment every 100ms, and exits 0 on
// SIGTERM. The `-i` value selects a behaviour:
//   crash     exits 3 after ~0.5s with an error line
//   nospace   starts printing "No space left on device" after ~0.5s
//   stubborn  ignores SIGTERM

#![allow(dead_code)]

use echolog::device::{DeviceRequest, FixedDeviceResolver};
use echolog::session::SupervisorSettings;
use echolog::{SessionConfig, SessionController};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tempfile::TempDir;

const FAKE_FFMPEG: &str = r#"#!/bin/sh
seg=300
out=""
dev=""
prev=""
for a in "$@"; do
  case "$prev" in
    -segment_time) seg="$a" ;;
    -i) dev="$a" ;;
  esac
  prev="$a"
  out="$a"
done

if [ "$dev" = "stubborn" ]; then
  trap '' TERM
else
  trap 'exit 0' TERM INT
fi

echo "Input #0, pulse, from '$dev':" >&2
ticks=$((seg * 10))
i=0
while :; do
  case "$dev" in
    crash)
      if [ "$i" -ge 5 ]; then
        echo "Error: capture device vanished" >&2
        exit 3
      fi
      ;;
    nospace)
      if [ "$i" -ge 5 ]; then
        echo "av_interleaved_write_frame(): No space left on device" >&2
      fi
      ;;
  esac
  file=$(printf "$out" $((i / ticks)))
  printf 'xxxxxxxxxxxxxxxx' >> "$file"
  i=$((i + 1))
  sleep 0.1
done
"#;

/// Path to the fake encoder, written once per test binary
pub fn fake_encoder() -> &'static Path {
    static FAKE: OnceLock<(TempDir, PathBuf)> = OnceLock::new();
    let (_, path) = FAKE.get_or_init(|| {
        let dir = TempDir::new().expect("temp dir for fake encoder");
        let path = dir.path().join("ffmpeg");
        fs::write(&path, FAKE_FFMPEG).expect("write fake encoder");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .expect("chmod fake encoder");
        (dir, path)
    });
    path
}

pub fn controller() -> SessionController {
    SessionController::new(Arc::new(FixedDeviceResolver::single("fake")))
}

/// Fast-polling config pointed at the fake encoder
pub fn session_config(root: &Path, name: &str, segment_secs: u64) -> SessionConfig {
    let mut config = SessionConfig::new(name, root);
    config.device = DeviceRequest::Named("fake".to_string());
    config.encoder.binary = fake_encoder().to_path_buf();
    config.encoder.segment_duration_secs = segment_secs;
    config.supervisor = SupervisorSettings {
        grace_period: Duration::from_secs(2),
        poll_interval: Duration::from_millis(100),
        stability_window: Duration::from_millis(200),
        stall_timeout: Duration::from_secs(5),
    };
    config
}

pub fn read_log(session_dir: &Path) -> String {
    fs::read_to_string(session_dir.join(echolog::logging::LOG_FILE_NAME)).unwrap_or_default()
}

pub fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path).map(|mut d| d.next().is_none()).unwrap_or(true)
}

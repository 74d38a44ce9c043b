use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

use crate::logging::{Level, LogEvent, SessionLogger};
use crate::session::StopReason;

const DISK_EXHAUSTION_PATTERNS: &[&str] = &[
    "no space left on device",
    "enospc",
    "disk quota exceeded",
];

/// Level for one encoder stderr line.
///
/// Lines mentioning errors or warnings are surfaced; everything else goes to
/// `unmatched` (debug by default) to keep normal verbosity quiet.
pub fn classify(line: &str, unmatched: Level) -> Level {
    let lower = line.to_lowercase();
    if lower.contains("error") || indicates_disk_exhaustion(&lower) {
        Level::Error
    } else if lower.contains("warn") {
        Level::Warning
    } else {
        unmatched
    }
}

pub fn indicates_disk_exhaustion(line: &str) -> bool {
    let lower = line.to_lowercase();
    DISK_EXHAUSTION_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Forward encoder stderr into the session log until EOF.
///
/// Carriage returns are treated as line breaks. A disk exhaustion line asks
/// the controller for a graceful `disk_full` stop (once). Returns the number
/// of lines read.
pub async fn stream_stderr<R>(
    reader: R,
    logger: SessionLogger,
    unmatched: Level,
    stop_tx: mpsc::UnboundedSender<StopReason>,
) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    let mut count = 0u64;
    let mut disk_full_reported = false;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                logger.emit(LogEvent::warning("stderr reader failed").field("error", e));
                break;
            }
        }

        let text = String::from_utf8_lossy(&buf);
        for line in text.split(['\r', '\n']).map(str::trim).filter(|l| !l.is_empty()) {
            count += 1;
            let level = classify(line, unmatched);
            logger.emit(LogEvent::new(level, format!("ffmpeg {line}")));

            if !disk_full_reported && indicates_disk_exhaustion(line) {
                disk_full_reported = true;
                logger.emit(LogEvent::error("disk_exhausted").field("source", "encoder_output"));
                let _ = stop_tx.send(StopReason::DiskFull);
            }
        }
    }

    debug!(lines = count, "Encoder stderr closed");
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogSettings, LOG_FILE_NAME};
    use tempfile::TempDir;

    #[test]
    fn classification_vocabulary() {
        assert_eq!(classify("Error opening input", Level::Debug), Level::Error);
        assert_eq!(classify("[pulse] WARNING: underrun", Level::Debug), Level::Warning);
        assert_eq!(classify("Stream #0:0: Audio: flac", Level::Debug), Level::Debug);
        assert_eq!(classify("Stream #0:0: Audio: flac", Level::Info), Level::Info);
        assert_eq!(
            classify("av_interleaved_write_frame(): No space left on device", Level::Debug),
            Level::Error
        );
    }

    #[tokio::test]
    async fn forwards_lines_and_requests_stop_on_disk_exhaustion() {
        let dir = TempDir::new().unwrap();
        let settings = LogSettings {
            level: Level::Debug,
            ..LogSettings::default()
        };
        let logger = SessionLogger::open(dir.path(), "encoder", &settings).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let input: &[u8] = b"Input #0, pulse\nsize=1kB\rsize=2kB\nwrite error: No space left on device\nENOSPC again\n";
        let lines = stream_stderr(input, logger.clone(), Level::Debug, tx).await;
        logger.flush();

        assert_eq!(lines, 5);
        assert_eq!(rx.recv().await, Some(StopReason::DiskFull));
        assert!(rx.try_recv().is_err(), "disk_full must be requested once");

        let log = std::fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
        assert!(log.contains("DEBUG encoder: ffmpeg size=2kB"));
        assert!(log.contains("ERROR encoder: ffmpeg write error: No space left on device"));
        assert_eq!(log.matches("disk_exhausted").count(), 1);
    }
}

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use super::encoder::{parse_chunk_sequence, Codec};
use crate::logging::{LogEvent, SessionLogger};
use crate::recording::ExitRecord;
use crate::session::StopReason;

/// Chunk tracker configuration
#[derive(Debug, Clone)]
pub struct ChunkTrackerConfig {
    /// Session id; the only input used to match file names
    pub session_id: String,
    /// Directory the encoder writes into
    pub session_dir: PathBuf,
    pub codec: Codec,
    pub poll_interval: Duration,
    /// Size must be unchanged this long before a chunk may be finalized
    pub stability_window: Duration,
    /// Zero disables stall detection
    pub stall_timeout: Duration,
}

/// One segment file produced by the encoder
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    /// Zero-based, matches the encoder's `%03d` numbering
    pub sequence: u32,
    pub file_path: PathBuf,
    /// When the file was first observed
    pub created_at: DateTime<Utc>,
    /// When the file last grew before it was finalized; None while open
    pub finalized_at: Option<DateTime<Utc>>,
    /// None while open
    pub size_bytes: Option<u64>,
}

impl Chunk {
    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }

    /// Observed wall-clock span; accurate to about one poll interval
    pub fn duration_secs(&self) -> Option<f64> {
        self.finalized_at
            .map(|end| (end - self.created_at).num_milliseconds().max(0) as f64 / 1000.0)
    }
}

/// Progress published for status surfaces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkProgress {
    pub chunk_count: usize,
    pub finalized_count: usize,
    /// Highest admitted sequence still open
    pub current: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct Growth {
    size: u64,
    changed_at: Instant,
    changed_wall: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct PendingStop {
    /// Last chunk allowed to complete; None if nothing was open when flagged
    last_admitted: Option<u32>,
}

/// Reconciles the encoder's segment files with session bookkeeping.
///
/// The encoder decides when a segment closes, so finalization is inferred by
/// polling: a chunk is finalized once its size has been stable for the
/// stability window and either a newer chunk exists or the encoder has
/// exited. This is best-effort by nature; the last chunk is always finalized
/// at stop with whatever size is on disk.
pub struct ChunkTracker {
    config: ChunkTrackerConfig,
    logger: SessionLogger,
    chunks: BTreeMap<u32, Chunk>,
    growth: BTreeMap<u32, Growth>,
    last_sequence: Option<u32>,
    pending_stop: Option<PendingStop>,
    /// Files the encoder opened after an end_segment flag
    overflow: BTreeMap<u32, PathBuf>,
    stop_requested: bool,
    stall_reported: bool,
    progress_tx: watch::Sender<ChunkProgress>,
}

impl ChunkTracker {
    pub fn new(config: ChunkTrackerConfig, logger: SessionLogger) -> Self {
        let (progress_tx, _) = watch::channel(ChunkProgress::default());
        Self {
            config,
            logger,
            chunks: BTreeMap::new(),
            growth: BTreeMap::new(),
            last_sequence: None,
            pending_stop: None,
            overflow: BTreeMap::new(),
            stop_requested: false,
            stall_reported: false,
            progress_tx,
        }
    }

    pub fn progress(&self) -> watch::Receiver<ChunkProgress> {
        self.progress_tx.subscribe()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    /// One polling pass. Returns a stop request when one is due.
    pub fn poll(
        &mut self,
        now: Instant,
        wall: DateTime<Utc>,
        encoder_exited: bool,
    ) -> Option<StopReason> {
        self.scan(now, wall);
        self.finalize_ready(now, encoder_exited);

        let mut request = self.check_boundary();
        if request.is_none() && !encoder_exited {
            request = self.check_stall(now);
        }
        self.publish_progress();
        request
    }

    /// End-segment limit reached: the chunk open right now is the last one
    /// admitted. Returns a stop request if nothing is left to wait for.
    pub fn flag_limit(
        &mut self,
        now: Instant,
        wall: DateTime<Utc>,
        encoder_exited: bool,
    ) -> Option<StopReason> {
        if self.pending_stop.is_some() {
            return None;
        }
        // Pick up a segment the encoder opened since the last tick
        self.scan(now, wall);

        let last_admitted = self.last_sequence;
        self.pending_stop = Some(PendingStop { last_admitted });
        let mut event = LogEvent::info("limit_pending");
        if let Some(seq) = last_admitted {
            event = event.field("sequence", seq);
        }
        self.logger.emit(event);

        self.finalize_ready(now, encoder_exited);
        let request = self.check_boundary();
        self.publish_progress();
        request
    }

    /// Final reconciliation at stop: admit what is on disk, finalize every
    /// open chunk with its current size, discard post-boundary files.
    pub fn finish(&mut self, now: Instant, wall: DateTime<Utc>) -> Vec<Chunk> {
        self.scan(now, wall);

        let open: Vec<u32> = self
            .chunks
            .values()
            .filter(|c| !c.is_finalized())
            .map(|c| c.sequence)
            .collect();
        for seq in open {
            let path = self.chunks[&seq].file_path.clone();
            let size = match fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(e) => {
                    self.logger.emit(
                        LogEvent::warning("chunk_missing")
                            .field("file", path.display())
                            .field("error", e),
                    );
                    self.growth.get(&seq).map(|g| g.size).unwrap_or(0)
                }
            };
            let end = self
                .growth
                .get(&seq)
                .map(|g| g.changed_wall)
                .unwrap_or(wall);
            self.finalize(seq, size, end);
        }

        for (seq, path) in std::mem::take(&mut self.overflow) {
            let mut event = LogEvent::info("chunk_discarded")
                .field("file", path.display())
                .field("sequence", seq)
                .field("reason", "end_segment");
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    event = event.field("error", e);
                }
            }
            self.logger.emit(event);
        }

        self.publish_progress();
        self.chunks.values().cloned().collect()
    }

    /// Background polling activity. Returns the tracker so the controller can
    /// run `finish` after the encoder is gone.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut limit_rx: watch::Receiver<Option<DateTime<Utc>>>,
        exit_rx: watch::Receiver<Option<ExitRecord>>,
        stop_tx: mpsc::UnboundedSender<StopReason>,
    ) -> Self {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut limit_armed = true;

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = limit_rx.changed(), if limit_armed => {
                    if changed.is_err() {
                        limit_armed = false;
                        continue;
                    }
                    let flagged = *limit_rx.borrow_and_update();
                    if flagged.is_some() {
                        let exited = exit_rx.borrow().is_some();
                        if let Some(reason) = self.flag_limit(Instant::now(), Utc::now(), exited) {
                            let _ = stop_tx.send(reason);
                        }
                    }
                }
                _ = ticker.tick() => {
                    let exited = exit_rx.borrow().is_some();
                    if let Some(reason) = self.poll(Instant::now(), Utc::now(), exited) {
                        let _ = stop_tx.send(reason);
                    }
                }
            }
        }

        debug!(chunks = self.chunks.len(), "Chunk poller stopped");
        self
    }

    fn scan(&mut self, now: Instant, wall: DateTime<Utc>) {
        let entries = match fs::read_dir(&self.config.session_dir) {
            Ok(entries) => entries,
            Err(e) => {
                self.logger.emit(
                    LogEvent::warning("chunk_scan_failed")
                        .field("dir", self.config.session_dir.display())
                        .field("error", e),
                );
                return;
            }
        };

        let mut found: Vec<(u32, PathBuf, u64)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let seq = parse_chunk_sequence(
                    &name.to_string_lossy(),
                    &self.config.session_id,
                    self.config.codec,
                )?;
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                Some((seq, entry.path(), size))
            })
            .collect();
        found.sort_by_key(|(seq, _, _)| *seq);

        for (seq, path, size) in found {
            if self.chunks.contains_key(&seq) {
                if let Some(growth) = self.growth.get_mut(&seq) {
                    if growth.size != size {
                        growth.size = size;
                        growth.changed_at = now;
                        growth.changed_wall = wall;
                    }
                }
                continue;
            }
            if self.overflow.contains_key(&seq) {
                continue;
            }
            if let Some(pending) = self.pending_stop {
                if pending.last_admitted.map_or(true, |last| seq > last) {
                    self.logger.emit(
                        LogEvent::debug("chunk_after_limit")
                            .field("file", path.display())
                            .field("sequence", seq),
                    );
                    self.overflow.insert(seq, path);
                    continue;
                }
            }
            self.admit(seq, path, size, now, wall);
        }
    }

    fn admit(&mut self, seq: u32, path: PathBuf, size: u64, now: Instant, wall: DateTime<Utc>) {
        if let Some(last) = self.last_sequence {
            if seq != last + 1 {
                self.logger.emit(
                    LogEvent::warning("chunk_sequence_gap")
                        .field("expected", last + 1)
                        .field("found", seq),
                );
            }
        }

        self.logger.emit(
            LogEvent::info("chunk_detected")
                .field("file", file_name(&path))
                .field("sequence", seq)
                .field("size", size),
        );

        self.chunks.insert(
            seq,
            Chunk {
                sequence: seq,
                file_path: path,
                created_at: wall,
                finalized_at: None,
                size_bytes: None,
            },
        );
        self.growth.insert(
            seq,
            Growth {
                size,
                changed_at: now,
                changed_wall: wall,
            },
        );
        self.last_sequence = Some(self.last_sequence.map_or(seq, |last| last.max(seq)));
    }

    fn finalize_ready(&mut self, now: Instant, encoder_exited: bool) {
        let newest = self
            .chunks
            .keys()
            .chain(self.overflow.keys())
            .copied()
            .max();

        let ready: Vec<(u32, u64, DateTime<Utc>)> = self
            .chunks
            .values()
            .filter(|c| !c.is_finalized())
            .filter_map(|c| {
                let growth = self.growth.get(&c.sequence)?;
                let superseded = newest.map_or(false, |n| n > c.sequence);
                let stable = now.saturating_duration_since(growth.changed_at)
                    >= self.config.stability_window;
                ((superseded || encoder_exited) && stable)
                    .then_some((c.sequence, growth.size, growth.changed_wall))
            })
            .collect();

        for (seq, size, end) in ready {
            self.finalize(seq, size, end);
        }
    }

    fn finalize(&mut self, seq: u32, size: u64, end: DateTime<Utc>) {
        let Some(chunk) = self.chunks.get_mut(&seq) else {
            return;
        };
        let end = end.max(chunk.created_at);
        chunk.finalized_at = Some(end);
        chunk.size_bytes = Some(size);
        self.growth.remove(&seq);

        let chunk = &self.chunks[&seq];
        self.logger.emit(
            LogEvent::info("chunk_created")
                .field("file", chunk.file_name())
                .field("sequence", seq)
                .field("start", chunk.created_at.to_rfc3339())
                .field("end", end.to_rfc3339())
                .field("size", size)
                .field("duration_s", format!("{:.1}", chunk.duration_secs().unwrap_or(0.0))),
        );
    }

    fn check_boundary(&mut self) -> Option<StopReason> {
        if self.stop_requested {
            return None;
        }
        let pending = self.pending_stop?;
        let done = match pending.last_admitted {
            None => true,
            Some(seq) => self.chunks.get(&seq).map_or(true, Chunk::is_finalized),
        };
        if !done {
            return None;
        }

        self.stop_requested = true;
        let mut event = LogEvent::info("limit_boundary_reached");
        if let Some(seq) = pending.last_admitted {
            event = event.field("sequence", seq);
        }
        self.logger.emit(event);
        Some(StopReason::TimeLimit)
    }

    fn check_stall(&mut self, now: Instant) -> Option<StopReason> {
        if self.stall_reported || self.config.stall_timeout.is_zero() {
            return None;
        }
        let (seq, growth) = self.growth.iter().next_back()?;
        let idle = now.saturating_duration_since(growth.changed_at);
        if idle < self.config.stall_timeout {
            return None;
        }

        self.stall_reported = true;
        self.logger.emit(
            LogEvent::error("chunk_write_stall")
                .field("sequence", *seq)
                .field("size", growth.size)
                .field("idle_s", idle.as_secs()),
        );
        Some(StopReason::DiskFull)
    }

    fn publish_progress(&self) {
        let progress = ChunkProgress {
            chunk_count: self.chunks.len(),
            finalized_count: self.chunks.values().filter(|c| c.is_finalized()).count(),
            current: self
                .chunks
                .values()
                .rev()
                .find(|c| !c.is_finalized())
                .map(|c| c.sequence),
        };
        self.progress_tx.send_if_modified(|current| {
            if *current == progress {
                false
            } else {
                *current = progress;
                true
            }
        });
    }
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::encoder::chunk_file_name;
    use crate::logging::{LogSettings, LOG_FILE_NAME};
    use tempfile::TempDir;

    const ID: &str = "my_meeting_notes_20260111_101010";

    fn tracker(dir: &TempDir) -> ChunkTracker {
        let logger = SessionLogger::open(dir.path(), "chunks", &LogSettings::default()).unwrap();
        ChunkTracker::new(
            ChunkTrackerConfig {
                session_id: ID.to_string(),
                session_dir: dir.path().to_path_buf(),
                codec: Codec::Flac,
                poll_interval: Duration::from_millis(100),
                stability_window: Duration::from_millis(100),
                stall_timeout: Duration::from_secs(5),
            },
            logger,
        )
    }

    fn write_chunk(dir: &TempDir, seq: u32, bytes: usize) -> PathBuf {
        let path = dir.path().join(chunk_file_name(ID, seq, Codec::Flac));
        fs::write(&path, vec![b'a'; bytes]).unwrap();
        path
    }

    #[test]
    fn finalizes_previous_chunk_once_superseded_and_stable() {
        let dir = TempDir::new().unwrap();
        let mut tracker = tracker(&dir);
        let t0 = Instant::now();
        let wall = Utc::now();

        write_chunk(&dir, 0, 10);
        assert_eq!(tracker.poll(t0, wall, false), None);
        assert_eq!(tracker.chunks().count(), 1);

        write_chunk(&dir, 0, 20);
        write_chunk(&dir, 1, 5);
        tracker.poll(t0 + Duration::from_millis(50), wall, false);
        assert!(!tracker.chunks[&0].is_finalized(), "size just changed");

        tracker.poll(t0 + Duration::from_millis(200), wall, false);
        assert_eq!(tracker.chunks[&0].size_bytes, Some(20));
        assert!(!tracker.chunks[&1].is_finalized(), "newest chunk stays open");
        assert_eq!(*tracker.progress().borrow(), ChunkProgress {
            chunk_count: 2,
            finalized_count: 1,
            current: Some(1),
        });
    }

    #[test]
    fn ignores_files_from_other_sessions() {
        let dir = TempDir::new().unwrap();
        let mut tracker = tracker(&dir);
        write_chunk(&dir, 0, 1);
        fs::write(dir.path().join("my_20260111_101010_chunk_000.flac"), b"x").unwrap();
        fs::write(dir.path().join("other_20260111_000000_chunk_001.flac"), b"x").unwrap();
        fs::write(dir.path().join(LOG_FILE_NAME), b"").unwrap();

        tracker.poll(Instant::now(), Utc::now(), false);
        let seqs: Vec<u32> = tracker.chunks().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![0]);
    }

    #[test]
    fn finish_keeps_short_final_chunk() {
        let dir = TempDir::new().unwrap();
        let mut tracker = tracker(&dir);
        let t0 = Instant::now();
        write_chunk(&dir, 0, 100);
        tracker.poll(t0, Utc::now(), false);
        write_chunk(&dir, 1, 3);

        let chunks = tracker.finish(t0 + Duration::from_millis(10), Utc::now());
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(Chunk::is_finalized));
        assert_eq!(chunks[1].size_bytes, Some(3));
        assert!(chunks[1].file_path.exists());
    }

    #[test]
    fn end_segment_flag_waits_for_open_chunk_and_discards_later_files() {
        let dir = TempDir::new().unwrap();
        let mut tracker = tracker(&dir);
        let t0 = Instant::now();
        let wall = Utc::now();

        write_chunk(&dir, 0, 10);
        tracker.poll(t0, wall, false);
        write_chunk(&dir, 1, 10);
        tracker.poll(t0 + Duration::from_millis(200), wall, false);
        assert!(tracker.chunks[&0].is_finalized());

        // Limit hits while chunk 1 is open
        assert_eq!(tracker.flag_limit(t0 + Duration::from_millis(250), wall, false), None);

        let late = write_chunk(&dir, 2, 1);
        assert_eq!(tracker.poll(t0 + Duration::from_millis(260), wall, false), None);
        assert_eq!(
            tracker.poll(t0 + Duration::from_millis(500), wall, false),
            Some(StopReason::TimeLimit)
        );
        // Requested once
        assert_eq!(tracker.poll(t0 + Duration::from_millis(600), wall, false), None);

        let chunks = tracker.finish(t0 + Duration::from_millis(700), wall);
        let seqs: Vec<u32> = chunks.iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![0, 1]);
        assert!(!late.exists());
    }

    #[test]
    fn flag_without_open_chunk_stops_immediately() {
        let dir = TempDir::new().unwrap();
        let mut tracker = tracker(&dir);
        assert_eq!(
            tracker.flag_limit(Instant::now(), Utc::now(), false),
            Some(StopReason::TimeLimit)
        );
    }

    #[test]
    fn stalled_chunk_requests_disk_full_stop() {
        let dir = TempDir::new().unwrap();
        let mut tracker = tracker(&dir);
        let t0 = Instant::now();
        write_chunk(&dir, 0, 10);
        tracker.poll(t0, Utc::now(), false);

        assert_eq!(tracker.poll(t0 + Duration::from_secs(4), Utc::now(), false), None);
        assert_eq!(
            tracker.poll(t0 + Duration::from_secs(6), Utc::now(), false),
            Some(StopReason::DiskFull)
        );
        assert_eq!(tracker.poll(t0 + Duration::from_secs(7), Utc::now(), false), None);
    }

    #[test]
    fn sequence_gap_is_logged() {
        let dir = TempDir::new().unwrap();
        let mut tracker = tracker(&dir);
        write_chunk(&dir, 0, 1);
        tracker.poll(Instant::now(), Utc::now(), false);
        write_chunk(&dir, 2, 1);
        tracker.poll(Instant::now(), Utc::now(), false);
        tracker.logger.flush();

        let log = fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
        assert!(log.contains("chunk_sequence_gap expected=1 found=2"), "{log}");
    }
}

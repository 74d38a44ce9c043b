use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::config::{make_session_id, SessionConfig};
use super::limit::{LimitEnforcer, LimitPlan};
use super::stats::{SessionSnapshot, SessionState, SessionSummary, StopReason};
use crate::audio::{
    locate_binary, Chunk, ChunkProgress, ChunkTracker, ChunkTrackerConfig, EncoderCommand,
};
use crate::device::{free_bytes, DeviceResolver};
use crate::error::{RecorderError, RecorderResult};
use crate::logging::{LogEvent, SessionLogger};
use crate::recording::{ExitRecord, ProcessSupervisor, Termination};

/// Create a fresh directory for the session, suffixing `_2`, `_3`, ... when
/// an earlier session with the same name started in the same second. An
/// existing directory is never reused.
fn create_session_dir(output_dir: &Path, base_id: &str) -> RecorderResult<(String, PathBuf)> {
    let unwritable = |path: &Path, e: std::io::Error| {
        RecorderError::config(format!(
            "output directory {} is not writable: {e}",
            path.display()
        ))
    };
    std::fs::create_dir_all(output_dir).map_err(|e| unwritable(output_dir, e))?;

    for n in 1u32.. {
        let session_id = match n {
            1 => base_id.to_string(),
            n => format!("{base_id}_{n}"),
        };
        let session_dir = output_dir.join(&session_id);
        match std::fs::create_dir(&session_dir) {
            Ok(()) => return Ok((session_id, session_dir)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(unwritable(&session_dir, e)),
        }
    }
    Err(RecorderError::config(format!(
        "no free session directory for {base_id} in {}",
        output_dir.display()
    )))
}

/// Owns at most one active recording session.
///
/// `start` returns once the encoder is running; everything after that is
/// driven by background activities that talk to the session through
/// channels. Any of them (or the caller, or a signal handler) can end the
/// session; `stop` is idempotent and the first reason wins.
pub struct SessionController {
    resolver: Arc<dyn DeviceResolver>,
    slot: Arc<Mutex<Slot>>,
}

#[derive(Default)]
struct Slot {
    starting: bool,
    launch_failed: bool,
    session: Option<Arc<ActiveSession>>,
}

impl SessionController {
    pub fn new(resolver: Arc<dyn DeviceResolver>) -> Self {
        Self {
            resolver,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Validate, open the session log, launch the encoder and start the
    /// background activities. Does not wait for the recording.
    pub async fn start(&self, config: SessionConfig) -> RecorderResult<SessionHandle> {
        config.validate()?;
        let reservation = self.reserve()?;

        let binary = locate_binary(&config.encoder.binary)?;
        let device = match self.resolver.resolve(&config.device).await {
            Ok(device) => device,
            Err(RecorderError::NoDeviceFound) => {
                return Err(RecorderError::dependency("no audio capture device found"))
            }
            Err(e) => return Err(e),
        };

        let started_at = Utc::now();
        let (session_id, session_dir) = create_session_dir(
            &config.output_dir,
            &make_session_id(&config.session_name, started_at),
        )?;

        let logger = SessionLogger::open_or_detached(&session_dir, "session", &config.logging);
        let mut encoder = config.encoder.clone();
        encoder.binary = binary;
        let command = EncoderCommand::build(&encoder, &device, &session_dir, &session_id);

        let mut event = LogEvent::info("session_start")
            .field("session_id", &session_id)
            .field("name", &config.session_name)
            .field("device", &device)
            .field("sample_rate", encoder.sample_rate)
            .field("channels", encoder.channels)
            .field("codec", encoder.codec)
            .field("segment_s", encoder.segment_duration_secs)
            .field("output_dir", session_dir.display())
            .field("time_limit_s", config.time_limit.limit_secs)
            .field("boundary", config.time_limit.boundary);
        for (key, value) in &config.overrides {
            event = event.field(format!("override.{key}"), value);
        }
        logger.emit(event.field("cmd", command.display()));

        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let supervisor = match ProcessSupervisor::launch(
            &command,
            &logger,
            config.logging.encoder_output_level,
            stop_tx.clone(),
        ) {
            Ok(supervisor) => supervisor,
            Err(e) => {
                logger.emit(LogEvent::error("launch_failed").field("error", &e));
                logger.flush();
                reservation.fail();
                return Err(e);
            }
        };

        let started = Instant::now();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (limit_tx, limit_rx) = watch::channel(None);
        let exit_rx = supervisor.exit_watch();

        let tracker = ChunkTracker::new(
            ChunkTrackerConfig {
                session_id: session_id.clone(),
                session_dir: session_dir.clone(),
                codec: encoder.codec,
                poll_interval: config.supervisor.poll_interval,
                stability_window: config.supervisor.stability_window,
                stall_timeout: config.supervisor.stall_timeout,
            },
            logger.scoped("chunks"),
        );
        let progress_rx = tracker.progress();
        let tracker = tokio::spawn(tracker.run(
            shutdown_rx.clone(),
            limit_rx,
            exit_rx.clone(),
            stop_tx.clone(),
        ));

        let enforcer = LimitPlan::for_policy(&config.time_limit).map(|plan| {
            let enforcer =
                LimitEnforcer::new(plan, logger.scoped("limit"), stop_tx.clone(), limit_tx);
            tokio::spawn(enforcer.run(started, shutdown_rx.clone()))
        });

        let (state_tx, _) = watch::channel(SessionState::Recording);
        let session = Arc::new(ActiveSession {
            session_id: session_id.clone(),
            session_name: config.session_name.clone(),
            device,
            session_dir,
            started_at,
            started,
            pid: supervisor.pid(),
            config,
            logger,
            stop_tx,
            shutdown_tx,
            state_tx,
            progress_rx,
            runtime: Mutex::new(Some(Runtime {
                supervisor,
                tracker,
                enforcer,
            })),
            summary: OnceCell::new(),
        });

        tokio::spawn(watchdog(Arc::clone(&session), stop_rx, exit_rx, shutdown_rx));
        reservation.commit(Arc::clone(&session));

        info!(session_id = %session_id, pid = session.pid, "Recording started");
        Ok(SessionHandle { session })
    }

    /// Stop the current session, or return its summary if it already ended
    pub async fn stop(&self, reason: StopReason) -> RecorderResult<SessionSummary> {
        let session = self.current().ok_or(RecorderError::NotRecording)?;
        Ok(session.stop(reason).await)
    }

    /// Resolves once the current session reaches a terminal state
    pub async fn wait(&self) -> RecorderResult<SessionSummary> {
        let session = self.current().ok_or(RecorderError::NotRecording)?;
        Ok(session.wait().await)
    }

    pub fn status(&self) -> SessionSnapshot {
        let Ok(slot) = self.slot.lock() else {
            return SessionSnapshot::idle(SessionState::Errored);
        };
        if slot.starting {
            return SessionSnapshot::idle(SessionState::Starting);
        }
        match &slot.session {
            Some(session) => session.snapshot(),
            None if slot.launch_failed => SessionSnapshot::idle(SessionState::Errored),
            None => SessionSnapshot::idle(SessionState::Idle),
        }
    }

    pub fn stop_handle(&self) -> Option<StopHandle> {
        self.current().map(|session| session.stop_handle())
    }

    fn current(&self) -> Option<Arc<ActiveSession>> {
        self.slot.lock().ok().and_then(|slot| slot.session.clone())
    }

    fn reserve(&self) -> RecorderResult<StartReservation> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| RecorderError::subprocess("controller state poisoned"))?;
        if slot.starting {
            return Err(RecorderError::AlreadyRecording {
                session_id: "<starting>".to_string(),
            });
        }
        if let Some(session) = &slot.session {
            if session.state().is_active() {
                return Err(RecorderError::AlreadyRecording {
                    session_id: session.session_id.clone(),
                });
            }
        }
        slot.starting = true;
        Ok(StartReservation {
            slot: Arc::clone(&self.slot),
            launch_failed: false,
        })
    }
}

/// Holds the controller's single session slot while `start` runs.
/// Dropping it without `commit` leaves the previous session in place.
struct StartReservation {
    slot: Arc<Mutex<Slot>>,
    launch_failed: bool,
}

impl StartReservation {
    fn fail(mut self) {
        self.launch_failed = true;
    }

    fn commit(self, session: Arc<ActiveSession>) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.session = Some(session);
            slot.launch_failed = false;
        }
    }
}

impl Drop for StartReservation {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.starting = false;
            if self.launch_failed {
                slot.launch_failed = true;
                slot.session = None;
            }
        }
    }
}

/// Caller's handle on a started session
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<ActiveSession>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub fn session_dir(&self) -> &Path {
        &self.session.session_dir
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.session.logger.path()
    }

    pub fn pid(&self) -> u32 {
        self.session.pid
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn status(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    pub async fn stop(&self, reason: StopReason) -> SessionSummary {
        self.session.stop(reason).await
    }

    pub async fn wait(&self) -> SessionSummary {
        self.session.wait().await
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.session.stop_handle()
    }
}

/// Non-blocking stop request; safe to use from signal handlers
#[derive(Debug, Clone)]
pub struct StopHandle {
    stop_tx: mpsc::UnboundedSender<StopReason>,
}

impl StopHandle {
    /// Returns false if the session is already gone
    pub fn request_stop(&self, reason: StopReason) -> bool {
        self.stop_tx.send(reason).is_ok()
    }
}

struct Runtime {
    supervisor: ProcessSupervisor,
    tracker: JoinHandle<ChunkTracker>,
    enforcer: Option<JoinHandle<()>>,
}

struct ActiveSession {
    session_id: String,
    session_name: String,
    device: String,
    session_dir: PathBuf,
    started_at: DateTime<Utc>,
    started: Instant,
    pid: u32,
    config: SessionConfig,
    logger: SessionLogger,
    stop_tx: mpsc::UnboundedSender<StopReason>,
    shutdown_tx: watch::Sender<bool>,
    state_tx: watch::Sender<SessionState>,
    progress_rx: watch::Receiver<ChunkProgress>,
    runtime: Mutex<Option<Runtime>>,
    summary: OnceCell<SessionSummary>,
}

impl ActiveSession {
    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop_tx: self.stop_tx.clone(),
        }
    }

    async fn stop(&self, reason: StopReason) -> SessionSummary {
        let summary = self
            .summary
            .get_or_init(|| self.shutdown(reason))
            .await
            .clone();
        // Terminal state only after the summary is readable
        self.state_tx.send_replace(summary.final_state);
        summary
    }

    async fn wait(&self) -> SessionSummary {
        let mut state_rx = self.state_tx.subscribe();
        let _ = state_rx.wait_for(SessionState::is_terminal).await;
        match self.summary.get() {
            Some(summary) => summary.clone(),
            None => self.stop(StopReason::UserRequest).await,
        }
    }

    async fn shutdown(&self, requested: StopReason) -> SessionSummary {
        self.state_tx.send_replace(SessionState::Stopping);
        let runtime = self.runtime.lock().ok().and_then(|mut guard| guard.take());
        let Some(Runtime {
            mut supervisor,
            tracker,
            enforcer,
        }) = runtime
        else {
            return self.summarize(requested, Vec::new(), None);
        };

        let died_on_its_own =
            supervisor.exit_status().is_some() && !supervisor.terminate_requested();
        let reason = if died_on_its_own && !requested.is_error() {
            StopReason::SubprocessExit
        } else {
            requested
        };
        self.logger.emit(
            LogEvent::info("stop_requested")
                .field("reason", reason)
                .field("requested", requested),
        );

        self.shutdown_tx.send_replace(true);
        if let Some(enforcer) = enforcer {
            if let Err(e) = enforcer.await {
                warn!(error = %e, "Time-limit scheduler panicked");
            }
        }
        let tracker = tracker.await;

        let termination = supervisor
            .terminate(self.config.supervisor.grace_period)
            .await;
        supervisor.join().await;
        if let Termination::Forced(None) = termination {
            self.logger.emit(
                LogEvent::error("terminate_unconfirmed").field("pid", supervisor.pid()),
            );
        }

        let chunks = match tracker {
            Ok(mut tracker) => tracker.finish(Instant::now(), Utc::now()),
            Err(e) => {
                error!(error = %e, "Chunk poller panicked");
                self.logger
                    .emit(LogEvent::error("chunk_tracking_lost").field("error", e));
                Vec::new()
            }
        };

        self.summarize(reason, chunks, termination.exit())
    }

    fn summarize(
        &self,
        reason: StopReason,
        chunks: Vec<Chunk>,
        exit: Option<ExitRecord>,
    ) -> SessionSummary {
        let ended_at = Utc::now();
        let duration_secs = (ended_at - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        let total_bytes = chunks.iter().filter_map(|c| c.size_bytes).sum();
        let final_state = if reason.is_error() {
            SessionState::Errored
        } else {
            SessionState::Stopped
        };

        let mut event = if reason.is_error() {
            LogEvent::error("session_stop")
        } else {
            LogEvent::info("session_stop")
        };
        event = event
            .field("reason", reason)
            .field("chunks", chunks.len())
            .field("duration", format!("{duration_secs:.1}"))
            .field("bytes", total_bytes);
        if let Some(exit) = exit {
            event = event.field("exit", exit);
        }
        self.logger.emit(event);
        self.logger.flush();

        info!(
            session_id = %self.session_id,
            reason = %reason,
            chunks = chunks.len(),
            "Recording stopped"
        );

        SessionSummary {
            session_id: self.session_id.clone(),
            session_name: self.session_name.clone(),
            reason,
            final_state,
            started_at: self.started_at,
            ended_at,
            duration_secs,
            chunks,
            total_bytes,
            exit,
            log_path: self.logger.path().map(Path::to_path_buf),
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let state = self.state();
        let progress = *self.progress_rx.borrow();
        let elapsed_secs = match self.summary.get() {
            Some(summary) if state.is_terminal() => summary.duration_secs,
            _ => self.started.elapsed().as_secs_f64(),
        };

        let limit = &self.config.time_limit;
        let time_limit_remaining_secs = (limit.is_enabled() && !state.is_terminal())
            .then(|| limit.limit_secs.saturating_sub(elapsed_secs as u64));

        SessionSnapshot {
            state,
            session_id: Some(self.session_id.clone()),
            session_name: Some(self.session_name.clone()),
            device: Some(self.device.clone()),
            elapsed_secs,
            chunk_count: progress.chunk_count,
            current_chunk: progress.current,
            segment_duration_secs: Some(self.config.encoder.segment_duration_secs),
            log_path: self.logger.path().map(Path::to_path_buf),
            time_limit_secs: limit.limit_secs,
            time_limit_remaining_secs,
            process_id: (!state.is_terminal()).then_some(self.pid),
            disk_free_bytes: free_bytes(&self.session_dir),
        }
    }
}

/// Turns stop requests and unexpected encoder exits into `stop` calls
async fn watchdog(
    session: Arc<ActiveSession>,
    mut stop_rx: mpsc::UnboundedReceiver<StopReason>,
    mut exit_rx: watch::Receiver<Option<ExitRecord>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let reason = tokio::select! {
        biased;
        Some(reason) = stop_rx.recv() => reason,
        _ = encoder_exited(&mut exit_rx) => StopReason::SubprocessExit,
        _ = shutdown_signalled(&mut shutdown_rx) => return,
    };
    session.stop(reason).await;
}

async fn encoder_exited(rx: &mut watch::Receiver<Option<ExitRecord>>) {
    let _ = rx.wait_for(Option::is_some).await;
}

async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

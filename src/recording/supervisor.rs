use serde::Serialize;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::diagnostics;
use crate::audio::EncoderCommand;
use crate::error::{RecorderError, RecorderResult};
use crate::logging::{Level, LogEvent, SessionLogger};
use crate::session::StopReason;

/// How long to wait for the group to vanish after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(5);

/// How the encoder process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitRecord {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitRecord {
    pub fn from_status(status: &ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown"),
        }
    }
}

/// Outcome of `terminate`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process was already gone before we asked
    AlreadyExited(ExitRecord),
    Graceful(ExitRecord),
    Forced(Option<ExitRecord>),
}

impl Termination {
    pub fn exit(&self) -> Option<ExitRecord> {
        match self {
            Termination::AlreadyExited(r) | Termination::Graceful(r) => Some(*r),
            Termination::Forced(r) => *r,
        }
    }
}

/// Owns the encoder subprocess: launch, stderr capture, termination.
///
/// The child runs in its own process group so one signal reaches any helper
/// processes it spawns without touching ours. A waiter task owns the `Child`
/// and publishes its exit through a watch channel, which keeps `is_alive`
/// non-blocking.
pub struct ProcessSupervisor {
    pid: u32,
    logger: SessionLogger,
    exit_rx: watch::Receiver<Option<ExitRecord>>,
    kill_tx: mpsc::UnboundedSender<()>,
    terminate_requested: AtomicBool,
    waiter: Option<JoinHandle<()>>,
    diagnostics: Option<JoinHandle<u64>>,
}

impl ProcessSupervisor {
    /// Spawn the encoder and start the stderr reader and exit waiter
    pub fn launch(
        command: &EncoderCommand,
        logger: &SessionLogger,
        unmatched_output_level: Level,
        stop_tx: mpsc::UnboundedSender<StopReason>,
    ) -> RecorderResult<Self> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RecorderError::dependency(format!(
                    "encoder {} not found: {e}",
                    command.program.display()
                ))
            } else {
                RecorderError::subprocess(format!(
                    "failed to spawn {}: {e}",
                    command.program.display()
                ))
            }
        })?;

        let pid = child
            .id()
            .ok_or_else(|| RecorderError::subprocess("encoder exited before reporting a pid"))?;

        let encoder_log = logger.scoped("encoder");
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(diagnostics::stream_stderr(
                stderr,
                encoder_log.clone(),
                unmatched_output_level,
                stop_tx,
            ))
        });

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();
        let waiter_log = logger.clone();
        let waiter = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Some(()) = kill_rx.recv() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let record = match status {
                Ok(status) => ExitRecord::from_status(&status),
                Err(e) => {
                    waiter_log.emit(LogEvent::error("process wait failed").field("error", e));
                    ExitRecord {
                        code: None,
                        signal: None,
                    }
                }
            };

            let mut event = LogEvent::info("process_exit").field("pid", pid);
            if let Some(code) = record.code {
                event = event.field("code", code);
            }
            if let Some(signal) = record.signal {
                event = event.field("signal", signal);
            }
            waiter_log.emit(event);
            exit_tx.send_replace(Some(record));
        });

        info!(pid, program = %command.program.display(), "Encoder launched");
        logger.emit(LogEvent::info("process_started").field("pid", pid));

        Ok(Self {
            pid,
            logger: logger.clone(),
            exit_rx,
            kill_tx,
            terminate_requested: AtomicBool::new(false),
            waiter: Some(waiter),
            diagnostics: stderr_task,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking health check
    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit_status(&self) -> Option<ExitRecord> {
        *self.exit_rx.borrow()
    }

    /// Whether `terminate` has been called; separates "we stopped it" from "it died"
    pub fn terminate_requested(&self) -> bool {
        self.terminate_requested.load(Ordering::SeqCst)
    }

    /// Watch that flips to `Some` when the encoder exits
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitRecord>> {
        self.exit_rx.clone()
    }

    pub async fn wait_exit(&self) -> Option<ExitRecord> {
        let mut rx = self.exit_rx.clone();
        let result = rx.wait_for(Option::is_some).await;
        result.ok().and_then(|record| *record)
    }

    /// SIGTERM the process group, wait up to `grace_period`, then SIGKILL
    pub async fn terminate(&self, grace_period: Duration) -> Termination {
        if let Some(record) = self.exit_status() {
            return Termination::AlreadyExited(record);
        }
        self.terminate_requested.store(true, Ordering::SeqCst);

        self.logger.emit(
            LogEvent::info("terminate")
                .field("pid", self.pid)
                .field("signal", "SIGTERM")
                .field("grace_s", grace_period.as_secs_f64()),
        );
        self.signal_group(GroupSignal::Terminate);

        if let Ok(Some(record)) = tokio::time::timeout(grace_period, self.wait_exit()).await {
            return Termination::Graceful(record);
        }

        warn!(pid = self.pid, "Encoder ignored SIGTERM, killing");
        self.logger.emit(
            LogEvent::warning("terminate_escalated")
                .field("pid", self.pid)
                .field("signal", "SIGKILL"),
        );
        self.signal_group(GroupSignal::Kill);
        let _ = self.kill_tx.send(());

        let record = tokio::time::timeout(KILL_WAIT, self.wait_exit())
            .await
            .ok()
            .flatten();
        Termination::Forced(record)
    }

    /// Wait for the stderr reader and exit waiter to finish
    pub async fn join(&mut self) {
        if let Some(handle) = self.diagnostics.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Encoder stderr reader panicked");
            }
        }
        if let Some(handle) = self.waiter.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Encoder exit waiter panicked");
            }
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: GroupSignal) {
        let sig = match signal {
            GroupSignal::Terminate => libc::SIGTERM,
            GroupSignal::Kill => libc::SIGKILL,
        };
        // Negative pid addresses the whole process group
        let rc = unsafe { libc::kill(-(self.pid as libc::pid_t), sig) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!(pid = self.pid, error = %err, "Failed to signal encoder group");
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&self, _signal: GroupSignal) {
        let _ = self.kill_tx.send(());
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::logging::LogSettings;
    use std::ffi::OsString;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn sh(script: &str) -> EncoderCommand {
        EncoderCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec![OsString::from("-c"), OsString::from(script)],
        }
    }

    #[tokio::test]
    async fn terminates_group_gracefully() {
        let dir = TempDir::new().unwrap();
        let logger = SessionLogger::open(dir.path(), "session", &LogSettings::default()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let mut supervisor =
            ProcessSupervisor::launch(&sh("sleep 30"), &logger, Level::Debug, tx).unwrap();
        assert!(supervisor.is_alive());

        let outcome = supervisor.terminate(Duration::from_secs(5)).await;
        assert!(matches!(outcome, Termination::Graceful(_)), "{outcome:?}");
        assert!(!supervisor.is_alive());
        assert!(supervisor.terminate_requested());
        supervisor.join().await;
    }

    #[tokio::test]
    async fn escalates_to_kill_when_term_is_ignored() {
        let dir = TempDir::new().unwrap();
        let logger = SessionLogger::open(dir.path(), "session", &LogSettings::default()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let mut supervisor = ProcessSupervisor::launch(
            &sh("trap '' TERM; while true; do sleep 0.1; done"),
            &logger,
            Level::Debug,
            tx,
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = supervisor.terminate(Duration::from_millis(300)).await;
        match outcome {
            Termination::Forced(Some(record)) => assert_eq!(record.signal, Some(libc::SIGKILL)),
            other => panic!("expected forced kill, got {other:?}"),
        }
        supervisor.join().await;
    }

    #[tokio::test]
    async fn reports_unexpected_exit() {
        let dir = TempDir::new().unwrap();
        let logger = SessionLogger::open(dir.path(), "session", &LogSettings::default()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let mut supervisor = ProcessSupervisor::launch(
            &sh("echo 'Error opening input' >&2; exit 3"),
            &logger,
            Level::Debug,
            tx,
        )
        .unwrap();

        let record = supervisor.wait_exit().await.unwrap();
        assert_eq!(record.code, Some(3));
        assert!(!supervisor.terminate_requested());
        assert!(matches!(
            supervisor.terminate(Duration::from_secs(1)).await,
            Termination::AlreadyExited(_)
        ));
        supervisor.join().await;
        logger.flush();

        let log = std::fs::read_to_string(dir.path().join("session.log")).unwrap();
        assert!(log.contains("ERROR encoder: ffmpeg Error opening input"));
        assert!(log.contains("process_exit"));
    }

    #[tokio::test]
    async fn missing_binary_is_dependency_error() {
        let dir = TempDir::new().unwrap();
        let logger = SessionLogger::open(dir.path(), "session", &LogSettings::default()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let command = EncoderCommand {
            program: PathBuf::from("/nonexistent/ffmpeg"),
            args: vec![],
        };

        let result = ProcessSupervisor::launch(&command, &logger, Level::Debug, tx);
        assert!(matches!(result, Err(RecorderError::DependencyUnavailable { .. })));
    }
}

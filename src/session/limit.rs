use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use super::config::{BoundaryMode, TimeLimitPolicy};
use super::stats::StopReason;
use crate::logging::{LogEvent, SessionLogger};

/// A scheduled heads-up before the limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitWarning {
    /// Offset from session start
    pub at: Duration,
    pub remaining: Duration,
}

/// Warning schedule and action for one session's time limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitPlan {
    pub limit: Duration,
    pub boundary: BoundaryMode,
    /// Ascending by `at`
    pub warnings: Vec<LimitWarning>,
}

impl LimitPlan {
    /// None when the limit is disabled
    pub fn for_policy(policy: &TimeLimitPolicy) -> Option<Self> {
        if !policy.is_enabled() {
            return None;
        }
        let limit = policy.limit_secs;
        let warnings = warning_offsets(limit)
            .into_iter()
            .filter(|remaining| *remaining < limit)
            .map(|remaining| LimitWarning {
                at: Duration::from_secs(limit - remaining),
                remaining: Duration::from_secs(remaining),
            })
            .collect();

        Some(Self {
            limit: Duration::from_secs(limit),
            boundary: policy.boundary,
            warnings,
        })
    }
}

/// Seconds-remaining marks for a limit, largest first
fn warning_offsets(limit_secs: u64) -> Vec<u64> {
    match limit_secs {
        0 => vec![],
        l if l >= 120 => vec![60, 10],
        l if l >= 20 => vec![10],
        _ => vec![5],
    }
}

/// Background time-limit scheduler for one session
pub struct LimitEnforcer {
    plan: LimitPlan,
    logger: SessionLogger,
    stop_tx: mpsc::UnboundedSender<StopReason>,
    limit_tx: watch::Sender<Option<DateTime<Utc>>>,
}

impl LimitEnforcer {
    pub fn new(
        plan: LimitPlan,
        logger: SessionLogger,
        stop_tx: mpsc::UnboundedSender<StopReason>,
        limit_tx: watch::Sender<Option<DateTime<Utc>>>,
    ) -> Self {
        Self {
            plan,
            logger,
            stop_tx,
            limit_tx,
        }
    }

    /// Sleep through the warnings to the limit, unless shutdown comes first
    pub async fn run(self, started: Instant, mut shutdown: watch::Receiver<bool>) {
        for warning in &self.plan.warnings {
            tokio::select! {
                _ = sleep_until(started + warning.at) => {}
                _ = shutdown_signalled(&mut shutdown) => {
                    debug!("Time-limit scheduler cancelled");
                    return;
                }
            }
            self.logger.emit(
                LogEvent::warning("limit_warning").field("remaining_s", warning.remaining.as_secs()),
            );
        }

        tokio::select! {
            _ = sleep_until(started + self.plan.limit) => {}
            _ = shutdown_signalled(&mut shutdown) => {
                debug!("Time-limit scheduler cancelled");
                return;
            }
        }

        let limit_s = self.plan.limit.as_secs();
        match self.plan.boundary {
            BoundaryMode::Immediate => {
                self.logger
                    .emit(LogEvent::info("limit_hit").field("limit_s", limit_s));
                let _ = self.stop_tx.send(StopReason::TimeLimit);
            }
            BoundaryMode::EndSegment => {
                self.logger.emit(
                    LogEvent::info("limit_hit")
                        .field("limit_s", limit_s)
                        .field("pending", "end_segment"),
                );
                self.limit_tx.send_replace(Some(Utc::now()));
            }
        }
    }
}

async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    // A dropped sender also means the session is going away
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogSettings, LOG_FILE_NAME};
    use tempfile::TempDir;

    fn offsets(limit: u64) -> Vec<(u64, u64)> {
        LimitPlan::for_policy(&TimeLimitPolicy::new(limit, BoundaryMode::Immediate))
            .map(|plan| {
                plan.warnings
                    .iter()
                    .map(|w| (w.at.as_secs(), w.remaining.as_secs()))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn warning_schedule_per_band() {
        assert!(LimitPlan::for_policy(&TimeLimitPolicy::disabled()).is_none());
        assert_eq!(offsets(130), vec![(70, 60), (120, 10)]);
        assert_eq!(offsets(120), vec![(60, 60), (110, 10)]);
        assert_eq!(offsets(119), vec![(109, 10)]);
        assert_eq!(offsets(20), vec![(10, 10)]);
        assert_eq!(offsets(15), vec![(10, 5)]);
        assert_eq!(offsets(6), vec![(1, 5)]);
        assert_eq!(offsets(5), vec![]);
        assert_eq!(offsets(1), vec![]);
    }

    fn enforcer(
        dir: &TempDir,
        limit: u64,
        boundary: BoundaryMode,
    ) -> (
        LimitEnforcer,
        SessionLogger,
        mpsc::UnboundedReceiver<StopReason>,
        watch::Receiver<Option<DateTime<Utc>>>,
    ) {
        let logger = SessionLogger::open(dir.path(), "limit", &LogSettings::default()).unwrap();
        let plan = LimitPlan::for_policy(&TimeLimitPolicy::new(limit, boundary)).unwrap();
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let (limit_tx, limit_rx) = watch::channel(None);
        (
            LimitEnforcer::new(plan, logger.clone(), stop_tx, limit_tx),
            logger,
            stop_rx,
            limit_rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_limit_warns_then_requests_stop() {
        let dir = TempDir::new().unwrap();
        let (enforcer, logger, mut stop_rx, _limit_rx) =
            enforcer(&dir, 130, BoundaryMode::Immediate);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let started = Instant::now();

        let task = tokio::spawn(enforcer.run(started, shutdown_rx));

        tokio::time::sleep(Duration::from_secs(129)).await;
        assert!(stop_rx.try_recv().is_err());

        assert_eq!(stop_rx.recv().await, Some(StopReason::TimeLimit));
        assert!(started.elapsed() >= Duration::from_secs(130));
        task.await.unwrap();

        logger.flush();
        let log = std::fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
        let warnings: Vec<&str> = log.lines().filter(|l| l.contains("limit_warning")).collect();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].ends_with("remaining_s=60"));
        assert!(warnings[1].ends_with("remaining_s=10"));
    }

    #[tokio::test(start_paused = true)]
    async fn end_segment_limit_raises_flag_instead_of_stopping() {
        let dir = TempDir::new().unwrap();
        let (enforcer, _logger, mut stop_rx, mut limit_rx) =
            enforcer(&dir, 15, BoundaryMode::EndSegment);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(enforcer.run(Instant::now(), shutdown_rx));

        limit_rx.changed().await.unwrap();
        assert!(limit_rx.borrow().is_some());
        assert!(stop_rx.recv().await.is_none(), "no direct stop in end_segment mode");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_timers() {
        let dir = TempDir::new().unwrap();
        let (enforcer, logger, mut stop_rx, _limit_rx) =
            enforcer(&dir, 300, BoundaryMode::Immediate);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(enforcer.run(Instant::now(), shutdown_rx));
        tokio::time::sleep(Duration::from_secs(30)).await;
        shutdown_tx.send_replace(true);
        task.await.unwrap();

        assert!(stop_rx.recv().await.is_none());
        logger.flush();
        let log = std::fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
        assert!(!log.contains("limit_warning"));
    }
}

//! Background refresh loop.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::manager::SessionManager;

/// First wait after a failed refresh or acquisition.
pub const FAILURE_BACKOFF_INITIAL: Duration = Duration::from_secs(60);
/// Longest wait between failed attempts.
pub const FAILURE_BACKOFF_MAX: Duration = Duration::from_secs(3600);

/// Keeps the session renewed ahead of expiry until cancelled.
///
/// The loop sleeps until `access_expiry - lead_time` and redeems. A session
/// generation change (a foreground refresh or a new login) reschedules the
/// wait from the new expiry instead of redeeming. Failures back off
/// exponentially from [`FAILURE_BACKOFF_INITIAL`] to [`FAILURE_BACKOFF_MAX`].
/// Without a session the loop acquires one, so it should be cancelled before
/// an in-process uninstall.
pub struct RefreshScheduler {
    manager: Arc<SessionManager>,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
}

impl RefreshScheduler {
    /// Scheduler for `manager` that stops once `cancel` fires.
    pub fn new(manager: Arc<SessionManager>, cancel: CancellationToken) -> Self {
        Self {
            manager,
            trigger: Arc::new(Notify::new()),
            cancel,
        }
    }

    /// Handle for requesting an immediate refresh.
    pub fn trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    /// Runs the loop on a new task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs the loop on the current task until cancelled.
    pub async fn run(self) {
        let mut generations = self.manager.subscribe_generation();
        let mut backoff: Option<Duration> = None;

        loop {
            let observed = *generations.borrow_and_update();
            let delay = match backoff {
                Some(delay) => delay,
                None => match self.manager.session().await {
                    Some(state) => {
                        state.refresh_delay(OffsetDateTime::now_utc(), self.manager.lead_time())
                    }
                    None => Duration::ZERO,
                },
            };
            tracing::debug!(delay_secs = delay.as_secs(), generation = observed, "next refresh scheduled");

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = generations.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    backoff = None;
                    continue;
                }
                _ = self.trigger.notified() => self.manager.force_refresh().await,
                _ = tokio::time::sleep(delay) => self.manager.refresh_if_stale(observed).await,
            };

            match outcome {
                Ok(state) => {
                    backoff = None;
                    tracing::debug!(access_expiry = %state.access_expiry, "session renewed");
                }
                Err(e) => {
                    let next = backoff.map_or(FAILURE_BACKOFF_INITIAL, |d| {
                        d.saturating_mul(2).min(FAILURE_BACKOFF_MAX)
                    });
                    tracing::error!(error = %e, retry_in_secs = next.as_secs(), "session renewal failed");
                    backoff = Some(next);
                }
            }
        }

        tracing::debug!("refresh scheduler stopped");
    }
}

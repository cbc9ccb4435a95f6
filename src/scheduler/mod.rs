//! Execution modes and maintenance cadence.
//!
//! `single` runs one cycle and exits with its outcome. `continuous` loops
//! forever: sync interval between successful cycles, exponential back-off
//! after incomplete 2FA, and a maintenance ticker that pauses the engine,
//! backs up the tracker, and checks its integrity.

pub mod backoff;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::notify::PushoverNotifier;
use crate::sync::{CycleError, PauseFlag, SyncEngine, SyncStats};
use crate::tracker::Tracker;
use crate::types::ExecutionMode;
use backoff::TwoFactorBackoff;

/// Hard ceiling on one cycle's wall-clock time.
pub const CYCLE_WATCHDOG: Duration = Duration::from_secs(4 * 60 * 60);

/// Drives [`SyncEngine`] cycles according to the execution mode.
pub struct Scheduler {
    engine: SyncEngine,
    tracker: Arc<Tracker>,
    notifier: Option<PushoverNotifier>,
    shutdown: CancellationToken,
    pause: Arc<PauseFlag>,
    mode: ExecutionMode,
    sync_interval: Duration,
    maintenance_interval: Duration,
    backoff: TwoFactorBackoff,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)] // Mirrors the wiring in main
    pub fn new(
        engine: SyncEngine,
        tracker: Arc<Tracker>,
        notifier: Option<PushoverNotifier>,
        shutdown: CancellationToken,
        pause: Arc<PauseFlag>,
        mode: ExecutionMode,
        sync_interval: Duration,
        maintenance_interval: Duration,
        backoff: TwoFactorBackoff,
    ) -> Self {
        Self {
            engine,
            tracker,
            notifier,
            shutdown,
            pause,
            mode,
            sync_interval,
            maintenance_interval,
            backoff,
        }
    }

    /// Run until done (single) or until shutdown (continuous).
    pub async fn run(mut self) -> Result<(), CycleError> {
        match self.mode {
            ExecutionMode::Single => self.run_single().await,
            ExecutionMode::Continuous => self.run_continuous().await,
        }
    }

    async fn run_single(&mut self) -> Result<(), CycleError> {
        tracing::info!("Running in single execution mode");
        match self.run_cycle_with_watchdog().await {
            Ok(stats) => {
                self.backoff.reset();
                if stats.interrupted {
                    tracing::info!("Cycle interrupted by shutdown signal");
                }
                Ok(())
            }
            Err(e) => {
                self.handle_cycle_error(&e).await;
                Err(e)
            }
        }
    }

    async fn run_continuous(&mut self) -> Result<(), CycleError> {
        tracing::info!(
            "Running in continuous execution mode (sync every {:?}, maintenance every {:?})",
            self.sync_interval,
            self.maintenance_interval
        );

        let maintenance_cancel = self.shutdown.child_token();
        let maintenance = tokio::spawn(maintenance_loop(
            self.tracker.clone(),
            self.pause.clone(),
            self.maintenance_interval,
            maintenance_cancel.clone(),
        ));

        let result = loop {
            if self.shutdown.is_cancelled() {
                break Ok(());
            }

            if let Some(delay) = self.backoff.current_delay() {
                tracing::info!(
                    "Waiting {:?} before the next attempt ({} consecutive 2FA failures)",
                    delay,
                    self.backoff.consecutive_failures()
                );
                if self.sleep_or_shutdown(delay).await {
                    break Ok(());
                }
            }

            match self.run_cycle_with_watchdog().await {
                Ok(stats) => {
                    self.backoff.reset();
                    if stats.interrupted {
                        break Ok(());
                    }
                    if self.sleep_or_shutdown(self.sync_interval).await {
                        break Ok(());
                    }
                }
                Err(CycleError::InvalidCredentials) => {
                    // Credentials will not fix themselves; stop and let the
                    // operator intervene.
                    break Err(CycleError::InvalidCredentials);
                }
                Err(e) => {
                    self.handle_cycle_error(&e).await;
                    if !matches!(e, CycleError::TwoFactorIncomplete(_))
                        && self.sleep_or_shutdown(self.sync_interval).await
                    {
                        break Ok(());
                    }
                }
            }
        };

        maintenance_cancel.cancel();
        let _ = maintenance.await;
        tracing::info!("Continuous execution stopped");
        result
    }

    async fn run_cycle_with_watchdog(&self) -> Result<SyncStats, CycleError> {
        match tokio::time::timeout(CYCLE_WATCHDOG, self.engine.run_cycle()).await {
            Ok(result) => result,
            Err(_) => Err(CycleError::WatchdogExpired),
        }
    }

    /// Log the failure, adjust back-off, and emit at most one fatal
    /// notification for the cycle.
    async fn handle_cycle_error(&mut self, error: &CycleError) {
        tracing::error!("Sync cycle failed: {}", error);
        match error {
            CycleError::TwoFactorIncomplete(_) => {
                self.backoff.record_failure();
            }
            CycleError::Tracker(_) | CycleError::WatchdogExpired => {
                if let Some(notifier) = &self.notifier {
                    if let Err(e) = notifier.notify_fatal(&error.to_string()).await {
                        tracing::warn!("Fatal notification failed: {}", e);
                    }
                }
            }
            _ => {}
        }
    }

    /// Returns true when shutdown fired during the sleep.
    async fn sleep_or_shutdown(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.shutdown.cancelled() => {
                tracing::info!("Shutdown during wait, exiting...");
                true
            }
        }
    }
}

/// Periodic tracker maintenance: raise the pause flag, back up, check
/// integrity (restoring from backup when it fails), resume.
async fn maintenance_loop(
    tracker: Arc<Tracker>,
    pause: Arc<PauseFlag>,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::debug!("Maintenance worker started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => break,
        }
        run_maintenance(&tracker, &pause).await;
    }
    tracing::debug!("Maintenance worker stopped");
}

/// One maintenance pass. Public within the crate for the scheduler tests.
pub(crate) async fn run_maintenance(tracker: &Tracker, pause: &PauseFlag) {
    tracing::info!("Starting scheduled tracker maintenance");
    pause.pause();

    match tracker.check_integrity().await {
        Ok(true) => tracing::debug!("Tracker integrity check passed"),
        Ok(false) => {
            tracing::warn!("Tracker integrity check failed, attempting recovery");
            match tracker.restore_from_backup().await {
                Ok(true) => tracing::info!("Tracker recovered from backup"),
                Ok(false) => tracing::error!("Tracker recovery failed: no usable backup"),
                Err(e) => tracing::error!("Tracker recovery failed: {}", e),
            }
        }
        Err(e) => tracing::error!("Tracker integrity check errored: {}", e),
    }

    if let Err(e) = tracker.backup().await {
        tracing::warn!("Maintenance backup failed: {}", e);
    }

    pause.resume();
    tracing::info!("Tracker maintenance finished, sync may resume");
}

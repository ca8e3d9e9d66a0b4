//! Expiration sweep plumbing: cancellation, reporting and the periodic task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Shared cancellation signal checked between trials.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Fresh, not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running sweep to stop after the current trial.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of one sweep run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Trials moved to `Expired` by this run
    pub expired: usize,
    /// Trials that could not be expired (retried next run)
    pub failed: usize,
    /// Whether the run stopped early
    pub cancelled: bool,
}

impl SweepReport {
    /// Number of transitions performed.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.expired
    }
}

#[cfg(feature = "tokio")]
pub use periodic::{spawn_sweeper, SweeperHandle};

#[cfg(feature = "tokio")]
mod periodic {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    use super::CancelFlag;
    use crate::trial::TrialLifecycleManager;

    /// Handle to the background sweeper.
    #[derive(Debug)]
    pub struct SweeperHandle {
        cancel: CancelFlag,
        shutdown: Option<oneshot::Sender<()>>,
        task: JoinHandle<()>,
    }

    impl SweeperHandle {
        /// Stop the sweeper, interrupting a run in progress, and wait for it.
        ///
        /// Trials expired before the stop stay expired.
        pub async fn shutdown(mut self) {
            self.cancel.cancel();
            if let Some(tx) = self.shutdown.take() {
                let _ = tx.send(());
            }
            if let Err(e) = self.task.await {
                tracing::warn!(error = %e, "sweeper task ended abnormally");
            }
        }
    }

    /// Run [`TrialLifecycleManager::sweep_expirations_with`] every `interval`.
    ///
    /// The first sweep runs immediately, catching up on anything missed
    /// while the service was down. Each sweep runs on the blocking pool.
    #[must_use]
    pub fn spawn_sweeper(manager: Arc<TrialLifecycleManager>, interval: Duration) -> SweeperHandle {
        let cancel = CancelFlag::new();
        let (tx, mut rx) = oneshot::channel::<()>();
        let flag = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = ticker.tick() => {}
                }
                if flag.is_cancelled() {
                    break;
                }

                let manager = Arc::clone(&manager);
                let run_flag = flag.clone();
                match tokio::task::spawn_blocking(move || manager.sweep_expirations_with(&run_flag))
                    .await
                {
                    Ok(report) => {
                        tracing::debug!(expired = report.expired, failed = report.failed, "sweep tick");
                    }
                    Err(e) => tracing::warn!(error = %e, "sweep task panicked"),
                }
            }
            tracing::info!("expiration sweeper stopped");
        });

        SweeperHandle {
            cancel,
            shutdown: Some(tx),
            task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_report_count() {
        let report = SweepReport {
            expired: 4,
            failed: 1,
            cancelled: false,
        };
        assert_eq!(report.count(), 4);
    }
}

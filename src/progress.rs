//! Periodic in-flight heartbeat for a single in-progress delivery.
//!
//! Grounded on `subscriptions/progress_reporter.py`, but reimplemented as a
//! plain cancel-checked loop instead of the original's self-recursive
//! `_report_progress` (spec's design notes call this out explicitly: the
//! semantics are unchanged, only the recursion is removed).

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::broker::DeliveryAck;

pub const DEFAULT_REPORT_INTERVAL_SECS: u64 = 15;

/// Signals a broker's "work in progress" heartbeat for one delivery at a
/// time, on an interval, until stopped.
pub struct ProgressReporter {
    report_interval: Duration,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

impl ProgressReporter {
    pub fn new(report_interval: Duration) -> Self {
        Self {
            report_interval,
            task: None,
        }
    }

    pub fn with_default_interval() -> Self {
        Self::new(Duration::from_secs(DEFAULT_REPORT_INTERVAL_SECS))
    }

    /// Begin periodic signalling against `delivery`. At most one
    /// outstanding report loop may run per instance; callers must `stop`
    /// the previous one before calling `start` again.
    pub fn start(&mut self, delivery: Arc<dyn DeliveryAck>) {
        let token = CancellationToken::new();
        let child_token = token.clone();
        let interval = self.report_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = child_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = delivery.in_progress().await {
                            debug!(error = %err, "in-progress heartbeat failed, continuing");
                        }
                    }
                }
            }
        });
        self.task = Some((token, handle));
    }

    /// Cancel the running report loop, if any. Idempotent.
    pub fn stop(&mut self) {
        if let Some((token, handle)) = self.task.take() {
            token.cancel();
            handle.abort();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Randomized, resettable election timer.
//!
//! Fires when the election timeout elapses without a reset; a fresh
//! random timeout is drawn every cycle so repeated split votes are
//! unlikely.

use crate::config::RaftConfig;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Notify};
use tokio::time::sleep;

/// Election timer.
///
/// Followers and candidates reset it on every valid leader contact; when
/// it fires, the election loop starts a new election.
pub struct ElectionTimer {
    config: RaftConfig,
    reset_notify: Arc<Notify>,
    shutdown_notify: Arc<Notify>,
    timeout_tx: mpsc::Sender<()>,
}

impl ElectionTimer {
    /// Create a timer and the channel its timeouts fire on.
    pub fn new(config: RaftConfig) -> (Self, mpsc::Receiver<()>) {
        let (timeout_tx, timeout_rx) = mpsc::channel(4);
        (
            Self {
                config,
                reset_notify: Arc::new(Notify::new()),
                shutdown_notify: Arc::new(Notify::new()),
                timeout_tx,
            },
            timeout_rx,
        )
    }

    /// Restart the countdown with a fresh random timeout.
    pub fn reset(&self) {
        self.reset_notify.notify_one();
    }

    pub fn shutdown(&self) {
        self.shutdown_notify.notify_waiters();
    }

    /// Timer loop; spawn as a background task.
    pub async fn run(self: Arc<Self>) {
        loop {
            let timeout = self.config.random_election_timeout();
            let deadline = Instant::now() + timeout;

            tokio::select! {
                _ = sleep_until(deadline) => {
                    if self.timeout_tx.send(()).await.is_err() {
                        break;
                    }
                }
                _ = self.reset_notify.notified() => {
                    continue;
                }
                _ = self.shutdown_notify.notified() => {
                    break;
                }
            }
        }
    }
}

async fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        sleep(deadline - now).await;
    }
}

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Timestamp of the last byte that crossed a session's pty, in either direction.
///
/// The idle watchdog waits on this to decide when an unattended session can
/// be torn down.
#[derive(Clone)]
pub struct ActivityTracker {
    tx: Arc<watch::Sender<Instant>>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Instant::now());
        Self { tx: Arc::new(tx) }
    }

    /// Record activity. Safe to call from blocking threads.
    pub fn touch(&self) {
        self.tx.send_replace(Instant::now());
    }

    pub fn idle_for(&self) -> Duration {
        self.tx.borrow().elapsed()
    }

    /// Resolve once `timeout` has passed without a `touch()`.
    pub async fn wait_for_idle(&self, timeout: Duration) {
        let mut rx = self.tx.subscribe();
        loop {
            let elapsed = rx.borrow_and_update().elapsed();
            if elapsed >= timeout {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(timeout - elapsed) => {}
                res = rx.changed() => {
                    if res.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

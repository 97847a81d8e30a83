//! Cooperative start/stop flags shared between a loop and its owner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How often an owner re-checks the stopped flag while waiting.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A "keep running" flag plus an observable "has stopped" flag.
///
/// The owner clears `running`; the loop notices at its next suspension point,
/// returns, and its [`StoppedGuard`] flips `stopped`.
#[derive(Debug)]
pub struct LoopControl {
    running: AtomicBool,
    stopped: AtomicBool,
}

impl LoopControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Creates the guard the loop holds for its whole lifetime. Create it
    /// before spawning so a task that never gets polled still reports stopped.
    pub fn stopped_guard(self: &Arc<Self>) -> StoppedGuard {
        StoppedGuard(Arc::clone(self))
    }

    pub async fn wait_stopped(&self) {
        while !self.is_stopped() {
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }

    /// Requests a stop and waits until the loop has observably exited.
    pub async fn stop(&self) {
        self.request_stop();
        self.wait_stopped().await;
    }
}

/// Marks the owning [`LoopControl`] as stopped when dropped, including when
/// the loop's task panics or is cancelled.
#[derive(Debug)]
pub struct StoppedGuard(Arc<LoopControl>);

impl Drop for StoppedGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
        self.0.stopped.store(true, Ordering::Release);
    }
}

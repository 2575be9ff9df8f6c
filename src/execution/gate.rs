//! Pause Gate
//!
//! The suspension point behind pause/resume. A gate is either open or
//! closed; waiting on a closed gate blocks until it is opened again.
//! Pausing closes the gate, resuming or stopping opens it.
//!
//! Waiting is only done at safe points around a step's `run` call, so a
//! pause never interrupts user code mid-flight; it holds the component
//! before its next transition.

use tokio::sync::watch;

/// Open/closed gate that async code can wait on.
#[derive(Debug)]
pub struct PauseGate {
    closed: watch::Sender<bool>,
}

impl PauseGate {
    /// Creates an open gate.
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self { closed }
    }

    /// Closes the gate; later [`wait`](Self::wait) calls block.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Opens the gate and releases every waiter.
    pub fn open(&self) {
        self.closed.send_replace(false);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Waits until the gate is open. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|closed| !*closed).await;
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

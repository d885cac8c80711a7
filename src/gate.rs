//! Caller-controlled release gate.
//!
//! The single-fire primitive behind every held stub: a matched request is
//! parked on the gate, and the reply can only be produced once the gate has
//! been fired through its [`ControlHandle`].

use std::future::pending;
use tokio::sync::watch;

/// Handle returned at registration time.
///
/// Exposes exactly one operation, [`release`](ControlHandle::release). The
/// handle lives for the duration of a scenario and is discarded afterwards.
#[derive(Debug)]
pub struct ControlHandle {
    fire: watch::Sender<bool>,
}

impl ControlHandle {
    /// Fire the gate, allowing the parked reply to be delivered.
    ///
    /// Non-blocking and returns nothing. The first call opens the gate;
    /// every later call is a no-op. Calling before the matching request has
    /// arrived is valid: the request finds the gate already open and is
    /// answered immediately.
    ///
    /// The parked continuation runs after the current unit of work, never
    /// inside this call. Perform pending-state assertions *before* invoking
    /// `release`, never after; only that ordering guarantees the assertion
    /// observes the unanswered request.
    pub fn release(&self) {
        self.fire.send_replace(true);
    }
}

/// Wait side of the gate, owned by the registration that parks on it.
#[derive(Debug)]
pub struct ReleaseGate {
    opened: watch::Receiver<bool>,
}

impl ReleaseGate {
    /// Create a closed gate and the handle that fires it.
    pub fn new() -> (ControlHandle, ReleaseGate) {
        let (fire, opened) = watch::channel(false);
        (ControlHandle { fire }, ReleaseGate { opened })
    }

    /// A gate that is already open. Requests matched against it are answered
    /// immediately; config-installed stubs without `hold` use this.
    pub fn open() -> ReleaseGate {
        let (_, opened) = watch::channel(true);
        ReleaseGate { opened }
    }

    /// Whether the gate has been fired.
    pub fn is_open(&self) -> bool {
        *self.opened.borrow()
    }

    /// Resolve once the gate has been fired.
    ///
    /// If the control handle is dropped without firing, this never resolves:
    /// the parked request stays parked until the surrounding test tears the
    /// server down. There is no internal timeout.
    pub async fn released(&self) {
        let mut opened = self.opened.clone();
        if opened.wait_for(|fired| *fired).await.is_err() {
            // Handle dropped unfired; park forever.
            pending::<()>().await;
        }
    }
}

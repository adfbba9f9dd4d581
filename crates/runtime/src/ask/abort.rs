//! Write-once abort signalling
//!
//! One handle flips the flag, any number of signal clones observe it at
//! their next suspension point. Aborting a run that already finished is a
//! no-op.

use tokio::sync::watch;

/// Sender half; owned by the orchestrator's active-run table.
#[derive(Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Flip the abort flag. Idempotent; safe after the run completed.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiver half; cloned into every outbound capability call.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the abort flag flips. Never resolves if the handle is
    /// dropped without aborting, so callers can park this in a `select!`.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without aborting: the run can no longer
                // be cancelled.
                std::future::pending::<()>().await;
            }
        }
    }

}

/// Create a connected handle/signal pair.
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx }, AbortSignal { rx })
}

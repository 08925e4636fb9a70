//! Cancellation tokens for workflow runs.
//!
//! Cancellation is cooperative: the orchestrator holds a [`CancelHandle`]
//! per run and hands cloneable [`CancelToken`]s to delegators, workers and
//! the clarification gate. A handler call observes cancellation either by
//! polling `is_cancelled` or by awaiting `cancelled` inside a `select!`.
//!
//! Built on a `watch` channel so the flag is retained: a token created or
//! checked after the handle fired still observes the cancellation.

use tokio::sync::watch;

/// The cancelling side, held by the orchestrator's run registry.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Fires the cancellation. Idempotent.
    pub fn cancel(&self) {
        // Send fails only when every token is gone, which means nobody is
        // left to observe the cancellation anyway.
        let _ = self.tx.send(true);
    }

    /// Creates another token observing this handle.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// The observing side, threaded through every handler call.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Returns whether cancellation has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation fires. Never resolves if the handle is
    /// dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Handle dropped without ever cancelling: this run can no longer be
        // cancelled, so the future must stay pending.
        std::future::pending::<()>().await;
    }
}

/// Creates a connected handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

//! Cooperative cancellation.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A clonable, single-fire cancellation flag.
///
/// Clones share state: cancelling one cancels all. Waiting on
/// [`cancelled`](Self::cancelled) registers interest; dropping the future
/// unregisters it.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    state: Arc<watch::Sender<bool>>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self {
            state: Arc::new(watch::Sender::new(false)),
        }
    }

    /// Fires the signal. Returns `true` only for the call that fired it.
    pub fn cancel(&self) -> bool {
        !self.state.send_replace(true)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Completes once the signal has fired.
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|fired| *fired).await;
    }

    /// Fires the signal after `delay` unless it fired earlier.
    ///
    /// Must be called within a tokio runtime.
    pub fn cancel_after(&self, delay: Duration) {
        let signal = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    signal.cancel();
                }
                _ = signal.cancelled() => {}
            }
        });
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

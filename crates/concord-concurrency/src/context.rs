//! Cooperative cancellation for blocking lock calls

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Cancellation signal passed to `Mutex::lock` and friends.
///
/// Clones share the same underlying flag. Once cancelled it stays cancelled.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    /// Create a signal that is not yet cancelled
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// A signal that nobody cancels
    pub fn never() -> Self {
        Self::new()
    }

    /// A signal that cancels itself after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        let signal = Self::new();
        let timer = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            timer.cancel();
        });
        signal
    }

    /// Trigger cancellation
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve once the signal is cancelled
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        signal.cancel();
        waiter.await.unwrap();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_already_cancelled_resolves_immediately() {
        let signal = CancelSignal::new();
        signal.cancel();
        signal.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels() {
        let signal = CancelSignal::with_timeout(Duration::from_secs(2));
        assert!(!signal.is_cancelled());
        signal.cancelled().await;
        assert!(signal.is_cancelled());
    }
}

//! Signal-of-Stop: cooperative cancellation primitive.
//!
//! One token stops the whole process (Ctrl+C, `/quit`); one more is handed
//! to every per-recipient upload task so `/cancel` can stop a single stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A cooperative cancellation token.
///
/// Clones share the same underlying state, so cancelling any clone
/// wakes every waiter.
#[derive(Debug, Default, Clone)]
pub struct SignalOfStop {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl SignalOfStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to all waiters. Idempotent.
    pub fn cancel(&self) {
        self.internal.closing.store(true, Ordering::Release);
        self.internal.notify.notify_waiters();
    }

    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Wait until cancellation is signaled. Returns immediately if it
    /// already was.
    pub async fn wait(&self) {
        loop {
            let notified = self.internal.notify.notified();
            if self.cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_after_cancel_from_clone() {
        let sos = SignalOfStop::new();
        let clone = sos.clone();
        let waiter = tokio::spawn(async move { clone.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        sos.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
        assert!(sos.cancelled());
    }

    #[tokio::test]
    async fn wait_on_cancelled_token_is_immediate() {
        let sos = SignalOfStop::new();
        sos.cancel();
        tokio::time::timeout(Duration::from_millis(50), sos.wait())
            .await
            .expect("already cancelled");
    }
}

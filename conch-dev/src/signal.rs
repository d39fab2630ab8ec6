//! Shared cancellation signal for a dev run.
//!
//! One signal is created per supervisor run and handed (by clone) to every
//! running process and to the reverse proxy. Firing it is idempotent, and
//! every holder observes it without polling.

use std::sync::Arc;

use tokio::sync::watch;

/// Broadcast abort flag shared by all processes of one dev run.
///
/// Clones share the same underlying flag; holders reference the signal, they
/// never own it.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cooperative shutdown. Later calls are no-ops.
    pub fn abort(&self) {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        });
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has fired. Returns immediately if it already
    /// has.
    pub async fn aborted(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        // `changed` only errors when the sender is dropped, which cannot
        // happen while `self` holds it.
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn starts_unfired() {
        let signal = AbortSignal::new();
        assert!(!signal.is_aborted());
    }

    #[test]
    fn abort_is_idempotent() {
        let signal = AbortSignal::new();
        signal.abort();
        signal.abort();
        assert!(signal.is_aborted());
    }

    #[test]
    fn clones_share_the_flag() {
        let signal = AbortSignal::new();
        let other = signal.clone();
        other.abort();
        assert!(signal.is_aborted());
    }

    #[tokio::test]
    async fn aborted_resolves_when_fired() {
        let signal = AbortSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move {
            waiter.aborted().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.abort();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should observe the signal")
            .unwrap();
    }

    #[tokio::test]
    async fn aborted_resolves_immediately_when_already_fired() {
        let signal = AbortSignal::new();
        signal.abort();
        tokio::time::timeout(Duration::from_millis(100), signal.aborted())
            .await
            .expect("already-fired signal should resolve at once");
    }
}

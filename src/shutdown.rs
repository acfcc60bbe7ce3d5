//! Process-wide exit flag, polled at loop boundaries.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Owner side; dropping it also counts as shutdown.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

/// Cloneable observer handed to servers, monitors and tasks
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
    _pinned: Option<Arc<watch::Sender<bool>>>,
}

impl Shutdown {
    pub fn new() -> (Self, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, ShutdownSignal { rx, _pinned: None })
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
            _pinned: None,
        }
    }
}

impl ShutdownSignal {
    /// A signal that never fires, for tests and one-off tools
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _pinned: Some(Arc::new(tx)),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `dur`, returning early with `true` when shutdown fires.
    pub async fn sleep(&mut self, dur: Duration) -> bool {
        if self.is_shutdown() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(dur) => self.is_shutdown(),
            _ = self.wait() => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_interrupted_by_shutdown() {
        let (shutdown, mut signal) = Shutdown::new();
        let waiter = tokio::spawn(async move { signal.sleep(Duration::from_secs(30)).await });
        shutdown.trigger();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_never_signal_sleeps_normally() {
        let mut signal = ShutdownSignal::never();
        assert!(!signal.sleep(Duration::from_millis(5)).await);
        assert!(!signal.is_shutdown());
    }
}

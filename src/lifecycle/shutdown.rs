//! Shutdown coordination for background work.

use std::sync::Arc;
use tokio::sync::watch;

/// Latching shutdown flag shared by the scheduler and its tasks.
///
/// Once triggered it stays triggered until [`Shutdown::reset`], so a task
/// that subscribes after the trigger still stops on its first poll.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

/// One task's view of the shutdown flag.
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal { rx: self.tx.subscribe() }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Re-arm the flag once every task of the previous run has stopped.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    /// Resolve once shutdown has been triggered.
    pub async fn recv(&mut self) {
        // The sender lives as long as the coordinator; a dropped coordinator
        // means nothing is left to stop us, so treat it as shutdown too.
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}

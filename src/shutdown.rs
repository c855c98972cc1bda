//! Cooperative shutdown signal shared by every long-running task.
//!
//! A single [`ShutdownTrigger`] flips a `watch` flag; any number of
//! [`ShutdownSignal`] clones observe it, either by polling
//! [`ShutdownSignal::is_signalled`] between steps or by racing
//! [`ShutdownSignal::signalled`] in a `tokio::select!`. Dropping the
//! trigger counts as shutdown, so tasks never outlive their owner.

use tokio::sync::watch;

pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal { rx: self.tx.subscribe() }
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_signalled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once shutdown is triggered or the trigger is dropped.
    pub async fn signalled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

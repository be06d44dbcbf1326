//! Fan-out of job status notifications.
//!
//! Every successful transition yields one `StatusChanged`; whoever persisted the
//! transition publishes it here. Delivery is best-effort: a publish never fails
//! the transition, and subscribers that went away are dropped silently.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::job::StatusChanged;

/// Receiving end of a status subscription.
#[derive(Debug)]
pub struct Subscription {
    receiver: Receiver<StatusChanged>,
}

impl Subscription {
    pub fn try_recv(&self) -> Result<StatusChanged, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<StatusChanged, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything published so far, without blocking.
    pub fn drain(&self) -> Vec<StatusChanged> {
        self.receiver.try_iter().collect()
    }
}

/// Publish/subscribe channel for status notifications.
pub trait StatusBus: Send + Sync {
    fn publish(&self, change: StatusChanged);

    fn subscribe(&self) -> Subscription;
}

impl<B> StatusBus for Arc<B>
where
    B: StatusBus + ?Sized,
{
    fn publish(&self, change: StatusChanged) {
        (**self).publish(change)
    }

    fn subscribe(&self) -> Subscription {
        (**self).subscribe()
    }
}

/// In-process bus backed by one `mpsc` channel per subscriber.
#[derive(Debug, Default)]
pub struct InMemoryStatusBus {
    subscribers: Mutex<Vec<mpsc::Sender<StatusChanged>>>,
}

impl InMemoryStatusBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusBus for InMemoryStatusBus {
    fn publish(&self, change: StatusChanged) {
        let Ok(mut subs) = self.subscribers.lock() else {
            return;
        };
        subs.retain(|tx| tx.send(change.clone()).is_ok());
    }

    fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        Subscription { receiver: rx }
    }
}

//! Observers of intercepted check-domain queries.
//!
//! External tooling subscribes to learn which clients actually resolve
//! through the interceptor. Publishing never blocks the query path: a
//! lagging subscriber loses events, everyone else keeps receiving.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

pub type SubscriberId = u64;

const CHANNEL_CAPACITY: usize = 64;

pub struct Subscribers {
    channels: RwLock<HashMap<SubscriberId, mpsc::Sender<String>>>,
    next_id: AtomicU64,
    /// Lifecycle token; once cancelled, publishes no longer touch the set.
    cancel: CancellationToken,
}

impl Subscribers {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            cancel,
        }
    }

    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);

        self.channels.write().insert(id, sender);

        (id, receiver)
    }

    /// Removes the subscriber; dropping the sender closes its channel
    /// exactly once.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.channels.write().remove(&id);
    }

    /// Fans `name` out to all subscribers without blocking. A full channel
    /// drops the event for that subscriber only.
    pub fn broadcast(&self, name: &str) {
        if self.cancel.is_cancelled() {
            return;
        }

        let channels = self.channels.read();
        for sender in channels.values() {
            match sender.try_send(name.to_owned()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::debug!("Subscriber lagging, dropping check-domain event");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Closes every channel and empties the set. Concurrent broadcasts are
    /// safe because they test the lifecycle token before taking the lock.
    pub fn close_all(&self) {
        self.channels.write().clear();
    }

    pub fn count(&self) -> usize {
        self.channels.read().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn subscribers_receive_broadcasts() {
        let subscribers = Subscribers::new(CancellationToken::new());

        let (_id, mut receiver) = subscribers.subscribe();
        subscribers.broadcast("client1.dns-check.pbr.internal");

        assert_eq!(
            receiver.recv().await.as_deref(),
            Some("client1.dns-check.pbr.internal")
        );
    }

    #[tokio::test]
    async fn full_channels_drop_events_without_blocking() {
        let subscribers = Subscribers::new(CancellationToken::new());

        let (_id, mut receiver) = subscribers.subscribe();
        for i in 0..CHANNEL_CAPACITY + 10 {
            subscribers.broadcast(&format!("n{i}.dns-check.pbr.internal"));
        }

        let mut received = 0;
        while receiver.try_recv().is_ok() {
            received += 1;
        }

        assert_eq!(received, CHANNEL_CAPACITY);
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_channel() {
        let subscribers = Subscribers::new(CancellationToken::new());

        let (id, mut receiver) = subscribers.subscribe();
        subscribers.unsubscribe(id);

        assert_eq!(receiver.recv().await, None);
        assert_eq!(subscribers.count(), 0);
    }

    #[tokio::test]
    async fn close_all_unblocks_waiting_subscribers() {
        let subscribers = Arc::new(Subscribers::new(CancellationToken::new()));

        let (_id, mut receiver) = subscribers.subscribe();
        let waiter = tokio::spawn(async move { receiver.recv().await });

        subscribers.close_all();

        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn broadcast_after_cancel_is_a_no_op() {
        let cancel = CancellationToken::new();
        let subscribers = Subscribers::new(cancel.clone());

        let (_id, mut receiver) = subscribers.subscribe();
        cancel.cancel();
        subscribers.broadcast("client1.dns-check.pbr.internal");

        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn churn_and_broadcast_never_panic() {
        let subscribers = Arc::new(Subscribers::new(CancellationToken::new()));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let subscribers = Arc::clone(&subscribers);
            tasks.push(tokio::spawn(async move {
                for _ in 0..200 {
                    let (id, _receiver) = subscribers.subscribe();
                    subscribers.broadcast("x.dns-check.pbr.internal");
                    subscribers.unsubscribe(id);
                }
            }));
        }
        for _ in 0..4 {
            let subscribers = Arc::clone(&subscribers);
            tasks.push(tokio::spawn(async move {
                for _ in 0..100 {
                    subscribers.close_all();
                    tokio::task::yield_now().await;
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
    }
}

//! Director notification bus.
//!
//! Every dashboard ("director") connection subscribes here and receives the
//! full worker roster whenever it changes. Delivery is best-effort and never
//! blocks the publisher: each observer has a small bounded queue, and an
//! observer whose queue is closed or full is dropped from the fan-out set.
//! Its socket task notices the closed queue and hangs up; a reconnecting
//! dashboard gets a fresh full snapshot, so nothing is lost by dropping it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::registry::Worker;

/// Snapshot type pushed to observers.
pub type Roster = Arc<Vec<Worker>>;

/// Roster snapshots an observer may have queued before it is considered stuck.
const OBSERVER_QUEUE: usize = 16;

/// Fan-out of roster snapshots to connected directors.
///
/// Cloneable — all clones share the same observer set.
#[derive(Clone, Default)]
pub struct DirectorBus {
    observers: Arc<RwLock<HashMap<u64, mpsc::Sender<Roster>>>>,
    next_id: Arc<AtomicU64>,
}

/// A registered observer. Dropping it does not unsubscribe; call
/// [`DirectorBus::unsubscribe`] with [`Subscription::id`].
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Roster>,
}

impl DirectorBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new observer.
    pub async fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OBSERVER_QUEUE);
        self.observers.write().await.insert(id, tx);
        debug!(director = id, "Director subscribed");
        Subscription { id, rx }
    }

    pub async fn unsubscribe(&self, id: u64) {
        if self.observers.write().await.remove(&id).is_some() {
            debug!(director = id, "Director unsubscribed");
        }
    }

    /// Number of live observers.
    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }

    /// Push `roster` to every observer, dropping the ones that cannot take it.
    pub async fn publish(&self, roster: Vec<Worker>) {
        let roster: Roster = Arc::new(roster);
        let mut observers = self.observers.write().await;
        observers.retain(|id, tx| match tx.try_send(Arc::clone(&roster)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(director = *id, "Director not keeping up, dropping it");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(name: &str) -> Worker {
        Worker {
            host: "host".into(),
            mac: "00:00:00:00:00:00".into(),
            process_name: name.into(),
            identity_token: "t".into(),
            active: true,
        }
    }

    #[tokio::test]
    async fn publish_reaches_every_observer() {
        let bus = DirectorBus::new();
        let mut a = bus.subscribe().await;
        let mut b = bus.subscribe().await;

        bus.publish(vec![worker("alpha")]).await;

        assert_eq!(a.rx.recv().await.unwrap()[0].process_name, "alpha");
        assert_eq!(b.rx.recv().await.unwrap()[0].process_name, "alpha");
    }

    #[tokio::test]
    async fn closed_observer_is_removed_without_affecting_others() {
        let bus = DirectorBus::new();
        let gone = bus.subscribe().await;
        let mut alive = bus.subscribe().await;
        drop(gone.rx);

        bus.publish(vec![worker("alpha")]).await;

        assert_eq!(bus.observer_count().await, 1);
        assert!(alive.rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn stuck_observer_is_dropped_once_its_queue_fills() {
        let bus = DirectorBus::new();
        let _stuck = bus.subscribe().await;
        let mut reader = bus.subscribe().await;

        for _ in 0..=OBSERVER_QUEUE {
            bus.publish(vec![worker("alpha")]).await;
            reader.rx.recv().await.unwrap();
        }

        assert_eq!(bus.observer_count().await, 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_observer() {
        let bus = DirectorBus::new();
        let sub = bus.subscribe().await;
        bus.unsubscribe(sub.id).await;
        assert_eq!(bus.observer_count().await, 0);
    }
}

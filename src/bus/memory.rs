//! In-process [`Bus`] backed by one `watch` channel per topic.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

use super::Bus;

#[derive(Debug)]
struct Topic {
    tx: watch::Sender<Option<Value>>,
    publishers: Arc<AtomicUsize>,
    leased_until: Option<Instant>,
}

impl Topic {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            publishers: Arc::new(AtomicUsize::new(0)),
            leased_until: None,
        }
    }

    fn count(&self, now: Instant) -> usize {
        let leased = self.leased_until.is_some_and(|until| now < until);
        self.publishers.load(Ordering::SeqCst) + usize::from(leased)
    }
}

/// Retained in-process bus.
///
/// In-process peers announce themselves with [`advertise`](Self::advertise);
/// peers bridged over the console hold a lease renewed by
/// [`Bus::refresh_publisher`]. Either way [`Bus::publisher_count`] reflects
/// whether anybody is on the other end.
#[derive(Debug, Default)]
pub struct MemoryBus {
    topics: DashMap<String, Topic>,
}

impl MemoryBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an external publisher on `topic` for the guard's lifetime.
    #[must_use]
    pub fn advertise(&self, topic: &str) -> PublisherGuard {
        let publishers = Arc::clone(
            &self
                .topics
                .entry(topic.to_string())
                .or_insert_with(Topic::new)
                .publishers,
        );
        publishers.fetch_add(1, Ordering::SeqCst);
        PublisherGuard { publishers }
    }

    /// Last value retained on `topic`.
    #[must_use]
    pub fn latest(&self, topic: &str) -> Option<Value> {
        self.topics
            .get(topic)
            .and_then(|topic| topic.tx.borrow().clone())
    }

    /// Names of all topics seen so far, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Bus for MemoryBus {
    fn publish(&self, topic: &str, message: Value) {
        let entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(Topic::new);
        entry.tx.send_replace(Some(message));
    }

    fn subscribe(&self, topic: &str) -> watch::Receiver<Option<Value>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(Topic::new)
            .tx
            .subscribe()
    }

    fn publisher_count(&self, topic: &str) -> usize {
        let now = Instant::now();
        self.topics.get(topic).map_or(0, |topic| topic.count(now))
    }

    fn refresh_publisher(&self, topic: &str, ttl: Duration) {
        let until = Instant::now() + ttl;
        let mut entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(Topic::new);
        entry.leased_until = Some(entry.leased_until.map_or(until, |current| current.max(until)));
    }
}

/// Keeps an external publisher registered until dropped.
#[derive(Debug)]
pub struct PublisherGuard {
    publishers: Arc<AtomicUsize>,
}

impl Drop for PublisherGuard {
    fn drop(&mut self) {
        self.publishers.fetch_sub(1, Ordering::SeqCst);
    }
}

//! Event Bus - topic based fan-out
//!
//! Every subscriber owns an unbounded queue, so `publish` never waits on a
//! consumer. Publishes to one topic are serialized under that topic's entry
//! lock, which gives every subscriber the same per-topic order. Closed
//! subscribers are pruned lazily on the next publish.

use dashmap::DashMap;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::event::{BusEvent, Topic};

const DEFAULT_BACKLOG_WARN_THRESHOLD: usize = 1024;

struct SubscriberSlot {
    id: u64,
    tx: mpsc::UnboundedSender<BusEvent>,
    depth: Arc<AtomicUsize>,
}

struct BusInner {
    topics: DashMap<Topic, Vec<SubscriberSlot>>,
    next_id: AtomicU64,
    published: AtomicU64,
    pruned: AtomicU64,
    backlog_warn_threshold: usize,
}

/// Bus statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub pruned_subscribers: u64,
}

/// In-process publish/subscribe bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_backlog_warning(DEFAULT_BACKLOG_WARN_THRESHOLD)
    }

    /// Bus that warns once a subscriber's queue reaches `threshold` events
    pub fn with_backlog_warning(threshold: usize) -> Self {
        let topics = DashMap::new();
        for topic in Topic::ALL {
            topics.insert(topic, Vec::new());
        }
        Self {
            inner: Arc::new(BusInner {
                topics,
                next_id: AtomicU64::new(1),
                published: AtomicU64::new(0),
                pruned: AtomicU64::new(0),
                backlog_warn_threshold: threshold.max(1),
            }),
        }
    }

    /// Subscribe to a topic. Only events published after this call are seen.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner
            .topics
            .entry(topic)
            .or_default()
            .push(SubscriberSlot {
                id,
                tx,
                depth: depth.clone(),
            });

        debug!(%topic, subscriber_id = id, "bus subscription added");
        Subscription {
            id,
            topic,
            rx,
            depth,
        }
    }

    /// Publish an event on its topic. Never blocks.
    ///
    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: impl Into<BusEvent>) -> usize {
        let event = event.into();
        let topic = event.topic();
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let Some(mut slots) = self.inner.topics.get_mut(&topic) else {
            return 0;
        };

        let before = slots.len();
        let threshold = self.inner.backlog_warn_threshold;
        slots.retain(|slot| {
            if slot.tx.send(event.clone()).is_err() {
                return false;
            }
            let depth = slot.depth.fetch_add(1, Ordering::Relaxed) + 1;
            if depth == threshold {
                warn!(
                    %topic,
                    subscriber_id = slot.id,
                    depth,
                    "bus subscriber is falling behind"
                );
            }
            true
        });

        let delivered = slots.len();
        let pruned = before - delivered;
        if pruned > 0 {
            self.inner.pruned.fetch_add(pruned as u64, Ordering::Relaxed);
            debug!(%topic, pruned, "pruned closed bus subscribers");
        }
        delivered
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .topics
            .get(&topic)
            .map(|slots| slots.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            pruned_subscribers: self.inner.pruned.load(Ordering::Relaxed),
        }
    }

    /// Run `handler` for every event on `topic` in a dedicated task.
    ///
    /// Handler errors and panics are logged and the loop moves on to the next
    /// event; they never reach the publisher or other subscribers. The task
    /// ends when the bus is dropped or the returned handle is aborted.
    pub fn spawn_subscriber<F, Fut>(&self, topic: Topic, name: &str, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(BusEvent) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut subscription = self.subscribe(topic);
        let name = name.to_string();

        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                match AssertUnwindSafe(handler(event)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(subscriber = %name, %topic, error = %e, "bus subscriber failed on event");
                    }
                    Err(_) => {
                        error!(subscriber = %name, %topic, "bus subscriber panicked on event");
                    }
                }
            }
            debug!(subscriber = %name, %topic, "bus subscriber loop finished");
        })
    }
}

/// Receiving side of a topic subscription.
///
/// Dropping it unsubscribes; the bus notices on its next publish.
pub struct Subscription {
    id: u64,
    topic: Topic,
    rx: mpsc::UnboundedReceiver<BusEvent>,
    depth: Arc<AtomicUsize>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Next event in publish order. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        let event = self.rx.recv().await;
        if event.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        event
    }

    pub fn try_recv(&mut self) -> Option<BusEvent> {
        let event = self.rx.try_recv().ok();
        if event.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        event
    }

    /// Events queued but not yet received
    pub fn backlog(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Stop receiving; already queued events can still be drained
    pub fn close(&mut self) {
        self.rx.close();
    }
}

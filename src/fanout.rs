use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bincode::{deserialize, serialize};
use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::window::Window;

type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;

/// Post-increment counts of one hit, keyed by window.
pub type Counts = BTreeMap<Window, u64>;

pub type SubscriberId = u64;

/// Payload delivered to subscribers for every recorded hit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HitEvent {
    /// Publish sequence number; a gap means this subscriber missed events.
    pub seq: u64,
    pub url: String,
    pub counts: Counts,
}

impl HitEvent {
    #[inline]
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serialize(self)?)
    }

    #[inline]
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(deserialize(data)?)
    }
}

/// Best-effort broadcast of hit events.
///
/// `publish` never waits: a subscriber whose queue is full misses the event,
/// and a subscriber whose receiver is gone is removed.
#[derive(Clone)]
pub struct Fanout {
    subscribers: Arc<DashMap<SubscriberId, mpsc::Sender<HitEvent>>>,
    next_id: Arc<AtomicU64>,
    seq: Arc<AtomicU64>,
    published: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    buffer: usize,
}

impl Fanout {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Arc::new(DashMap::default()),
            next_id: Arc::new(AtomicU64::new(1)),
            seq: Arc::new(AtomicU64::new(0)),
            published: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            buffer,
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.insert(id, tx);
        debug!("subscriber {} added", id);
        Subscription {
            id,
            rx,
            fanout: self.clone(),
        }
    }

    /// Returns `false` if `id` was not subscribed.
    #[inline]
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn publish(&self, url: &str, counts: &Counts) {
        if self.subscribers.is_empty() {
            return;
        }
        let event = HitEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            url: url.to_owned(),
            counts: counts.clone(),
        };
        self.published.fetch_add(1, Ordering::SeqCst);

        let mut closed = Vec::new();
        for mut subscriber in self.subscribers.iter_mut() {
            if let Err(e) = subscriber.value_mut().try_send(event.clone()) {
                if e.is_disconnected() {
                    closed.push(*subscriber.key());
                } else {
                    self.dropped.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        "subscriber {} queue is full, dropping event seq: {}",
                        subscriber.key(),
                        event.seq
                    );
                }
            }
        }
        for id in closed {
            if self.subscribers.remove(&id).is_some() {
                warn!("subscriber {} disconnected, removed", id);
            }
        }
    }

    #[inline]
    pub fn subscribers(&self) -> usize {
        self.subscribers.len()
    }

    #[inline]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

/// A live feed of hit events. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<HitEvent>,
    fanout: Fanout,
}

impl Subscription {
    #[inline]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for the next event; `None` once unsubscribed and drained.
    #[inline]
    pub async fn recv(&mut self) -> Option<HitEvent> {
        self.rx.next().await
    }

    /// Returns an already queued event without waiting.
    #[inline]
    pub fn try_recv(&mut self) -> Option<HitEvent> {
        self.rx.try_next().ok().flatten()
    }
}

impl Stream for Subscription {
    type Item = HitEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.fanout.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(n: u64) -> Counts {
        Window::ACTIVE.iter().map(|w| (*w, n)).collect()
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let fanout = Fanout::new(4);
        fanout.publish("/a", &counts(1));
        assert_eq!(fanout.published(), 0);
        assert_eq!(fanout.dropped(), 0);
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let fanout = Fanout::new(16);
        let mut sub = fanout.subscribe();
        for (i, url) in ["/a", "/b", "/c"].iter().enumerate() {
            fanout.publish(url, &counts(i as u64 + 1));
        }
        let mut urls = Vec::new();
        for _ in 0..3 {
            let event = sub.recv().await.unwrap();
            urls.push(event.url);
        }
        assert_eq!(urls, vec!["/a", "/b", "/c"]);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let fanout = Fanout::new(0);
        let mut sub = fanout.subscribe();
        for _ in 0..5 {
            fanout.publish("/a", &counts(1));
        }
        assert_eq!(fanout.published(), 5);
        assert!(fanout.dropped() > 0);
        let first = sub.try_recv().unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(fanout.subscribers(), 1);
    }

    #[test]
    fn dropped_subscription_is_removed() {
        let fanout = Fanout::new(4);
        let sub = fanout.subscribe();
        let keep = fanout.subscribe();
        assert_eq!(fanout.subscribers(), 2);
        drop(sub);
        assert_eq!(fanout.subscribers(), 1);
        assert!(fanout.unsubscribe(keep.id()));
        assert!(!fanout.unsubscribe(keep.id()));
        fanout.publish("/a", &counts(1));
        assert_eq!(fanout.subscribers(), 0);
    }

    #[test]
    fn event_encoding() {
        let event = HitEvent {
            seq: 7,
            url: "https://example.com/x".into(),
            counts: counts(3),
        };
        let bytes = event.encode().unwrap();
        assert_eq!(HitEvent::decode(&bytes).unwrap(), event);
        assert!(HitEvent::decode(&[0xff]).is_err());
    }
}

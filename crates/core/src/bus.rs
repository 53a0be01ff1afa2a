//! Push-notification fabric.
//!
//! Fan-out to any number of subscribers, each behind its own bounded
//! ring. Publishing never blocks: when a ring is full the oldest
//! non-heartbeat event is dropped and the subscriber sees a compaction
//! notice on its next delivery. A heartbeat task pings every client;
//! clients that stop answering are disconnected.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::event::BusEvent;

pub const DEFAULT_RING_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Bounded per-subscriber buffer. Overflow drops the oldest
/// non-heartbeat event first and counts what was lost.
struct EventRing {
    buf: VecDeque<BusEvent>,
    capacity: usize,
    dropped: u64,
}

impl EventRing {
    fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    fn push(&mut self, event: BusEvent) {
        if self.buf.len() >= self.capacity {
            let victim = self
                .buf
                .iter()
                .position(|e| !e.is_heartbeat())
                .unwrap_or(0);
            self.buf.remove(victim);
            self.dropped += 1;
        }
        self.buf.push_back(event);
    }

    fn pop(&mut self) -> Option<BusEvent> {
        if self.dropped > 0 {
            let count = std::mem::take(&mut self.dropped);
            return Some(BusEvent::EventsDropped { count });
        }
        self.buf.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty() && self.dropped == 0
    }
}

struct SubscriberInner {
    id: SubscriberId,
    ring: Mutex<EventRing>,
    notify: Notify,
    last_pong: Mutex<Instant>,
    closed: AtomicBool,
}

type Registry = DashMap<SubscriberId, Arc<SubscriberInner>>;

/// Client-side handle for one subscription. Dropping it unregisters
/// the subscriber.
pub struct Subscription {
    inner: Arc<SubscriberInner>,
    registry: Arc<Registry>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.inner.id
    }

    /// Next event for this subscriber, in publish order. Returns
    /// `None` once the bus disconnected the client and the ring is
    /// drained.
    pub async fn next(&self) -> Option<BusEvent> {
        loop {
            {
                let mut ring = self.inner.ring.lock();
                if let Some(event) = ring.pop() {
                    return Some(event);
                }
                if self.inner.closed.load(Ordering::Acquire) && ring.is_empty() {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Record a liveness answer from the client.
    pub fn pong(&self) {
        *self.inner.last_pong.lock() = Instant::now();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.remove(&self.inner.id);
    }
}

pub struct EventBus {
    subscribers: Arc<Registry>,
    ring_capacity: usize,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
}

impl EventBus {
    pub fn new(heartbeat_interval: Duration, heartbeat_timeout: Duration) -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            ring_capacity: DEFAULT_RING_CAPACITY,
            heartbeat_interval,
            heartbeat_timeout,
        }
    }

    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity.max(1);
        self
    }

    pub fn subscribe(&self) -> Subscription {
        let inner = Arc::new(SubscriberInner {
            id: SubscriberId::new(),
            ring: Mutex::new(EventRing::new(self.ring_capacity)),
            notify: Notify::new(),
            last_pong: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        });
        self.subscribers.insert(inner.id, Arc::clone(&inner));
        debug!(subscriber = %inner.id, "Client subscribed");
        Subscription {
            inner,
            registry: Arc::clone(&self.subscribers),
        }
    }

    /// Fan an event out to every live subscriber. Never blocks; slow
    /// subscribers fall behind in their own ring only.
    pub fn publish(&self, event: BusEvent) {
        for entry in self.subscribers.iter() {
            let sub = entry.value();
            if sub.closed.load(Ordering::Acquire) {
                continue;
            }
            sub.ring.lock().push(event.clone());
            sub.notify.notify_one();
        }
    }

    pub fn pong(&self, id: SubscriberId) -> bool {
        if let Some(sub) = self.subscribers.get(&id) {
            *sub.last_pong.lock() = Instant::now();
            true
        } else {
            false
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn disconnect(&self, id: SubscriberId) {
        if let Some((_, sub)) = self.subscribers.remove(&id) {
            sub.closed.store(true, Ordering::Release);
            sub.notify.notify_one();
            info!(subscriber = %id, "Client disconnected");
        }
    }

    /// Heartbeat loop: ping every interval, drop clients whose last
    /// pong is older than the timeout. Runs until the token fires,
    /// then closes every subscription.
    pub async fn run_heartbeat(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.publish(BusEvent::heartbeat());
                    let stale: Vec<SubscriberId> = self
                        .subscribers
                        .iter()
                        .filter(|entry| entry.value().last_pong.lock().elapsed() > self.heartbeat_timeout)
                        .map(|entry| *entry.key())
                        .collect();
                    for id in stale {
                        self.disconnect(id);
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        let remaining: Vec<SubscriberId> =
            self.subscribers.iter().map(|entry| *entry.key()).collect();
        for id in remaining {
            self.disconnect(id);
        }
    }
}

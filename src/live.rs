//! Live fan-out of storage events.
//!
//! Dashboards subscribe with a client id and receive a [`LiveMessage`] for
//! every committed span batch, log batch, and issue change. Each subscriber
//! owns a bounded buffer; when it is full the oldest buffered message is
//! evicted, so a slow client loses history instead of stalling publishers.
//!
//! ```no_run
//! use spanvault::live::{LiveBroadcaster, LiveKind, LiveMessage};
//!
//! # async fn demo() {
//! let live = LiveBroadcaster::new(1_000);
//! let mut sub = live.subscribe("dashboard-1");
//! live.publish(LiveMessage::new(LiveKind::Spans, serde_json::json!({ "count": 3 })));
//! let msg = sub.recv().await;
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use tokio::sync::Notify;

/// Default per-subscriber buffer capacity.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1_000;

// =============================================================================
// Messages
// =============================================================================

/// What a live message describes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LiveKind {
    Spans,
    Logs,
    Issues,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveMessage {
    pub kind: LiveKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl LiveMessage {
    pub fn new(kind: LiveKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Subscriber buffer
// =============================================================================

struct Mailbox {
    buffer: Mutex<VecDeque<LiveMessage>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
    capacity: usize,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, message: LiveMessage) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        if buffer.len() >= self.capacity {
            buffer.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        buffer.push_back(message);
        drop(buffer);
        self.notify.notify_one();
        true
    }

    fn pop(&self) -> Option<LiveMessage> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn len(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns false if already closed.
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.notify.notify_one();
        true
    }
}

// =============================================================================
// Broadcaster
// =============================================================================

struct Shared {
    subscribers: DashMap<String, Arc<Mailbox>>,
    capacity: usize,
    disposed: AtomicBool,
}

/// Fan-out hub. Cheap to clone; clones share subscribers.
#[derive(Clone)]
pub struct LiveBroadcaster {
    shared: Arc<Shared>,
}

impl LiveBroadcaster {
    /// Create a broadcaster whose subscribers buffer up to `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                subscribers: DashMap::new(),
                capacity: capacity.max(1),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Attach a subscriber. Re-using a client id completes the previous subscription.
    ///
    /// After [`dispose`](Self::dispose) the returned subscription is already complete.
    pub fn subscribe(&self, client_id: impl Into<String>) -> LiveSubscription {
        let client_id = client_id.into();
        let mailbox = Arc::new(Mailbox::new(self.shared.capacity));

        if self.shared.disposed.load(Ordering::Acquire) {
            mailbox.close();
        } else {
            if let Some(previous) = self
                .shared
                .subscribers
                .insert(client_id.clone(), Arc::clone(&mailbox))
            {
                previous.close();
                tracing::debug!(client_id = %client_id, "Live subscriber replaced");
            }
            // `dispose` may have collected ids before this insert landed.
            if self.shared.disposed.load(Ordering::Acquire) {
                self.shared
                    .subscribers
                    .remove_if(&client_id, |_, current| Arc::ptr_eq(current, &mailbox));
                mailbox.close();
            }
        }

        LiveSubscription {
            client_id,
            mailbox,
            hub: Arc::downgrade(&self.shared),
        }
    }

    /// Detach and complete a subscriber. Returns whether it existed.
    pub fn unsubscribe(&self, client_id: &str) -> bool {
        match self.shared.subscribers.remove(client_id) {
            Some((_, mailbox)) => {
                mailbox.close();
                true
            }
            None => false,
        }
    }

    /// Deliver `message` to every subscriber without waiting on any of them.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, message: LiveMessage) -> usize {
        if self.shared.disposed.load(Ordering::Acquire) {
            return 0;
        }
        self.shared
            .subscribers
            .iter()
            .filter(|entry| entry.value().push(message.clone()))
            .count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    /// Complete every subscriber and refuse new messages. Idempotent.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let ids: Vec<String> = self
            .shared
            .subscribers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut completed = 0usize;
        for id in ids {
            if let Some((_, mailbox)) = self.shared.subscribers.remove(&id)
                && mailbox.close()
            {
                completed += 1;
            }
        }
        tracing::info!(subscribers = completed, "Live broadcaster disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }
}

impl Default for LiveBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl std::fmt::Debug for LiveBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveBroadcaster")
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.shared.capacity)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Receiving end for one client. Dropping it unsubscribes.
pub struct LiveSubscription {
    client_id: String,
    mailbox: Arc<Mailbox>,
    hub: Weak<Shared>,
}

impl LiveSubscription {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Next message; `None` once the subscription is complete and drained.
    pub async fn recv(&mut self) -> Option<LiveMessage> {
        loop {
            if let Some(message) = self.mailbox.pop() {
                return Some(message);
            }
            if self.mailbox.closed.load(Ordering::Acquire) {
                return self.mailbox.pop();
            }
            self.mailbox.notify.notified().await;
        }
    }

    /// Next buffered message without waiting.
    pub fn try_recv(&mut self) -> Option<LiveMessage> {
        self.mailbox.pop()
    }

    /// Messages evicted from this subscriber's buffer.
    pub fn dropped(&self) -> u64 {
        self.mailbox.dropped.load(Ordering::Relaxed)
    }

    pub fn buffered(&self) -> usize {
        self.mailbox.len()
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.closed.load(Ordering::Acquire)
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        self.mailbox.close();
        if let Some(hub) = self.hub.upgrade() {
            // A newer subscription may own the id by now.
            hub.subscribers
                .remove_if(&self.client_id, |_, current| Arc::ptr_eq(current, &self.mailbox));
        }
    }
}

impl std::fmt::Debug for LiveSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSubscription")
            .field("client_id", &self.client_id)
            .field("buffered", &self.buffered())
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn msg(n: i64) -> LiveMessage {
        LiveMessage::new(LiveKind::Spans, json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let live = LiveBroadcaster::new(16);
        let mut subs: Vec<_> = (0..3).map(|i| live.subscribe(format!("c{i}"))).collect();

        assert_eq!(live.publish(msg(1)), 3);
        for sub in &mut subs {
            let got = sub.recv().await.unwrap();
            assert_eq!(got.payload["n"], 1);
        }
    }

    #[tokio::test]
    async fn test_full_buffer_drops_oldest() {
        let live = LiveBroadcaster::new(3);
        let mut sub = live.subscribe("slow");
        for n in 0..5 {
            live.publish(msg(n));
        }

        assert_eq!(sub.dropped(), 2);
        let received: Vec<i64> = std::iter::from_fn(|| sub.try_recv())
            .map(|m| m.payload["n"].as_i64().unwrap())
            .collect();
        assert_eq!(received, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_affect_others() {
        let live = LiveBroadcaster::new(2);
        let slow = live.subscribe("slow");
        let mut fast = live.subscribe("fast");

        for n in 0..4 {
            live.publish(msg(n));
            assert_eq!(fast.recv().await.unwrap().payload["n"], n);
        }
        assert_eq!(slow.dropped(), 2);
        assert_eq!(fast.dropped(), 0);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let live = LiveBroadcaster::new(8);
        let mut sub = live.subscribe("waiter");
        let publisher = live.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(msg(7));
        });
        let got = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.payload["n"], 7);
    }

    #[tokio::test]
    async fn test_unsubscribe_completes_stream() {
        let live = LiveBroadcaster::new(8);
        let mut sub = live.subscribe("c");
        live.publish(msg(1));
        assert!(live.unsubscribe("c"));
        assert!(!live.unsubscribe("c"));

        // Buffered messages are still drained before completion.
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
        assert_eq!(live.publish(msg(2)), 0);
    }

    #[tokio::test]
    async fn test_dispose_completes_all_once() {
        let live = LiveBroadcaster::new(8);
        let mut a = live.subscribe("a");
        let mut b = live.subscribe("b");
        live.dispose();
        live.dispose();

        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
        assert_eq!(live.subscriber_count(), 0);
        assert_eq!(live.publish(msg(1)), 0);
        assert!(live.subscribe("late").is_closed());
    }

    #[test]
    fn test_subscribe_racing_dispose_never_leaks() {
        for _ in 0..50 {
            let live = LiveBroadcaster::new(4);
            let barrier = std::sync::Barrier::new(5);
            let subs = std::thread::scope(|scope| {
                let workers: Vec<_> = (0..4)
                    .map(|t| {
                        let (live, barrier) = (&live, &barrier);
                        scope.spawn(move || {
                            barrier.wait();
                            (0..25)
                                .map(|i| live.subscribe(format!("c{t}-{i}")))
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect();
                barrier.wait();
                live.dispose();
                workers
                    .into_iter()
                    .flat_map(|w| w.join().unwrap())
                    .collect::<Vec<_>>()
            });

            assert_eq!(live.subscriber_count(), 0);
            assert!(subs.iter().all(LiveSubscription::is_closed));
        }
    }

    #[tokio::test]
    async fn test_drop_subscription_unsubscribes() {
        let live = LiveBroadcaster::new(8);
        let sub = live.subscribe("c");
        assert_eq!(live.subscriber_count(), 1);
        drop(sub);
        assert_eq!(live.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_previous() {
        let live = LiveBroadcaster::new(8);
        let mut old = live.subscribe("c");
        let mut new = live.subscribe("c");
        assert!(old.recv().await.is_none());

        drop(old);
        assert_eq!(live.subscriber_count(), 1);
        live.publish(msg(5));
        assert_eq!(new.recv().await.unwrap().payload["n"], 5);
    }
}

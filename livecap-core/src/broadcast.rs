//! Multi-subscriber event fan-out.
//!
//! Each subscriber owns a bounded ring (default 256 events). When a ring
//! fills, the broadcaster evicts by class: oldest `First` (level ticks),
//! then oldest `Second` (deltas / ordinary chat events), and never `Never`
//! (finals, status, error, room_control). A subscriber whose ring is full of
//! un-evictable events is sent a synthetic `subscriber_slow` notice and
//! closed; other subscribers are unaffected.
//!
//! Delivery order per subscriber always matches publish order.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{LivecapError, Result};
use crate::events::{AudioEvent, ChatEvent, ChatPayload, TranscriptKind};

/// Per-subscriber ring capacity.
pub const RING_CAPACITY: usize = 256;

/// Upper bound on simultaneous subscribers. Policy default, not a protocol
/// contract.
pub const MAX_SUBSCRIBERS: usize = 32;

/// Eviction priority when a subscriber ring is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropClass {
    /// Dropped first (lossy by design).
    First,
    /// Dropped only when no `First` event remains.
    Second,
    /// Never evicted.
    Never,
}

/// Implemented by every event type a [`Broadcaster`] can carry.
pub trait BroadcastItem: Clone + Send + 'static {
    fn drop_class(&self) -> DropClass;

    /// Synthetic event delivered right before a hopelessly slow subscriber
    /// is closed.
    fn slow_subscriber_notice() -> Self;
}

impl BroadcastItem for AudioEvent {
    fn drop_class(&self) -> DropClass {
        match self {
            AudioEvent::Level(_) => DropClass::First,
            AudioEvent::Transcript(ev) if ev.kind == TranscriptKind::Delta => DropClass::Second,
            _ => DropClass::Never,
        }
    }

    fn slow_subscriber_notice() -> Self {
        AudioEvent::error("subscriber_slow", false)
    }
}

impl BroadcastItem for ChatEvent {
    fn drop_class(&self) -> DropClass {
        match self.payload {
            ChatPayload::Status { .. } | ChatPayload::Error { .. } | ChatPayload::RoomControl { .. } => {
                DropClass::Never
            }
            _ => DropClass::Second,
        }
    }

    fn slow_subscriber_notice() -> Self {
        ChatEvent::error("subscriber_slow")
    }
}

struct SubQueue<E> {
    ring: VecDeque<E>,
    dropped: u64,
    closed: bool,
}

struct Shared<E> {
    queue: Mutex<SubQueue<E>>,
    notify: Notify,
}

/// Fan-out hub. Owns every subscriber ring; subscribers hold read handles.
pub struct Broadcaster<E: BroadcastItem> {
    subs: Mutex<Vec<Arc<Shared<E>>>>,
    capacity: usize,
    max_subscribers: usize,
}

impl<E: BroadcastItem> Default for Broadcaster<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BroadcastItem> Broadcaster<E> {
    pub fn new() -> Self {
        Self::with_limits(RING_CAPACITY, MAX_SUBSCRIBERS)
    }

    /// Alternate limits, used by tests exercising overflow behavior.
    pub fn with_limits(capacity: usize, max_subscribers: usize) -> Self {
        Self {
            subs: Mutex::new(Vec::new()),
            capacity,
            max_subscribers,
        }
    }

    /// Register a new subscriber.
    ///
    /// # Errors
    /// `LivecapError::SubscriberLimit` when the subscriber cap is reached.
    pub fn subscribe(&self) -> Result<Subscription<E>> {
        let mut subs = self.subs.lock();
        subs.retain(|s| !s.queue.lock().closed);
        if subs.len() >= self.max_subscribers {
            return Err(LivecapError::SubscriberLimit(self.max_subscribers));
        }
        let shared = Arc::new(Shared {
            queue: Mutex::new(SubQueue {
                ring: VecDeque::with_capacity(self.capacity),
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
        });
        subs.push(Arc::clone(&shared));
        Ok(Subscription { shared })
    }

    /// Deliver `event` to every live subscriber, applying the eviction policy
    /// independently per ring.
    pub fn publish(&self, event: E) {
        let mut subs = self.subs.lock();
        subs.retain(|s| !s.queue.lock().closed);
        for sub in subs.iter() {
            let mut q = sub.queue.lock();
            if q.closed {
                continue;
            }
            if q.ring.len() >= self.capacity && !Self::evict(&mut q) {
                // Nothing evictable: the ring is wall-to-wall un-droppable
                // events. A droppable incoming event is simply lost; an
                // un-droppable one means the subscriber can never catch up.
                q.dropped += 1;
                if event.drop_class() == DropClass::Never {
                    q.ring.push_back(E::slow_subscriber_notice());
                    q.closed = true;
                    sub.notify.notify_waiters();
                }
                continue;
            }
            q.ring.push_back(event.clone());
            drop(q);
            sub.notify.notify_waiters();
        }
    }

    /// Remove the oldest evictable event. Returns false when every queued
    /// event is `Never`.
    fn evict(q: &mut SubQueue<E>) -> bool {
        for wanted in [DropClass::First, DropClass::Second] {
            if let Some(idx) = q.ring.iter().position(|e| e.drop_class() == wanted) {
                q.ring.remove(idx);
                q.dropped += 1;
                return true;
            }
        }
        false
    }

    /// Deliver an optional last event to everyone, then close all rings.
    pub fn close_all(&self, last: Option<E>) {
        let mut subs = self.subs.lock();
        for sub in subs.drain(..) {
            let mut q = sub.queue.lock();
            if q.closed {
                continue;
            }
            if let Some(ev) = &last {
                // Terminal event is delivered even to a full ring.
                q.ring.push_back(ev.clone());
            }
            q.closed = true;
            drop(q);
            sub.notify.notify_waiters();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subs.lock();
        subs.retain(|s| !s.queue.lock().closed);
        subs.len()
    }
}

/// Read handle for one subscriber. Dropping it unsubscribes.
pub struct Subscription<E: BroadcastItem> {
    shared: Arc<Shared<E>>,
}

impl<E: BroadcastItem> Subscription<E> {
    /// Next event, in publish order. Returns `None` once the subscription is
    /// closed and drained.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register with the notifier before checking the ring: the hub
            // wakes with notify_waiters(), which stores no permit, so a
            // notify landing between the check and the await would otherwise
            // be lost — terminally so for close_all, which is never
            // followed by another notify.
            notified.as_mut().enable();
            {
                let mut q = self.shared.queue.lock();
                if let Some(ev) = q.ring.pop_front() {
                    return Some(ev);
                }
                if q.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant used by tests and drain loops.
    pub fn try_recv(&mut self) -> Option<E> {
        self.shared.queue.lock().ring.pop_front()
    }

    /// Events lost to this subscriber so far.
    pub fn dropped_count(&self) -> u64 {
        self.shared.queue.lock().dropped
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.lock().closed
    }
}

impl<E: BroadcastItem> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.shared.queue.lock().closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{LevelEvent, TranscriptEvent};

    fn level(t: f64) -> AudioEvent {
        AudioEvent::Level(LevelEvent {
            rms: 0.1,
            peak: 0.2,
            t,
        })
    }

    fn transcript(kind: TranscriptKind, text: &str) -> AudioEvent {
        AudioEvent::Transcript(TranscriptEvent {
            kind,
            text: text.into(),
            confidence: 1.0,
            seg_start: 0.0,
            seg_end: 1.0,
            session_id: "s".into(),
        })
    }

    fn text_of(ev: &AudioEvent) -> &str {
        match ev {
            AudioEvent::Transcript(t) => &t.text,
            _ => panic!("expected transcript"),
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let hub = Broadcaster::<AudioEvent>::new();
        let mut sub = hub.subscribe().expect("subscribe");
        hub.publish(transcript(TranscriptKind::Delta, "a"));
        hub.publish(transcript(TranscriptKind::Final, "b"));
        assert_eq!(text_of(&sub.recv().await.expect("first")), "a");
        assert_eq!(text_of(&sub.recv().await.expect("second")), "b");
    }

    #[test]
    fn full_ring_drops_levels_before_deltas_and_never_finals() {
        let hub = Broadcaster::<AudioEvent>::with_limits(3, 4);
        let mut sub = hub.subscribe().expect("subscribe");

        hub.publish(level(0.0));
        hub.publish(transcript(TranscriptKind::Delta, "d1"));
        hub.publish(transcript(TranscriptKind::Final, "f1"));
        // Ring full. Level evicted first.
        hub.publish(transcript(TranscriptKind::Final, "f2"));
        assert_eq!(sub.dropped_count(), 1);
        // Full again with [d1, f1, f2]; delta goes next.
        hub.publish(transcript(TranscriptKind::Final, "f3"));
        assert_eq!(sub.dropped_count(), 2);

        let drained: Vec<String> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| text_of(&e).to_string())
            .collect();
        assert_eq!(drained, vec!["f1", "f2", "f3"]);
    }

    #[test]
    fn hopeless_subscriber_gets_notice_then_closes() {
        let hub = Broadcaster::<AudioEvent>::with_limits(2, 4);
        let mut sub = hub.subscribe().expect("subscribe");
        hub.publish(transcript(TranscriptKind::Final, "f1"));
        hub.publish(transcript(TranscriptKind::Final, "f2"));
        // Ring is all finals; another final cannot fit.
        hub.publish(transcript(TranscriptKind::Final, "f3"));
        assert!(sub.is_closed());

        assert_eq!(text_of(&sub.try_recv().expect("f1")), "f1");
        assert_eq!(text_of(&sub.try_recv().expect("f2")), "f2");
        match sub.try_recv().expect("notice") {
            AudioEvent::Error(e) => assert_eq!(e.reason, "subscriber_slow"),
            other => panic!("expected slow-subscriber notice, got {other:?}"),
        }
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn slow_subscriber_does_not_affect_others() {
        let hub = Broadcaster::<AudioEvent>::with_limits(2, 4);
        let mut slow = hub.subscribe().expect("slow");
        let mut healthy = hub.subscribe().expect("healthy");

        for i in 0..5 {
            hub.publish(transcript(TranscriptKind::Final, &format!("f{i}")));
            // Healthy subscriber keeps up.
            assert_eq!(text_of(&healthy.try_recv().expect("keep up")), format!("f{i}"));
        }
        assert!(slow.is_closed());
        assert!(!healthy.is_closed());
        assert!(slow.dropped_count() > 0);
        assert_eq!(healthy.dropped_count(), 0);
    }

    #[tokio::test]
    async fn parked_receiver_observes_close() {
        let hub = std::sync::Arc::new(Broadcaster::<AudioEvent>::new());
        let mut sub = hub.subscribe().expect("subscribe");
        let waiter = tokio::spawn(async move {
            let first = sub.recv().await;
            (first, sub.recv().await.is_none())
        });
        // Let the waiter park inside recv before the terminal notify fires.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        hub.close_all(Some(AudioEvent::status("stopped", None)));

        let (first, drained) = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("parked receiver missed the close notify")
            .expect("waiter task panicked");
        match first.expect("terminal status") {
            AudioEvent::Status(s) => assert_eq!(s.stage, "stopped"),
            other => panic!("expected status, got {other:?}"),
        }
        assert!(drained);
    }

    #[tokio::test]
    async fn close_all_delivers_terminal_event_then_none() {
        let hub = Broadcaster::<AudioEvent>::new();
        let mut sub = hub.subscribe().expect("subscribe");
        hub.close_all(Some(AudioEvent::status("stopped", None)));
        match sub.recv().await.expect("terminal status") {
            AudioEvent::Status(s) => assert_eq!(s.stage, "stopped"),
            other => panic!("expected status, got {other:?}"),
        }
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn subscriber_limit_enforced() {
        let hub = Broadcaster::<AudioEvent>::with_limits(4, 2);
        let _a = hub.subscribe().expect("first");
        let _b = hub.subscribe().expect("second");
        assert!(matches!(
            hub.subscribe(),
            Err(LivecapError::SubscriberLimit(2))
        ));
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let hub = Broadcaster::<AudioEvent>::with_limits(4, 2);
        {
            let _a = hub.subscribe().expect("first");
            assert_eq!(hub.subscriber_count(), 1);
        }
        assert_eq!(hub.subscriber_count(), 0);
        let _b = hub.subscribe().expect("slot freed");
    }

    #[test]
    fn chat_control_frames_are_never_dropped() {
        let hub = Broadcaster::<ChatEvent>::with_limits(2, 4);
        let mut sub = hub.subscribe().expect("subscribe");
        hub.publish(ChatEvent::new(ChatPayload::Chat {
            user: "u".into(),
            content: "one".into(),
        }));
        hub.publish(ChatEvent::status("reconnecting", Some(1)));
        hub.publish(ChatEvent::new(ChatPayload::RoomControl {
            status: 3,
            message: "closed".into(),
        }));
        // The plain chat message was evicted in favor of control frames.
        assert_eq!(sub.dropped_count(), 1);
        let kinds: Vec<DropClass> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| e.drop_class())
            .collect();
        assert_eq!(kinds, vec![DropClass::Never, DropClass::Never]);
    }
}

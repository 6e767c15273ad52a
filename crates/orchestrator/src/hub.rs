//! In-process pub/sub fan-out.
//!
//! One subscriber list per conversation plus a firehose list for
//! conversation-level notifications. Delivery is best-effort from the
//! writer's perspective: `publish` pushes into bounded per-subscriber
//! queues and never blocks; a subscriber whose queue is full is dropped
//! rather than stalling the append path.
//!
//! Unregistration is deterministic: [`Subscription`] and
//! [`FirehoseSubscription`] remove themselves from the hub on drop, so a
//! cancelled long-poll cannot leak its slot.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use parley_domain::{Event, EventType};

/// Queue depth per subscriber. Slow consumers are dropped at overflow.
const SUBSCRIBER_QUEUE: usize = 256;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hub
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct EventSub {
    id: u64,
    include_guidance: bool,
    tx: mpsc::Sender<Event>,
}

struct FirehoseSub {
    id: u64,
    tx: mpsc::Sender<i64>,
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    by_conversation: HashMap<i64, Vec<EventSub>>,
    firehose: Vec<FirehoseSub>,
}

impl HubInner {
    fn remove(&mut self, id: u64) {
        for subs in self.by_conversation.values_mut() {
            subs.retain(|s| s.id != id);
        }
        self.by_conversation.retain(|_, subs| !subs.is_empty());
        self.firehose.retain(|s| s.id != id);
    }

    fn notify_firehose(&mut self, conv: i64) {
        self.firehose.retain(|sub| match sub.tx.try_send(conv) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subscriber = sub.id, "firehose overflow — dropping subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// Cheap to clone; clones share the subscriber registry.
#[derive(Clone, Default)]
pub struct SubscriptionHub {
    inner: Arc<Mutex<HubInner>>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for one conversation's events.
    pub fn subscribe(&self, conv: i64, include_guidance: bool) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            let id = inner.next_id;
            inner.by_conversation.entry(conv).or_default().push(EventSub {
                id,
                include_guidance,
                tx,
            });
            id
        };
        Subscription {
            id,
            rx,
            hub: self.inner.clone(),
        }
    }

    /// Register a firehose subscriber (conversation ids with activity).
    pub fn subscribe_conversations(&self) -> FirehoseSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            let id = inner.next_id;
            inner.firehose.push(FirehoseSub { id, tx });
            id
        };
        FirehoseSubscription {
            id,
            rx,
            hub: self.inner.clone(),
        }
    }

    /// Remove a subscriber by id. Safe to call twice.
    pub fn unsubscribe(&self, id: u64) {
        self.inner.lock().remove(id);
    }

    /// Deliver an event to the conversation's subscribers and ping the
    /// firehose. Called with the conversation's write lock held so
    /// subscribers observe events in seq order.
    pub fn publish(&self, event: &Event) {
        let mut inner = self.inner.lock();
        if let Some(subs) = inner.by_conversation.get_mut(&event.conversation) {
            subs.retain(|sub| {
                if event.event_type == EventType::Guidance && !sub.include_guidance {
                    return true;
                }
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            conversation = event.conversation,
                            subscriber = sub.id,
                            "subscriber queue overflow — dropping subscriber"
                        );
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
        }
        inner.notify_firehose(event.conversation);
    }

    /// Announce a conversation with no event attached (creation).
    pub fn announce_conversation(&self, conv: i64) {
        self.inner.lock().notify_firehose(conv);
    }

    /// Subscriber count for one conversation (tests, monitoring).
    pub fn subscriber_count(&self, conv: i64) -> usize {
        self.inner
            .lock()
            .by_conversation
            .get(&conv)
            .map_or(0, Vec::len)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscription handles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A live event subscription. Dropping it unregisters from the hub.
pub struct Subscription {
    id: u64,
    pub rx: mpsc::Receiver<Event>,
    hub: Arc<Mutex<HubInner>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.lock().remove(self.id);
    }
}

/// A live firehose subscription. Dropping it unregisters from the hub.
pub struct FirehoseSubscription {
    id: u64,
    pub rx: mpsc::Receiver<i64>,
    hub: Arc<Mutex<HubInner>>,
}

impl FirehoseSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<i64> {
        self.rx.recv().await
    }
}

impl Drop for FirehoseSubscription {
    fn drop(&mut self) {
        self.hub.lock().remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_domain::{EventPayload, Finality, MessagePayload};

    fn event(conv: i64, seq: u64, event_type: EventType) -> Event {
        Event {
            conversation: conv,
            seq,
            turn: 1,
            event_type,
            finality: Finality::None,
            agent_id: "a".into(),
            ts: Utc::now(),
            payload: EventPayload::Message(MessagePayload::text("x")),
        }
    }

    #[tokio::test]
    async fn publish_reaches_subscriber_in_order() {
        let hub = SubscriptionHub::new();
        let mut sub = hub.subscribe(1, false);
        hub.publish(&event(1, 1, EventType::Message));
        hub.publish(&event(1, 2, EventType::Message));
        assert_eq!(sub.recv().await.unwrap().seq, 1);
        assert_eq!(sub.recv().await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn guidance_is_filtered_unless_requested() {
        let hub = SubscriptionHub::new();
        let mut quiet = hub.subscribe(1, false);
        let mut chatty = hub.subscribe(1, true);
        hub.publish(&event(1, 1, EventType::Guidance));
        hub.publish(&event(1, 2, EventType::Message));
        // The non-guidance subscriber sees only the message.
        assert_eq!(quiet.recv().await.unwrap().seq, 2);
        assert_eq!(chatty.recv().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn other_conversations_are_invisible() {
        let hub = SubscriptionHub::new();
        let mut sub = hub.subscribe(1, false);
        hub.publish(&event(2, 1, EventType::Message));
        hub.publish(&event(1, 1, EventType::Message));
        assert_eq!(sub.recv().await.unwrap().conversation, 1);
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let hub = SubscriptionHub::new();
        {
            let _sub = hub.subscribe(1, false);
            assert_eq!(hub.subscriber_count(1), 1);
        }
        assert_eq!(hub.subscriber_count(1), 0);
    }

    #[tokio::test]
    async fn overflow_drops_subscriber_not_writer() {
        let hub = SubscriptionHub::new();
        let _sub = hub.subscribe(1, false);
        for seq in 0..(SUBSCRIBER_QUEUE as u64 + 10) {
            hub.publish(&event(1, seq + 1, EventType::Message));
        }
        // The writer survived; the laggard was dropped.
        assert_eq!(hub.subscriber_count(1), 0);
    }

    #[tokio::test]
    async fn firehose_sees_all_conversations() {
        let hub = SubscriptionHub::new();
        let mut fh = hub.subscribe_conversations();
        hub.announce_conversation(3);
        hub.publish(&event(1, 1, EventType::Message));
        assert_eq!(fh.recv().await.unwrap(), 3);
        assert_eq!(fh.recv().await.unwrap(), 1);
    }
}

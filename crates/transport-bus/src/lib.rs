use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

const TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Lifecycle notifications a transport delivers for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Joined,
    Errored(String),
    TimedOut,
    Closed,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("unknown subscription {0}")]
    UnknownSubscription(u64),
}

pub type BusResult<T> = Result<T, BusError>;

/// Low-level joined flag of a subscription.
///
/// Some transports flip this without ever delivering [`SubscriptionStatus::Joined`],
/// so callers poll it alongside the status stream.
#[derive(Debug, Clone, Default)]
pub struct JoinProbe(Arc<AtomicBool>);

impl JoinProbe {
    pub fn is_joined(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, joined: bool) {
        self.0.store(joined, Ordering::SeqCst);
    }
}

/// A live subscription to one topic.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub topic: String,
    pub messages: broadcast::Receiver<BusMessage>,
    pub status: mpsc::UnboundedReceiver<SubscriptionStatus>,
    pub probe: JoinProbe,
}

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> BusResult<Subscription>;
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
    fn unsubscribe(&self, subscription: u64) -> BusResult<()>;
}

/// How [`LocalBus`] answers a subscribe handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum JoinBehavior {
    /// Flag the subscription joined and deliver `Joined`.
    #[default]
    Immediate,
    /// Flag the subscription joined but never deliver the status event.
    Silent,
    /// Leave the handshake pending forever.
    Never,
    /// Deliver `Errored` with the given reason.
    Reject(String),
}

#[derive(Debug)]
struct Subscriber {
    topic: String,
    status: mpsc::UnboundedSender<SubscriptionStatus>,
    probe: JoinProbe,
}

/// Simple in-memory bus for tests and non-transport contexts.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    behaviors: RwLock<HashMap<String, JoinBehavior>>,
    default_behavior: RwLock<JoinBehavior>,
    handshakes: Mutex<HashMap<String, usize>>,
    next_id: AtomicU64,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_join(behavior: JoinBehavior) -> Self {
        let bus = Self::default();
        *bus.default_behavior.write() = behavior;
        bus
    }

    pub fn set_join_behavior(&self, topic: &str, behavior: JoinBehavior) {
        self.behaviors.write().insert(topic.to_string(), behavior);
    }

    /// Number of subscribe handshakes performed for `topic`.
    pub fn subscribe_count(&self, topic: &str) -> usize {
        self.handshakes.lock().get(topic).copied().unwrap_or(0)
    }

    /// Number of subscriptions currently registered for `topic`.
    pub fn active_subscriptions(&self, topic: &str) -> usize {
        self.subscribers
            .lock()
            .values()
            .filter(|sub| sub.topic == topic)
            .count()
    }

    /// Tear down every subscription on `topic`, delivering `Closed` to each.
    pub fn force_close(&self, topic: &str) -> usize {
        let mut guard = self.subscribers.lock();
        let ids: Vec<u64> = guard
            .iter()
            .filter(|(_, sub)| sub.topic == topic)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(sub) = guard.remove(id) {
                sub.probe.set(false);
                let _ = sub.status.send(SubscriptionStatus::Closed);
            }
        }
        ids.len()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    fn behavior_for(&self, topic: &str) -> JoinBehavior {
        self.behaviors
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.read().clone())
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> BusResult<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let messages = self.sender_for(topic).subscribe();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let probe = JoinProbe::default();
        *self
            .handshakes
            .lock()
            .entry(topic.to_string())
            .or_default() += 1;

        match self.behavior_for(topic) {
            JoinBehavior::Immediate => {
                probe.set(true);
                let _ = status_tx.send(SubscriptionStatus::Joined);
            }
            JoinBehavior::Silent => probe.set(true),
            JoinBehavior::Never => {}
            JoinBehavior::Reject(reason) => {
                let _ = status_tx.send(SubscriptionStatus::Errored(reason));
            }
        }
        tracing::trace!(topic, subscription = id, "local bus subscribe");

        self.subscribers.lock().insert(
            id,
            Subscriber {
                topic: topic.to_string(),
                status: status_tx,
                probe: probe.clone(),
            },
        );
        Ok(Subscription {
            id,
            topic: topic.to_string(),
            messages,
            status: status_rx,
            probe,
        })
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let sender = self.sender_for(topic);
        sender
            .send(BusMessage {
                topic: topic.to_string(),
                payload,
            })
            .map(|_| ())
            .map_err(|_| BusError::Closed)
    }

    fn unsubscribe(&self, subscription: u64) -> BusResult<()> {
        let removed = self.subscribers.lock().remove(&subscription);
        match removed {
            Some(sub) => {
                sub.probe.set(false);
                Ok(())
            }
            None => Err(BusError::UnknownSubscription(subscription)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("room_lobby_signaling").expect("subscribe ok");
        bus.publish("room_lobby_signaling", Bytes::from_static(b"ping"))
            .expect("publish ok");
        let msg = sub.messages.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "room_lobby_signaling");
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
        assert_eq!(sub.status.recv().await, Some(SubscriptionStatus::Joined));
        assert!(sub.probe.is_joined());
    }

    #[tokio::test]
    async fn silent_join_flags_without_status_event() {
        let bus = LocalBus::with_default_join(JoinBehavior::Silent);
        let mut sub = bus.subscribe("quiet").expect("subscribe ok");
        assert!(sub.probe.is_joined());
        assert!(sub.status.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejected_join_reports_error() {
        let bus = LocalBus::new();
        bus.set_join_behavior("denied", JoinBehavior::Reject("no access".into()));
        let mut sub = bus.subscribe("denied").expect("subscribe ok");
        assert_eq!(
            sub.status.recv().await,
            Some(SubscriptionStatus::Errored("no access".into()))
        );
        assert!(!sub.probe.is_joined());
    }

    #[tokio::test]
    async fn force_close_notifies_and_forgets_subscribers() {
        let bus = LocalBus::new();
        let mut first = bus.subscribe("room").expect("subscribe ok");
        let _second = bus.subscribe("room").expect("subscribe ok");
        assert_eq!(bus.subscribe_count("room"), 2);
        assert_eq!(bus.force_close("room"), 2);
        assert_eq!(first.status.recv().await, Some(SubscriptionStatus::Joined));
        assert_eq!(first.status.recv().await, Some(SubscriptionStatus::Closed));
        assert!(!first.probe.is_joined());
        assert_eq!(bus.active_subscriptions("room"), 0);
        assert!(matches!(
            bus.unsubscribe(first.id),
            Err(BusError::UnknownSubscription(_))
        ));
    }

    #[test]
    fn publish_without_receivers_is_closed() {
        let bus = LocalBus::new();
        let result = bus.publish("nobody", Bytes::from_static(b"x"));
        assert!(matches!(result, Err(BusError::Closed)));
    }
}

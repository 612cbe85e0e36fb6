//! Room-scoped publish/subscribe over a [`transport_bus::Bus`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, timeout};
use transport_bus::{Bus, JoinProbe, Subscription, SubscriptionStatus};

use crate::config::SignalingConfig;
use crate::error::{ConnectError, PublishError};
use crate::message::{NegotiationMessage, RoomMessage};
use crate::observer::{ListenerHandle, Listeners};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Connecting,
    Subscribed,
    Closed,
    Errored,
    TimedOut,
}

impl ChannelState {
    /// Closed, errored and timed-out channels are dead bookkeeping.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChannelState::Closed | ChannelState::Errored | ChannelState::TimedOut
        )
    }
}

/// Handle to the subscription of one room. At most one exists per room.
#[derive(Debug)]
pub struct RoomChannel {
    room_id: String,
    name: String,
    state: watch::Receiver<ChannelState>,
}

impl RoomChannel {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }
}

/// Derive the transport topic for `room_id`.
pub fn channel_name(room_id: &str, max_len: usize) -> Result<String, ConnectError> {
    if room_id.is_empty() {
        return Err(ConnectError::InvalidRoom("room id is empty".into()));
    }
    let sanitized: String = room_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let name = format!("room_{sanitized}_signaling");
    if name.len() > max_len {
        return Err(ConnectError::InvalidRoom(format!(
            "channel name is {} characters, limit is {max_len}",
            name.len()
        )));
    }
    Ok(name)
}

/// Outbound half of the bus as seen by the negotiation engine.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn publish(&self, room_id: &str, message: NegotiationMessage)
    -> Result<(), PublishError>;
}

type JoinResolver = Arc<Mutex<Option<oneshot::Sender<Result<(), ConnectError>>>>>;
type Handshake = watch::Receiver<Option<Result<(), ConnectError>>>;

struct ChannelEntry {
    channel: Arc<RoomChannel>,
    state_tx: Arc<watch::Sender<ChannelState>>,
    subscription_id: u64,
    handshake: Handshake,
    tasks: Vec<JoinHandle<()>>,
}

impl ChannelEntry {
    fn shutdown(self, transport: &dyn Bus) {
        for task in &self.tasks {
            task.abort();
        }
        self.state_tx.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = ChannelState::Closed;
                true
            }
        });
        if let Err(err) = transport.unsubscribe(self.subscription_id) {
            tracing::warn!(
                channel = %self.channel.name,
                error = %err,
                "unsubscribe failed; dropping bookkeeping anyway"
            );
        }
    }
}

enum Begin {
    Ready(Arc<RoomChannel>),
    Pending {
        subscription_id: u64,
        handshake: Handshake,
    },
}

struct BusInner {
    transport: Arc<dyn Bus>,
    config: SignalingConfig,
    channels: Mutex<HashMap<String, ChannelEntry>>,
    listeners: Listeners<RoomMessage>,
}

/// Per-process registry of room channels and inbound message fan-out.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(transport: Arc<dyn Bus>, config: SignalingConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                transport,
                config,
                channels: Mutex::new(HashMap::new()),
                listeners: Listeners::new(),
            }),
        }
    }

    /// Subscribe to `room_id`, returning the existing channel if one is live.
    ///
    /// The handshake runs in its own task, so a caller that stops waiting
    /// never strands the room in `Connecting`; concurrent callers share its
    /// outcome.
    pub async fn connect(&self, room_id: &str) -> Result<Arc<RoomChannel>, ConnectError> {
        let name = channel_name(room_id, self.inner.config.max_channel_name_len)?;
        let (subscription_id, mut handshake) = match self.begin(room_id, &name)? {
            Begin::Ready(channel) => return Ok(channel),
            Begin::Pending {
                subscription_id,
                handshake,
            } => (subscription_id, handshake),
        };

        let outcome = match timeout(
            self.inner.config.connect_timeout,
            handshake.wait_for(Option::is_some),
        )
        .await
        {
            Ok(Ok(settled)) => (*settled)
                .clone()
                .unwrap_or(Err(ConnectError::ClosedPrematurely)),
            Ok(Err(_)) => Err(ConnectError::ClosedPrematurely),
            Err(_) => {
                self.abandon(room_id, subscription_id, &ConnectError::Timeout);
                Err(ConnectError::Timeout)
            }
        };
        outcome?;
        self.channel(room_id)
            .filter(|channel| channel.state() == ChannelState::Subscribed)
            .ok_or(ConnectError::ClosedPrematurely)
    }

    /// Drop the room's subscription. Bookkeeping is removed even if the
    /// transport refuses the unsubscribe.
    pub async fn disconnect(&self, room_id: &str) {
        let entry = self.inner.channels.lock().remove(room_id);
        match entry {
            Some(entry) => {
                tracing::info!(room_id, channel = %entry.channel.name, "room channel disconnected");
                entry.shutdown(self.inner.transport.as_ref());
            }
            None => tracing::debug!(room_id, "disconnect for unknown room ignored"),
        }
    }

    /// Publish to a subscribed room. Publishing to a room without a live
    /// channel succeeds without sending anything.
    pub async fn publish(
        &self,
        room_id: &str,
        message: NegotiationMessage,
    ) -> Result<(), PublishError> {
        let name = self
            .inner
            .channels
            .lock()
            .get(room_id)
            .filter(|entry| entry.channel.state() == ChannelState::Subscribed)
            .map(|entry| entry.channel.name.clone());
        let Some(name) = name else {
            tracing::debug!(
                room_id,
                kind = %message.kind(),
                "no live channel for room; message not sent"
            );
            return Ok(());
        };
        let payload = Bytes::from(message.encode()?);
        self.inner
            .transport
            .publish(&name, payload)
            .map_err(|err| PublishError::Transport(err.to_string()))
    }

    /// Register a listener for every inbound message on every room.
    pub fn on_message<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&RoomMessage) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(callback)
    }

    pub fn channel(&self, room_id: &str) -> Option<Arc<RoomChannel>> {
        self.inner
            .channels
            .lock()
            .get(room_id)
            .map(|entry| Arc::clone(&entry.channel))
    }

    pub fn state(&self, room_id: &str) -> Option<ChannelState> {
        self.inner
            .channels
            .lock()
            .get(room_id)
            .map(|entry| entry.channel.state())
    }

    pub fn rooms(&self) -> Vec<String> {
        self.inner.channels.lock().keys().cloned().collect()
    }

    /// Remove the room's bookkeeping if its channel is in a terminal state.
    pub fn evict_stale(&self, room_id: &str) -> bool {
        let entry = {
            let mut guard = self.inner.channels.lock();
            match guard.get(room_id) {
                Some(entry) if entry.channel.state().is_terminal() => guard.remove(room_id),
                _ => None,
            }
        };
        match entry {
            Some(entry) => {
                tracing::debug!(
                    room_id,
                    state = ?entry.channel.state(),
                    "evicting stale room channel"
                );
                entry.shutdown(self.inner.transport.as_ref());
                true
            }
            None => false,
        }
    }

    fn begin(&self, room_id: &str, name: &str) -> Result<Begin, ConnectError> {
        let mut guard = self.inner.channels.lock();
        if let Some(entry) = guard.get(room_id) {
            match entry.channel.state() {
                ChannelState::Subscribed => return Ok(Begin::Ready(Arc::clone(&entry.channel))),
                ChannelState::Connecting => {
                    return Ok(Begin::Pending {
                        subscription_id: entry.subscription_id,
                        handshake: entry.handshake.clone(),
                    });
                }
                state => {
                    tracing::debug!(room_id, ?state, "replacing stale room channel");
                    if let Some(stale) = guard.remove(room_id) {
                        stale.shutdown(self.inner.transport.as_ref());
                    }
                }
            }
        }

        let subscription = self
            .inner
            .transport
            .subscribe(name)
            .map_err(|err| ConnectError::ChannelError(err.to_string()))?;
        let Subscription {
            id: subscription_id,
            messages,
            status,
            probe,
            ..
        } = subscription;

        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let state_tx = Arc::new(state_tx);
        let channel = Arc::new(RoomChannel {
            room_id: room_id.to_string(),
            name: name.to_string(),
            state: state_rx.clone(),
        });
        let (join_tx, join_rx) = oneshot::channel();
        let resolver: JoinResolver = Arc::new(Mutex::new(Some(join_tx)));
        let (outcome_tx, handshake) = watch::channel(None);

        let tasks = vec![
            self.spawn_inbound_pump(room_id.to_string(), messages, state_rx),
            spawn_status_listener(status, Arc::clone(&resolver), Arc::clone(&state_tx)),
            self.spawn_join_poll(probe, resolver),
        ];
        guard.insert(
            room_id.to_string(),
            ChannelEntry {
                channel,
                state_tx: Arc::clone(&state_tx),
                subscription_id,
                handshake: handshake.clone(),
                tasks,
            },
        );
        self.spawn_handshake(room_id, name, subscription_id, join_rx, state_tx, outcome_tx);
        tracing::debug!(room_id, channel = name, subscription = subscription_id, "room channel connecting");

        Ok(Begin::Pending {
            subscription_id,
            handshake,
        })
    }

    /// Owns the connect timeout and the cleanup of a failed join.
    fn spawn_handshake(
        &self,
        room_id: &str,
        name: &str,
        subscription_id: u64,
        join_rx: oneshot::Receiver<Result<(), ConnectError>>,
        state_tx: Arc<watch::Sender<ChannelState>>,
        outcome_tx: watch::Sender<Option<Result<(), ConnectError>>>,
    ) {
        let bus = self.clone();
        let room_id = room_id.to_string();
        let name = name.to_string();
        tokio::spawn(async move {
            let result = match timeout(bus.inner.config.connect_timeout, join_rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(ConnectError::ClosedPrematurely),
                Err(_) => Err(ConnectError::Timeout),
            };
            let result = result.and_then(|()| {
                let promoted = state_tx.send_if_modified(|state| {
                    if *state == ChannelState::Connecting {
                        *state = ChannelState::Subscribed;
                        true
                    } else {
                        false
                    }
                });
                if promoted {
                    Ok(())
                } else {
                    Err(failure_for(*state_tx.borrow()))
                }
            });
            match &result {
                Ok(()) => tracing::info!(room_id = %room_id, channel = %name, "room channel joined"),
                Err(err) => bus.abandon(&room_id, subscription_id, err),
            }
            outcome_tx.send_replace(Some(result));
        });
    }

    /// Drop a subscription that never joined. A no-op once the entry was
    /// replaced, removed or promoted.
    fn abandon(&self, room_id: &str, subscription_id: u64, err: &ConnectError) {
        let entry = {
            let mut guard = self.inner.channels.lock();
            match guard.get(room_id) {
                Some(entry)
                    if entry.subscription_id == subscription_id
                        && entry.channel.state() != ChannelState::Subscribed =>
                {
                    guard.remove(room_id)
                }
                _ => None,
            }
        };
        if let Some(entry) = entry {
            entry.state_tx.send_if_modified(|state| {
                if state.is_terminal() {
                    false
                } else {
                    *state = state_for(err);
                    true
                }
            });
            tracing::warn!(
                room_id,
                channel = %entry.channel.name,
                error = %err,
                "room channel connect failed"
            );
            entry.shutdown(self.inner.transport.as_ref());
        }
    }

    /// Fallback for transports that set the joined flag without delivering
    /// the status event. Stops once the join is settled either way.
    fn spawn_join_poll(&self, probe: JoinProbe, resolver: JoinResolver) -> JoinHandle<()> {
        let period = self.inner.config.join_poll_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if resolver.lock().is_none() {
                    break;
                }
                if probe.is_joined() {
                    tracing::debug!("joined flag observed by poll");
                    resolve(&resolver, Ok(()));
                    break;
                }
            }
        })
    }

    /// Delivers until the transport drops the topic or the channel reaches
    /// a terminal state.
    fn spawn_inbound_pump(
        &self,
        room_id: String,
        mut messages: broadcast::Receiver<transport_bus::BusMessage>,
        mut state: watch::Receiver<ChannelState>,
    ) -> JoinHandle<()> {
        let listeners = self.inner.listeners.clone();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    _ = state.wait_for(|state| state.is_terminal()) => break,
                    received = messages.recv() => received,
                };
                if state.borrow().is_terminal() {
                    break;
                }
                match received {
                    Ok(raw) => match NegotiationMessage::decode(&raw.payload) {
                        Ok(message) => listeners.emit(&RoomMessage {
                            room_id: room_id.clone(),
                            message,
                        }),
                        Err(err) => tracing::warn!(
                            room_id = %room_id,
                            error = %err,
                            "skipping undecodable signaling payload"
                        ),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(room_id = %room_id, skipped, "room channel lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!(room_id = %room_id, "inbound pump stopped");
        })
    }
}

#[async_trait]
impl SignalSink for MessageBus {
    async fn publish(
        &self,
        room_id: &str,
        message: NegotiationMessage,
    ) -> Result<(), PublishError> {
        MessageBus::publish(self, room_id, message).await
    }
}

fn spawn_status_listener(
    mut status: tokio::sync::mpsc::UnboundedReceiver<SubscriptionStatus>,
    resolver: JoinResolver,
    state_tx: Arc<watch::Sender<ChannelState>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = status.recv().await {
            let (result, state) = match event {
                SubscriptionStatus::Joined => (Ok(()), None),
                SubscriptionStatus::Errored(reason) => {
                    (Err(ConnectError::ChannelError(reason)), Some(ChannelState::Errored))
                }
                SubscriptionStatus::TimedOut => {
                    (Err(ConnectError::Timeout), Some(ChannelState::TimedOut))
                }
                SubscriptionStatus::Closed => {
                    (Err(ConnectError::ClosedPrematurely), Some(ChannelState::Closed))
                }
            };
            if !resolve(&resolver, result) {
                if let Some(state) = state {
                    tracing::info!(?state, "room channel lost after join");
                    state_tx.send_replace(state);
                }
            }
        }
    })
}

/// Complete the pending connect. Returns `false` once it has been settled.
fn resolve(resolver: &JoinResolver, result: Result<(), ConnectError>) -> bool {
    match resolver.lock().take() {
        Some(tx) => {
            let _ = tx.send(result);
            true
        }
        None => false,
    }
}

fn failure_for(state: ChannelState) -> ConnectError {
    match state {
        ChannelState::TimedOut => ConnectError::Timeout,
        ChannelState::Errored => ConnectError::ChannelError("room channel errored".into()),
        _ => ConnectError::ClosedPrematurely,
    }
}

fn state_for(err: &ConnectError) -> ChannelState {
    match err {
        ConnectError::Timeout => ChannelState::TimedOut,
        ConnectError::ChannelError(_) | ConnectError::InvalidRoom(_) => ChannelState::Errored,
        ConnectError::ClosedPrematurely => ChannelState::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use transport_bus::{JoinBehavior, LocalBus};

    fn make_bus(transport: &Arc<LocalBus>) -> MessageBus {
        MessageBus::new(transport.clone(), SignalingConfig::default())
    }

    #[test]
    fn channel_names_are_sanitized_and_bounded() {
        assert_eq!(
            channel_name("lobby 1/east", 200).unwrap(),
            "room_lobby_1_east_signaling"
        );
        assert_eq!(channel_name("a-b_c", 200).unwrap(), "room_a-b_c_signaling");
        let long = "x".repeat(190);
        assert!(matches!(
            channel_name(&long, 200),
            Err(ConnectError::InvalidRoom(_))
        ));
        assert!(matches!(channel_name("", 200), Err(ConnectError::InvalidRoom(_))));
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let transport = Arc::new(LocalBus::new());
        let bus = make_bus(&transport);
        let first = bus.connect("lobby").await.expect("first connect");
        let second = bus.connect("lobby").await.expect("second connect");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(transport.subscribe_count("room_lobby_signaling"), 1);
        assert_eq!(first.state(), ChannelState::Subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_join_is_resolved_by_poll() {
        let transport = Arc::new(LocalBus::with_default_join(JoinBehavior::Silent));
        let bus = make_bus(&transport);
        let started = Instant::now();
        let channel = bus.connect("quiet").await.expect("poll resolves join");
        assert_eq!(channel.state(), ChannelState::Subscribed);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out_and_leaves_no_bookkeeping() {
        let transport = Arc::new(LocalBus::with_default_join(JoinBehavior::Never));
        let bus = make_bus(&transport);
        let err = bus.connect("R2").await.expect_err("no join signal");
        assert_eq!(err, ConnectError::Timeout);
        assert!(bus.channel("R2").is_none());
        assert_eq!(transport.active_subscriptions("room_R2_signaling"), 0);
    }

    #[tokio::test]
    async fn rejected_join_surfaces_channel_error() {
        let transport = Arc::new(LocalBus::new());
        transport.set_join_behavior("room_vip_signaling", JoinBehavior::Reject("denied".into()));
        let bus = make_bus(&transport);
        let err = bus.connect("vip").await.expect_err("rejected");
        assert_eq!(err, ConnectError::ChannelError("denied".into()));
        assert!(bus.state("vip").is_none());
    }

    #[tokio::test]
    async fn publish_without_channel_is_a_no_op() {
        let transport = Arc::new(LocalBus::new());
        let bus = make_bus(&transport);
        bus.publish("nowhere", NegotiationMessage::peer_joined("alice"))
            .await
            .expect("benign no-op");
    }

    #[tokio::test]
    async fn inbound_messages_reach_listeners_and_garbage_is_skipped() {
        let transport = Arc::new(LocalBus::new());
        let bus = make_bus(&transport);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _handle = bus.on_message(move |msg| {
            let _ = tx.send(msg.clone());
        });
        bus.connect("lobby").await.expect("connect");

        transport
            .publish("room_lobby_signaling", Bytes::from_static(b"not json"))
            .expect("raw publish");
        bus.publish("lobby", NegotiationMessage::peer_joined("alice"))
            .await
            .expect("publish");

        let received = rx.recv().await.expect("delivered");
        assert_eq!(received.room_id, "lobby");
        assert_eq!(received.message.from(), "alice");
    }

    #[tokio::test]
    async fn forced_close_marks_channel_and_reconnect_replaces_it() {
        let transport = Arc::new(LocalBus::new());
        let bus = make_bus(&transport);
        let first = bus.connect("lobby").await.expect("connect");
        transport.force_close("room_lobby_signaling");

        let mut state = first.state.clone();
        let settled = state
            .wait_for(|state| *state == ChannelState::Closed)
            .await
            .map(|state| *state)
            .expect("state update");
        assert_eq!(settled, ChannelState::Closed);

        let second = bus.connect("lobby").await.expect("reconnect");
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(transport.subscribe_count("room_lobby_signaling"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_connect_still_times_out_and_frees_the_room() {
        let transport = Arc::new(LocalBus::new());
        transport.set_join_behavior("room_R3_signaling", JoinBehavior::Never);
        let bus = make_bus(&transport);
        let started = Instant::now();

        let background = bus.clone();
        let attempt = tokio::spawn(async move { background.connect("R3").await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        attempt.abort();
        assert_eq!(bus.state("R3"), Some(ChannelState::Connecting));

        let err = timeout(Duration::from_secs(60), bus.connect("R3"))
            .await
            .expect("second connect settles")
            .expect_err("join never signalled");
        assert_eq!(err, ConnectError::Timeout);
        assert!(started.elapsed() <= Duration::from_secs(10));
        assert_eq!(bus.state("R3"), None);
        assert_eq!(transport.active_subscriptions("room_R3_signaling"), 0);

        transport.set_join_behavior("room_R3_signaling", JoinBehavior::Immediate);
        let channel = bus.connect("R3").await.expect("fresh attempt joins");
        assert_eq!(channel.state(), ChannelState::Subscribed);
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_handshake() {
        let transport = Arc::new(LocalBus::with_default_join(JoinBehavior::Silent));
        let bus = make_bus(&transport);
        let (first, second) = tokio::join!(bus.connect("lobby"), bus.connect("lobby"));
        let first = first.expect("first caller");
        let second = second.expect("second caller");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(transport.subscribe_count("room_lobby_signaling"), 1);
    }

    #[tokio::test]
    async fn closed_channel_stops_delivering() {
        let transport = Arc::new(LocalBus::new());
        let bus = make_bus(&transport);
        let delivered = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = delivered.clone();
        let _handle = bus.on_message(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        let channel = bus.connect("lobby").await.expect("connect");
        transport.force_close("room_lobby_signaling");

        let mut state = channel.state.clone();
        state
            .wait_for(|state| state.is_terminal())
            .await
            .expect("state update");
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let payload = NegotiationMessage::peer_joined("alice")
            .encode()
            .expect("encode");
        let _ = transport.publish("room_lobby_signaling", Bytes::from(payload));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(delivered.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(bus.state("lobby"), Some(ChannelState::Closed));
    }

    #[tokio::test]
    async fn disconnect_is_unconditional() {
        let transport = Arc::new(LocalBus::new());
        let bus = make_bus(&transport);
        bus.connect("lobby").await.expect("connect");
        bus.disconnect("lobby").await;
        assert!(bus.channel("lobby").is_none());
        assert_eq!(transport.active_subscriptions("room_lobby_signaling"), 0);
        bus.disconnect("lobby").await;
    }
}

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use transport_bus::Bus;

use crate::bus::{MessageBus, SignalSink};
use crate::config::SignalingConfig;
use crate::connection::{ConnectionFactory, LocalStream};
use crate::engine::NegotiationEngine;
use crate::error::{ConnectError, PublishError};
use crate::identity::{Identity, IdentityProvider};
use crate::message::{NegotiationMessage, RoomMessage};
use crate::observer::ListenerHandle;
use crate::router::{RouteOutcome, SignalingRouter};
use crate::supervisor::SubscriptionSupervisor;

/// Process-level entry point tying the bus, supervisor, router and per-room
/// engines together.
///
/// Inbound messages from every room are queued into a single router task, so
/// negotiation for all rooms advances one message at a time.
pub struct SignalingClient {
    identity: Arc<dyn IdentityProvider>,
    factory: Arc<dyn ConnectionFactory>,
    config: SignalingConfig,
    bus: MessageBus,
    supervisor: SubscriptionSupervisor,
    router: Arc<SignalingRouter>,
    inbound: Mutex<Option<ListenerHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_stream: Mutex<Option<LocalStream>>,
}

impl SignalingClient {
    /// Must be called from within a tokio runtime.
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        transport: Arc<dyn Bus>,
        factory: Arc<dyn ConnectionFactory>,
        config: SignalingConfig,
    ) -> Self {
        let bus = MessageBus::new(transport, config.clone());
        let supervisor = SubscriptionSupervisor::new(bus.clone());
        let router = Arc::new(SignalingRouter::new(Arc::clone(&identity), config.clone()));

        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<RoomMessage>();
        let inbound = bus.on_message(move |message| {
            let _ = inbound_tx.send(message.clone());
        });
        let router_loop = Arc::clone(&router);
        let router_task = tokio::spawn(async move {
            while let Some(message) = inbound_rx.recv().await {
                let room_id = message.room_id.clone();
                let kind = message.message.kind().clone();
                match router_loop.route(message).await {
                    RouteOutcome::Failed(reason) => {
                        tracing::debug!(room_id = %room_id, %kind, reason = %reason, "inbound message failed");
                    }
                    outcome => {
                        tracing::trace!(room_id = %room_id, %kind, ?outcome, "inbound message routed");
                    }
                }
            }
        });

        Self {
            identity,
            factory,
            config,
            bus,
            supervisor,
            router,
            inbound: Mutex::new(Some(inbound)),
            tasks: Mutex::new(vec![router_task]),
            local_stream: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity.current_identity()
    }

    pub fn supervisor(&self) -> &SubscriptionSupervisor {
        &self.supervisor
    }

    pub fn engine(&self, room_id: &str) -> Option<NegotiationEngine> {
        self.router.engine(room_id)
    }

    /// Subscribe to the room and make sure it has a negotiation engine.
    /// Presence is announced the first time the room is joined.
    pub async fn join_room(&self, room_id: &str) -> Result<NegotiationEngine, ConnectError> {
        self.supervisor.subscribe(room_id).await?;
        let (engine, inserted) = self.router.get_or_register(room_id, || {
            let sink: Arc<dyn SignalSink> = Arc::new(self.bus.clone());
            NegotiationEngine::new(
                room_id,
                Arc::clone(&self.identity),
                Arc::clone(&self.factory),
                sink,
                self.config.clone(),
            )
        });
        if !inserted {
            return Ok(engine);
        }

        let stream = self.local_stream.lock().clone();
        if let Some(stream) = stream {
            engine.attach_local_stream(stream).await;
        }
        tracing::info!(room_id, "joined room");

        if self.config.announce_presence {
            let announce = NegotiationMessage::peer_joined(self.identity().primary());
            if let Err(err) = self.bus.publish(room_id, announce).await {
                tracing::warn!(room_id, error = %err, "presence announcement failed");
            }
        }
        Ok(engine)
    }

    /// Announce departure, close every link in the room and drop the channel.
    pub async fn leave_room(&self, room_id: &str) {
        if self.config.announce_presence && self.supervisor.is_subscribed(room_id) {
            let farewell = NegotiationMessage::peer_left(self.identity().primary());
            if let Err(err) = self.bus.publish(room_id, farewell).await {
                tracing::warn!(room_id, error = %err, "departure announcement failed");
            }
        }
        if let Some(engine) = self.router.unregister(room_id) {
            engine.close_all().await;
        }
        self.supervisor.unsubscribe(room_id).await;
        tracing::info!(room_id, "left room");
    }

    /// Leave every room and stop routing inbound traffic.
    pub async fn shutdown(&self) {
        for engine in self.router.engines() {
            self.leave_room(engine.room_id()).await;
        }
        self.supervisor.unsubscribe_all().await;
        if let Some(inbound) = self.inbound.lock().take() {
            inbound.unsubscribe();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub async fn send(&self, room_id: &str, message: NegotiationMessage) -> Result<(), PublishError> {
        self.bus.publish(room_id, message).await
    }

    /// Publish a system announcement to the room.
    pub async fn send_notice(&self, room_id: &str, text: &str) -> Result<(), PublishError> {
        let notice = NegotiationMessage::system_notice(self.identity().primary(), text);
        self.bus.publish(room_id, notice).await
    }

    pub fn on_message<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&RoomMessage) + Send + Sync + 'static,
    {
        self.router.on_message(callback)
    }

    /// Attach local capture to every joined room and to rooms joined later.
    pub async fn attach_local_stream(&self, stream: LocalStream) -> usize {
        *self.local_stream.lock() = Some(stream.clone());
        let mut capped = 0;
        for engine in self.router.engines() {
            capped += engine.attach_local_stream(stream.clone()).await;
        }
        capped
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

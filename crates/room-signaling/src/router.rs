use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::SignalingConfig;
use crate::engine::NegotiationEngine;
use crate::error::NegotiationError;
use crate::identity::IdentityProvider;
use crate::message::{MessageKind, NegotiationMessage, NoticeKind, RoomMessage};
use crate::observer::{ListenerHandle, Listeners};

/// What the router did with one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// Handed to the room's negotiation engine, which accepted it.
    Dispatched,
    SelfEcho,
    NotAddressed,
    /// Repeat of a recent system notice; carries the first instance seen.
    Duplicate(NegotiationMessage),
    /// Not a negotiation message; passed to observers only.
    Delivered,
    Ignored,
    Failed(String),
}

/// Filters inbound room traffic and feeds it to the per-room engines.
pub struct SignalingRouter {
    identity: Arc<dyn IdentityProvider>,
    config: SignalingConfig,
    engines: RwLock<HashMap<String, NegotiationEngine>>,
    notices: Mutex<HashMap<(String, String), NegotiationMessage>>,
    observers: Listeners<RoomMessage>,
}

impl SignalingRouter {
    pub fn new(identity: Arc<dyn IdentityProvider>, config: SignalingConfig) -> Self {
        Self {
            identity,
            config,
            engines: RwLock::new(HashMap::new()),
            notices: Mutex::new(HashMap::new()),
            observers: Listeners::new(),
        }
    }

    pub fn register(&self, engine: NegotiationEngine) {
        self.engines
            .write()
            .insert(engine.room_id().to_string(), engine);
    }

    /// Return the room's engine, building it with `make` if none is
    /// registered. The flag is `true` only for the call that inserted it.
    pub fn get_or_register<F>(&self, room_id: &str, make: F) -> (NegotiationEngine, bool)
    where
        F: FnOnce() -> NegotiationEngine,
    {
        let mut engines = self.engines.write();
        if let Some(engine) = engines.get(room_id) {
            return (engine.clone(), false);
        }
        let engine = make();
        engines.insert(room_id.to_string(), engine.clone());
        (engine, true)
    }

    pub fn unregister(&self, room_id: &str) -> Option<NegotiationEngine> {
        self.notices.lock().retain(|(room, _), _| room != room_id);
        self.engines.write().remove(room_id)
    }

    pub fn engine(&self, room_id: &str) -> Option<NegotiationEngine> {
        self.engines.read().get(room_id).cloned()
    }

    pub fn engines(&self) -> Vec<NegotiationEngine> {
        self.engines.read().values().cloned().collect()
    }

    /// Observe every message that survives filtering and dedup, whether or not
    /// an engine handled it.
    pub fn on_message<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&RoomMessage) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }

    pub async fn route(&self, inbound: RoomMessage) -> RouteOutcome {
        let identity = self.identity.current_identity();
        let message = &inbound.message;

        if identity.matches(message.from()) {
            tracing::trace!(room_id = %inbound.room_id, kind = %message.kind(), "dropping self echo");
            return RouteOutcome::SelfEcho;
        }
        if let Some(to) = message.to() {
            if !identity.matches(to) {
                tracing::trace!(
                    room_id = %inbound.room_id,
                    kind = %message.kind(),
                    to,
                    "dropping message addressed elsewhere"
                );
                return RouteOutcome::NotAddressed;
            }
        }
        if let Some(previous) = self.previous_notice(&inbound) {
            tracing::debug!(
                room_id = %inbound.room_id,
                first_seen = previous.sent_at(),
                "duplicate system notice discarded"
            );
            return RouteOutcome::Duplicate(previous);
        }

        let outcome = self.dispatch(&inbound).await;
        self.observers.emit(&inbound);
        outcome
    }

    async fn dispatch(&self, inbound: &RoomMessage) -> RouteOutcome {
        let message = &inbound.message;
        let room_id = inbound.room_id.as_str();
        match message.kind() {
            MessageKind::Chat => return RouteOutcome::Delivered,
            MessageKind::Unknown(kind) => {
                tracing::debug!(room_id, kind = %kind, from = message.from(), "unknown message kind ignored");
                return RouteOutcome::Ignored;
            }
            MessageKind::PeerJoined if !self.config.offer_on_peer_joined => {
                return RouteOutcome::Delivered;
            }
            _ => {}
        }
        let Some(engine) = self.engine(room_id) else {
            tracing::debug!(room_id, kind = %message.kind(), "no negotiation engine for room");
            return RouteOutcome::Ignored;
        };

        let from = message.from();
        let result: Result<(), NegotiationError> = match message.kind() {
            MessageKind::Offer => match message.description() {
                Ok(offer) => engine.apply_offer(from, offer).await.map(|_| ()),
                Err(err) => Err(err),
            },
            MessageKind::Answer => match message.description() {
                Ok(answer) => engine.apply_answer(from, answer).await,
                Err(err) => Err(err),
            },
            MessageKind::Candidate => match message.ice_candidate() {
                Ok(candidate) => engine.add_candidate(from, candidate).await,
                Err(err) => Err(err),
            },
            MessageKind::PeerJoined => {
                tracing::info!(room_id, remote_id = from, "peer joined; starting offer");
                engine.create_offer(from).await.map(|_| ())
            }
            MessageKind::PeerLeft => {
                tracing::info!(room_id, remote_id = from, "peer left");
                engine.close_peer(from).await;
                Ok(())
            }
            MessageKind::Chat | MessageKind::Unknown(_) => return RouteOutcome::Ignored,
        };

        match result {
            Ok(()) => RouteOutcome::Dispatched,
            Err(err) => {
                tracing::warn!(
                    target = "signaling",
                    room_id,
                    remote_id = from,
                    kind = %message.kind(),
                    error = %err,
                    "negotiation step failed"
                );
                RouteOutcome::Failed(err.to_string())
            }
        }
    }

    /// First instance of an identical system notice in this room, if it was
    /// sent within the dedup window. Otherwise `message` becomes the instance
    /// later duplicates are measured against.
    fn previous_notice(&self, inbound: &RoomMessage) -> Option<NegotiationMessage> {
        let notice = inbound.message.notice()?;
        if notice.kind != NoticeKind::System {
            return None;
        }
        let window = self.config.notice_dedup_window.as_millis() as i64;
        let sent_at = inbound.message.sent_at();
        let key = (inbound.room_id.clone(), notice.text);

        let mut notices = self.notices.lock();
        if let Some(previous) = notices.get(&key) {
            if (sent_at - previous.sent_at()).abs() < window {
                return Some(previous.clone());
            }
        }
        notices.retain(|_, seen| (sent_at - seen.sent_at()).abs() < window);
        notices.insert(key, inbound.message.clone());
        None
    }
}

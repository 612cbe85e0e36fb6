//! Offer/answer state machine, one instance per room.
//!
//! Every step that touches a [`PeerLink`] takes the link's turn lock and
//! re-checks that the link is still open and still the registered one after
//! each await on the connection primitive; a concurrent teardown surfaces as
//! [`NegotiationError::LinkClosed`] instead of mutating a dead link.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::bus::SignalSink;
use crate::config::SignalingConfig;
use crate::connection::{
    ConnectionEvent, ConnectionFactory, IceCandidate, LocalStream, SdpType, SessionDescription,
    SignalingState,
};
use crate::error::NegotiationError;
use crate::identity::IdentityProvider;
use crate::message::NegotiationMessage;
use crate::observer::ListenerHandle;
use crate::registry::{Acquired, ConnectionRegistry, NegotiationState, PeerEvent, PeerLink};

enum AnswerStep {
    Answered(SessionDescription),
    /// Link never took the remote offer; replace it and try again.
    Rebuild,
    /// Glare lost on identity ordering; drop the local offer and answer.
    Yield,
    /// Rebuilt link still refuses the offer.
    Corrupt(NegotiationState),
}

struct EngineInner {
    room_id: String,
    identity: Arc<dyn IdentityProvider>,
    registry: ConnectionRegistry,
    sink: Arc<dyn SignalSink>,
    config: SignalingConfig,
    local_stream: Mutex<Option<LocalStream>>,
}

#[derive(Clone)]
pub struct NegotiationEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for NegotiationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationEngine")
            .field("room_id", &self.inner.room_id)
            .finish_non_exhaustive()
    }
}

impl NegotiationEngine {
    pub fn new(
        room_id: impl Into<String>,
        identity: Arc<dyn IdentityProvider>,
        factory: Arc<dyn ConnectionFactory>,
        sink: Arc<dyn SignalSink>,
        config: SignalingConfig,
    ) -> Self {
        let room_id = room_id.into();
        let registry =
            ConnectionRegistry::new(room_id.clone(), factory, config.creation_attempt_limit);
        Self {
            inner: Arc::new(EngineInner {
                room_id,
                identity,
                registry,
                sink,
                config,
                local_stream: Mutex::new(None),
            }),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn state(&self, remote_id: &str) -> Option<NegotiationState> {
        self.inner.registry.get(remote_id).map(|link| link.state())
    }

    pub fn peers(&self) -> Vec<String> {
        self.inner.registry.peers()
    }

    pub fn on_peer_event<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&PeerEvent) + Send + Sync + 'static,
    {
        self.inner.registry.on_peer_event(callback)
    }

    /// Produce an offer for `remote_id` and publish it. While an offer is
    /// pending the same offer is returned and nothing is re-applied.
    pub async fn create_offer(&self, remote_id: &str) -> Result<SessionDescription, NegotiationError> {
        let link = self.acquire(remote_id).await?;
        let _turn = link.lock_turn().await;
        self.ensure_current(&link)?;

        if let Some(pending) = link.pending_offer() {
            tracing::debug!(
                target = "signaling",
                room_id = %self.inner.room_id,
                remote_id,
                "offer already pending; reusing it"
            );
            return Ok(pending);
        }
        match link.state() {
            NegotiationState::Stable => {}
            other => return Err(NegotiationError::InvalidStateForOffer(other)),
        }

        let connection = Arc::clone(link.connection());
        let offer = connection.create_offer().await?;
        self.ensure_current(&link)?;
        expect_kind(&offer, SdpType::Offer)?;
        connection.set_local_description(offer.clone()).await?;
        self.ensure_current(&link)?;
        link.record_local_offer(offer.clone());

        let message = NegotiationMessage::offer(&self.local_id(), remote_id, &offer);
        self.inner.sink.publish(&self.inner.room_id, message).await?;
        tracing::info!(
            target = "signaling",
            room_id = %self.inner.room_id,
            remote_id,
            "offer sent"
        );
        Ok(offer)
    }

    /// Apply a remote answer to a pending local offer. Answers that do not
    /// match a pending offer are stale and ignored.
    pub async fn apply_answer(
        &self,
        remote_id: &str,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        expect_kind(&answer, SdpType::Answer)?;
        let Some(link) = self.inner.registry.get(remote_id) else {
            tracing::debug!(
                target = "signaling",
                room_id = %self.inner.room_id,
                remote_id,
                "answer for unknown peer ignored"
            );
            return Ok(());
        };
        let _turn = link.lock_turn().await;
        if self.ensure_current(&link).is_err() || link.state() != NegotiationState::HaveLocalOffer
        {
            tracing::debug!(
                target = "signaling",
                room_id = %self.inner.room_id,
                remote_id,
                state = ?link.state(),
                "stale answer ignored"
            );
            return Ok(());
        }

        link.connection().set_remote_description(answer).await?;
        self.ensure_current(&link)?;
        link.mark_remote_description();
        link.set_state(NegotiationState::Stable);
        self.inner.registry.reset_creation_attempts(remote_id);
        tracing::info!(
            target = "signaling",
            room_id = %self.inner.room_id,
            remote_id,
            "answer applied"
        );
        Ok(())
    }

    /// Apply a remote offer, then build, apply and publish the answer.
    pub async fn apply_offer(
        &self,
        remote_id: &str,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        expect_kind(&offer, SdpType::Offer)?;
        let mut carried = None;
        let mut rebuilt = false;
        let mut yielded = false;

        loop {
            let link = self.acquire(remote_id).await?;
            if let Some(attempts) = carried.take() {
                link.carry_answer_attempts(attempts);
            }
            let step = {
                let _turn = link.lock_turn().await;
                self.try_answer(&link, &offer, !rebuilt, !yielded).await
            };
            let step = match step {
                Ok(step) => step,
                Err(err @ NegotiationError::RetryBudgetExceeded { .. }) => {
                    self.drop_exhausted(&link, &err).await;
                    return Err(err);
                }
                Err(err) => return Err(err),
            };
            match step {
                AnswerStep::Answered(answer) => return Ok(answer),
                AnswerStep::Corrupt(state) => {
                    let err = NegotiationError::InvalidStateForAnswer(state);
                    self.drop_exhausted(&link, &err).await;
                    return Err(err);
                }
                AnswerStep::Rebuild => {
                    tracing::warn!(
                        target = "signaling",
                        room_id = %self.inner.room_id,
                        remote_id,
                        "peer link ignored remote offer; rebuilding once"
                    );
                    rebuilt = true;
                }
                AnswerStep::Yield => {
                    tracing::info!(
                        target = "signaling",
                        room_id = %self.inner.room_id,
                        remote_id,
                        "offer collision; yielding to remote offer"
                    );
                    yielded = true;
                }
            }
            carried = Some(link.answer_attempts());
            self.inner
                .registry
                .discard(remote_id, link.generation())
                .await;
        }
    }

    /// Apply a remote candidate. Candidates for unknown or closed links, or
    /// arriving before any remote description, are dropped.
    pub async fn add_candidate(
        &self,
        remote_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        let Some(link) = self.inner.registry.get(remote_id) else {
            tracing::debug!(
                target = "signaling",
                room_id = %self.inner.room_id,
                remote_id,
                "candidate for unknown peer dropped"
            );
            return Ok(());
        };
        if link.is_closed() {
            tracing::debug!(
                target = "signaling",
                room_id = %self.inner.room_id,
                remote_id,
                "candidate for closed link dropped"
            );
            return Ok(());
        }
        if !link.has_remote_description() {
            tracing::debug!(
                target = "signaling",
                room_id = %self.inner.room_id,
                remote_id,
                "candidate arrived before remote description; dropped"
            );
            return Ok(());
        }
        match link.connection().add_ice_candidate(candidate).await {
            Ok(()) => Ok(()),
            Err(_) if link.is_closed() => {
                tracing::debug!(
                    target = "signaling",
                    room_id = %self.inner.room_id,
                    remote_id,
                    "link closed while applying candidate"
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn close_peer(&self, remote_id: &str) -> bool {
        self.inner.registry.remove(remote_id).await
    }

    pub async fn close_all(&self) {
        self.inner.registry.close_all().await;
    }

    /// Attach local capture to every current and future link in the room and
    /// cap its video sender. Returns how many links were capped.
    pub async fn attach_local_stream(&self, stream: LocalStream) -> usize {
        *self.inner.local_stream.lock() = Some(stream.clone());
        let mut capped = 0;
        for remote_id in self.inner.registry.peers() {
            let Some(link) = self.inner.registry.get(&remote_id) else {
                continue;
            };
            if let Err(err) = link.connection().add_local_stream(&stream).await {
                tracing::warn!(
                    target = "signaling",
                    room_id = %self.inner.room_id,
                    remote_id = %remote_id,
                    error = %err,
                    "attaching local stream failed"
                );
                continue;
            }
            if self.apply_bitrate_cap(&link).await {
                capped += 1;
            }
        }
        capped
    }

    async fn try_answer(
        &self,
        link: &PeerLink,
        offer: &SessionDescription,
        allow_rebuild: bool,
        allow_yield: bool,
    ) -> Result<AnswerStep, NegotiationError> {
        let remote_id = link.remote_id();
        self.ensure_current(link)?;
        match link.state() {
            NegotiationState::Stable => {}
            NegotiationState::HaveLocalOffer if allow_yield && self.yields_to(remote_id) => {
                return Ok(AnswerStep::Yield);
            }
            other => {
                tracing::debug!(
                    target = "signaling",
                    room_id = %self.inner.room_id,
                    remote_id,
                    state = ?other,
                    "remote offer rejected"
                );
                return Err(NegotiationError::InvalidStateForAnswer(other));
            }
        }

        let attempt = link
            .consume_answer_attempt(self.inner.config.answer_attempt_limit)
            .map_err(|attempts| NegotiationError::RetryBudgetExceeded {
                remote_id: remote_id.to_string(),
                attempts,
            })?;

        let result = self.answer_step(link, offer, allow_rebuild).await;
        if result.is_err() && link.state() == NegotiationState::HaveRemoteOffer {
            link.set_state(NegotiationState::Stable);
        }
        if let Err(err) = &result {
            tracing::warn!(
                target = "signaling",
                room_id = %self.inner.room_id,
                remote_id,
                attempt,
                error = %err,
                "answer attempt failed"
            );
        }
        result
    }

    async fn answer_step(
        &self,
        link: &PeerLink,
        offer: &SessionDescription,
        allow_rebuild: bool,
    ) -> Result<AnswerStep, NegotiationError> {
        let remote_id = link.remote_id();
        let connection = Arc::clone(link.connection());

        connection.set_remote_description(offer.clone()).await?;
        self.ensure_current(link)?;
        if connection.signaling_state() != SignalingState::HaveRemoteOffer {
            let pristine = connection.local_description().await.is_none()
                && connection.remote_description().await.is_none();
            if pristine && allow_rebuild {
                return Ok(AnswerStep::Rebuild);
            }
            if pristine {
                return Ok(AnswerStep::Corrupt(link.state()));
            }
            return Err(NegotiationError::InvalidStateForAnswer(link.state()));
        }
        link.mark_remote_description();
        link.set_state(NegotiationState::HaveRemoteOffer);

        let answer = connection.create_answer().await?;
        self.ensure_current(link)?;
        expect_kind(&answer, SdpType::Answer)?;
        connection.set_local_description(answer.clone()).await?;
        self.ensure_current(link)?;

        link.set_state(NegotiationState::Stable);
        link.reset_answer_attempts();
        self.inner.registry.reset_creation_attempts(remote_id);

        let message = NegotiationMessage::answer(&self.local_id(), remote_id, &answer);
        self.inner.sink.publish(&self.inner.room_id, message).await?;
        tracing::info!(
            target = "signaling",
            room_id = %self.inner.room_id,
            remote_id,
            "answer sent"
        );
        Ok(AnswerStep::Answered(answer))
    }

    /// Retire a link that can no longer answer so the next offer from the
    /// peer starts on a fresh one.
    async fn drop_exhausted(&self, link: &PeerLink, err: &NegotiationError) {
        let removed = self
            .inner
            .registry
            .remove_generation(link.remote_id(), link.generation())
            .await;
        if removed {
            tracing::warn!(
                target = "signaling",
                room_id = %self.inner.room_id,
                remote_id = %link.remote_id(),
                error = %err,
                "peer link retired after unrecoverable answer failure"
            );
        }
    }

    async fn acquire(&self, remote_id: &str) -> Result<Arc<PeerLink>, NegotiationError> {
        match self.inner.registry.get_or_create(remote_id).await? {
            Acquired::Existing(link) => Ok(link),
            Acquired::Created(link, events) => {
                self.prepare_link(&link, events).await;
                Ok(link)
            }
        }
    }

    async fn prepare_link(
        &self,
        link: &Arc<PeerLink>,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let pump = tokio::spawn(pump_events(
            Arc::downgrade(&self.inner),
            link.remote_id().to_string(),
            link.generation(),
            events,
        ));
        link.attach_pump(pump);

        let stream = self.inner.local_stream.lock().clone();
        let Some(stream) = stream else {
            return;
        };
        if let Err(err) = link.connection().add_local_stream(&stream).await {
            tracing::warn!(
                target = "signaling",
                room_id = %self.inner.room_id,
                remote_id = %link.remote_id(),
                error = %err,
                "attaching local stream to new link failed"
            );
            return;
        }
        let engine = Arc::downgrade(&self.inner);
        let link = Arc::clone(link);
        let grace = self.inner.config.bitrate_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = engine.upgrade() {
                NegotiationEngine { inner }.apply_bitrate_cap(&link).await;
            }
        });
    }

    async fn apply_bitrate_cap(&self, link: &PeerLink) -> bool {
        if link.is_closed() || !self.inner.registry.is_current(link) {
            return false;
        }
        let cap = self.inner.config.video_bitrate_cap_bps;
        match link.connection().set_video_bitrate(cap).await {
            Ok(true) => {
                tracing::debug!(
                    target = "signaling",
                    room_id = %self.inner.room_id,
                    remote_id = %link.remote_id(),
                    cap,
                    "video bitrate capped"
                );
                true
            }
            Ok(false) => {
                tracing::debug!(
                    target = "signaling",
                    room_id = %self.inner.room_id,
                    remote_id = %link.remote_id(),
                    "no video sender to cap"
                );
                false
            }
            Err(err) => {
                tracing::warn!(
                    target = "signaling",
                    room_id = %self.inner.room_id,
                    remote_id = %link.remote_id(),
                    error = %err,
                    "applying bitrate cap failed"
                );
                false
            }
        }
    }

    async fn publish_candidate(&self, remote_id: &str, generation: u64, candidate: IceCandidate) {
        let current = self
            .inner
            .registry
            .get(remote_id)
            .is_some_and(|link| link.generation() == generation && !link.is_closed());
        if !current {
            return;
        }
        let message = NegotiationMessage::candidate(&self.local_id(), remote_id, &candidate);
        if let Err(err) = self.inner.sink.publish(&self.inner.room_id, message).await {
            tracing::warn!(
                target = "signaling",
                room_id = %self.inner.room_id,
                remote_id,
                error = %err,
                "publishing local candidate failed"
            );
        }
    }

    fn ensure_current(&self, link: &PeerLink) -> Result<(), NegotiationError> {
        if link.is_closed() || !self.inner.registry.is_current(link) {
            return Err(NegotiationError::LinkClosed(link.remote_id().to_string()));
        }
        Ok(())
    }

    /// The side with the lower primary id gives up its offer on collision.
    fn yields_to(&self, remote_id: &str) -> bool {
        self.local_id().as_str() < remote_id
    }

    fn local_id(&self) -> String {
        self.inner.identity.current_identity().primary().to_string()
    }
}

fn expect_kind(desc: &SessionDescription, expected: SdpType) -> Result<(), NegotiationError> {
    if desc.kind != expected {
        return Err(NegotiationError::UnexpectedDescription {
            expected,
            actual: desc.kind,
        });
    }
    Ok(())
}

async fn pump_events(
    engine: Weak<EngineInner>,
    remote_id: String,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = engine.upgrade() else {
            break;
        };
        let engine = NegotiationEngine { inner };
        let registry = &engine.inner.registry;
        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                engine
                    .publish_candidate(&remote_id, generation, candidate)
                    .await;
            }
            ConnectionEvent::RemoteStream(stream) => {
                registry.emit(PeerEvent::RemoteStream {
                    remote_id: remote_id.clone(),
                    stream: Some(stream),
                });
            }
            ConnectionEvent::ConnectionState(state) => {
                tracing::debug!(
                    target = "signaling",
                    room_id = %engine.inner.room_id,
                    remote_id = %remote_id,
                    ?state,
                    "connection state changed"
                );
                registry.emit(PeerEvent::ConnectionState {
                    remote_id: remote_id.clone(),
                    state,
                });
                if state.is_terminal() {
                    registry.remove_generation(&remote_id, generation).await;
                    break;
                }
            }
            ConnectionEvent::IceState(state) => {
                registry.emit(PeerEvent::IceState {
                    remote_id: remote_id.clone(),
                    state,
                });
                if state.is_terminal() {
                    registry.remove_generation(&remote_id, generation).await;
                    break;
                }
            }
        }
    }
}

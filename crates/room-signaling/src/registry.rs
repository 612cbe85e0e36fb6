//! Authoritative map of peer links for one room.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, mpsc};
use tokio::task::JoinHandle;

use crate::connection::{
    ConnectionEvent, ConnectionFactory, ConnectionState, IceState, PeerConnection, RemoteStream,
    SessionDescription,
};
use crate::error::RegistryError;
use crate::observer::{ListenerHandle, Listeners};

/// Handshake phase of one peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    /// Only ever observed inside an answer step.
    HaveRemoteOffer,
    HaveLocalPrAnswer,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    RemoteStream {
        remote_id: String,
        stream: Option<RemoteStream>,
    },
    ConnectionState {
        remote_id: String,
        state: ConnectionState,
    },
    IceState {
        remote_id: String,
        state: IceState,
    },
}

#[derive(Debug)]
struct LinkInner {
    state: NegotiationState,
    local_offer: Option<SessionDescription>,
    has_remote_description: bool,
    answer_attempts: u32,
}

/// Negotiation session with one remote participant.
pub struct PeerLink {
    remote_id: String,
    connection: Arc<dyn PeerConnection>,
    generation: u64,
    creation_attempt: u32,
    inner: Mutex<LinkInner>,
    turn: AsyncMutex<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl PeerLink {
    fn new(
        remote_id: String,
        connection: Arc<dyn PeerConnection>,
        generation: u64,
        creation_attempt: u32,
    ) -> Self {
        Self {
            remote_id,
            connection,
            generation,
            creation_attempt,
            inner: Mutex::new(LinkInner {
                state: NegotiationState::Stable,
                local_offer: None,
                has_remote_description: false,
                answer_attempts: 0,
            }),
            turn: AsyncMutex::new(()),
            pump: Mutex::new(None),
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Which creation attempt for this remote produced the link.
    pub fn creation_attempt(&self) -> u32 {
        self.creation_attempt
    }

    pub fn state(&self) -> NegotiationState {
        self.inner.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == NegotiationState::Closed
    }

    /// Transport reports the connection or its ICE agent as closed or failed.
    pub fn is_defunct(&self) -> bool {
        self.connection.connection_state().is_terminal()
            || self.connection.ice_state().is_terminal()
    }

    pub fn pending_offer(&self) -> Option<SessionDescription> {
        let inner = self.inner.lock();
        match inner.state {
            NegotiationState::HaveLocalOffer => inner.local_offer.clone(),
            _ => None,
        }
    }

    pub fn has_remote_description(&self) -> bool {
        self.inner.lock().has_remote_description
    }

    pub fn answer_attempts(&self) -> u32 {
        self.inner.lock().answer_attempts
    }

    /// Serialises offer/answer steps for this peer.
    pub async fn lock_turn(&self) -> AsyncMutexGuard<'_, ()> {
        self.turn.lock().await
    }

    pub(crate) fn record_local_offer(&self, offer: SessionDescription) {
        let mut inner = self.inner.lock();
        if inner.state != NegotiationState::Closed {
            inner.state = NegotiationState::HaveLocalOffer;
            inner.local_offer = Some(offer);
        }
    }

    pub(crate) fn set_state(&self, state: NegotiationState) {
        let mut inner = self.inner.lock();
        if inner.state != NegotiationState::Closed {
            inner.state = state;
            if state == NegotiationState::Stable {
                inner.local_offer = None;
            }
        }
    }

    pub(crate) fn mark_remote_description(&self) {
        self.inner.lock().has_remote_description = true;
    }

    /// Take one answer attempt, or report the count if the budget is spent.
    pub(crate) fn consume_answer_attempt(&self, limit: u32) -> Result<u32, u32> {
        let mut inner = self.inner.lock();
        if inner.answer_attempts >= limit {
            return Err(inner.answer_attempts);
        }
        inner.answer_attempts += 1;
        Ok(inner.answer_attempts)
    }

    pub(crate) fn carry_answer_attempts(&self, attempts: u32) {
        self.inner.lock().answer_attempts = attempts;
    }

    pub(crate) fn reset_answer_attempts(&self) {
        self.inner.lock().answer_attempts = 0;
    }

    pub(crate) fn attach_pump(&self, pump: JoinHandle<()>) {
        if let Some(previous) = self.pump.lock().replace(pump) {
            previous.abort();
        }
    }

    fn mark_closed(&self) {
        let mut inner = self.inner.lock();
        inner.state = NegotiationState::Closed;
        inner.local_offer = None;
    }

    async fn teardown(&self) {
        self.mark_closed();
        self.connection.stop_local_tracks().await;
        if let Err(err) = self.connection.close().await {
            tracing::warn!(
                target = "signaling",
                remote_id = %self.remote_id,
                error = %err,
                "closing peer connection failed"
            );
        }
        // The pump may be the caller; abort it last.
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote_id", &self.remote_id)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish()
    }
}

/// Result of [`ConnectionRegistry::get_or_create`].
pub enum Acquired {
    Existing(Arc<PeerLink>),
    /// A new link plus its connection events, which the caller must drain.
    Created(Arc<PeerLink>, mpsc::UnboundedReceiver<ConnectionEvent>),
}

impl Acquired {
    pub fn link(&self) -> &Arc<PeerLink> {
        match self {
            Acquired::Existing(link) | Acquired::Created(link, _) => link,
        }
    }
}

pub struct ConnectionRegistry {
    room_id: String,
    factory: Arc<dyn ConnectionFactory>,
    creation_limit: u32,
    links: Mutex<HashMap<String, Arc<PeerLink>>>,
    creation_attempts: Mutex<HashMap<String, u32>>,
    creating: AsyncMutex<()>,
    next_generation: AtomicU64,
    events: Listeners<PeerEvent>,
}

impl ConnectionRegistry {
    pub fn new(
        room_id: impl Into<String>,
        factory: Arc<dyn ConnectionFactory>,
        creation_limit: u32,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            factory,
            creation_limit,
            links: Mutex::new(HashMap::new()),
            creation_attempts: Mutex::new(HashMap::new()),
            creating: AsyncMutex::new(()),
            next_generation: AtomicU64::new(0),
            events: Listeners::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn get(&self, remote_id: &str) -> Option<Arc<PeerLink>> {
        self.links.lock().get(remote_id).cloned()
    }

    /// True when `link` is still the registered link for its remote.
    pub fn is_current(&self, link: &PeerLink) -> bool {
        self.links
            .lock()
            .get(&link.remote_id)
            .is_some_and(|current| current.generation == link.generation)
    }

    pub fn peers(&self) -> Vec<String> {
        self.links.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.links.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn creation_attempts(&self, remote_id: &str) -> u32 {
        self.creation_attempts
            .lock()
            .get(remote_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn reset_creation_attempts(&self, remote_id: &str) {
        self.creation_attempts.lock().remove(remote_id);
    }

    /// Return the live link for `remote_id`, building one if none exists or
    /// the registered one has failed at the transport level.
    pub async fn get_or_create(&self, remote_id: &str) -> Result<Acquired, RegistryError> {
        if let Some(link) = self.live(remote_id) {
            return Ok(Acquired::Existing(link));
        }

        let _creating = self.creating.lock().await;
        if let Some(link) = self.live(remote_id) {
            return Ok(Acquired::Existing(link));
        }
        let defunct = self.links.lock().remove(remote_id);
        if let Some(defunct) = defunct {
            tracing::info!(
                target = "signaling",
                room_id = %self.room_id,
                remote_id,
                generation = defunct.generation,
                "discarding failed peer link"
            );
            self.retire(&defunct).await;
        }

        let mut last_error = None;
        loop {
            let attempt = {
                let mut attempts = self.creation_attempts.lock();
                let count = attempts.entry(remote_id.to_string()).or_insert(0);
                if *count >= self.creation_limit {
                    return Err(RegistryError::CreationBudgetExceeded {
                        remote_id: remote_id.to_string(),
                        attempts: *count,
                        last_error,
                    });
                }
                *count += 1;
                *count
            };

            match self.factory.create(remote_id).await {
                Ok(created) => {
                    let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let link = Arc::new(PeerLink::new(
                        remote_id.to_string(),
                        created.connection,
                        generation,
                        attempt,
                    ));
                    self.links
                        .lock()
                        .insert(remote_id.to_string(), Arc::clone(&link));
                    tracing::info!(
                        target = "signaling",
                        room_id = %self.room_id,
                        remote_id,
                        generation,
                        attempt,
                        "peer link created"
                    );
                    return Ok(Acquired::Created(link, created.events));
                }
                Err(err) => {
                    tracing::warn!(
                        target = "signaling",
                        room_id = %self.room_id,
                        remote_id,
                        attempt,
                        error = %err,
                        "peer connection construction failed"
                    );
                    last_error = Some(err.to_string());
                }
            }
        }
    }

    /// Close and forget the link, reset its counters and report the remote
    /// stream gone. Returns `false` if no link was registered.
    pub async fn remove(&self, remote_id: &str) -> bool {
        let link = self.links.lock().remove(remote_id);
        self.reset_creation_attempts(remote_id);
        match link {
            Some(link) => {
                self.retire(&link).await;
                tracing::info!(
                    target = "signaling",
                    room_id = %self.room_id,
                    remote_id,
                    "peer link removed"
                );
                true
            }
            None => false,
        }
    }

    /// Remove the link only if it is still generation `generation`.
    pub async fn remove_generation(&self, remote_id: &str, generation: u64) -> bool {
        let link = {
            let mut links = self.links.lock();
            match links.get(remote_id) {
                Some(link) if link.generation == generation => links.remove(remote_id),
                _ => None,
            }
        };
        let Some(link) = link else {
            return false;
        };
        self.reset_creation_attempts(remote_id);
        self.retire(&link).await;
        tracing::info!(
            target = "signaling",
            room_id = %self.room_id,
            remote_id,
            generation,
            "peer link removed after transport failure"
        );
        true
    }

    /// Tear down the link without resetting the creation counter, so a
    /// following `get_or_create` is charged against the same budget.
    pub async fn discard(&self, remote_id: &str, generation: u64) -> bool {
        let link = {
            let mut links = self.links.lock();
            match links.get(remote_id) {
                Some(link) if link.generation == generation => links.remove(remote_id),
                _ => None,
            }
        };
        match link {
            Some(link) => {
                self.retire(&link).await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let links: Vec<Arc<PeerLink>> = self.links.lock().drain().map(|(_, link)| link).collect();
        self.creation_attempts.lock().clear();
        for link in links {
            self.retire(&link).await;
        }
    }

    pub fn on_peer_event<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&PeerEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    pub(crate) fn emit(&self, event: PeerEvent) {
        self.events.emit(&event);
    }

    fn live(&self, remote_id: &str) -> Option<Arc<PeerLink>> {
        self.links
            .lock()
            .get(remote_id)
            .filter(|link| !link.is_closed() && !link.is_defunct())
            .cloned()
    }

    async fn retire(&self, link: &PeerLink) {
        link.teardown().await;
        self.emit(PeerEvent::RemoteStream {
            remote_id: link.remote_id.clone(),
            stream: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnectionFactory;
    use std::sync::atomic::AtomicUsize;

    fn make_registry(factory: &Arc<MockConnectionFactory>, limit: u32) -> ConnectionRegistry {
        ConnectionRegistry::new("lobby", factory.clone(), limit)
    }

    #[tokio::test]
    async fn existing_link_is_reused() {
        let factory = Arc::new(MockConnectionFactory::new());
        let registry = make_registry(&factory, 5);
        let first = registry.get_or_create("bob").await.expect("create");
        assert!(matches!(first, Acquired::Created(..)));
        let second = registry.get_or_create("bob").await.expect("reuse");
        assert!(matches!(second, Acquired::Existing(_)));
        assert!(Arc::ptr_eq(first.link(), second.link()));
        assert_eq!(factory.create_calls(), 1);
    }

    #[tokio::test]
    async fn failed_link_is_replaced_without_resetting_budget() {
        let factory = Arc::new(MockConnectionFactory::new());
        let registry = make_registry(&factory, 5);
        let first = registry.get_or_create("bob").await.expect("create");
        factory
            .connection_for("bob")
            .expect("mock connection")
            .set_connection_state(ConnectionState::Failed);

        let second = registry.get_or_create("bob").await.expect("recreate");
        assert!(matches!(second, Acquired::Created(..)));
        assert_ne!(first.link().generation(), second.link().generation());
        assert!(first.link().is_closed());
        assert_eq!(registry.creation_attempts("bob"), 2);
        assert_eq!(second.link().creation_attempt(), 2);
    }

    #[tokio::test]
    async fn creation_budget_is_terminal() {
        let factory = Arc::new(MockConnectionFactory::new());
        factory.fail_all_creations();
        let registry = make_registry(&factory, 5);

        let err = match registry.get_or_create("bob").await {
            Err(err) => err,
            Ok(_) => panic!("creation should fail"),
        };
        let RegistryError::CreationBudgetExceeded {
            attempts,
            last_error,
            ..
        } = err;
        assert_eq!(attempts, 5);
        assert!(last_error.is_some());
        assert_eq!(factory.create_calls(), 5);

        assert!(registry.get_or_create("bob").await.is_err());
        assert_eq!(factory.create_calls(), 5);
    }

    #[tokio::test]
    async fn transient_creation_failures_are_retried() {
        let factory = Arc::new(MockConnectionFactory::new());
        factory.fail_next_creations(2);
        let registry = make_registry(&factory, 5);
        let acquired = registry.get_or_create("bob").await.expect("third try works");
        assert_eq!(acquired.link().creation_attempt(), 3);
        assert_eq!(factory.create_calls(), 3);
    }

    #[tokio::test]
    async fn remove_releases_resources_and_notifies() {
        let factory = Arc::new(MockConnectionFactory::new());
        let registry = make_registry(&factory, 5);
        let gone = Arc::new(AtomicUsize::new(0));
        let gone_clone = gone.clone();
        let _handle = registry.on_peer_event(move |event| {
            if let PeerEvent::RemoteStream { stream: None, .. } = event {
                gone_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let acquired = registry.get_or_create("bob").await.expect("create");
        assert!(registry.remove("bob").await);
        let mock = factory.connection_for("bob").expect("mock connection");
        assert!(mock.tracks_stopped());
        assert!(mock.is_closed());
        assert!(acquired.link().is_closed());
        assert!(registry.get("bob").is_none());
        assert_eq!(registry.creation_attempts("bob"), 0);
        assert_eq!(gone.load(Ordering::SeqCst), 1);
        assert!(!registry.remove("bob").await);
    }

    #[tokio::test]
    async fn stale_generation_removal_is_ignored() {
        let factory = Arc::new(MockConnectionFactory::new());
        let registry = make_registry(&factory, 5);
        let acquired = registry.get_or_create("bob").await.expect("create");
        let generation = acquired.link().generation();
        assert!(!registry.remove_generation("bob", generation + 1).await);
        assert!(registry.get("bob").is_some());
        assert!(registry.remove_generation("bob", generation).await);
        assert!(registry.get("bob").is_none());
    }
}

//! In-memory connection primitive and signal sink for tests and local demos.
//!
//! [`MockPeerConnection`] follows the offer/answer signaling states of a real
//! peer connection, records every call, and lets the caller inject transport
//! events. [`MockConnectionFactory`] exposes knobs for the failure modes the
//! negotiation engine has to survive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::bus::SignalSink;
use crate::connection::{
    ConnectionEvent, ConnectionFactory, ConnectionState, CreatedConnection, IceCandidate,
    IceState, LocalStream, PeerConnection, SdpType, SessionDescription, SignalingState,
};
use crate::error::{PrimitiveError, PublishError};
use crate::message::{MessageKind, NegotiationMessage};

#[derive(Debug)]
struct MockState {
    signaling: SignalingState,
    connection: ConnectionState,
    ice: IceState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    streams: Vec<LocalStream>,
    bitrate_caps: Vec<u64>,
    tracks_stopped: bool,
}

pub struct MockPeerConnection {
    remote_id: String,
    serial: u64,
    fail_answers: Arc<AtomicBool>,
    ignore_remote: bool,
    state: Mutex<MockState>,
    events: Mutex<Option<mpsc::UnboundedSender<ConnectionEvent>>>,
    create_offer_calls: AtomicUsize,
    create_answer_calls: AtomicUsize,
    set_local_calls: AtomicUsize,
    set_remote_calls: AtomicUsize,
}

impl MockPeerConnection {
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn create_offer_calls(&self) -> usize {
        self.create_offer_calls.load(Ordering::SeqCst)
    }

    pub fn create_answer_calls(&self) -> usize {
        self.create_answer_calls.load(Ordering::SeqCst)
    }

    pub fn set_local_calls(&self) -> usize {
        self.set_local_calls.load(Ordering::SeqCst)
    }

    pub fn set_remote_calls(&self) -> usize {
        self.set_remote_calls.load(Ordering::SeqCst)
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn local_streams(&self) -> Vec<LocalStream> {
        self.state.lock().streams.clone()
    }

    pub fn bitrate_caps(&self) -> Vec<u64> {
        self.state.lock().bitrate_caps.clone()
    }

    pub fn tracks_stopped(&self) -> bool {
        self.state.lock().tracks_stopped
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().signaling == SignalingState::Closed
    }

    /// Deliver a transport event. Returns `false` once the connection is closed.
    pub fn emit(&self, event: ConnectionEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        self.state.lock().connection = state;
        self.emit(ConnectionEvent::ConnectionState(state));
    }

    pub fn set_ice_state(&self, state: IceState) {
        self.state.lock().ice = state;
        self.emit(ConnectionEvent::IceState(state));
    }

    fn ensure_open(&self) -> Result<(), PrimitiveError> {
        if self.is_closed() {
            return Err(PrimitiveError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, PrimitiveError> {
        self.ensure_open()?;
        let n = self.create_offer_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=mock {} {n} IN IP4 127.0.0.1\r\n",
            self.serial
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PrimitiveError> {
        self.ensure_open()?;
        let n = self.create_answer_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_answers.load(Ordering::SeqCst) {
            return Err(PrimitiveError::Operation("answer generation failed".into()));
        }
        if self.state.lock().signaling != SignalingState::HaveRemoteOffer {
            return Err(PrimitiveError::Operation(
                "no remote offer to answer".into(),
            ));
        }
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=mock {} {n} IN IP4 127.0.0.1\r\n",
            self.serial
        )))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), PrimitiveError> {
        self.ensure_open()?;
        self.set_local_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.signaling = match (state.signaling, desc.kind) {
            (SignalingState::Stable, SdpType::Offer)
            | (SignalingState::HaveLocalOffer, SdpType::Offer) => SignalingState::HaveLocalOffer,
            (SignalingState::HaveRemoteOffer, SdpType::Answer) => SignalingState::Stable,
            (current, kind) => {
                return Err(PrimitiveError::Operation(format!(
                    "cannot set local {kind:?} in {current:?}"
                )));
            }
        };
        state.local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), PrimitiveError> {
        self.ensure_open()?;
        self.set_remote_calls.fetch_add(1, Ordering::SeqCst);
        if self.ignore_remote {
            return Ok(());
        }
        let mut state = self.state.lock();
        state.signaling = match (state.signaling, desc.kind) {
            (SignalingState::Stable, SdpType::Offer)
            | (SignalingState::HaveRemoteOffer, SdpType::Offer) => {
                SignalingState::HaveRemoteOffer
            }
            (SignalingState::HaveLocalOffer, SdpType::Answer) => SignalingState::Stable,
            (current, kind) => {
                return Err(PrimitiveError::Operation(format!(
                    "cannot set remote {kind:?} in {current:?}"
                )));
            }
        };
        state.remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PrimitiveError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(PrimitiveError::Operation(
                "candidate before remote description".into(),
            ));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    fn ice_state(&self) -> IceState {
        self.state.lock().ice
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), PrimitiveError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if !state.streams.iter().any(|existing| existing.id == stream.id) {
            state.streams.push(stream.clone());
        }
        Ok(())
    }

    async fn set_video_bitrate(&self, max_bitrate_bps: u64) -> Result<bool, PrimitiveError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if !state.streams.iter().any(|stream| stream.has_video) {
            return Ok(false);
        }
        state.bitrate_caps.push(max_bitrate_bps);
        Ok(true)
    }

    async fn stop_local_tracks(&self) {
        self.state.lock().tracks_stopped = true;
    }

    async fn close(&self) -> Result<(), PrimitiveError> {
        {
            let mut state = self.state.lock();
            state.signaling = SignalingState::Closed;
            state.connection = ConnectionState::Closed;
            state.ice = IceState::Closed;
        }
        self.events.lock().take();
        Ok(())
    }
}

/// Builds [`MockPeerConnection`]s and remembers every one it built.
#[derive(Default)]
pub struct MockConnectionFactory {
    created: Mutex<Vec<Arc<MockPeerConnection>>>,
    create_calls: AtomicUsize,
    failing_creations: AtomicU64,
    corrupt_connections: AtomicU64,
    fail_answers: Arc<AtomicBool>,
    next_serial: AtomicU64,
}

impl MockConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls to `create` fail.
    pub fn fail_next_creations(&self, n: u64) {
        self.failing_creations.store(n, Ordering::SeqCst);
    }

    pub fn fail_all_creations(&self) {
        self.failing_creations.store(u64::MAX, Ordering::SeqCst);
    }

    /// Answer generation fails on every connection, existing ones included.
    pub fn set_fail_answers(&self, fail: bool) {
        self.fail_answers.store(fail, Ordering::SeqCst);
    }

    /// Connections built from now on accept remote descriptions without
    /// applying them, leaving the link stuck in `Stable` with no descriptions.
    pub fn set_ignore_remote_descriptions(&self, ignore: bool) {
        let n = if ignore { u64::MAX } else { 0 };
        self.corrupt_connections.store(n, Ordering::SeqCst);
    }

    /// Only the next `n` connections ignore remote descriptions.
    pub fn corrupt_next_connections(&self, n: u64) {
        self.corrupt_connections.store(n, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<Arc<MockPeerConnection>> {
        self.created.lock().clone()
    }

    /// Most recent connection built for `remote_id`.
    pub fn connection_for(&self, remote_id: &str) -> Option<Arc<MockPeerConnection>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|conn| conn.remote_id == remote_id)
            .cloned()
    }
}

fn take_one(counter: &AtomicU64) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
            0 => None,
            u64::MAX => Some(u64::MAX),
            n => Some(n - 1),
        })
        .is_ok()
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn create(&self, remote_id: &str) -> Result<CreatedConnection, PrimitiveError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failing_creations) {
            return Err(PrimitiveError::Unavailable(
                "mock factory refused to build a connection".into(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(MockPeerConnection {
            remote_id: remote_id.to_string(),
            serial: self.next_serial.fetch_add(1, Ordering::SeqCst) + 1,
            fail_answers: Arc::clone(&self.fail_answers),
            ignore_remote: take_one(&self.corrupt_connections),
            state: Mutex::new(MockState {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                ice: IceState::New,
                local: None,
                remote: None,
                candidates: Vec::new(),
                streams: Vec::new(),
                bitrate_caps: Vec::new(),
                tracks_stopped: false,
            }),
            events: Mutex::new(Some(tx)),
            create_offer_calls: AtomicUsize::new(0),
            create_answer_calls: AtomicUsize::new(0),
            set_local_calls: AtomicUsize::new(0),
            set_remote_calls: AtomicUsize::new(0),
        });
        self.created.lock().push(Arc::clone(&connection));
        Ok(CreatedConnection {
            connection,
            events: rx,
        })
    }
}

/// [`SignalSink`] that records everything published through it.
#[derive(Default)]
pub struct RecordingSink {
    published: Mutex<Vec<(String, NegotiationMessage)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, NegotiationMessage)> {
        self.published.lock().clone()
    }

    pub fn kinds(&self) -> Vec<MessageKind> {
        self.published
            .lock()
            .iter()
            .map(|(_, message)| message.kind().clone())
            .collect()
    }

    /// Yield to the runtime until at least `count` messages were recorded or
    /// a bounded number of turns has passed, then return what was recorded.
    pub async fn wait_for_count(&self, count: usize) -> Vec<(String, NegotiationMessage)> {
        for _ in 0..1_000 {
            if self.published.lock().len() >= count {
                break;
            }
            tokio::task::yield_now().await;
        }
        self.messages()
    }
}

#[async_trait]
impl SignalSink for RecordingSink {
    async fn publish(
        &self,
        room_id: &str,
        message: NegotiationMessage,
    ) -> Result<(), PublishError> {
        self.published.lock().push((room_id.to_string(), message));
        Ok(())
    }
}

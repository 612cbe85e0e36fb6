//! `room_signaling` connection primitive backed by `webrtc::RTCPeerConnection`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use room_signaling::{
    ConnectionEvent, ConnectionFactory, ConnectionState, CreatedConnection, IceCandidate,
    IceState, LocalStream, PeerConnection, PrimitiveError, RemoteStream, SdpType,
    SessionDescription, SignalingState,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<String>,
    /// Negotiate a data channel with this label so offers carry an
    /// application m-line even before any media is attached.
    pub data_channel_label: Option<String>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN.to_string()],
            data_channel_label: Some("room-signaling".to_string()),
        }
    }
}

impl WebRtcConfig {
    /// `ROOM_SIGNALING_ICE_SERVERS` is a comma separated list of URLs; an
    /// empty value disables ICE servers entirely.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("ROOM_SIGNALING_ICE_SERVERS") {
            config.ice_servers = raw
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }
        config
    }
}

type SharedTrack = Arc<dyn TrackLocal + Send + Sync>;

/// Builds one `RTCPeerConnection` per remote participant.
pub struct WebRtcConnectionFactory {
    api: API,
    config: WebRtcConfig,
    tracks: RwLock<Vec<SharedTrack>>,
}

impl WebRtcConnectionFactory {
    pub fn new(config: WebRtcConfig) -> Result<Self, PrimitiveError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(unavailable)?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(unavailable)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            config,
            tracks: RwLock::new(Vec::new()),
        })
    }

    /// Make a capture track available to [`PeerConnection::add_local_stream`];
    /// tracks are matched to a [`LocalStream`] by stream id.
    pub fn register_track(&self, track: SharedTrack) {
        self.tracks.write().push(track);
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn create(&self, remote_id: &str) -> Result<CreatedConnection, PrimitiveError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_configuration())
                .await
                .map_err(unavailable)?,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        wire_events(&pc, remote_id, events_tx);

        if let Some(label) = &self.config.data_channel_label {
            pc.create_data_channel(label, None)
                .await
                .map_err(operation)?;
        }

        let connection = Arc::new(WebRtcPeerConnection {
            remote_id: remote_id.to_string(),
            pc,
            tracks: self.tracks.read().clone(),
            senders: Mutex::new(Vec::new()),
            video_bitrate_cap: AtomicU64::new(0),
        });
        debug!(target = "webrtc", remote_id, "peer connection created");
        Ok(CreatedConnection {
            connection,
            events: events_rx,
        })
    }
}

fn wire_events(pc: &RTCPeerConnection, remote_id: &str, events: mpsc::UnboundedSender<ConnectionEvent>) {
    let candidates = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let candidates = candidates.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = candidates.send(ConnectionEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(err) => warn!(target = "webrtc", error = %err, "failed to encode local candidate"),
            }
        })
    }));

    let states = events.clone();
    let remote = remote_id.to_string();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let states = states.clone();
        let remote = remote.clone();
        Box::pin(async move {
            debug!(target = "webrtc", remote_id = %remote, ?state, "peer connection state changed");
            if let Some(state) = connection_state(state) {
                let _ = states.send(ConnectionEvent::ConnectionState(state));
            }
        })
    }));

    let ice = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let ice = ice.clone();
        Box::pin(async move {
            if let Some(state) = ice_state(state) {
                let _ = ice.send(ConnectionEvent::IceState(state));
            }
        })
    }));

    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(ConnectionEvent::RemoteStream(RemoteStream {
                    id: track.stream_id(),
                }));
            })
        },
    ));
}

pub struct WebRtcPeerConnection {
    remote_id: String,
    pc: Arc<RTCPeerConnection>,
    tracks: Vec<SharedTrack>,
    senders: Mutex<Vec<LocalSender>>,
    video_bitrate_cap: AtomicU64,
}

struct LocalSender {
    track_id: String,
    kind: RTPCodecType,
    sender: Arc<RTCRtpSender>,
}

impl WebRtcPeerConnection {
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Cap the video encoder feeding this connection should honour; zero
    /// means uncapped.
    pub fn video_bitrate_cap(&self) -> u64 {
        self.video_bitrate_cap.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, PrimitiveError> {
        let offer = self.pc.create_offer(None).await.map_err(operation)?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PrimitiveError> {
        let answer = self.pc.create_answer(None).await.map_err(operation)?;
        from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), PrimitiveError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(operation)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), PrimitiveError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(operation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PrimitiveError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(operation)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .and_then(|desc| from_rtc(desc).ok())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.pc
            .remote_description()
            .await
            .and_then(|desc| from_rtc(desc).ok())
    }

    fn connection_state(&self) -> ConnectionState {
        connection_state(self.pc.connection_state()).unwrap_or(ConnectionState::New)
    }

    fn ice_state(&self) -> IceState {
        ice_state(self.pc.ice_connection_state()).unwrap_or(IceState::New)
    }

    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.pc.signaling_state())
    }

    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), PrimitiveError> {
        let matching: Vec<SharedTrack> = self
            .tracks
            .iter()
            .filter(|track| track.stream_id() == stream.id)
            .filter(|track| match track.kind() {
                RTPCodecType::Video => stream.has_video,
                RTPCodecType::Audio => stream.has_audio,
                _ => false,
            })
            .cloned()
            .collect();
        if matching.is_empty() {
            return Err(PrimitiveError::Operation(format!(
                "no registered tracks for stream {}",
                stream.id
            )));
        }
        for track in matching {
            let kind = track.kind();
            let track_id = track.id().to_string();
            if self.senders.lock().iter().any(|sent| sent.track_id == track_id) {
                continue;
            }
            let sender = self.pc.add_track(track).await.map_err(operation)?;
            self.senders.lock().push(LocalSender {
                track_id,
                kind,
                sender,
            });
        }
        debug!(target = "webrtc", remote_id = %self.remote_id, stream = %stream.id, "local stream attached");
        Ok(())
    }

    async fn set_video_bitrate(&self, max_bitrate_bps: u64) -> Result<bool, PrimitiveError> {
        let has_video = self
            .senders
            .lock()
            .iter()
            .any(|sent| sent.kind == RTPCodecType::Video);
        if has_video {
            self.video_bitrate_cap
                .store(max_bitrate_bps, Ordering::SeqCst);
        }
        Ok(has_video)
    }

    async fn stop_local_tracks(&self) {
        let senders: Vec<Arc<RTCRtpSender>> = self
            .senders
            .lock()
            .drain(..)
            .map(|sent| sent.sender)
            .collect();
        for sender in senders {
            if let Err(err) = sender.stop().await {
                debug!(target = "webrtc", remote_id = %self.remote_id, error = %err, "stopping sender failed");
            }
        }
    }

    async fn close(&self) -> Result<(), PrimitiveError> {
        self.pc.close().await.map_err(operation)
    }
}

fn unavailable(err: webrtc::Error) -> PrimitiveError {
    PrimitiveError::Unavailable(err.to_string())
}

fn operation(err: webrtc::Error) -> PrimitiveError {
    PrimitiveError::Operation(err.to_string())
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, PrimitiveError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(PrimitiveError::Operation(
                "description without a type".into(),
            ));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PrimitiveError> {
    match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp).map_err(operation),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp).map_err(operation),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp).map_err(operation),
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            Ok(rollback)
        }
    }
}

fn connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceState> {
    match state {
        RTCIceConnectionState::New => Some(IceState::New),
        RTCIceConnectionState::Checking => Some(IceState::Checking),
        RTCIceConnectionState::Connected => Some(IceState::Connected),
        RTCIceConnectionState::Completed => Some(IceState::Completed),
        RTCIceConnectionState::Disconnected => Some(IceState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceState::Failed),
        RTCIceConnectionState::Closed => Some(IceState::Closed),
        RTCIceConnectionState::Unspecified => None,
    }
}

fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
    }
}

//! Contract of the connection-establishment primitive the engine drives.
//!
//! Media transport itself lives behind these traits; `transport-webrtc`
//! provides the production implementation and [`crate::mock`] an in-memory one.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::PrimitiveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A reachability candidate in its JSON-exchangeable form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, IceState::Failed | IceState::Closed)
    }
}

/// Description-exchange state as reported by the primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Local capture attached to every link in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStream {
    pub id: String,
    pub has_video: bool,
    pub has_audio: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    IceState(IceState),
    RemoteStream(RemoteStream),
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PrimitiveError>;
    async fn create_answer(&self) -> Result<SessionDescription, PrimitiveError>;
    async fn set_local_description(&self, desc: SessionDescription)
    -> Result<(), PrimitiveError>;
    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), PrimitiveError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PrimitiveError>;
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn remote_description(&self) -> Option<SessionDescription>;

    fn connection_state(&self) -> ConnectionState;
    fn ice_state(&self) -> IceState;
    fn signaling_state(&self) -> SignalingState;

    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), PrimitiveError>;
    /// Cap the outbound video sender. Returns `false` when no video sender exists.
    async fn set_video_bitrate(&self, max_bitrate_bps: u64) -> Result<bool, PrimitiveError>;
    async fn stop_local_tracks(&self);
    async fn close(&self) -> Result<(), PrimitiveError>;
}

/// A freshly constructed connection and the stream of its transport events.
pub struct CreatedConnection {
    pub connection: Arc<dyn PeerConnection>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self, remote_id: &str) -> Result<CreatedConnection, PrimitiveError>;
}

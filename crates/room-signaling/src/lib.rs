//! Peer-connection negotiation over a room-scoped publish/subscribe bus.
//!
//! A [`SignalingClient`] joins rooms through the [`SubscriptionSupervisor`],
//! routes inbound traffic through the [`SignalingRouter`] and runs one
//! [`NegotiationEngine`] per room. Each engine owns a [`ConnectionRegistry`]
//! of [`PeerLink`]s built by a pluggable [`ConnectionFactory`].

pub mod bus;
pub mod client;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod identity;
pub mod message;
pub mod mock;
pub mod observer;
pub mod registry;
pub mod router;
pub mod supervisor;
pub mod telemetry;

pub use bus::{ChannelState, MessageBus, RoomChannel, SignalSink, channel_name};
pub use client::SignalingClient;
pub use config::SignalingConfig;
pub use connection::{
    ConnectionEvent, ConnectionFactory, ConnectionState, CreatedConnection, IceCandidate,
    IceState, LocalStream, PeerConnection, RemoteStream, SdpType, SessionDescription,
    SignalingState,
};
pub use engine::NegotiationEngine;
pub use error::{ConnectError, NegotiationError, PrimitiveError, PublishError, RegistryError};
pub use identity::{Identity, IdentityProvider, SharedIdentity};
pub use message::{MessageKind, NegotiationMessage, Notice, NoticeKind, RoomMessage};
pub use observer::{ListenerHandle, Listeners};
pub use registry::{Acquired, ConnectionRegistry, NegotiationState, PeerEvent, PeerLink};
pub use router::{RouteOutcome, SignalingRouter};
pub use supervisor::SubscriptionSupervisor;

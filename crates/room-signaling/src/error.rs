use thiserror::Error;

use crate::connection::SdpType;
use crate::registry::NegotiationState;

/// Failure to bring a room channel to the joined state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("room channel did not join in time")]
    Timeout,
    #[error("room channel error: {0}")]
    ChannelError(String),
    #[error("room channel closed before joining")]
    ClosedPrematurely,
    #[error("invalid room id: {0}")]
    InvalidRoom(String),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode signaling message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("signaling transport error: {0}")]
    Transport(String),
}

/// Errors reported by the underlying connection primitive.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PrimitiveError {
    #[error("connection primitive unavailable: {0}")]
    Unavailable(String),
    #[error("connection operation failed: {0}")]
    Operation(String),
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("gave up creating a link to {remote_id} after {attempts} attempts")]
    CreationBudgetExceeded {
        remote_id: String,
        attempts: u32,
        last_error: Option<String>,
    },
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("cannot create an offer in state {0:?}")]
    InvalidStateForOffer(NegotiationState),
    #[error("cannot create an answer in state {0:?}")]
    InvalidStateForAnswer(NegotiationState),
    #[error("answer budget for {remote_id} exhausted after {attempts} attempts")]
    RetryBudgetExceeded { remote_id: String, attempts: u32 },
    #[error("expected a {expected:?} description, got {actual:?}")]
    UnexpectedDescription { expected: SdpType, actual: SdpType },
    #[error("link to {0} closed during negotiation")]
    LinkClosed(String),
    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload { kind: String, reason: String },
    #[error(transparent)]
    Primitive(#[from] PrimitiveError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

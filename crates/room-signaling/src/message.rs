use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::connection::{IceCandidate, SessionDescription};
use crate::error::NegotiationError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    Offer,
    Answer,
    Candidate,
    PeerJoined,
    PeerLeft,
    Chat,
    Unknown(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::Candidate => "ice-candidate",
            MessageKind::PeerJoined => "user-joined",
            MessageKind::PeerLeft => "user-left",
            MessageKind::Chat => "chat",
            MessageKind::Unknown(kind) => kind,
        }
    }
}

impl From<String> for MessageKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "offer" => MessageKind::Offer,
            "answer" => MessageKind::Answer,
            "ice-candidate" => MessageKind::Candidate,
            "user-joined" => MessageKind::PeerJoined,
            "user-left" => MessageKind::PeerLeft,
            "chat" => MessageKind::Chat,
            _ => MessageKind::Unknown(value),
        }
    }
}

impl From<MessageKind> for String {
    fn from(value: MessageKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    System,
    User,
}

/// Payload of a `chat` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub text: String,
}

/// One signaling message as carried on a room channel.
///
/// Fields are fixed at construction; `to == None` addresses the whole room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationMessage {
    #[serde(rename = "type")]
    kind: MessageKind,
    from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(rename = "timestamp")]
    sent_at: i64,
}

impl NegotiationMessage {
    pub fn new(
        kind: MessageKind,
        from: impl Into<String>,
        to: Option<String>,
        data: Value,
    ) -> Self {
        Self {
            kind,
            from: from.into(),
            to,
            data,
            sent_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Same message stamped with an explicit send time in Unix milliseconds.
    pub fn at(mut self, sent_at: i64) -> Self {
        self.sent_at = sent_at;
        self
    }

    pub fn offer(from: &str, to: &str, desc: &SessionDescription) -> Self {
        Self::new(
            MessageKind::Offer,
            from,
            Some(to.to_string()),
            json!(desc),
        )
    }

    pub fn answer(from: &str, to: &str, desc: &SessionDescription) -> Self {
        Self::new(
            MessageKind::Answer,
            from,
            Some(to.to_string()),
            json!(desc),
        )
    }

    pub fn candidate(from: &str, to: &str, candidate: &IceCandidate) -> Self {
        Self::new(
            MessageKind::Candidate,
            from,
            Some(to.to_string()),
            json!(candidate),
        )
    }

    pub fn peer_joined(from: &str) -> Self {
        Self::new(MessageKind::PeerJoined, from, None, json!({}))
    }

    pub fn peer_left(from: &str) -> Self {
        Self::new(MessageKind::PeerLeft, from, None, json!({}))
    }

    pub fn system_notice(from: &str, text: impl Into<String>) -> Self {
        let notice = Notice {
            kind: NoticeKind::System,
            text: text.into(),
        };
        Self::new(MessageKind::Chat, from, None, json!(notice))
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> Option<&str> {
        self.to.as_deref()
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn sent_at(&self) -> i64 {
        self.sent_at
    }

    pub fn description(&self) -> Result<SessionDescription, NegotiationError> {
        self.decode_data()
    }

    pub fn ice_candidate(&self) -> Result<IceCandidate, NegotiationError> {
        self.decode_data()
    }

    /// The notice carried by a `chat` message, if the payload is one.
    pub fn notice(&self) -> Option<Notice> {
        if self.kind != MessageKind::Chat {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    fn decode_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, NegotiationError> {
        serde_json::from_value(self.data.clone()).map_err(|err| NegotiationError::MalformedPayload {
            kind: self.kind.to_string(),
            reason: err.to_string(),
        })
    }
}

/// An inbound message together with the room it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomMessage {
    pub room_id: String,
    pub message: NegotiationMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_serializes_to_wire_shape() {
        let desc = SessionDescription::offer("v=0");
        let message = NegotiationMessage::offer("alice", "bob", &desc).at(1_700_000_000_000);
        let value: Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "offer",
                "from": "alice",
                "to": "bob",
                "data": { "type": "offer", "sdp": "v=0" },
                "timestamp": 1_700_000_000_000i64,
            })
        );
    }

    #[test]
    fn broadcast_omits_recipient() {
        let message = NegotiationMessage::peer_joined("alice");
        let value: Value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "user-joined");
        assert!(value.get("to").is_none());
        assert_eq!(message.to(), None);
    }

    #[test]
    fn candidate_payload_uses_camel_case_keys() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 53421 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let message = NegotiationMessage::candidate("alice", "bob", &candidate);
        assert_eq!(message.data()["sdpMid"], "0");
        assert_eq!(message.data()["sdpMLineIndex"], 0);
        assert_eq!(message.kind().as_str(), "ice-candidate");
        assert_eq!(message.ice_candidate().unwrap(), candidate);
    }

    #[test]
    fn unknown_kinds_decode_instead_of_failing() {
        let raw = br#"{"type":"screen-share","from":"carol","data":{},"timestamp":5}"#;
        let message = NegotiationMessage::decode(raw).unwrap();
        assert_eq!(message.kind(), &MessageKind::Unknown("screen-share".into()));
        assert_eq!(message.sent_at(), 5);
    }

    #[test]
    fn malformed_description_is_reported() {
        let message = NegotiationMessage::new(
            MessageKind::Offer,
            "alice",
            Some("bob".into()),
            json!({ "sdp": 3 }),
        );
        assert!(matches!(
            message.description(),
            Err(NegotiationError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn system_notice_round_trips_through_chat() {
        let message = NegotiationMessage::system_notice("server", "room closing soon");
        let decoded = NegotiationMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind(), &MessageKind::Chat);
        assert_eq!(
            decoded.notice(),
            Some(Notice {
                kind: NoticeKind::System,
                text: "room closing soon".into()
            })
        );
    }
}

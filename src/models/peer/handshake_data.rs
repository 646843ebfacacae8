use serde::Deserialize;
use serde::Serialize;

use super::PeerId;
use super::PeerMessage;
use super::HANDSHAKE;
use super::HANDSHAKE_RESPONSE;

/// Payload of a `handshake` frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeData {
    pub peer_id: PeerId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeStatus {
    Success,
    Error,
}

/// Payload of a `handshake_response` frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub peer_id: PeerId,
    pub status: HandshakeStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HandshakeData {
    pub fn new(peer_id: PeerId) -> Self {
        Self { peer_id }
    }

    pub fn to_message(&self) -> PeerMessage {
        PeerMessage::new(HANDSHAKE).with_field("peer_id", self.peer_id.as_str())
    }

    pub fn accept(&self) -> HandshakeResponse {
        HandshakeResponse {
            peer_id: self.peer_id.clone(),
            status: HandshakeStatus::Success,
            message: None,
        }
    }

    pub fn refuse(&self, reason: impl Into<String>) -> HandshakeResponse {
        HandshakeResponse {
            peer_id: self.peer_id.clone(),
            status: HandshakeStatus::Error,
            message: Some(reason.into()),
        }
    }
}

impl HandshakeResponse {
    pub fn is_success(&self) -> bool {
        self.status == HandshakeStatus::Success
    }

    pub fn to_message(&self) -> PeerMessage {
        let status = match self.status {
            HandshakeStatus::Success => "success",
            HandshakeStatus::Error => "error",
        };
        let msg = PeerMessage::new(HANDSHAKE_RESPONSE)
            .with_field("peer_id", self.peer_id.as_str())
            .with_field("status", status);
        match &self.message {
            Some(reason) => msg.with_field("message", reason.as_str()),
            None => msg,
        }
    }
}

#[cfg(test)]
mod handshake_data_tests {
    use assert2::check;
    use assert2::let_assert;

    use super::*;

    #[test]
    fn handshake_frame_matches_wire_contract() {
        let own = HandshakeData::new(PeerId::from("alice"));
        let wire = serde_json::to_value(own.to_message()).unwrap();
        check!(wire == serde_json::json!({"type": "handshake", "peer_id": "alice"}));

        let response = serde_json::to_value(own.accept().to_message()).unwrap();
        check!(
            response
                == serde_json::json!({
                    "type": "handshake_response",
                    "peer_id": "alice",
                    "status": "success"
                })
        );
    }

    #[test]
    fn handshake_payloads_decode_from_frames() {
        let own = HandshakeData::new(PeerId::from("bob"));
        let decoded: HandshakeData = own.to_message().payload().unwrap();
        check!(decoded == own);

        let refusal = own.refuse("already connected");
        let decoded: HandshakeResponse = refusal.to_message().payload().unwrap();
        check!(decoded == refusal);
        check!(!decoded.is_success());
    }

    #[test]
    fn unknown_status_is_malformed() {
        let msg = PeerMessage::new(HANDSHAKE_RESPONSE)
            .with_field("peer_id", "bob")
            .with_field("status", "maybe");
        let_assert!(Err(_) = msg.payload::<HandshakeResponse>());
    }
}

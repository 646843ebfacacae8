pub mod connection_table;
pub mod handshake_data;
pub mod inbound_message;
pub mod peer_connection;

use std::borrow::Borrow;
use std::convert::Infallible;
use std::fmt::Display;
use std::str::FromStr;

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

pub use self::connection_table::Admission;
pub use self::connection_table::ConnectionTable;
pub use self::handshake_data::HandshakeData;
pub use self::handshake_data::HandshakeResponse;
pub use self::handshake_data::HandshakeStatus;
pub use self::inbound_message::InboundMessage;
pub use self::peer_connection::PeerConnection;
pub use self::peer_connection::PeerSink;
pub use self::peer_connection::PeerStream;

/// Message type of the first frame an initiating peer sends.
pub const HANDSHAKE: &str = "handshake";

/// Message type of the answer to a [`HANDSHAKE`] frame.
pub const HANDSHAKE_RESPONSE: &str = "handshake_response";

/// Opaque identity of a chat participant. Unique per participant; the
/// connection table holds at most one live connection per identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Lifecycle of a single peer link.
///
/// ```text
/// Connecting -> AwaitingHandshake -> Established -> Closing -> Closed
///      \______________\__________________________________/
///                  (failure before Established)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    AwaitingHandshake,
    Established,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::AwaitingHandshake;
        use ConnectionState::Closed;
        use ConnectionState::Closing;
        use ConnectionState::Connecting;
        use ConnectionState::Established;

        matches!(
            (self, next),
            (Connecting, AwaitingHandshake)
                | (AwaitingHandshake, Established)
                | (Connecting | AwaitingHandshake, Closed)
                | (Established, Closing | Closed)
                | (Closing, Closed)
        )
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingHandshake => "awaiting handshake",
            ConnectionState::Established => "established",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Which side dialed the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionDirection {
    Inbound,
    Outbound,
}

impl ConnectionDirection {
    /// Identity of the peer that opened the transport.
    pub fn dialer<'a>(self, own_id: &'a PeerId, remote_id: &'a PeerId) -> &'a PeerId {
        match self {
            ConnectionDirection::Inbound => remote_id,
            ConnectionDirection::Outbound => own_id,
        }
    }

    /// A link is canonical when it was dialed by the smaller of the two
    /// identities. Used to collapse simultaneous dials deterministically.
    pub fn is_canonical(self, own_id: &PeerId, remote_id: &PeerId) -> bool {
        self.dialer(own_id, remote_id) == own_id.min(remote_id)
    }
}

/// One frame on a peer link: a JSON object with a mandatory `type` field.
/// All other fields are carried verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerMessage {
    #[serde(rename = "type")]
    pub message_type: String,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl PeerMessage {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            fields: Map::new(),
        }
    }

    /// Set a field. The `type` key is reserved and silently ignored.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != "type" {
            self.fields.insert(key, value.into());
        }
        self
    }

    /// Application frame as sent by [`crate::Node::send`].
    pub fn application(
        message_type: impl Into<String>,
        content: impl Into<Value>,
        from: &PeerId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::new(message_type)
            .with_field("content", content)
            .with_field("from", from.as_str())
            .with_field(
                "timestamp",
                timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            )
    }

    pub fn is_control(&self) -> bool {
        self.message_type == HANDSHAKE || self.message_type == HANDSHAKE_RESPONSE
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Interpret the non-`type` fields as a typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }
}

use chrono::DateTime;
use chrono::Utc;
use serde_json::Map;
use serde_json::Value;

use super::PeerId;
use super::PeerMessage;

/// An application message as received from an established peer.
///
/// Immutable once constructed; handlers receive their own copy.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    message_type: String,
    content: String,
    from_peer: PeerId,
    received_at: DateTime<Utc>,
    fields: Map<String, Value>,
}

impl InboundMessage {
    /// `content` is taken verbatim when it is a JSON string, rendered as JSON
    /// text otherwise, and empty when absent.
    pub fn new(message: PeerMessage, from_peer: PeerId, received_at: DateTime<Utc>) -> Self {
        let PeerMessage {
            message_type,
            fields,
        } = message;
        let content = match fields.get("content") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };

        Self {
            message_type,
            content,
            from_peer,
            received_at,
            fields,
        }
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn from_peer(&self) -> &PeerId {
        &self.from_peer
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Any other field the sender attached, e.g. `channel` or `timestamp`.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

#[cfg(test)]
mod inbound_message_tests {
    use assert2::check;

    use super::*;

    #[test]
    fn content_is_extracted_from_frame() {
        let msg = PeerMessage::new("chat_message").with_field("content", "hi");
        let inbound = InboundMessage::new(msg, PeerId::from("bob"), Utc::now());

        check!(inbound.message_type() == "chat_message");
        check!(inbound.content() == "hi");
        check!(inbound.from_peer() == &PeerId::from("bob"));
    }

    #[test]
    fn non_string_content_is_rendered_as_json() {
        let msg = PeerMessage::new("status").with_field("content", serde_json::json!({"n": 1}));
        let inbound = InboundMessage::new(msg, PeerId::from("bob"), Utc::now());
        check!(inbound.content() == r#"{"n":1}"#);

        let msg = PeerMessage::new("ping");
        let inbound = InboundMessage::new(msg, PeerId::from("bob"), Utc::now());
        check!(inbound.content() == "");
    }

    #[test]
    fn extra_fields_remain_accessible() {
        let msg = PeerMessage::new("join_channel").with_field("channel", "rust");
        let inbound = InboundMessage::new(msg, PeerId::from("carol"), Utc::now());
        check!(inbound.field("channel") == Some(&Value::from("rust")));
        check!(inbound.field("missing").is_none());
    }
}

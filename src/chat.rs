//! Chat application on top of [`Node`]: the message handlers and the
//! interactive command set of the `chatmesh` binary.

use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::connect_to_peers::ConnectOutcome;
use crate::error::NodeError;
use crate::models::handler_registry::MessageHandler;
use crate::models::peer::InboundMessage;
use crate::models::peer::PeerId;
use crate::node::Node;

pub const CHAT_MESSAGE: &str = "chat_message";
pub const JOIN_CHANNEL: &str = "join_channel";
pub const LEAVE_CHANNEL: &str = "leave_channel";

const DEFAULT_CHANNEL: &str = "general";

/// How many received messages `/messages` shows.
const SHOWN_RECENT_MESSAGES: usize = 10;

pub const HELP: &str = "Commands:
  /discover                 Discover and connect to peers
  /peers                    Show connected peers
  /connect <peer_id>        Connect to a peer known to the tracker
  /msg <peer_id> <message>  Send a direct message
  /broadcast <message>      Send a message to all connected peers
  /messages                 Show recent messages
  /help                     Show this help
  /quit                     Exit
Anything else is broadcast as a chat message.";

/// One line of user input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatCommand {
    Discover,
    Peers,
    Connect(PeerId),
    Msg { peer_id: PeerId, text: String },
    Broadcast(String),
    Messages,
    Help,
    Quit,
    /// Plain text, broadcast as a chat message.
    Say(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChatCommandError {
    #[error("empty input")]
    Empty,

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("unknown command: {0} (type /help for available commands)")]
    Unknown(String),
}

impl FromStr for ChatCommand {
    type Err = ChatCommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ChatCommandError::Empty);
        }
        if !line.starts_with('/') {
            return Ok(ChatCommand::Say(line.to_owned()));
        }

        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command.to_lowercase().as_str() {
            "/discover" => Ok(ChatCommand::Discover),
            "/peers" => Ok(ChatCommand::Peers),
            "/messages" => Ok(ChatCommand::Messages),
            "/help" => Ok(ChatCommand::Help),
            "/quit" | "/exit" => Ok(ChatCommand::Quit),
            "/connect" => match rest.split_whitespace().next() {
                Some(peer_id) => Ok(ChatCommand::Connect(PeerId::from(peer_id))),
                None => Err(ChatCommandError::Usage("/connect <peer_id>")),
            },
            "/msg" => match rest.split_once(char::is_whitespace) {
                Some((peer_id, text)) if !text.trim().is_empty() => Ok(ChatCommand::Msg {
                    peer_id: PeerId::from(peer_id),
                    text: text.trim().to_owned(),
                }),
                _ => Err(ChatCommandError::Usage("/msg <peer_id> <message>")),
            },
            "/broadcast" if !rest.is_empty() => Ok(ChatCommand::Broadcast(rest.to_owned())),
            "/broadcast" => Err(ChatCommandError::Usage("/broadcast <message>")),
            _ => Err(ChatCommandError::Unknown(command.to_owned())),
        }
    }
}

impl ChatCommand {
    /// Run the command against `node` and describe the result for the user.
    /// [`ChatCommand::Quit`] has no effect here; the caller stops the node.
    pub async fn execute(&self, node: &Node) -> Result<String, NodeError> {
        match self {
            ChatCommand::Discover => {
                let count = node.discover_and_connect().await?;
                Ok(format!("Discovered {count} new peers"))
            }
            ChatCommand::Peers => {
                let peers = node.connected_peers().await;
                if peers.is_empty() {
                    Ok("No connected peers".to_owned())
                } else {
                    let names: Vec<&str> = peers.iter().map(PeerId::as_str).collect();
                    Ok(format!("Connected peers: {}", names.join(", ")))
                }
            }
            ChatCommand::Connect(peer_id) => {
                let peers = node.tracker_peers().await?;
                let Some(record) = peers.iter().find(|record| record.peer_id == *peer_id) else {
                    return Ok(format!("Peer {peer_id} not found"));
                };
                match node.connect_to(peer_id, &record.ip, record.port).await? {
                    ConnectOutcome::Established => Ok(format!("Connected to {peer_id}")),
                    ConnectOutcome::AlreadyConnected => {
                        Ok(format!("Already connected to {peer_id}"))
                    }
                }
            }
            ChatCommand::Msg { peer_id, text } => {
                node.send(peer_id, CHAT_MESSAGE, text.as_str()).await?;
                Ok(format!("Message sent to {peer_id}"))
            }
            ChatCommand::Broadcast(text) | ChatCommand::Say(text) => {
                let count = node.broadcast(CHAT_MESSAGE, text.as_str()).await?;
                Ok(format!("Broadcasted to {count} peers"))
            }
            ChatCommand::Messages => {
                let messages = node.recent_messages(SHOWN_RECENT_MESSAGES).await;
                if messages.is_empty() {
                    return Ok("No messages".to_owned());
                }
                let lines: Vec<String> = messages.iter().map(render_recent).collect();
                Ok(format!("Recent messages:\n{}", lines.join("\n")))
            }
            ChatCommand::Help => Ok(HELP.to_owned()),
            ChatCommand::Quit => Ok("Goodbye!".to_owned()),
        }
    }
}

fn channel_of(message: &InboundMessage) -> &str {
    message
        .field("channel")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_CHANNEL)
}

pub fn render_chat_message(message: &InboundMessage) -> String {
    format!("[CHAT] {}: {}", message.from_peer(), message.content())
}

pub fn render_join_channel(message: &InboundMessage) -> String {
    format!(
        "[CHAT] {} joined channel: {}",
        message.from_peer(),
        channel_of(message)
    )
}

pub fn render_leave_channel(message: &InboundMessage) -> String {
    format!(
        "[CHAT] {} left channel: {}",
        message.from_peer(),
        channel_of(message)
    )
}

fn render_recent(message: &InboundMessage) -> String {
    format!(
        "  [{}] {}: {}",
        message.received_at().format("%Y-%m-%d %H:%M:%S"),
        message.from_peer(),
        message.content()
    )
}

/// Handler that renders a message to a line of output.
struct ChatPrinter {
    output: mpsc::UnboundedSender<String>,
    render: fn(&InboundMessage) -> String,
}

#[async_trait]
impl MessageHandler for ChatPrinter {
    async fn handle(&self, message: InboundMessage) -> anyhow::Result<()> {
        self.output.send((self.render)(&message))?;
        Ok(())
    }
}

/// Register the chat handlers on `node`; rendered lines are sent to `output`.
pub async fn register_chat_handlers(node: &Node, output: mpsc::UnboundedSender<String>) {
    let handlers: [(&str, fn(&InboundMessage) -> String); 3] = [
        (CHAT_MESSAGE, render_chat_message),
        (JOIN_CHANNEL, render_join_channel),
        (LEAVE_CHANNEL, render_leave_channel),
    ];
    for (message_type, render) in handlers {
        node.register_handler(
            message_type,
            ChatPrinter {
                output: output.clone(),
                render,
            },
        )
        .await;
    }
}

#[cfg(test)]
mod chat_tests {
    use std::sync::Arc;

    use assert2::check;
    use assert2::let_assert;
    use chrono::Utc;
    use tracing_test::traced_test;

    use super::*;
    use crate::config_models::cli_args::Args;
    use crate::discovery::InMemoryTracker;
    use crate::models::peer::PeerMessage;

    fn parse(line: &str) -> Result<ChatCommand, ChatCommandError> {
        line.parse()
    }

    #[test]
    fn parse_commands() {
        check!(parse("/discover") == Ok(ChatCommand::Discover));
        check!(parse("  /PEERS ") == Ok(ChatCommand::Peers));
        check!(parse("/connect bob") == Ok(ChatCommand::Connect(PeerId::from("bob"))));
        check!(
            parse("/msg bob hello there")
                == Ok(ChatCommand::Msg {
                    peer_id: PeerId::from("bob"),
                    text: "hello there".to_owned()
                })
        );
        check!(parse("/broadcast hi all") == Ok(ChatCommand::Broadcast("hi all".to_owned())));
        check!(parse("/messages") == Ok(ChatCommand::Messages));
        check!(parse("/quit") == Ok(ChatCommand::Quit));
        check!(parse("hello") == Ok(ChatCommand::Say("hello".to_owned())));
    }

    #[test]
    fn reject_incomplete_commands() {
        check!(parse("") == Err(ChatCommandError::Empty));
        check!(parse("/connect") == Err(ChatCommandError::Usage("/connect <peer_id>")));
        check!(parse("/msg bob") == Err(ChatCommandError::Usage("/msg <peer_id> <message>")));
        check!(parse("/broadcast   ") == Err(ChatCommandError::Usage("/broadcast <message>")));
        let_assert!(Err(ChatCommandError::Unknown(command)) = parse("/dance"));
        check!(command == "/dance");
    }

    #[test]
    fn render_channel_events() {
        let join = InboundMessage::new(
            PeerMessage::new(JOIN_CHANNEL).with_field("channel", "rust"),
            PeerId::from("bob"),
            Utc::now(),
        );
        check!(render_join_channel(&join) == "[CHAT] bob joined channel: rust");

        let leave = InboundMessage::new(
            PeerMessage::new(LEAVE_CHANNEL),
            PeerId::from("bob"),
            Utc::now(),
        );
        check!(render_leave_channel(&leave) == "[CHAT] bob left channel: general");

        let chat = InboundMessage::new(
            PeerMessage::new(CHAT_MESSAGE).with_field("content", "hi"),
            PeerId::from("carol"),
            Utc::now(),
        );
        check!(render_chat_message(&chat) == "[CHAT] carol: hi");
    }

    #[traced_test]
    #[tokio::test]
    async fn commands_on_an_isolated_node() {
        let args = Args {
            peer_id: Some(PeerId::from("alice")),
            listen_addr: "127.0.0.1".parse().unwrap(),
            peer_port: 0,
            ..Args::default()
        };
        let node = Node::with_tracker(args, Arc::new(InMemoryTracker::new()));
        node.start().await.unwrap();

        check!(ChatCommand::Peers.execute(&node).await.unwrap() == "No connected peers");
        check!(ChatCommand::Messages.execute(&node).await.unwrap() == "No messages");
        check!(ChatCommand::Discover.execute(&node).await.unwrap() == "Discovered 0 new peers");
        check!(
            ChatCommand::Say("hi".to_owned()).execute(&node).await.unwrap()
                == "Broadcasted to 0 peers"
        );
        check!(
            ChatCommand::Connect(PeerId::from("bob")).execute(&node).await.unwrap()
                == "Peer bob not found"
        );
        let_assert!(
            Err(NodeError::NotConnected(_)) = ChatCommand::Msg {
                peer_id: PeerId::from("bob"),
                text: "hi".to_owned()
            }
            .execute(&node)
            .await
        );

        node.stop().await;
    }
}

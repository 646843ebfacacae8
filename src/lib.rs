//! Peer-to-peer overlay for a small chat application.
//!
//! Every participant runs a [`Node`]: it publishes its address to a
//! rendezvous tracker, opens direct TCP connections to other participants,
//! upgrades each one with a `handshake` exchange, and routes the JSON frames
//! it receives to handlers registered per message type.

pub mod chat;
pub mod config_models;
pub mod connect_to_peers;
pub mod discovery;
pub mod error;
pub mod main_loop;
pub mod models;
pub mod node;
pub mod peer_loop;


use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use crate::config_models::cli_args::Args;
pub use crate::connect_to_peers::ConnectOutcome;
pub use crate::error::NodeError;
pub use crate::models::handler_registry::MessageHandler;
pub use crate::models::peer::InboundMessage;
pub use crate::models::peer::PeerId;
pub use crate::models::peer::PeerMessage;
pub use crate::node::Node;

use crate::chat::ChatCommand;
use crate::chat::ChatCommandError;

/// Run the interactive chat client until `/quit`, end of input or Ctrl-C.
pub async fn initialize(args: Args) -> Result<()> {
    let auto_discover = !args.no_auto_discover;
    let auto_discover_delay = args.auto_discover_delay;
    let node = Node::new(args)?;

    let (output_tx, mut output_rx) = mpsc::unbounded_channel::<String>();
    chat::register_chat_handlers(&node, output_tx).await;
    let printer = tokio::spawn(async move {
        while let Some(line) = output_rx.recv().await {
            println!("{line}");
        }
    });

    node.start().await?;
    println!("=== P2P Chat Client ===");
    println!("Peer ID: {}", node.peer_id());
    println!("{}", chat::HELP);

    if auto_discover {
        let node = node.clone();
        tokio::spawn(async move {
            tokio::time::sleep(auto_discover_delay).await;
            println!("[System] Auto-discovering peers...");
            match node.discover_and_connect().await {
                Ok(count) => println!("[System] Discovered {count} new peers"),
                Err(err) => debug!("Auto-discovery skipped: {err}"),
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C");
                None
            }
        };
        let Some(line) = line else {
            break;
        };

        let command = match line.parse::<ChatCommand>() {
            Ok(command) => command,
            Err(ChatCommandError::Empty) => continue,
            Err(err) => {
                println!("[System] {err}");
                continue;
            }
        };

        match command.execute(&node).await {
            Ok(report) => println!("[System] {report}"),
            Err(err) => println!("[System] Failed: {err}"),
        }
        if command == ChatCommand::Quit {
            break;
        }
    }

    println!("[System] Shutting down...");
    node.stop().await;
    printer.abort();
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        warn!("Output printer did not stop");
    }
    Ok(())
}

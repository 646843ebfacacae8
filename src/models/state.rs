use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::warn;

use super::handler_registry::HandlerRegistry;
use super::message_log::MessageLog;
use super::peer::ConnectionTable;
use super::peer::HandshakeData;
use super::peer::PeerId;
use super::peer::PeerMessage;
use crate::config_models::cli_args::Args;
use crate::error::NodeError;

/// Everything the listener and the per-connection workers share. Owned by a
/// [`crate::Node`] and handed to workers behind an `Arc`.
#[derive(Debug)]
pub struct NodeState {
    own_id: PeerId,
    table: ConnectionTable,
    handlers: HandlerRegistry,
    messages: MessageLog,
    handshake_timeout: Duration,
    connect_timeout: Duration,
    write_timeout: Duration,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl NodeState {
    pub fn new(own_id: PeerId, cli: &Args) -> Self {
        Self {
            own_id,
            table: ConnectionTable::new(),
            handlers: HandlerRegistry::new(),
            messages: MessageLog::with_capacity(cli.max_recent_messages),
            handshake_timeout: cli.handshake_timeout,
            connect_timeout: cli.connect_timeout,
            write_timeout: cli.write_timeout,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn own_id(&self) -> &PeerId {
        &self.own_id
    }

    pub fn own_handshake(&self) -> HandshakeData {
        HandshakeData::new(self.own_id.clone())
    }

    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Write one frame to `peer_id`. A failed write tears that connection
    /// down; the failure is returned, never retried.
    pub async fn send(&self, peer_id: &PeerId, message: PeerMessage) -> Result<(), NodeError> {
        let connection = self
            .table
            .get(peer_id)
            .await
            .ok_or_else(|| NodeError::NotConnected(peer_id.clone()))?;

        if let Err(err) = connection.send(message).await {
            warn!("Failed to send to {peer_id}: {err}. Closing connection");
            self.table.remove_connection(&connection).await;
            return Err(NodeError::Transport(err));
        }
        Ok(())
    }

    /// Send `message` to every connected peer concurrently. Returns the
    /// number of peers the frame was written to.
    pub async fn broadcast(&self, message: PeerMessage) -> usize {
        let connections = self.table.snapshot().await;
        debug!(
            "Broadcasting {} to {} peers",
            message.message_type,
            connections.len()
        );

        let results = join_all(connections.iter().map(|connection| {
            let message = message.clone();
            async move {
                match connection.send(message).await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(
                            "Broadcast to {} failed: {err}. Closing connection",
                            connection.peer_id()
                        );
                        self.table.remove_connection(connection).await;
                        false
                    }
                }
            }
        }))
        .await;

        results.into_iter().filter(|sent| *sent).count()
    }
}

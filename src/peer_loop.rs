use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use futures::TryStreamExt;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::PeerLoopError;
use crate::models::peer::InboundMessage;
use crate::models::peer::PeerConnection;
use crate::models::peer::PeerMessage;
use crate::models::peer::PeerStream;
use crate::models::state::NodeState;

/// Per-connection worker: reads frames from one established connection and
/// hands them to the node's handlers, in the order received.
#[derive(Debug)]
pub struct PeerLoopHandler {
    state: Arc<NodeState>,
    connection: Arc<PeerConnection>,
}

impl PeerLoopHandler {
    pub fn new(state: Arc<NodeState>, connection: Arc<PeerConnection>) -> Self {
        Self { state, connection }
    }

    /// Run the peer loop until the stream ends, fails, or the connection or
    /// node is shut down. The connection is always removed from the table
    /// and closed afterwards, also if the loop panics.
    pub async fn run_wrapper(&self, stream: PeerStream) {
        let peer_id = self.connection.peer_id();
        let result = AssertUnwindSafe(self.run(stream)).catch_unwind().await;

        match result {
            Ok(Ok(())) => debug!("Peer loop for {peer_id} finished"),
            Ok(Err(err)) => warn!("Peer loop for {peer_id} stopped: {err}"),
            Err(_panic) => error!("Peer loop for {peer_id} panicked"),
        }

        // Only removes the entry if it still refers to this connection
        if self.state.table().remove_connection(&self.connection).await {
            info!("Disconnected from {peer_id}");
        }
    }

    async fn run(&self, mut stream: PeerStream) -> Result<(), PeerLoopError> {
        loop {
            tokio::select! {
                _ = self.connection.cancelled() => {
                    debug!("Connection to {} closed locally", self.connection.peer_id());
                    return Ok(());
                }
                _ = self.state.shutdown_token().cancelled() => {
                    debug!(
                        "Node shutting down; leaving peer loop for {}",
                        self.connection.peer_id()
                    );
                    return Ok(());
                }
                frame = stream.try_next() => match frame {
                    Ok(Some(msg)) => self.handle_peer_message(msg).await,
                    Ok(None) => {
                        info!("Peer {} closed connection", self.connection.peer_id());
                        return Ok(());
                    }
                    Err(err) => {
                        return Err(PeerLoopError::from_io(self.connection.peer_id().clone(), err));
                    }
                },
            }
        }
    }

    /// Record one application frame and run its handler.
    async fn handle_peer_message(&self, msg: PeerMessage) {
        let peer_id = self.connection.peer_id();
        if msg.is_control() {
            warn!(
                "Ignoring {} from {peer_id} on established connection",
                msg.message_type
            );
            return;
        }

        debug!("Got {} from {peer_id}", msg.message_type);
        let inbound = InboundMessage::new(msg, peer_id.clone(), Utc::now());
        self.state.messages().push(inbound.clone()).await;
        self.state.handlers().dispatch(inbound).await;
    }
}

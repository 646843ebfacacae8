use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::connect_to_peers::answer_peer;
use crate::models::state::NodeState;

/// Pause after a failed accept so a persistent error (e.g. out of file
/// descriptors) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts inbound transports for as long as the node runs, one worker task
/// per connection.
pub(crate) struct ListenerLoop {
    listener: TcpListener,
    state: Arc<NodeState>,
}

impl ListenerLoop {
    pub(crate) fn new(listener: TcpListener, state: Arc<NodeState>) -> Self {
        Self { listener, state }
    }

    /// Runs until the node's shutdown token is cancelled. The listening
    /// socket is released when this returns.
    pub(crate) async fn run(self) {
        let shutdown = self.state.shutdown_token().clone();
        if let Ok(addr) = self.listener.local_addr() {
            info!("Listening for peers on {addr}");
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("Listener loop received shutdown signal");
                    break;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_address)) => {
                        let state = self.state.clone();
                        self.state
                            .tasks()
                            .spawn(answer_peer(stream, state, peer_address));
                    }
                    Err(err) if shutdown.is_cancelled() => {
                        debug!("Ignoring accept error during shutdown: {err}");
                        break;
                    }
                    Err(err) => {
                        warn!("Failed to accept incoming connection: {err}");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        info!("Stopped listening for peers");
    }
}

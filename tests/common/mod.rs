#![allow(dead_code)]

pub mod logging;

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chatmesh::discovery::InMemoryTracker;
use chatmesh::Args;
use chatmesh::InboundMessage;
use chatmesh::Node;
use chatmesh::PeerId;

pub fn loopback_args(peer_id: &str) -> Args {
    Args {
        peer_id: Some(PeerId::from(peer_id)),
        listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        peer_port: 0,
        no_auto_discover: true,
        handshake_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        write_timeout: Duration::from_millis(500),
        ..Args::default()
    }
}

/// Start a node on an ephemeral loopback port that registers with `tracker`.
pub async fn start_node(peer_id: &str, tracker: &Arc<InMemoryTracker>) -> anyhow::Result<Node> {
    let node = Node::with_tracker(loopback_args(peer_id), tracker.clone());
    node.start().await?;
    Ok(node)
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const POLL_ATTEMPTS: usize = 500;

/// Wait until `node` is connected to exactly `expected` (sorted).
pub async fn wait_for_peers(node: &Node, expected: &[&str]) -> bool {
    let expected: Vec<PeerId> = expected.iter().copied().map(PeerId::from).collect();
    for _ in 0..POLL_ATTEMPTS {
        if node.connected_peers().await == expected {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    false
}

/// Wait until the newest message `node` received has `content`.
pub async fn wait_for_message(node: &Node, content: &str) -> Option<InboundMessage> {
    for _ in 0..POLL_ATTEMPTS {
        if let Some(latest) = node.recent_messages(1).await.pop() {
            if latest.content() == content {
                return Some(latest);
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    None
}

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::SecondsFormat;
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config_models::cli_args::Args;
use crate::connect_to_peers::call_peer;
use crate::connect_to_peers::ConnectOutcome;
use crate::discovery::resolve_advertised_ip;
use crate::discovery::HttpTracker;
use crate::discovery::PeerRecord;
use crate::discovery::PeerRegistration;
use crate::discovery::Tracker;
use crate::error::HandshakeError;
use crate::error::NodeError;
use crate::main_loop::ListenerLoop;
use crate::models::handler_registry::MessageHandler;
use crate::models::peer::InboundMessage;
use crate::models::peer::PeerId;
use crate::models::peer::PeerMessage;
use crate::models::state::NodeState;

/// Upper bound on how long [`Node::stop`] waits for workers to exit.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running { local_addr: SocketAddr },
    Stopped,
}

#[derive(Debug)]
struct NodeInner {
    args: Args,
    state: Arc<NodeState>,
    tracker: Arc<dyn Tracker>,
    lifecycle: Mutex<Lifecycle>,
}

/// One chat participant: owns the connection table, accepts inbound peers,
/// and offers connect/send/broadcast to the application.
///
/// Cloning is cheap and yields a handle to the same node, so handlers may
/// capture a `Node` and reply through it.
#[derive(Clone, Debug)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// A node that registers with and discovers through the HTTP tracker
    /// named in `args`.
    pub fn new(args: Args) -> Result<Self, NodeError> {
        let tracker =
            HttpTracker::new(&args.tracker_host, args.tracker_port, args.tracker_timeout)?;
        Ok(Self::with_tracker(args, Arc::new(tracker)))
    }

    pub fn with_tracker(args: Args, tracker: Arc<dyn Tracker>) -> Self {
        let state = NodeState::new(args.peer_id(), &args);
        Self {
            inner: Arc::new(NodeInner {
                args,
                state: Arc::new(state),
                tracker,
                lifecycle: Mutex::new(Lifecycle::Idle),
            }),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        self.inner.state.own_id()
    }

    pub fn tracker(&self) -> &Arc<dyn Tracker> {
        &self.inner.tracker
    }

    /// Bound listen address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match *self.inner.lifecycle.lock().await {
            Lifecycle::Running { local_addr } => Some(local_addr),
            Lifecycle::Idle | Lifecycle::Stopped => None,
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(
            *self.inner.lifecycle.lock().await,
            Lifecycle::Running { .. }
        )
    }

    async fn ensure_running(&self) -> Result<(), NodeError> {
        if self.is_running().await {
            Ok(())
        } else {
            Err(NodeError::NotRunning)
        }
    }

    /// Bind the listener, start accepting peers and register with the
    /// tracker. A node can be started only once.
    ///
    /// A failed registration is logged and does not fail the start.
    pub async fn start(&self) -> Result<SocketAddr, NodeError> {
        let args = &self.inner.args;
        let state = &self.inner.state;
        let local_addr = {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            if *lifecycle != Lifecycle::Idle {
                return Err(NodeError::AlreadyStarted);
            }

            let bind_addr = SocketAddr::new(args.listen_addr, args.peer_port);
            let listener = TcpListener::bind(bind_addr)
                .await
                .map_err(|source| NodeError::Bind {
                    addr: bind_addr,
                    source,
                })?;
            let local_addr = listener.local_addr().map_err(|source| NodeError::Bind {
                addr: bind_addr,
                source,
            })?;

            state
                .tasks()
                .spawn(ListenerLoop::new(listener, state.clone()).run());
            *lifecycle = Lifecycle::Running { local_addr };
            local_addr
        };
        info!("Node {} listening on {local_addr}", state.own_id());

        let advertised_ip = resolve_advertised_ip(args.advertise_ip, args.listen_addr).await;
        let registration = PeerRegistration {
            peer_id: state.own_id().clone(),
            ip: advertised_ip.to_string(),
            port: local_addr.port(),
        };
        match self.inner.tracker.register(&registration).await {
            Ok(()) => info!("Registered with tracker as {advertised_ip}:{}", local_addr.port()),
            Err(err) => warn!("Could not register with tracker: {err}"),
        }

        Ok(local_addr)
    }

    /// Stop accepting peers, close every connection and wait (bounded) for
    /// the workers to exit. Calling this more than once is harmless.
    pub async fn stop(&self) {
        {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            let was_running = matches!(*lifecycle, Lifecycle::Running { .. });
            *lifecycle = Lifecycle::Stopped;
            if !was_running {
                return;
            }
        }

        let state = &self.inner.state;
        info!("Stopping node {}", state.own_id());
        state.shutdown_token().cancel();
        let closed = state.table().drain().await;
        debug!("Closed {closed} peer connections");

        state.tasks().close();
        if tokio::time::timeout(STOP_GRACE_PERIOD, state.tasks().wait())
            .await
            .is_err()
        {
            warn!(
                "{} workers still running after {:?}; not waiting any longer",
                state.tasks().len(),
                STOP_GRACE_PERIOD
            );
        }
        info!("Node {} stopped", state.own_id());
    }

    /// Connect to `peer_id` at `host:port` unless a live connection to it
    /// already exists. Returns once the handshake has completed.
    pub async fn connect_to(
        &self,
        peer_id: &PeerId,
        host: &str,
        port: u16,
    ) -> Result<ConnectOutcome, NodeError> {
        self.ensure_running().await?;
        let state = &self.inner.state;
        if peer_id == state.own_id() {
            return Err(HandshakeError::SelfConnect.into());
        }
        if state
            .table()
            .get(peer_id)
            .await
            .is_some_and(|connection| connection.is_live())
        {
            debug!("Already connected to {peer_id}");
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        call_peer(state.clone(), peer_id, host, port).await
    }

    /// Send an application message of `message_type` with `content` to one
    /// connected peer.
    pub async fn send(
        &self,
        peer_id: &PeerId,
        message_type: &str,
        content: impl Into<Value>,
    ) -> Result<(), NodeError> {
        let message = PeerMessage::application(message_type, content, self.peer_id(), Utc::now());
        self.send_message(peer_id, message).await
    }

    /// Send a prepared frame. `from` and `timestamp` are filled in unless
    /// already present.
    pub async fn send_message(
        &self,
        peer_id: &PeerId,
        message: PeerMessage,
    ) -> Result<(), NodeError> {
        self.ensure_running().await?;
        let message = self.stamp(message);
        self.inner.state.send(peer_id, message).await
    }

    /// Send to every connected peer. Returns how many peers the message was
    /// written to; failures on individual peers do not affect the others.
    pub async fn broadcast(
        &self,
        message_type: &str,
        content: impl Into<Value>,
    ) -> Result<usize, NodeError> {
        let message = PeerMessage::application(message_type, content, self.peer_id(), Utc::now());
        self.broadcast_message(message).await
    }

    pub async fn broadcast_message(&self, message: PeerMessage) -> Result<usize, NodeError> {
        self.ensure_running().await?;
        let message = self.stamp(message);
        Ok(self.inner.state.broadcast(message).await)
    }

    fn stamp(&self, mut message: PeerMessage) -> PeerMessage {
        message
            .fields
            .entry("from")
            .or_insert_with(|| Value::from(self.peer_id().as_str()));
        message
            .fields
            .entry("timestamp")
            .or_insert_with(|| {
                Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
            });
        message
    }

    /// Current peer list as reported by the tracker.
    pub async fn tracker_peers(&self) -> Result<Vec<PeerRecord>, NodeError> {
        Ok(self.inner.tracker.list_peers().await?)
    }

    /// Fetch the tracker's peer list and connect to every listed peer that is
    /// neither this node nor already connected. Returns the number of new
    /// connections. Tracker failures are logged and yield zero.
    pub async fn discover_and_connect(&self) -> Result<usize, NodeError> {
        self.ensure_running().await?;
        let peers = match self.inner.tracker.list_peers().await {
            Ok(peers) => peers,
            Err(err) => {
                warn!("Peer discovery failed: {err}");
                return Ok(0);
            }
        };

        let connected = self.connected_peers().await;
        let candidates: Vec<PeerRecord> = peers
            .into_iter()
            .filter(|record| record.peer_id != *self.peer_id())
            .filter(|record| !connected.contains(&record.peer_id))
            .collect();
        debug!("Discovered {} candidate peers", candidates.len());

        let outcomes = join_all(candidates.iter().map(|record| async move {
            match self.connect_to(&record.peer_id, &record.ip, record.port).await {
                Ok(outcome) => outcome == ConnectOutcome::Established,
                Err(err) => {
                    warn!(
                        "Could not connect to {} at {}:{}: {err}",
                        record.peer_id, record.ip, record.port
                    );
                    false
                }
            }
        }))
        .await;

        let established = outcomes.into_iter().filter(|ok| *ok).count();
        info!("Discovery established {established} new connections");
        Ok(established)
    }

    /// Register `handler` for `message_type`, replacing any previous one.
    pub async fn register_handler<H>(&self, message_type: impl Into<String>, handler: H)
    where
        H: MessageHandler + 'static,
    {
        self.inner
            .state
            .handlers()
            .register(message_type, handler)
            .await;
    }

    /// The newest `limit` received messages, oldest first.
    pub async fn recent_messages(&self, limit: usize) -> Vec<InboundMessage> {
        self.inner.state.messages().recent(limit).await
    }

    /// Snapshot of the identities this node is connected to, sorted.
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.state.table().list().await
    }

    /// Close and forget the connection to `peer_id`. Returns whether there
    /// was one.
    pub async fn disconnect(&self, peer_id: &PeerId) -> bool {
        let removed = self.inner.state.table().remove(peer_id).await.is_some();
        if removed {
            info!("Disconnected from {peer_id}");
        }
        removed
    }
}

#[cfg(test)]
mod node_tests {
    use std::net::IpAddr;
    use std::net::Ipv4Addr;

    use assert2::check;
    use assert2::let_assert;
    use tracing_test::traced_test;

    use super::*;
    use crate::discovery::InMemoryTracker;

    fn loopback_args(peer_id: &str) -> Args {
        Args {
            peer_id: Some(PeerId::from(peer_id)),
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            peer_port: 0,
            ..Args::default()
        }
    }

    #[traced_test]
    #[tokio::test]
    async fn lifecycle_is_enforced() {
        let node = Node::with_tracker(loopback_args("alice"), Arc::new(InMemoryTracker::new()));
        check!(node.local_addr().await.is_none());
        let_assert!(Err(NodeError::NotRunning) = node.broadcast("chat_message", "hi").await);

        let addr = node.start().await.unwrap();
        check!(addr.port() != 0);
        check!(node.local_addr().await == Some(addr));
        let_assert!(Err(NodeError::AlreadyStarted) = node.start().await);

        node.stop().await;
        node.stop().await;
        check!(node.local_addr().await.is_none());
        let_assert!(Err(NodeError::AlreadyStarted) = node.start().await);
        let_assert!(
            Err(NodeError::NotRunning) = node.connect_to(&PeerId::from("bob"), "127.0.0.1", 1).await
        );
        let_assert!(
            Err(NodeError::NotRunning) = node.send(&PeerId::from("bob"), "chat_message", "hi").await
        );
    }

    #[traced_test]
    #[tokio::test]
    async fn bind_failure_is_reported() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let args = Args {
            peer_port: occupied.local_addr().unwrap().port(),
            ..loopback_args("alice")
        };
        let node = Node::with_tracker(args, Arc::new(InMemoryTracker::new()));
        let_assert!(Err(NodeError::Bind { .. }) = node.start().await);
        check!(!node.is_running().await);
    }

    #[traced_test]
    #[tokio::test]
    async fn start_registers_with_tracker() {
        let tracker = Arc::new(InMemoryTracker::new());
        let node = Node::with_tracker(loopback_args("alice"), tracker.clone());
        let addr = node.start().await.unwrap();

        let peers = tracker.list_peers().await.unwrap();
        check!(peers.len() == 1);
        check!(peers[0].peer_id == PeerId::from("alice"));
        check!(peers[0].ip == "127.0.0.1");
        check!(peers[0].port == addr.port());
        node.stop().await;
    }

    #[traced_test]
    #[tokio::test]
    async fn connecting_to_self_is_refused() {
        let node = Node::with_tracker(loopback_args("alice"), Arc::new(InMemoryTracker::new()));
        let addr = node.start().await.unwrap();
        let_assert!(
            Err(NodeError::Handshake(HandshakeError::SelfConnect)) = node
                .connect_to(&PeerId::from("alice"), "127.0.0.1", addr.port())
                .await
        );
        node.stop().await;
    }

    #[traced_test]
    #[tokio::test]
    async fn send_stamps_sender_and_time() {
        let node = Node::with_tracker(loopback_args("alice"), Arc::new(InMemoryTracker::new()));
        let stamped = node.stamp(PeerMessage::new("join_channel").with_field("channel", "rust"));
        check!(stamped.message_type == "join_channel");
        check!(stamped.field("from") == Some(&Value::from("alice")));
        check!(stamped.field("channel") == Some(&Value::from("rust")));
        check!(stamped.field("timestamp").is_some());
        check!(stamped.field("content").is_none());

        let custom = node.stamp(PeerMessage::new("chat_message").with_field("from", "spoof"));
        check!(custom.field("from") == Some(&Value::from("spoof")));
    }

    #[traced_test]
    #[tokio::test]
    async fn unreachable_tracker_discovers_nothing() {
        let args = Args {
            tracker_host: "127.0.0.1".to_owned(),
            tracker_port: 1,
            tracker_timeout: Duration::from_secs(1),
            ..loopback_args("alice")
        };
        let node = Node::new(args).unwrap();
        node.start().await.unwrap();
        check!(node.discover_and_connect().await.unwrap() == 0);
        check!(logs_contain("Could not register with tracker"));
        node.stop().await;
    }
}

use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use futures::Sink;
use futures::SinkExt;
use futures::Stream;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::WaitForCancellationFuture;
use tracing::debug;
use tracing::warn;

use super::ConnectionDirection;
use super::ConnectionState;
use super::PeerId;
use super::PeerMessage;

/// Write half of a framed peer transport.
pub type PeerSink = Pin<Box<dyn Sink<PeerMessage, Error = io::Error> + Send>>;

/// Read half of a framed peer transport.
pub type PeerStream = Pin<Box<dyn Stream<Item = io::Result<PeerMessage>> + Send>>;

/// Upper bound on how long shutting down the write half may take.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long one frame may take to be written before the peer is considered
/// stalled.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One live, identified link to a remote peer.
///
/// The read half is owned by the link's peer loop; this struct owns the
/// write half behind a per-connection lock so concurrent senders never
/// interleave frames.
pub struct PeerConnection {
    id: u64,
    peer_id: PeerId,
    peer_address: SocketAddr,
    direction: ConnectionDirection,
    established_at: Instant,
    write_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    writer: Mutex<PeerSink>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("peer_address", &self.peer_address)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PeerConnection {
    /// Wrap the write half of a transport whose handshake has completed.
    pub fn new(
        peer_id: PeerId,
        peer_address: SocketAddr,
        direction: ConnectionDirection,
        writer: PeerSink,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Established);
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_id,
            peer_address,
            direction,
            established_at: Instant::now(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            state,
            writer: Mutex::new(writer),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Bound every write to `write_timeout`.
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    /// Time since the handshake completed.
    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Established and not yet asked to close.
    pub fn is_live(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.state() == ConnectionState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`Self::close`] has been called.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// Write one frame. Fails with [`io::ErrorKind::TimedOut`] if the peer
    /// does not take the frame within the write timeout, and aborts if the
    /// connection is closed while the write is pending. A failed write may
    /// leave a partial frame behind, so the caller must close the link.
    pub async fn send(&self, message: PeerMessage) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("connection to {} is closed", self.peer_id),
            ));
        }

        let write = async {
            let mut writer = self.writer.lock().await;
            writer.send(message).await
        };
        tokio::select! {
            res = tokio::time::timeout(self.write_timeout, write) => match res {
                Ok(res) => res,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "write to {} timed out after {}",
                        self.peer_id,
                        humantime::format_duration(self.write_timeout)
                    ),
                )),
            },
            _ = self.shutdown.cancelled() => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("connection to {} closed during write", self.peer_id),
            )),
        }
    }

    /// Stop the peer loop and shut down the write half. Only the first call
    /// has any effect; returns whether this call closed the connection.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.set_state(ConnectionState::Closing);
        self.shutdown.cancel();

        let shutdown_write_half = async {
            let mut writer = self.writer.lock().await;
            writer.close().await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, shutdown_write_half).await {
            Ok(Ok(())) => (),
            Ok(Err(err)) => debug!("Error closing transport to {}: {err}", self.peer_id),
            Err(_) => warn!("Timed out closing transport to {}", self.peer_id),
        }

        self.set_state(ConnectionState::Closed);
        debug!(
            "Connection {} to {} ({}) closed",
            self.id, self.peer_id, self.peer_address
        );
        true
    }

    fn set_state(&self, next: ConnectionState) {
        let current = self.state();
        if !current.can_transition_to(next) {
            warn!(
                "Invalid state transition for {}: {current} -> {next}",
                self.peer_id
            );
        }
        self.state.send_replace(next);
    }
}

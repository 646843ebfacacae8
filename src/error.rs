use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::models::peer::PeerId;

/// Errors surfaced by [`crate::Node`] operations.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("could not bind listener to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("node has already been started")]
    AlreadyStarted,

    #[error("node is not running")]
    NotRunning,

    #[error("not connected to peer {0}")]
    NotConnected(PeerId),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),
}

/// Reasons a transport fails to become an established peer connection.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("connection closed before handshake completed")]
    ConnectionClosed,

    #[error("expected `{expected}` frame, got `{got}`")]
    UnexpectedMessage { expected: &'static str, got: String },

    #[error("malformed handshake payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("could not decode handshake frame: {0}")]
    Decode(#[source] io::Error),

    #[error("peer presented an empty identity")]
    EmptyPeerId,

    #[error("refusing to connect to own identity")]
    SelfConnect,

    #[error("expected peer {expected}, but remote identified as {actual}")]
    IdentityMismatch { expected: PeerId, actual: PeerId },

    #[error("remote refused handshake: {0}")]
    Refused(String),

    #[error("handshake timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),

    #[error("transport error during handshake: {0}")]
    Transport(#[from] io::Error),
}

impl HandshakeError {
    /// Same classification as [`PeerLoopError::from_io`].
    pub fn from_io(source: io::Error) -> Self {
        if is_decode_error(&source) {
            Self::Decode(source)
        } else {
            Self::Transport(source)
        }
    }
}

fn is_decode_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof
    )
}

/// Failures talking to the rendezvous tracker.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("tracker request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("tracker rejected request: {0}")]
    Rejected(String),

    #[error("malformed tracker reply: {0}")]
    Malformed(String),
}

/// Why a peer loop stopped reading from its connection.
#[derive(Debug, Error)]
pub enum PeerLoopError {
    #[error("could not decode frame from {peer_id}: {source}")]
    Decode {
        peer_id: PeerId,
        #[source]
        source: io::Error,
    },

    #[error("transport to {peer_id} failed: {source}")]
    Transport {
        peer_id: PeerId,
        #[source]
        source: io::Error,
    },
}

impl PeerLoopError {
    /// Undecodable or oversized frames are decode errors; everything else is
    /// a transport failure.
    pub fn from_io(peer_id: PeerId, source: io::Error) -> Self {
        if is_decode_error(&source) {
            Self::Decode { peer_id, source }
        } else {
            Self::Transport { peer_id, source }
        }
    }
}

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::Future;
use futures::FutureExt;
use futures::SinkExt;
use futures::StreamExt;
use futures::TryStreamExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio_serde::formats::Json;
use tokio_serde::formats::SymmetricalJson;
use tokio_serde::SymmetricallyFramed;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::HandshakeError;
use crate::error::NodeError;
use crate::models::peer::Admission;
use crate::models::peer::ConnectionDirection;
use crate::models::peer::ConnectionState;
use crate::models::peer::HandshakeData;
use crate::models::peer::HandshakeResponse;
use crate::models::peer::PeerConnection;
use crate::models::peer::PeerId;
use crate::models::peer::PeerMessage;
use crate::models::peer::PeerSink;
use crate::models::peer::PeerStream;
use crate::models::peer::HANDSHAKE;
use crate::models::peer::HANDSHAKE_RESPONSE;
use crate::models::state::NodeState;
use crate::peer_loop::PeerLoopHandler;

// Max peer message size is 16MB
pub const MAX_PEER_FRAME_LENGTH_IN_BYTES: usize = 16 * 1024 * 1024;

/// A transport speaking length-delimited JSON [`PeerMessage`] frames.
pub type PeerFramed<S> = tokio_serde::Framed<
    Framed<S, LengthDelimitedCodec>,
    PeerMessage,
    PeerMessage,
    Json<PeerMessage, PeerMessage>,
>;

/// Use this function to ensure that the same rules apply for both
/// ingoing and outgoing connections. This limits the size of messages
/// peers can send.
pub(crate) fn get_codec_rules() -> LengthDelimitedCodec {
    let mut codec_rules = LengthDelimitedCodec::new();
    codec_rules.set_max_frame_length(MAX_PEER_FRAME_LENGTH_IN_BYTES);
    codec_rules
}

/// Build the communication/serialization/frame handler for a raw stream.
pub fn frame_transport<S>(stream: S) -> PeerFramed<S>
where
    S: AsyncRead + AsyncWrite,
{
    let length_delimited = Framed::new(stream, get_codec_rules());
    SymmetricallyFramed::new(length_delimited, SymmetricalJson::default())
}

/// Separate a framed transport into the write half owned by a
/// [`PeerConnection`] and the read half owned by its peer loop.
pub fn split_transport<S>(framed: PeerFramed<S>) -> (PeerSink, PeerStream)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (sink, stream) = framed.split::<PeerMessage>();
    (Box::pin(sink), Box::pin(stream))
}

async fn with_handshake_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, HandshakeError>>,
) -> Result<T, HandshakeError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| HandshakeError::Timeout(timeout))?
}

async fn next_frame<S>(peer: &mut PeerFramed<S>) -> Result<PeerMessage, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match peer.try_next().await {
        Ok(Some(frame)) => Ok(frame),
        Ok(None) => Err(HandshakeError::ConnectionClosed),
        Err(err) => Err(HandshakeError::from_io(err)),
    }
}

/// Inbound half of the handshake: wait for the remote's `handshake` frame and
/// validate it. Nothing is sent back; the caller decides how to answer.
pub(crate) async fn receive_handshake<S>(
    peer: &mut PeerFramed<S>,
    own_id: &PeerId,
    timeout: Duration,
) -> Result<HandshakeData, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first = with_handshake_timeout(timeout, next_frame(peer)).await?;
    if first.message_type != HANDSHAKE {
        return Err(HandshakeError::UnexpectedMessage {
            expected: HANDSHAKE,
            got: first.message_type,
        });
    }

    let handshake: HandshakeData = first.payload()?;
    if handshake.peer_id.is_empty() {
        return Err(HandshakeError::EmptyPeerId);
    }
    if handshake.peer_id == *own_id {
        return Err(HandshakeError::SelfConnect);
    }

    Ok(handshake)
}

/// Outbound half of the handshake: announce ourselves and wait for a
/// successful `handshake_response` from the identity we meant to reach.
pub(crate) async fn call_handshake<S>(
    peer: &mut PeerFramed<S>,
    own_handshake: &HandshakeData,
    expected_peer: &PeerId,
    timeout: Duration,
) -> Result<HandshakeResponse, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_handshake_timeout(timeout, async {
        peer.send(own_handshake.to_message()).await?;
        debug!("Awaiting handshake response from {expected_peer}");

        let reply = next_frame(peer).await?;
        if reply.message_type != HANDSHAKE_RESPONSE {
            return Err(HandshakeError::UnexpectedMessage {
                expected: HANDSHAKE_RESPONSE,
                got: reply.message_type,
            });
        }

        let response: HandshakeResponse = reply.payload()?;
        if !response.is_success() {
            return Err(HandshakeError::Refused(
                response
                    .message
                    .unwrap_or_else(|| "no reason given".to_owned()),
            ));
        }
        if response.peer_id != *expected_peer {
            return Err(HandshakeError::IdentityMismatch {
                expected: expected_peer.clone(),
                actual: response.peer_id,
            });
        }

        Ok(response)
    })
    .await
}

/// Respond to an incoming connection initiation.
///
/// Catch and process errors (if any) gracefully.
///
/// All incoming connections from peers must go through this function.
pub(crate) async fn answer_peer<S>(stream: S, state: Arc<NodeState>, peer_address: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let panic_result = AssertUnwindSafe(answer_peer_inner(stream, state, peer_address))
        .catch_unwind()
        .await;

    match panic_result {
        Ok(Ok(())) => (),
        Ok(Err(err)) => warn!("Incoming connection from {peer_address} failed: {err}"),
        Err(_err) => error!("Peer task (incoming) for {peer_address} panicked"),
    }
}

async fn answer_peer_inner<S>(
    stream: S,
    state: Arc<NodeState>,
    peer_address: SocketAddr,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    info!("Established incoming TCP connection with {peer_address}");
    debug!(
        "{peer_address}: {} -> {}",
        ConnectionState::Connecting,
        ConnectionState::AwaitingHandshake
    );

    let mut peer = frame_transport(stream);
    let own_handshake = state.own_handshake();

    let handshake =
        match receive_handshake(&mut peer, state.own_id(), state.handshake_timeout()).await {
            Ok(handshake) => handshake,
            Err(err @ (HandshakeError::EmptyPeerId | HandshakeError::SelfConnect)) => {
                // answer well-formed but unacceptable handshakes before hanging up
                let _ = peer
                    .send(own_handshake.refuse(err.to_string()).to_message())
                    .await;
                let _ = peer.close().await;
                return Err(err);
            }
            Err(err) => {
                let _ = peer.close().await;
                return Err(err);
            }
        };
    let remote_id = handshake.peer_id;

    if !state
        .table()
        .would_admit(&remote_id, ConnectionDirection::Inbound, state.own_id())
        .await
    {
        info!("Already connected to {remote_id}; refusing duplicate incoming connection");
        let _ = peer
            .send(own_handshake.refuse("already connected").to_message())
            .await;
        let _ = peer.close().await;
        return Ok(());
    }

    peer.send(own_handshake.accept().to_message()).await?;

    let (sink, stream) = split_transport(peer);
    let connection = Arc::new(
        PeerConnection::new(remote_id.clone(), peer_address, ConnectionDirection::Inbound, sink)
            .with_write_timeout(state.write_timeout()),
    );
    if state.table().admit(connection.clone(), state.own_id()).await == Admission::Refused {
        return Ok(());
    }
    info!("Connection accepted from {remote_id} ({peer_address})");

    PeerLoopHandler::new(state, connection)
        .run_wrapper(stream)
        .await;

    Ok(())
}

/// Whether [`call_peer`] produced a new connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new connection was established and its peer loop started.
    Established,
    /// A live connection to the peer already existed and was kept.
    AlreadyConnected,
}

/// Perform handshake and establish connection to a new peer. The peer loop
/// is spawned on the node's task tracker; this returns once the handshake
/// has completed.
///
/// All outgoing connections to peers must go through this function.
pub(crate) async fn call_peer(
    state: Arc<NodeState>,
    peer_id: &PeerId,
    host: &str,
    port: u16,
) -> Result<ConnectOutcome, NodeError> {
    debug!("Attempting to initiate connection to {peer_id} at {host}:{port}");
    let connect_timeout = state.connect_timeout();
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| NodeError::Timeout(connect_timeout))??;
    let peer_address = stream.peer_addr()?;
    info!("Established outgoing TCP connection with {peer_address}");

    call_peer_inner(stream, state, peer_id, peer_address).await
}

pub(crate) async fn call_peer_inner<S>(
    stream: S,
    state: Arc<NodeState>,
    peer_id: &PeerId,
    peer_address: SocketAddr,
) -> Result<ConnectOutcome, NodeError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut peer = frame_transport(stream);
    debug!(
        "{peer_address}: {} -> {}",
        ConnectionState::Connecting,
        ConnectionState::AwaitingHandshake
    );

    if let Err(err) = call_handshake(
        &mut peer,
        &state.own_handshake(),
        peer_id,
        state.handshake_timeout(),
    )
    .await
    {
        debug!("{peer_address}: handshake failed, {}", ConnectionState::Closed);
        let _ = peer.close().await;
        return Err(err.into());
    }

    let (sink, stream) = split_transport(peer);
    let connection = Arc::new(
        PeerConnection::new(peer_id.clone(), peer_address, ConnectionDirection::Outbound, sink)
            .with_write_timeout(state.write_timeout()),
    );
    if state.table().admit(connection.clone(), state.own_id()).await == Admission::Refused {
        return Ok(ConnectOutcome::AlreadyConnected);
    }
    info!("Outgoing connection to {peer_id} ({peer_address}) established");

    let handler = PeerLoopHandler::new(state.clone(), connection);
    state.tasks().spawn(async move {
        handler.run_wrapper(stream).await;
    });

    Ok(ConnectOutcome::Established)
}

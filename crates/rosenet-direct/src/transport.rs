//! Transport abstraction consumed by the direct-messaging layer.
//!
//! Connection establishment, encryption, multiplexing and relaying belong to
//! the transport. The direct layer only needs to dial a peer, enumerate the
//! connections and streams that already exist, open a protocol stream, and be
//! handed inbound streams for the protocols it registers.

use async_trait::async_trait;
use bytes::Bytes;
use rosenet_types::{PeerAddress, RoseNetError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors surfaced by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Peer unreachable: {0}")]
    Unreachable(String),
    #[error("Protocol negotiation failed: {0}")]
    Negotiation(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Stream closed")]
    StreamClosed,
    #[error("Stream aborted: {0}")]
    Aborted(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for RoseNetError {
    fn from(err: TransportError) -> Self {
        RoseNetError::Unknown(err.to_string())
    }
}

/// Which side opened a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    /// Opened by the remote peer.
    Inbound,
    /// Opened locally.
    Outbound,
}

/// A logical, ordered, bidirectional byte channel multiplexed over a
/// connection and tagged with a protocol id.
#[async_trait]
pub trait ProtocolStream: Send + Sync + 'static {
    /// Transport-assigned stream id.
    fn id(&self) -> &str;

    /// Protocol negotiated for this stream.
    fn protocol(&self) -> &str;

    fn direction(&self) -> StreamDirection;

    /// Whether a write issued now could still reach the remote.
    fn is_writable(&self) -> bool;

    /// Write one chunk.
    async fn write(&self, chunk: Bytes) -> Result<(), TransportError>;

    /// Read the next chunk, or `None` once the remote closed its write side.
    async fn read(&self) -> Result<Option<Bytes>, TransportError>;

    /// Gracefully close the local write side.
    async fn close(&self);

    /// Tear the stream down in both directions, signalling `reason` to the
    /// remote. The stream must not be reused afterwards.
    fn abort(&self, reason: &str);
}

/// An established connection to one remote peer.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn remote_peer(&self) -> &PeerAddress;

    fn is_open(&self) -> bool;

    /// Streams currently multiplexed over this connection.
    fn streams(&self) -> Vec<Arc<dyn ProtocolStream>>;

    /// Open a new stream and negotiate `protocol` on it.
    async fn new_stream(&self, protocol: &str) -> Result<Arc<dyn ProtocolStream>, TransportError>;
}

/// Receives every inbound stream negotiated for a registered protocol.
#[async_trait]
pub trait InboundStreamHandler: Send + Sync + 'static {
    async fn on_stream(&self, connection: Arc<dyn Connection>, stream: Arc<dyn ProtocolStream>);
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionOpened {
        peer: PeerAddress,
        connection_id: String,
    },
    ConnectionClosed {
        peer: PeerAddress,
        connection_id: String,
    },
    /// First connection to a peer was established.
    PeerConnected(PeerAddress),
    /// Last connection to a peer was closed.
    PeerDisconnected(PeerAddress),
}

/// The transport collaborator.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// This node's own peer id.
    fn local_peer(&self) -> &PeerAddress;

    /// Establish a new connection to `peer`.
    async fn dial(&self, peer: &PeerAddress) -> Result<Arc<dyn Connection>, TransportError>;

    /// Connections to `peer` the transport currently knows about.
    fn connections(&self, peer: &PeerAddress) -> Vec<Arc<dyn Connection>>;

    /// Register the handler for inbound streams of `protocol`, replacing any
    /// previous one.
    fn handle(
        &self,
        protocol: &str,
        handler: Arc<dyn InboundStreamHandler>,
    ) -> Result<(), TransportError>;

    /// Subscribe to connection lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

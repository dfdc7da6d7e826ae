//! In-process transport.
//!
//! A [`MemoryNetwork`] hands out [`MemoryTransport`]s that dial each other
//! through channels instead of sockets. Used by tests and local simulations;
//! it also exposes fault hooks (unreachable peers, slow stream creation,
//! forced disconnects) and counters for dials and stream creations.

use crate::transport::{
    Connection, InboundStreamHandler, ProtocolStream, StreamDirection, Transport, TransportError,
    TransportEvent,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use rosenet_types::PeerAddress;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Registry of in-process nodes, keyed by peer id.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: DashMap<PeerAddress, Weak<MemoryTransport>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport for `peer` and attach it to the network.
    pub fn transport(self: &Arc<Self>, peer: impl Into<PeerAddress>) -> Arc<MemoryTransport> {
        let local = peer.into();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Arc::new(MemoryTransport {
            local: local.clone(),
            network: Arc::downgrade(self),
            connections: DashMap::new(),
            handlers: DashMap::new(),
            events,
            unreachable: DashSet::new(),
            stream_creation_delay_ms: AtomicU64::new(0),
            dial_count: AtomicUsize::new(0),
            stream_creations: AtomicUsize::new(0),
        });
        self.nodes.insert(local, Arc::downgrade(&transport));
        transport
    }

    fn lookup(&self, peer: &PeerAddress) -> Option<Arc<MemoryTransport>> {
        self.nodes.get(peer).and_then(|node| node.upgrade())
    }
}

/// One node's view of the in-process network.
pub struct MemoryTransport {
    local: PeerAddress,
    network: Weak<MemoryNetwork>,
    connections: DashMap<String, Arc<MemoryConnection>>,
    handlers: DashMap<String, Arc<dyn InboundStreamHandler>>,
    events: broadcast::Sender<TransportEvent>,
    unreachable: DashSet<PeerAddress>,
    stream_creation_delay_ms: AtomicU64,
    dial_count: AtomicUsize,
    stream_creations: AtomicUsize,
}

impl MemoryTransport {
    /// Make dials to `peer` fail (or succeed again).
    pub fn set_unreachable(&self, peer: &PeerAddress, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(peer.clone());
        } else {
            self.unreachable.remove(peer);
        }
    }

    /// Delay every locally initiated stream creation.
    pub fn set_stream_creation_delay(&self, delay: Option<Duration>) {
        let ms = delay.map(|d| d.as_millis() as u64).unwrap_or(0);
        self.stream_creation_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Number of dial attempts made by this node.
    pub fn dial_count(&self) -> usize {
        self.dial_count.load(Ordering::SeqCst)
    }

    /// Number of streams this node has opened.
    pub fn stream_creations(&self) -> usize {
        self.stream_creations.load(Ordering::SeqCst)
    }

    /// Close every connection to `peer` on both ends, aborting their streams.
    pub fn disconnect(&self, peer: &PeerAddress) {
        let targets: Vec<Arc<MemoryConnection>> = self
            .connections
            .iter()
            .filter(|entry| entry.value().remote_peer == *peer)
            .map(|entry| entry.value().clone())
            .collect();
        for connection in targets {
            if let Some(twin) = connection.twin.get().and_then(Weak::upgrade) {
                if let Some(owner) = twin.owner.upgrade() {
                    owner.drop_connection(&twin);
                }
            }
            self.drop_connection(&connection);
        }
    }

    fn register_connection(&self, connection: Arc<MemoryConnection>) {
        let peer = connection.remote_peer.clone();
        let first = !self.has_open_connection(&peer);
        let connection_id = connection.id.clone();
        self.connections.insert(connection_id.clone(), connection);
        let _ = self.events.send(TransportEvent::ConnectionOpened {
            peer: peer.clone(),
            connection_id,
        });
        if first {
            let _ = self.events.send(TransportEvent::PeerConnected(peer));
        }
    }

    fn drop_connection(&self, connection: &MemoryConnection) {
        if self.connections.remove(&connection.id).is_none() {
            return;
        }
        connection.close();
        let peer = connection.remote_peer.clone();
        let _ = self.events.send(TransportEvent::ConnectionClosed {
            peer: peer.clone(),
            connection_id: connection.id.clone(),
        });
        if !self.has_open_connection(&peer) {
            let _ = self.events.send(TransportEvent::PeerDisconnected(peer));
        }
    }

    fn has_open_connection(&self, peer: &PeerAddress) -> bool {
        self.connections
            .iter()
            .any(|entry| entry.value().remote_peer == *peer && entry.value().is_open())
    }

    fn handler_for(&self, protocol: &str) -> Option<Arc<dyn InboundStreamHandler>> {
        self.handlers.get(protocol).map(|h| h.value().clone())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer(&self) -> &PeerAddress {
        &self.local
    }

    async fn dial(&self, peer: &PeerAddress) -> Result<Arc<dyn Connection>, TransportError> {
        self.dial_count.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.contains(peer) {
            return Err(TransportError::Unreachable(format!("{peer} is marked unreachable")));
        }
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| TransportError::Unreachable("network is gone".into()))?;
        let remote = network
            .lookup(peer)
            .ok_or_else(|| TransportError::Unreachable(format!("no node for {peer}")))?;
        let local = network
            .lookup(&self.local)
            .ok_or_else(|| TransportError::Unreachable("local node is detached".into()))?;

        let outbound = MemoryConnection::new(peer.clone(), &local, &remote);
        let inbound = MemoryConnection::new(self.local.clone(), &remote, &local);
        let _ = outbound.twin.set(Arc::downgrade(&inbound));
        let _ = inbound.twin.set(Arc::downgrade(&outbound));

        debug!(from = %self.local, to = %peer, connection_id = %outbound.id, "Memory connection established");
        self.register_connection(outbound.clone());
        remote.register_connection(inbound);
        Ok(outbound as Arc<dyn Connection>)
    }

    fn connections(&self, peer: &PeerAddress) -> Vec<Arc<dyn Connection>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().remote_peer == *peer)
            .map(|entry| entry.value().clone() as Arc<dyn Connection>)
            .collect()
    }

    fn handle(
        &self,
        protocol: &str,
        handler: Arc<dyn InboundStreamHandler>,
    ) -> Result<(), TransportError> {
        self.handlers.insert(protocol.to_string(), handler);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// One end of an in-process connection.
pub struct MemoryConnection {
    id: String,
    remote_peer: PeerAddress,
    open: AtomicBool,
    owner: Weak<MemoryTransport>,
    remote: Weak<MemoryTransport>,
    twin: OnceLock<Weak<MemoryConnection>>,
    streams: Mutex<Vec<Arc<MemoryStream>>>,
}

impl MemoryConnection {
    fn new(
        remote_peer: PeerAddress,
        owner: &Arc<MemoryTransport>,
        remote: &Arc<MemoryTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            remote_peer,
            open: AtomicBool::new(true),
            owner: Arc::downgrade(owner),
            remote: Arc::downgrade(remote),
            twin: OnceLock::new(),
            streams: Mutex::new(Vec::new()),
        })
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let streams = match self.streams.lock() {
            Ok(mut streams) => std::mem::take(&mut *streams),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for stream in streams {
            stream.abort("connection closed");
        }
    }

    fn track(&self, stream: Arc<MemoryStream>) {
        if let Ok(mut streams) = self.streams.lock() {
            streams.retain(|s| !s.is_closed());
            streams.push(stream);
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn remote_peer(&self) -> &PeerAddress {
        &self.remote_peer
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn streams(&self) -> Vec<Arc<dyn ProtocolStream>> {
        match self.streams.lock() {
            Ok(streams) => streams
                .iter()
                .filter(|s| !s.is_closed())
                .map(|s| s.clone() as Arc<dyn ProtocolStream>)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn new_stream(&self, protocol: &str) -> Result<Arc<dyn ProtocolStream>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        let owner = self.owner.upgrade().ok_or(TransportError::ConnectionClosed)?;
        owner.stream_creations.fetch_add(1, Ordering::SeqCst);

        let delay_ms = owner.stream_creation_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        let remote = self.remote.upgrade().ok_or(TransportError::ConnectionClosed)?;
        let handler = remote.handler_for(protocol).ok_or_else(|| {
            TransportError::Negotiation(format!("{} does not handle {protocol}", self.remote_peer))
        })?;
        let twin = self
            .twin
            .get()
            .and_then(Weak::upgrade)
            .ok_or(TransportError::ConnectionClosed)?;

        let (local_stream, remote_stream) = MemoryStream::pair(protocol);
        self.track(local_stream.clone());
        twin.track(remote_stream.clone());

        let inbound_conn: Arc<dyn Connection> = twin;
        let inbound_stream: Arc<dyn ProtocolStream> = remote_stream;
        tokio::spawn(async move {
            handler.on_stream(inbound_conn, inbound_stream).await;
        });

        Ok(local_stream as Arc<dyn ProtocolStream>)
    }
}

/// One half of an in-process duplex stream.
pub struct MemoryStream {
    id: String,
    protocol: String,
    direction: StreamDirection,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: watch::Sender<bool>,
    reason: Mutex<Option<String>>,
}

impl MemoryStream {
    fn pair(protocol: &str) -> (Arc<Self>, Arc<Self>) {
        let id = Uuid::new_v4().to_string();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let outbound = Self::half(&id, protocol, StreamDirection::Outbound, out_tx, in_rx);
        let inbound = Self::half(&id, protocol, StreamDirection::Inbound, in_tx, out_rx);
        (outbound, inbound)
    }

    fn half(
        id: &str,
        protocol: &str,
        direction: StreamDirection,
        tx: mpsc::UnboundedSender<Bytes>,
        rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id: id.to_string(),
            protocol: protocol.to_string(),
            direction,
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed,
            reason: Mutex::new(None),
        })
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Bytes>> {
        self.tx.lock().ok().and_then(|tx| tx.clone())
    }

    fn drop_sender(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }

    fn abort_error(&self) -> TransportError {
        let reason = self
            .reason
            .lock()
            .ok()
            .and_then(|r| r.clone())
            .unwrap_or_else(|| "aborted".to_string());
        TransportError::Aborted(reason)
    }
}

#[async_trait]
impl ProtocolStream for MemoryStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn direction(&self) -> StreamDirection {
        self.direction
    }

    fn is_writable(&self) -> bool {
        !self.is_closed() && self.sender().is_some_and(|tx| !tx.is_closed())
    }

    async fn write(&self, chunk: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(self.abort_error());
        }
        let tx = self.sender().ok_or(TransportError::StreamClosed)?;
        tx.send(chunk).map_err(|_| TransportError::StreamClosed)
    }

    async fn read(&self) -> Result<Option<Bytes>, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(self.abort_error());
        }
        let mut rx = self.rx.lock().await;
        let received = tokio::select! {
            chunk = rx.recv() => Some(chunk),
            _ = closed.changed() => None,
        };
        match received {
            Some(chunk) => Ok(chunk),
            None => {
                rx.close();
                Err(self.abort_error())
            }
        }
    }

    async fn close(&self) {
        self.drop_sender();
    }

    fn abort(&self, reason: &str) {
        if self.closed.send_replace(true) {
            return;
        }
        if let Ok(mut slot) = self.reason.lock() {
            *slot = Some(reason.to_string());
        }
        self.drop_sender();
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
        }
        debug!(stream_id = %self.id, reason, "Memory stream aborted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl InboundStreamHandler for Echo {
        async fn on_stream(&self, _conn: Arc<dyn Connection>, stream: Arc<dyn ProtocolStream>) {
            while let Ok(Some(chunk)) = stream.read().await {
                if stream.write(chunk).await.is_err() {
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_dial_and_echo() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");
        b.handle("/echo", Arc::new(Echo)).unwrap();

        let conn = a.dial(&PeerAddress::new("b")).await.unwrap();
        assert_eq!(conn.remote_peer().as_str(), "b");
        assert_eq!(a.connections(&PeerAddress::new("b")).len(), 1);
        assert_eq!(b.connections(&PeerAddress::new("a")).len(), 1);

        let stream = conn.new_stream("/echo").await.unwrap();
        assert_eq!(stream.direction(), StreamDirection::Outbound);
        stream.write(Bytes::from_static(b"ping")).await.unwrap();
        let echoed = stream.read().await.unwrap().unwrap();
        assert_eq!(&echoed[..], b"ping");
        assert_eq!(a.stream_creations(), 1);
        assert_eq!(conn.streams().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_and_unknown_peers() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let _b = network.transport("b");

        a.set_unreachable(&PeerAddress::new("b"), true);
        assert!(matches!(
            a.dial(&PeerAddress::new("b")).await,
            Err(TransportError::Unreachable(_))
        ));
        a.set_unreachable(&PeerAddress::new("b"), false);
        assert!(a.dial(&PeerAddress::new("b")).await.is_ok());
        assert!(a.dial(&PeerAddress::new("nobody")).await.is_err());
        assert_eq!(a.dial_count(), 3);
    }

    #[tokio::test]
    async fn test_unhandled_protocol_fails_negotiation() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let _b = network.transport("b");
        let conn = a.dial(&PeerAddress::new("b")).await.unwrap();
        assert!(matches!(
            conn.new_stream("/missing").await,
            Err(TransportError::Negotiation(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_ends_remote_reads() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        struct Capture(mpsc::UnboundedSender<Arc<dyn ProtocolStream>>);
        #[async_trait]
        impl InboundStreamHandler for Capture {
            async fn on_stream(&self, _c: Arc<dyn Connection>, s: Arc<dyn ProtocolStream>) {
                let _ = self.0.send(s);
            }
        }
        b.handle("/p", Arc::new(Capture(seen_tx))).unwrap();

        let conn = a.dial(&PeerAddress::new("b")).await.unwrap();
        let stream = conn.new_stream("/p").await.unwrap();
        let remote = seen_rx.recv().await.unwrap();

        stream.abort("test");
        assert!(!stream.is_writable());
        assert!(stream.write(Bytes::from_static(b"x")).await.is_err());
        assert_eq!(remote.read().await.unwrap(), None);
        assert!(!remote.is_writable());
    }

    #[tokio::test]
    async fn test_disconnect_emits_events_on_both_sides() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();

        let conn = a.dial(&PeerAddress::new("b")).await.unwrap();
        assert!(matches!(
            a_events.recv().await.unwrap(),
            TransportEvent::ConnectionOpened { .. }
        ));
        assert_eq!(
            a_events.recv().await.unwrap(),
            TransportEvent::PeerConnected(PeerAddress::new("b"))
        );

        a.disconnect(&PeerAddress::new("b"));
        assert!(!conn.is_open());
        assert!(a.connections(&PeerAddress::new("b")).is_empty());
        assert!(b.connections(&PeerAddress::new("a")).is_empty());
        assert_eq!(
            a_events.recv().await.unwrap(),
            TransportEvent::ConnectionClosed {
                peer: PeerAddress::new("b"),
                connection_id: conn.id().to_string(),
            }
        );
        assert_eq!(
            a_events.recv().await.unwrap(),
            TransportEvent::PeerDisconnected(PeerAddress::new("b"))
        );

        let mut b_saw_disconnect = false;
        while let Ok(event) = b_events.try_recv() {
            if event == TransportEvent::PeerDisconnected(PeerAddress::new("a")) {
                b_saw_disconnect = true;
            }
        }
        assert!(b_saw_disconnect);
    }
}

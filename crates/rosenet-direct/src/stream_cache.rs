//! Per-peer cache of the outbound direct stream.
//!
//! Each peer has at most one cached outbound stream. Acquisition for a peer
//! is serialized through that peer's slot, so concurrent sends never open
//! duplicate streams. A cached stream is reused while it stays writable and
//! replaced otherwise: first by an existing writable outbound stream on an
//! open connection, then by a freshly negotiated one.

use crate::breaker::BreakerRegistry;
use crate::transport::{Connection, ProtocolStream, StreamDirection, Transport};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use rosenet_types::{PeerAddress, RoseNetError, RoseNetResult};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// A cached outbound stream plus the lock that keeps its exchanges in order.
#[derive(Clone)]
pub struct StreamHandle {
    peer: PeerAddress,
    connection_id: String,
    stream: Arc<dyn ProtocolStream>,
    exchange: Arc<Mutex<()>>,
}

impl StreamHandle {
    fn new(peer: &PeerAddress, connection_id: &str, stream: Arc<dyn ProtocolStream>) -> Self {
        Self {
            peer: peer.clone(),
            connection_id: connection_id.to_string(),
            stream,
            exchange: Arc::new(Mutex::new(())),
        }
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    pub fn id(&self) -> &str {
        self.stream.id()
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn stream(&self) -> &Arc<dyn ProtocolStream> {
        &self.stream
    }

    pub fn is_writable(&self) -> bool {
        self.stream.is_writable()
    }

    /// Wait for exclusive use of the stream for one write-then-ack exchange.
    ///
    /// The underlying mutex is FIFO, so exchanges run in acquisition order.
    pub async fn lock_exchange(&self) -> OwnedMutexGuard<()> {
        self.exchange.clone().lock_owned().await
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("peer", &self.peer)
            .field("connection_id", &self.connection_id)
            .field("stream_id", &self.stream.id())
            .finish()
    }
}

type Slot = Arc<Mutex<Option<StreamHandle>>>;

/// Outbound stream cache keyed by peer.
pub struct StreamCache {
    protocol: String,
    creation_timeout: Duration,
    transport: Arc<dyn Transport>,
    breakers: Arc<BreakerRegistry>,
    slots: DashMap<PeerAddress, Slot>,
}

impl StreamCache {
    pub fn new(
        protocol: impl Into<String>,
        creation_timeout: Duration,
        transport: Arc<dyn Transport>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            creation_timeout,
            transport,
            breakers,
            slots: DashMap::new(),
        }
    }

    /// A writable outbound stream to `peer`, reusing the cached one if possible.
    pub async fn acquire(&self, peer: &PeerAddress) -> RoseNetResult<StreamHandle> {
        let slot = self.slot(peer);
        let mut cached = slot.lock().await;

        if let Some(handle) = cached.as_ref() {
            if handle.is_writable() {
                debug!(peer = %peer, stream_id = handle.id(), "Reusing cached stream");
                return Ok(handle.clone());
            }
            debug!(peer = %peer, stream_id = handle.id(), "Cached stream is not writable, replacing it");
            *cached = None;
        }

        let connection = self.open_connection(peer).await?;
        let stream = self.outbound_stream(peer, connection.as_ref()).await?;
        let handle = StreamHandle::new(peer, connection.id(), stream);
        *cached = Some(handle.clone());
        Ok(handle)
    }

    /// Forget the cached stream of `peer` if it is `stream_id`.
    pub fn evict(&self, peer: &PeerAddress, stream_id: &str) {
        let Some(slot) = self.slots.get(peer).map(|s| s.value().clone()) else {
            return;
        };
        // A locked slot belongs to an acquisition that replaces unwritable
        // streams on its own.
        let Ok(mut cached) = slot.try_lock() else {
            return;
        };
        if cached.as_ref().is_some_and(|h| h.id() == stream_id) {
            debug!(peer = %peer, stream_id, "Evicted cached stream");
            *cached = None;
        }
    }

    /// Forget every cached stream carried by `connection_id`.
    pub fn evict_connection(&self, connection_id: &str) -> usize {
        let slots: Vec<Slot> = self.slots.iter().map(|s| s.value().clone()).collect();
        let mut evicted = 0;
        for slot in slots {
            if let Ok(mut cached) = slot.try_lock() {
                if cached
                    .as_ref()
                    .is_some_and(|h| h.connection_id() == connection_id)
                {
                    *cached = None;
                    evicted += 1;
                }
            }
        }
        if evicted > 0 {
            debug!(connection_id, evicted, "Evicted streams of closed connection");
        }
        evicted
    }

    /// Drop the slot of `peer` entirely.
    pub fn remove_peer(&self, peer: &PeerAddress) {
        self.slots
            .remove_if(peer, |_, slot| slot.try_lock().is_ok());
    }

    /// Drop slots that hold no stream and that no acquisition is using.
    pub fn prune_empty(&self) {
        self.slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1 || slot.try_lock().map_or(true, |cached| cached.is_some())
        });
    }

    /// Number of peers with a slot, cached stream or not.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Peers with a cached stream, sorted.
    pub fn cached_peers(&self) -> Vec<PeerAddress> {
        let mut peers: Vec<PeerAddress> = self
            .slots
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .try_lock()
                    .map_or(true, |cached| cached.is_some())
            })
            .map(|entry| entry.key().clone())
            .collect();
        peers.sort();
        peers
    }

    fn slot(&self, peer: &PeerAddress) -> Slot {
        self.slots.entry(peer.clone()).or_default().clone()
    }

    /// An open connection to `peer`, dialing through the breaker if none exists.
    async fn open_connection(&self, peer: &PeerAddress) -> RoseNetResult<Arc<dyn Connection>> {
        let existing = shuffled(self.transport.connections(peer))
            .into_iter()
            .find(|c| c.is_open());
        if let Some(connection) = existing {
            debug!(peer = %peer, connection_id = connection.id(), "Found an open connection");
            return Ok(connection);
        }

        let connection = self
            .breakers
            .dial(peer, || self.transport.dial(peer))
            .await?;
        debug!(peer = %peer, connection_id = connection.id(), "Established a new connection");
        Ok(connection)
    }

    /// A writable outbound direct stream on `connection`, creating one if needed.
    async fn outbound_stream(
        &self,
        peer: &PeerAddress,
        connection: &dyn Connection,
    ) -> RoseNetResult<Arc<dyn ProtocolStream>> {
        let existing = shuffled(connection.streams()).into_iter().find(|s| {
            s.is_writable()
                && s.direction() == StreamDirection::Outbound
                && s.protocol() == self.protocol
        });
        if let Some(stream) = existing {
            debug!(peer = %peer, stream_id = stream.id(), "Found an existing writable stream");
            return Ok(stream);
        }

        let stream = tokio::time::timeout(self.creation_timeout, connection.new_stream(&self.protocol))
            .await
            .map_err(|_| RoseNetError::StreamCreationTimeout {
                peer: peer.clone(),
                timeout_ms: self.creation_timeout.as_millis() as u64,
            })??;
        debug!(peer = %peer, stream_id = stream.id(), "Created a new stream");
        Ok(stream)
    }
}

fn shuffled<T>(mut items: Vec<T>) -> Vec<T> {
    items.shuffle(&mut rand::thread_rng());
    items
}

//! Bulkheads: bounded concurrency with a bounded wait queue.
//!
//! A [`Bulkhead`] admits up to `max_active` concurrent executions. Further
//! callers wait in FIFO order, up to `max_queued` of them; beyond that they
//! are rejected immediately with [`RoseNetError::CapacityExceeded`].
//!
//! Inbound streams pass two bulkheads ([`InboundGovernor`]): one for the
//! sending peer and one shared by all peers, so a single chatty peer cannot
//! exhaust the global budget.

use dashmap::DashMap;
use rosenet_types::{DirectConfig, PeerAddress, RoseNetError, RoseNetResult};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

/// Bulkhead occupancy snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkheadOccupancy {
    pub name: String,
    /// Executions currently holding a slot.
    pub active: usize,
    /// Callers currently waiting for a slot.
    pub queued: usize,
    pub max_active: usize,
    pub max_queued: usize,
}

/// A held execution slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

/// Decrements the wait-queue counter when a waiter leaves the queue,
/// whether it got a slot or was cancelled.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Concurrency limiter with a bounded FIFO wait queue.
#[derive(Debug)]
pub struct Bulkhead {
    name: String,
    slots: Arc<Semaphore>,
    queued: AtomicUsize,
    max_active: usize,
    max_queued: usize,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, max_active: usize, max_queued: usize) -> Self {
        Self {
            name: name.into(),
            slots: Arc::new(Semaphore::new(max_active)),
            queued: AtomicUsize::new(0),
            max_active,
            max_queued,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take a slot, waiting in the queue if all slots are busy.
    ///
    /// Fails with `CapacityExceeded` when the queue is full too, and with
    /// `ShuttingDown` once the bulkhead is closed.
    pub async fn acquire(&self) -> RoseNetResult<BulkheadPermit> {
        match self.slots.clone().try_acquire_owned() {
            Ok(permit) => return Ok(BulkheadPermit { _permit: permit }),
            Err(TryAcquireError::Closed) => return Err(RoseNetError::ShuttingDown),
            Err(TryAcquireError::NoPermits) => {}
        }

        let reserved = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                (queued < self.max_queued).then_some(queued + 1)
            })
            .is_ok();
        if !reserved {
            debug!(bulkhead = %self.name, "bulkhead full, rejecting execution");
            return Err(self.rejection());
        }

        let _waiting = QueueSlot(&self.queued);
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RoseNetError::ShuttingDown)?;
        Ok(BulkheadPermit { _permit: permit })
    }

    /// Run `work` inside the bulkhead.
    pub async fn execute<F, T>(&self, work: F) -> RoseNetResult<T>
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await?;
        Ok(work.await)
    }

    /// Executions currently holding a slot.
    pub fn active(&self) -> usize {
        self.max_active
            .saturating_sub(self.slots.available_permits())
    }

    /// Callers currently waiting for a slot.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn occupancy(&self) -> BulkheadOccupancy {
        BulkheadOccupancy {
            name: self.name.clone(),
            active: self.active(),
            queued: self.queued(),
            max_active: self.max_active,
            max_queued: self.max_queued,
        }
    }

    /// Refuse all future and waiting acquisitions. Held permits stay valid.
    pub fn close(&self) {
        self.slots.close();
    }

    fn rejection(&self) -> RoseNetError {
        RoseNetError::CapacityExceeded {
            bulkhead: self.name.clone(),
            max_active: self.max_active,
            max_queued: self.max_queued,
        }
    }
}

/// One bulkhead per peer, created on first use.
pub struct BulkheadRegistry {
    prefix: String,
    max_active: usize,
    max_queued: usize,
    bulkheads: DashMap<PeerAddress, Arc<Bulkhead>>,
}

impl BulkheadRegistry {
    pub fn new(prefix: impl Into<String>, max_active: usize, max_queued: usize) -> Self {
        Self {
            prefix: prefix.into(),
            max_active,
            max_queued,
            bulkheads: DashMap::new(),
        }
    }

    /// The bulkhead for `peer`, creating it if needed.
    pub fn get_or_create(&self, peer: &PeerAddress) -> Arc<Bulkhead> {
        self.bulkheads
            .entry(peer.clone())
            .or_insert_with(|| {
                Arc::new(Bulkhead::new(
                    format!("{}:{}", self.prefix, peer),
                    self.max_active,
                    self.max_queued,
                ))
            })
            .clone()
    }

    pub fn get(&self, peer: &PeerAddress) -> Option<Arc<Bulkhead>> {
        self.bulkheads.get(peer).map(|b| b.value().clone())
    }

    pub fn len(&self) -> usize {
        self.bulkheads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bulkheads.is_empty()
    }

    /// Drop the bulkhead of `peer` if nothing holds or waits on it.
    pub fn remove_idle(&self, peer: &PeerAddress) -> bool {
        self.bulkheads
            .remove_if(peer, |_, bulkhead| is_idle(bulkhead))
            .is_some()
    }

    /// Drop every bulkhead nothing holds or waits on.
    pub fn prune_idle(&self) {
        self.bulkheads.retain(|_, bulkhead| !is_idle(bulkhead));
    }

    pub fn occupancy(&self) -> Vec<BulkheadOccupancy> {
        let mut all: Vec<BulkheadOccupancy> =
            self.bulkheads.iter().map(|b| b.value().occupancy()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

fn is_idle(bulkhead: &Arc<Bulkhead>) -> bool {
    Arc::strong_count(bulkhead) == 1 && bulkhead.active() == 0 && bulkhead.queued() == 0
}

/// Both inbound permits for one stream. Dropping it frees both slots.
#[derive(Debug)]
pub struct InboundPermit {
    _peer: BulkheadPermit,
    _global: BulkheadPermit,
}

/// Two-level admission control for inbound streams.
pub struct InboundGovernor {
    global: Bulkhead,
    per_peer: BulkheadRegistry,
}

impl InboundGovernor {
    pub fn new(config: &DirectConfig) -> Self {
        Self {
            global: Bulkhead::new(
                "inbound",
                config.max_inbound_throughput,
                config.max_inbound_queue_size,
            ),
            per_peer: BulkheadRegistry::new(
                "inbound",
                config.max_inbound_throughput_per_peer,
                config.max_inbound_queue_size_per_peer,
            ),
        }
    }

    /// Admit one inbound stream from `peer`.
    ///
    /// The peer's own bulkhead is passed first, so a peer over its budget is
    /// rejected without occupying a global queue slot.
    pub async fn admit(&self, peer: &PeerAddress) -> RoseNetResult<InboundPermit> {
        let peer_bulkhead = self.per_peer.get_or_create(peer);
        let peer_permit = peer_bulkhead.acquire().await?;
        drop(peer_bulkhead);
        let global_permit = self.global.acquire().await?;
        Ok(InboundPermit {
            _peer: peer_permit,
            _global: global_permit,
        })
    }

    pub fn global(&self) -> &Bulkhead {
        &self.global
    }

    pub fn per_peer(&self) -> &BulkheadRegistry {
        &self.per_peer
    }

    pub fn close(&self) {
        self.global.close();
    }
}

//! Connection lifecycle listener.
//!
//! Logs transport events and keeps per-peer state in step with them: a
//! closed connection evicts the streams it carried from the cache, and a
//! disconnected peer releases its idle inbound bulkhead. A periodic sweep
//! also forgets peers that went quiet without ever connecting, such as
//! unreachable dial targets.

use crate::context::DirectContext;
use crate::transport::TransportEvent;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// How often idle per-peer state is swept.
pub const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Spawn the listener. It stops once the node is dropped or the transport
/// closes its event channel; abort the handle to stop it earlier.
pub fn spawn_event_listener(ctx: &Arc<DirectContext>) -> JoinHandle<()> {
    let mut events = ctx.transport.subscribe();
    let ctx: Weak<DirectContext> = Arc::downgrade(ctx);

    tokio::spawn(async move {
        let mut sweep = tokio::time::interval(IDLE_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = events.recv() => {
                    let event = match received {
                        Ok(event) => event,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Event listener lagged, some connection events were missed");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    };
                    let Some(ctx) = ctx.upgrade() else {
                        break;
                    };
                    handle_event(&ctx, &event);
                }
                _ = sweep.tick() => {
                    let Some(ctx) = ctx.upgrade() else {
                        break;
                    };
                    sweep_idle(&ctx);
                }
            }
        }
        debug!("Event listener stopped");
    })
}

/// Drop breaker, cache and inbound bulkhead entries nothing uses anymore.
pub fn sweep_idle(ctx: &DirectContext) {
    ctx.breakers.clear_idle();
    ctx.streams.prune_empty();
    ctx.inbound.per_peer().prune_idle();
}

/// Apply one event to the node state.
pub fn handle_event(ctx: &DirectContext, event: &TransportEvent) {
    match event {
        TransportEvent::ConnectionOpened {
            peer,
            connection_id,
        } => {
            debug!(peer = %peer, connection_id = %connection_id, "Connection opened");
        }
        TransportEvent::ConnectionClosed {
            peer,
            connection_id,
        } => {
            let evicted = ctx.streams.evict_connection(connection_id);
            debug!(peer = %peer, connection_id = %connection_id, evicted, "Connection closed");
        }
        TransportEvent::PeerConnected(peer) => {
            info!(peer = %peer, "Peer connected");
        }
        TransportEvent::PeerDisconnected(peer) => {
            ctx.streams.remove_peer(peer);
            ctx.inbound.per_peer().remove_idle(peer);
            info!(peer = %peer, "Peer disconnected");
        }
    }
}

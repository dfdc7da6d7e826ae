//! The direct-messaging node: public send and receive entry points.

use crate::breaker::BreakerSnapshot;
use crate::bulkhead::BulkheadOccupancy;
use crate::context::DirectContext;
use crate::events;
use crate::receive::{DirectMessageHandler, DirectReceiver};
use crate::retry::{retry_async, RetryConfig, RetryOutcome};
use crate::send::SendPipeline;
use crate::transport::Transport;
use rosenet_types::{PeerAddress, RoseNetConfig, RoseNetError, RoseNetResult};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Invoked exactly once with the final outcome of a send.
pub type SettledCallback = Box<dyn FnOnce(RoseNetResult<()>) + Send + 'static>;

/// Point-in-time view of a node's pipelines.
#[derive(Debug, Clone, Serialize)]
pub struct DirectSnapshot {
    pub local_peer: PeerAddress,
    /// Peers with a cached outbound stream.
    pub cached_streams: Vec<PeerAddress>,
    pub breakers: Vec<BreakerSnapshot>,
    pub outbound: BulkheadOccupancy,
    pub inbound: BulkheadOccupancy,
    pub inbound_per_peer: Vec<BulkheadOccupancy>,
}

/// A RoseNet direct-messaging node over some [`Transport`].
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct DirectNode {
    ctx: Arc<DirectContext>,
    sender: SendPipeline,
}

impl DirectNode {
    /// Build a node. Fails if `config` does not validate.
    pub fn new(config: RoseNetConfig, transport: Arc<dyn Transport>) -> RoseNetResult<Self> {
        let ctx = Arc::new(DirectContext::new(&config, transport)?);
        let sender = SendPipeline::new(ctx.streams.clone(), ctx.config.roundtrip_timeout());
        Ok(Self { ctx, sender })
    }

    pub fn context(&self) -> &Arc<DirectContext> {
        &self.ctx
    }

    pub fn local_peer(&self) -> &PeerAddress {
        self.ctx.transport.local_peer()
    }

    /// Send `message` to `to` and wait for the final outcome.
    ///
    /// Admission goes through the outbound bulkhead; when more than
    /// `fail_fast_threshold` sends are already in flight, the fail-fast retry
    /// policy applies instead of the normal one. The slot is held across all
    /// retries.
    pub async fn try_send_message(&self, to: &PeerAddress, message: &str) -> RoseNetResult<()> {
        let config = &self.ctx.config;
        let fail_fast = self.ctx.outbound.active() > config.fail_fast_threshold;
        let _slot = self.ctx.outbound.acquire().await.map_err(|e| {
            warn!(peer = %to, error = %e, "Maximum outbound throughput reached, rejecting message");
            e
        })?;

        let policy = if fail_fast {
            debug!(peer = %to, "Outbound pipeline under load, using fail-fast retries");
            RetryConfig::fail_fast(config)
        } else {
            RetryConfig::direct(config)
        };

        match retry_async(
            &policy,
            || self.sender.send(to, message),
            RoseNetError::is_retryable,
        )
        .await
        {
            RetryOutcome::Success { attempts, .. } => {
                debug!(peer = %to, attempts, "Message delivered");
                Ok(())
            }
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => {
                error!(
                    peer = %to,
                    attempts,
                    error = %last_error,
                    "Message sending failed regardless of retries, dropping message"
                );
                Err(RoseNetError::DeliveryFailed {
                    peer: to.clone(),
                    attempts,
                    source: Box::new(last_error),
                })
            }
        }
    }

    /// Send `message` to `to`, reporting the outcome to `on_settled`.
    ///
    /// Never returns an error itself; the callback, if any, runs exactly once.
    pub async fn send_message(
        &self,
        to: &PeerAddress,
        message: &str,
        on_settled: Option<SettledCallback>,
    ) {
        let result = self.try_send_message(to, message).await;
        if let Some(callback) = on_settled {
            callback(result);
        }
    }

    /// Fire-and-forget variant of [`send_message`](Self::send_message).
    pub fn spawn_send(
        &self,
        to: PeerAddress,
        message: String,
        on_settled: Option<SettledCallback>,
    ) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move { node.send_message(&to, &message, on_settled).await })
    }

    /// Register `handler` for inbound direct messages.
    ///
    /// Replaces any previously registered handler.
    pub fn handle_incoming_message<H: DirectMessageHandler>(&self, handler: H) -> RoseNetResult<()> {
        let receiver = Arc::new(DirectReceiver::new(self.ctx.clone(), Arc::new(handler)));
        self.ctx
            .transport
            .handle(&self.ctx.config.protocol_id, receiver)?;
        info!(protocol = %self.ctx.config.protocol_id, "Handler for direct protocol set");
        Ok(())
    }

    /// Start logging connection events, evicting state they invalidate and
    /// periodically forgetting idle peers.
    pub fn start_event_listener(&self) -> JoinHandle<()> {
        events::spawn_event_listener(&self.ctx)
    }

    /// Stop admitting new sends and inbound streams. In-flight work finishes.
    pub fn shutdown(&self) {
        self.ctx.outbound.close();
        self.ctx.inbound.close();
        info!("Direct node shutting down");
    }

    pub fn snapshot(&self) -> DirectSnapshot {
        DirectSnapshot {
            local_peer: self.local_peer().clone(),
            cached_streams: self.ctx.streams.cached_peers(),
            breakers: self.ctx.breakers.snapshot(),
            outbound: self.ctx.outbound.occupancy(),
            inbound: self.ctx.inbound.global().occupancy(),
            inbound_per_peer: self.ctx.inbound.per_peer().occupancy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use crate::receive::FnHandler;

    #[test]
    fn test_invalid_config_is_rejected() {
        let network = MemoryNetwork::new();
        let transport = network.transport("a");
        let mut config = RoseNetConfig::default();
        config.direct.max_outbound_throughput = 0;
        assert!(matches!(
            DirectNode::new(config, transport),
            Err(RoseNetError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_sends() {
        let network = MemoryNetwork::new();
        let node = DirectNode::new(RoseNetConfig::default(), network.transport("a")).unwrap();
        node.shutdown();
        let err = node
            .try_send_message(&PeerAddress::new("b"), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, RoseNetError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_snapshot_serializes() {
        let network = MemoryNetwork::new();
        let a = DirectNode::new(RoseNetConfig::default(), network.transport("a")).unwrap();
        let b = DirectNode::new(RoseNetConfig::default(), network.transport("b")).unwrap();
        b.handle_incoming_message(FnHandler(|_from: PeerAddress, _msg: String| async {}))
            .unwrap();

        a.try_send_message(&PeerAddress::new("b"), "hello").await.unwrap();

        let snapshot = a.snapshot();
        assert_eq!(snapshot.local_peer.as_str(), "a");
        assert_eq!(snapshot.cached_streams, vec![PeerAddress::new("b")]);
        assert_eq!(snapshot.outbound.active, 0);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["outbound"]["max_active"], 200);
        assert_eq!(json["breakers"][0]["state"], "Closed");
    }
}

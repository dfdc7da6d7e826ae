//! Shared state of a direct-messaging node.

use crate::breaker::BreakerRegistry;
use crate::bulkhead::{Bulkhead, InboundGovernor};
use crate::stream_cache::StreamCache;
use crate::transport::Transport;
use rosenet_types::{DirectConfig, RoseNetConfig, RoseNetResult};
use std::sync::Arc;

/// Everything the send and receive pipelines share.
///
/// Built once per node from a validated [`RoseNetConfig`].
pub struct DirectContext {
    pub config: DirectConfig,
    pub transport: Arc<dyn Transport>,
    pub breakers: Arc<BreakerRegistry>,
    pub streams: Arc<StreamCache>,
    pub inbound: InboundGovernor,
    pub outbound: Bulkhead,
}

impl DirectContext {
    pub fn new(config: &RoseNetConfig, transport: Arc<dyn Transport>) -> RoseNetResult<Self> {
        config.validate()?;
        let direct = config.direct.clone();
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let streams = Arc::new(StreamCache::new(
            direct.protocol_id.clone(),
            direct.stream_creation_timeout(),
            transport.clone(),
            breakers.clone(),
        ));
        Ok(Self {
            inbound: InboundGovernor::new(&direct),
            outbound: Bulkhead::new(
                "outbound",
                direct.max_outbound_throughput,
                direct.max_outbound_queue_size,
            ),
            config: direct,
            transport,
            breakers,
            streams,
        })
    }
}

//! One send attempt: acquire a stream, write a frame, await the ack.

use crate::codec::{self, ACK_BYTE};
use crate::stream_cache::{StreamCache, StreamHandle};
use bytes::Bytes;
use rosenet_types::{PeerAddress, RoseNetError, RoseNetResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A single delivery attempt of one message.
///
/// Retries, bulkheads and fail-fast are layered on top by the node.
#[derive(Clone)]
pub struct SendPipeline {
    streams: Arc<StreamCache>,
    roundtrip_timeout: Duration,
}

impl SendPipeline {
    pub fn new(streams: Arc<StreamCache>, roundtrip_timeout: Duration) -> Self {
        Self {
            streams,
            roundtrip_timeout,
        }
    }

    /// Deliver `message` to `peer` and wait for its ack.
    ///
    /// A failure that leaves the stream in an unknown state aborts that stream
    /// and evicts it from the cache, so the next attempt starts on a fresh one.
    pub async fn send(&self, peer: &PeerAddress, message: &str) -> RoseNetResult<()> {
        let handle = self.streams.acquire(peer).await?;
        debug!(peer = %peer, stream_id = handle.id(), "Got a stream for the message");

        match self.exchange(peer, &handle, message).await {
            Ok(()) => {
                debug!(peer = %peer, stream_id = handle.id(), "Message sent successfully");
                Ok(())
            }
            Err(e) if e.poisons_stream() => {
                warn!(peer = %peer, stream_id = handle.id(), error = %e, "Message exchange failed, aborting stream");
                handle.stream().abort(&e.to_string());
                self.streams.evict(peer, handle.id());
                Err(e)
            }
            Err(e) => {
                warn!(peer = %peer, stream_id = handle.id(), error = %e, "Message exchange failed");
                Err(e)
            }
        }
    }

    async fn exchange(
        &self,
        peer: &PeerAddress,
        handle: &StreamHandle,
        message: &str,
    ) -> RoseNetResult<()> {
        let _turn = handle.lock_exchange().await;
        let stream = handle.stream();
        let frame = codec::encode(message);

        let ack = tokio::time::timeout(self.roundtrip_timeout, async {
            stream.write(frame).await?;
            stream.read().await
        })
        .await
        .map_err(|_| RoseNetError::RoundTripTimeout {
            peer: peer.clone(),
            timeout_ms: self.roundtrip_timeout.as_millis() as u64,
        })??;

        validate_ack(peer, ack)
    }
}

/// Check that the response is exactly one chunk holding exactly [`ACK_BYTE`].
pub fn validate_ack(peer: &PeerAddress, ack: Option<Bytes>) -> RoseNetResult<()> {
    let chunk = ack.ok_or_else(|| RoseNetError::InvalidAckChunks {
        peer: peer.clone(),
        len: 0,
    })?;
    if chunk.len() != 1 {
        return Err(RoseNetError::InvalidAckChunks {
            peer: peer.clone(),
            len: chunk.len(),
        });
    }
    if chunk[0] != ACK_BYTE {
        return Err(RoseNetError::InvalidAckByte {
            peer: peer.clone(),
            byte: chunk[0],
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_ack() {
        let peer = PeerAddress::new("p");
        assert!(validate_ack(&peer, Some(Bytes::from_static(&[1]))).is_ok());
        assert!(matches!(
            validate_ack(&peer, None),
            Err(RoseNetError::InvalidAckChunks { len: 0, .. })
        ));
        assert!(matches!(
            validate_ack(&peer, Some(Bytes::from_static(&[1, 1]))),
            Err(RoseNetError::InvalidAckChunks { len: 2, .. })
        ));
        assert!(matches!(
            validate_ack(&peer, Some(Bytes::new())),
            Err(RoseNetError::InvalidAckChunks { len: 0, .. })
        ));
        assert!(matches!(
            validate_ack(&peer, Some(Bytes::from_static(&[2]))),
            Err(RoseNetError::InvalidAckByte { byte: 2, .. })
        ));
    }
}

//! Inbound side: admit streams, decode frames, invoke the handler, ack.

use crate::codec::{self, MessageDecoder, ACK_BYTE};
use crate::context::DirectContext;
use crate::transport::{Connection, InboundStreamHandler, ProtocolStream};
use async_trait::async_trait;
use bytes::Bytes;
use rosenet_types::{PeerAddress, RoseNetError, RoseNetResult};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Application callback for decoded direct messages.
#[async_trait]
pub trait DirectMessageHandler: Send + Sync + 'static {
    /// Handle one message. The sender is acked without waiting for this to
    /// return; messages of one stream are handled in order.
    async fn handle(&self, from: &PeerAddress, message: String);
}

/// Adapts an async closure into a [`DirectMessageHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> DirectMessageHandler for FnHandler<F>
where
    F: Fn(PeerAddress, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, from: &PeerAddress, message: String) {
        (self.0)(from.clone(), message).await
    }
}

/// Serves inbound direct streams.
///
/// Each stream first passes the per-peer and global inbound bulkheads and
/// keeps both slots until it ends. Every decoded message is handed to the
/// handler and acknowledged with [`ACK_BYTE`]; the ack write is bounded by
/// the handling timeout. Any failure aborts the stream.
pub struct DirectReceiver {
    ctx: Arc<DirectContext>,
    handler: Arc<dyn DirectMessageHandler>,
}

impl DirectReceiver {
    pub fn new(ctx: Arc<DirectContext>, handler: Arc<dyn DirectMessageHandler>) -> Self {
        Self { ctx, handler }
    }

    /// Serve messages until the stream ends or idles out, returning how many
    /// were acknowledged.
    ///
    /// Decoded messages go to a per-stream dispatch task that runs the
    /// handler in arrival order. The ack does not wait for the handler.
    async fn serve(&self, peer: &PeerAddress, stream: &dyn ProtocolStream) -> RoseNetResult<usize> {
        let config = &self.ctx.config;
        let mut decoder = MessageDecoder::new(config.max_message_size);
        let dispatch = spawn_dispatch(peer.clone(), self.handler.clone());
        let mut acked = 0;

        loop {
            let next = match tokio::time::timeout(
                config.stream_idle_timeout(),
                codec::read_message(stream, &mut decoder),
            )
            .await
            {
                Ok(next) => next?,
                Err(_) => {
                    // Abort rather than half-close so the sender's cache sees
                    // the stream as unwritable.
                    debug!(peer = %peer, stream_id = stream.id(), "Stream idle, closing it");
                    stream.abort("idle timeout");
                    return Ok(acked);
                }
            };
            let Some(message) = next else {
                return Ok(acked);
            };
            debug!(peer = %peer, stream_id = stream.id(), "Message decoded");

            if dispatch.send(message).is_err() {
                warn!(peer = %peer, "Message dispatcher stopped, dropping message");
            }

            tokio::time::timeout(
                config.handling_timeout(),
                stream.write(Bytes::from_static(&[ACK_BYTE])),
            )
            .await
            .map_err(|_| RoseNetError::HandlingTimeout {
                peer: peer.clone(),
                timeout_ms: config.handling_timeout_ms,
            })??;
            debug!(peer = %peer, stream_id = stream.id(), "Ack sent back to the sender");
            acked += 1;
        }
    }
}

/// Run `handler` for every message sent on the returned channel, one at a
/// time. The task drains what is queued after the sender is dropped.
fn spawn_dispatch(
    peer: PeerAddress,
    handler: Arc<dyn DirectMessageHandler>,
) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            handler.handle(&peer, message).await;
            debug!(peer = %peer, "Handler called");
        }
    });
    tx
}

#[async_trait]
impl InboundStreamHandler for DirectReceiver {
    async fn on_stream(&self, connection: Arc<dyn Connection>, stream: Arc<dyn ProtocolStream>) {
        let peer = connection.remote_peer().clone();
        debug!(
            peer = %peer,
            stream_id = stream.id(),
            protocol = stream.protocol(),
            "Incoming stream"
        );

        let _permit = match self.ctx.inbound.admit(&peer).await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Maximum message handling threshold reached, rejecting stream");
                stream.abort(&e.to_string());
                return;
            }
        };

        match self.serve(&peer, stream.as_ref()).await {
            Ok(acked) => {
                debug!(peer = %peer, stream_id = stream.id(), acked, "Incoming stream completed");
            }
            Err(e) => {
                warn!(peer = %peer, stream_id = stream.id(), error = %e, "Incoming message handling failed, aborting stream");
                stream.abort(&e.to_string());
            }
        }
    }
}

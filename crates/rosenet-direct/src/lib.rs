//! RoseNet Direct: acknowledged peer-to-peer text messaging.
//!
//! Delivers UTF-8 messages to a peer over a multiplexed transport. Each
//! message is length-prefixed, written to a cached per-peer stream and
//! acknowledged with a single byte. Sends are retried with exponential
//! backoff, dials go through a per-peer circuit breaker, and bulkheads bound
//! both outbound sends and inbound handling.
//!
//! ## Architecture
//!
//! - **DirectNode**: Public entry points (send, register a handler, snapshot)
//! - **StreamCache**: One reusable outbound stream per peer
//! - **BreakerRegistry**: Per-peer dial circuit breakers
//! - **Bulkhead / InboundGovernor**: Concurrency limits with bounded queues
//! - **Transport**: Trait the networking stack implements; `MemoryTransport`
//!   is the in-process implementation

pub mod breaker;
pub mod bulkhead;
pub mod codec;
pub mod config;
pub mod context;
pub mod events;
pub mod memory;
pub mod node;
pub mod receive;
pub mod retry;
pub mod send;
pub mod stream_cache;
pub mod transport;

pub use breaker::{BreakerRegistry, BreakerSnapshot, BreakerVerdict, CircuitState};
pub use bulkhead::{Bulkhead, BulkheadOccupancy, BulkheadRegistry, InboundGovernor};
pub use codec::ACK_BYTE;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use node::{DirectNode, DirectSnapshot, SettledCallback};
pub use receive::{DirectMessageHandler, FnHandler};
pub use retry::RetryConfig;
pub use rosenet_types::{
    PeerAddress, RoseNetConfig, RoseNetError, RoseNetResult, ROSENET_DIRECT_PROTOCOL_V1,
};
pub use transport::{
    Connection, InboundStreamHandler, ProtocolStream, StreamDirection, Transport, TransportError,
    TransportEvent,
};

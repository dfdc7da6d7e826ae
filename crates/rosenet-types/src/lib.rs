//! Core types for RoseNet direct messaging.
//!
//! This crate defines the shared data structures used by the direct-messaging
//! pipeline and the legacy broker: peer addressing, the error taxonomy, and
//! configuration. It contains no I/O and no business logic.

pub mod config;
pub mod error;
pub mod peer;

pub use config::{
    BreakerConfig, BrokerConfig, DirectConfig, RoseNetConfig, ROSENET_DIRECT_PROTOCOL_V1,
};
pub use error::{RoseNetError, RoseNetResult};
pub use peer::PeerAddress;

//! Shared error types for RoseNet direct messaging.

use crate::peer::PeerAddress;
use thiserror::Error;

/// Top-level error type for the direct-messaging pipeline.
#[derive(Error, Debug)]
pub enum RoseNetError {
    /// The dial breaker for this peer is open, or dialing failed.
    #[error("Cannot dial peer {peer}: {reason}")]
    DialUnavailable {
        /// The peer that could not be dialed.
        peer: PeerAddress,
        /// Why the dial was refused or failed.
        reason: String,
    },

    /// Opening a new protocol stream did not finish in time.
    #[error("Stream creation to {peer} timed out after {timeout_ms}ms")]
    StreamCreationTimeout { peer: PeerAddress, timeout_ms: u64 },

    /// The ack was not received before the round-trip deadline.
    #[error("Ack from {peer} was not received within {timeout_ms}ms")]
    RoundTripTimeout { peer: PeerAddress, timeout_ms: u64 },

    /// The ack response was not exactly one single-byte chunk.
    #[error("Invalid ack from {peer}: expected a single 1-byte chunk, got {len} bytes")]
    InvalidAckChunks { peer: PeerAddress, len: usize },

    /// The ack byte did not match the sentinel.
    #[error("Invalid ack byte from {peer}: {byte:#04x}")]
    InvalidAckByte { peer: PeerAddress, byte: u8 },

    /// A bulkhead rejected the execution (capacity and queue both full).
    #[error("Capacity exceeded on bulkhead '{bulkhead}' ({max_active} active, {max_queued} queued)")]
    CapacityExceeded {
        bulkhead: String,
        max_active: usize,
        max_queued: usize,
    },

    /// Handling an inbound message did not finish in time.
    #[error("Handling a message from {peer} timed out after {timeout_ms}ms")]
    HandlingTimeout { peer: PeerAddress, timeout_ms: u64 },

    /// A length-prefixed frame exceeded the configured maximum.
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// A decoded frame was not valid UTF-8.
    #[error("Message is not valid UTF-8")]
    InvalidUtf8,

    /// The byte stream did not contain a well-formed length-prefixed frame.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Delivery failed after the retry budget was exhausted.
    #[error("Message sending to {peer} failed after {attempts} attempts: {source}")]
    DeliveryFailed {
        peer: PeerAddress,
        attempts: u32,
        #[source]
        source: Box<RoseNetError>,
    },

    /// Any other failure surfaced by the transport.
    #[error("Unknown error: {0}")]
    Unknown(String),

    /// A configuration value is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The node is shutting down.
    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl RoseNetError {
    /// Whether the retry policy should attempt the operation again.
    ///
    /// Every classified send failure is retryable up to the attempt budget.
    /// Bulkhead rejection, configuration problems and shutdown are terminal.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RoseNetError::CapacityExceeded { .. }
                | RoseNetError::Config(_)
                | RoseNetError::ShuttingDown
                | RoseNetError::DeliveryFailed { .. }
        )
    }

    /// Whether the failure happened after a stream was obtained, meaning the
    /// stream is in an unknown state and must not be reused.
    pub fn poisons_stream(&self) -> bool {
        matches!(
            self,
            RoseNetError::RoundTripTimeout { .. }
                | RoseNetError::InvalidAckChunks { .. }
                | RoseNetError::InvalidAckByte { .. }
                | RoseNetError::Unknown(_)
                | RoseNetError::Io(_)
        )
    }
}

/// Alias for Result with RoseNetError.
pub type RoseNetResult<T> = Result<T, RoseNetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let peer = PeerAddress::new("p");
        assert!(RoseNetError::DialUnavailable {
            peer: peer.clone(),
            reason: "breaker open".into()
        }
        .is_retryable());
        assert!(RoseNetError::RoundTripTimeout {
            peer: peer.clone(),
            timeout_ms: 10
        }
        .is_retryable());
        assert!(RoseNetError::Unknown("boom".into()).is_retryable());
        assert!(!RoseNetError::CapacityExceeded {
            bulkhead: "outbound".into(),
            max_active: 1,
            max_queued: 0
        }
        .is_retryable());
        assert!(!RoseNetError::ShuttingDown.is_retryable());
    }

    #[test]
    fn test_dial_failure_does_not_poison_stream() {
        let peer = PeerAddress::new("p");
        assert!(!RoseNetError::DialUnavailable {
            peer: peer.clone(),
            reason: "unreachable".into()
        }
        .poisons_stream());
        assert!(RoseNetError::InvalidAckByte { peer, byte: 7 }.poisons_stream());
    }

    #[test]
    fn test_delivery_failed_display_includes_cause() {
        let peer = PeerAddress::new("peer-x");
        let err = RoseNetError::DeliveryFailed {
            peer: peer.clone(),
            attempts: 6,
            source: Box::new(RoseNetError::RoundTripTimeout {
                peer,
                timeout_ms: 5000,
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("peer-x"));
        assert!(msg.contains("6 attempts"));
        assert!(msg.contains("5000ms"));
    }
}

//! Legacy RoseNet message broker.
//!
//! A single background task routes queued messages through a caller-supplied
//! async function. Failed routes are retried with jittered exponential
//! backoff and dropped once `max_retries` rounds are spent. There are no
//! acknowledgements and no concurrency limits; new code should use the
//! direct-messaging pipeline in `rosenet-direct`.

pub mod broker;

pub use broker::{retry_timeout, BrokerError, BrokerStats, MessageBroker, WrappedMessage};
pub use rosenet_types::BrokerConfig;

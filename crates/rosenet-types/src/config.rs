//! Configuration types for RoseNet direct messaging.
//!
//! Every section carries `#[serde(default)]`, so a partial TOML file only
//! overrides the keys it names.

use crate::error::{RoseNetError, RoseNetResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Protocol id of RoseNet direct messaging.
pub const ROSENET_DIRECT_PROTOCOL_V1: &str = "/rosenet/direct/1";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoseNetConfig {
    /// Direct messaging pipeline.
    pub direct: DirectConfig,
    /// Per-peer dial circuit breaker.
    pub breaker: BreakerConfig,
    /// Legacy message broker.
    pub broker: BrokerConfig,
}

impl RoseNetConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(contents: &str) -> RoseNetResult<Self> {
        toml::from_str(contents).map_err(|e| RoseNetError::Config(e.to_string()))
    }

    /// Check every section for values the pipeline cannot run with.
    pub fn validate(&self) -> RoseNetResult<()> {
        self.direct.validate()?;
        self.breaker.validate()?;
        self.broker.validate()
    }
}

/// Settings of the send and receive pipelines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectConfig {
    /// Protocol id negotiated for direct streams.
    pub protocol_id: String,
    /// Maximum time for writing a message and receiving its ack.
    pub roundtrip_timeout_ms: u64,
    /// Maximum time for handling one inbound message (handler + ack write).
    pub handling_timeout_ms: u64,
    /// Maximum time for creating a stream, including protocol negotiation.
    pub stream_creation_timeout_ms: u64,
    /// How long an inbound stream may sit idle between messages.
    pub stream_idle_timeout_ms: u64,
    /// Largest accepted frame payload in bytes.
    pub max_message_size: usize,
    /// Retries after the first attempt.
    pub max_retry_attempts: u32,
    /// Retries after the first attempt while in fail-fast mode.
    pub fail_fast_max_retry_attempts: u32,
    /// Initial retry delay.
    pub retry_initial_delay_ms: u64,
    /// Initial retry delay while in fail-fast mode.
    pub fail_fast_retry_initial_delay_ms: u64,
    /// Base of the exponential backoff.
    pub retry_exponent: f64,
    /// Cap on a single retry delay.
    pub retry_max_delay_ms: u64,
    /// Jitter factor (0.0 = none, 1.0 = up to double the delay).
    pub retry_jitter: f64,
    /// In-flight outbound executions above which fail-fast kicks in.
    pub fail_fast_threshold: usize,
    /// Concurrent inbound messages across all peers.
    pub max_inbound_throughput: usize,
    /// Inbound streams allowed to wait for a global slot.
    pub max_inbound_queue_size: usize,
    /// Concurrent inbound messages from a single peer.
    pub max_inbound_throughput_per_peer: usize,
    /// Inbound streams from a single peer allowed to wait.
    pub max_inbound_queue_size_per_peer: usize,
    /// Concurrent outbound sends.
    pub max_outbound_throughput: usize,
    /// Outbound sends allowed to wait for a slot.
    pub max_outbound_queue_size: usize,
}

impl Default for DirectConfig {
    fn default() -> Self {
        let max_outbound_throughput = 200;
        Self {
            protocol_id: ROSENET_DIRECT_PROTOCOL_V1.to_string(),
            roundtrip_timeout_ms: 5_000,
            handling_timeout_ms: 2_000,
            stream_creation_timeout_ms: 2_000,
            stream_idle_timeout_ms: 60_000,
            max_message_size: 16 * 1024 * 1024,
            max_retry_attempts: 5,
            fail_fast_max_retry_attempts: 1,
            retry_initial_delay_ms: 2_000,
            fail_fast_retry_initial_delay_ms: 5_000,
            retry_exponent: 2.0,
            retry_max_delay_ms: 300_000,
            retry_jitter: 0.2,
            fail_fast_threshold: max_outbound_throughput / 4,
            max_inbound_throughput: 100,
            max_inbound_queue_size: 200,
            max_inbound_throughput_per_peer: 10,
            max_inbound_queue_size_per_peer: 20,
            max_outbound_throughput,
            max_outbound_queue_size: 400,
        }
    }
}

impl DirectConfig {
    pub fn roundtrip_timeout(&self) -> Duration {
        Duration::from_millis(self.roundtrip_timeout_ms)
    }

    pub fn handling_timeout(&self) -> Duration {
        Duration::from_millis(self.handling_timeout_ms)
    }

    pub fn stream_creation_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_creation_timeout_ms)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_idle_timeout_ms)
    }

    fn validate(&self) -> RoseNetResult<()> {
        if self.protocol_id.is_empty() {
            return Err(RoseNetError::Config("direct.protocol_id is empty".into()));
        }
        let capacities = [
            ("direct.max_inbound_throughput", self.max_inbound_throughput),
            (
                "direct.max_inbound_throughput_per_peer",
                self.max_inbound_throughput_per_peer,
            ),
            ("direct.max_outbound_throughput", self.max_outbound_throughput),
            ("direct.max_message_size", self.max_message_size),
        ];
        for (key, value) in capacities {
            if value == 0 {
                return Err(RoseNetError::Config(format!("{key} must be positive")));
            }
        }
        if self.retry_exponent < 1.0 {
            return Err(RoseNetError::Config(format!(
                "direct.retry_exponent must be >= 1.0, got {}",
                self.retry_exponent
            )));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(RoseNetError::Config(format!(
                "direct.retry_jitter must be within [0, 1], got {}",
                self.retry_jitter
            )));
        }
        Ok(())
    }
}

/// Settings of the per-peer dial circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Trailing window over which dial outcomes are sampled.
    pub sampling_window_ms: u64,
    /// Failure ratio at or above which the breaker opens.
    pub failure_threshold: f64,
    /// Samples required inside the window before the ratio is considered.
    pub minimum_samples: usize,
    /// First half-open cool-down.
    pub half_open_initial_ms: u64,
    /// Cap on the half-open cool-down.
    pub half_open_max_ms: u64,
    /// Growth factor of the cool-down across consecutive trips.
    pub half_open_exponent: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            sampling_window_ms: 5_000,
            failure_threshold: 0.7,
            minimum_samples: 5,
            half_open_initial_ms: 1_000,
            half_open_max_ms: 30_000,
            half_open_exponent: 2.0,
        }
    }
}

impl BreakerConfig {
    pub fn sampling_window(&self) -> Duration {
        Duration::from_millis(self.sampling_window_ms)
    }

    fn validate(&self) -> RoseNetResult<()> {
        if !(self.failure_threshold > 0.0 && self.failure_threshold <= 1.0) {
            return Err(RoseNetError::Config(format!(
                "breaker.failure_threshold must be within (0, 1], got {}",
                self.failure_threshold
            )));
        }
        if self.minimum_samples == 0 {
            return Err(RoseNetError::Config(
                "breaker.minimum_samples must be positive".into(),
            ));
        }
        if self.half_open_exponent < 1.0 {
            return Err(RoseNetError::Config(format!(
                "breaker.half_open_exponent must be >= 1.0, got {}",
                self.half_open_exponent
            )));
        }
        Ok(())
    }
}

/// Settings of the legacy message broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Retries after the first routing attempt before a message is dropped.
    pub max_retries: u32,
    /// Base of the exponential retry delay.
    pub exponential_factor: f64,
    /// Delay unit multiplied by jitter and `exponential_factor^round`.
    pub base_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            exponential_factor: 3.0,
            base_delay_ms: 1_000,
        }
    }
}

impl BrokerConfig {
    fn validate(&self) -> RoseNetResult<()> {
        if self.exponential_factor < 1.0 {
            return Err(RoseNetError::Config(format!(
                "broker.exponential_factor must be >= 1.0, got {}",
                self.exponential_factor
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_defaults() {
        let config = DirectConfig::default();
        assert_eq!(config.protocol_id, "/rosenet/direct/1");
        assert_eq!(config.roundtrip_timeout_ms, 5_000);
        assert_eq!(config.handling_timeout_ms, 2_000);
        assert_eq!(config.max_retry_attempts, 5);
        assert_eq!(config.fail_fast_max_retry_attempts, 1);
        assert_eq!(config.fail_fast_threshold, 50);
        assert_eq!(config.max_outbound_queue_size, 400);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RoseNetConfig::from_toml_str(
            r#"
            [direct]
            roundtrip_timeout_ms = 1500

            [broker]
            max_retries = 7
            "#,
        )
        .unwrap();
        assert_eq!(config.direct.roundtrip_timeout_ms, 1_500);
        assert_eq!(config.direct.handling_timeout_ms, 2_000);
        assert_eq!(config.broker.max_retries, 7);
        assert_eq!(config.breaker, BreakerConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RoseNetConfig::default();
        assert!(config.validate().is_ok());

        config.breaker.failure_threshold = 1.5;
        assert!(matches!(config.validate(), Err(RoseNetError::Config(_))));

        let mut config = RoseNetConfig::default();
        config.direct.max_outbound_throughput = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_outbound_throughput"));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = RoseNetConfig::from_toml_str("direct = 5").unwrap_err();
        assert!(matches!(err, RoseNetError::Config(_)));
    }
}

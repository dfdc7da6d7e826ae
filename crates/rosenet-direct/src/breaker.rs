//! Per-peer dial circuit breaker with a sampled failure ratio.
//!
//! Every dial outcome for a peer is recorded in a trailing sampling window.
//! Once the window holds enough samples and the failure ratio reaches the
//! threshold, the circuit opens and further dials to that peer are refused
//! without touching the network. After a cool-down that grows with each
//! consecutive trip, a single probe dial is let through: success closes the
//! circuit, failure reopens it.

use dashmap::DashMap;
use rosenet_types::{BreakerConfig, PeerAddress, RoseNetError, RoseNetResult};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Circuit state
// ---------------------------------------------------------------------------

/// Current state of a peer's dial circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Dials flow normally and outcomes are sampled.
    Closed,
    /// Dials are refused until the cool-down expires.
    Open,
    /// Cool-down expired; one probe dial decides the next state.
    HalfOpen,
}

/// Verdict for a dial about to be made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerVerdict {
    Allow,
    /// Allowed as the half-open probe; its outcome closes or reopens the circuit.
    AllowProbe,
    Reject { retry_after: Duration },
}

/// Snapshot of one peer's breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub peer: PeerAddress,
    pub state: CircuitState,
    /// Outcomes currently inside the sampling window.
    pub samples: usize,
    /// Failures currently inside the sampling window.
    pub failures: usize,
    /// Consecutive trips without a successful probe.
    pub trips: u32,
    pub cooldown_remaining_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Internal per-peer state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PeerCircuit {
    /// (when, failed) for each sampled dial.
    samples: VecDeque<(Instant, bool)>,
    state: CircuitState,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trips: u32,
    probe_started: Option<Instant>,
}

impl PeerCircuit {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            state: CircuitState::Closed,
            opened_at: None,
            cooldown: Duration::ZERO,
            trips: 0,
            probe_started: None,
        }
    }

    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn failures(&self) -> usize {
        self.samples.iter().filter(|(_, failed)| *failed).count()
    }

    fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        let opened_at = self.opened_at?;
        let elapsed = now.duration_since(opened_at);
        (elapsed < self.cooldown).then(|| self.cooldown - elapsed)
    }

    /// Last time the circuit did anything: its cool-down ending or a probe.
    fn last_activity(&self) -> Option<Instant> {
        let cooled = self.opened_at.map(|at| at + self.cooldown);
        cooled.max(self.probe_started)
    }

    /// The state as observed now, accounting for an expired cool-down.
    fn effective_state(&self, now: Instant) -> CircuitState {
        match self.state {
            CircuitState::Open if self.cooldown_remaining(now).is_none() => CircuitState::HalfOpen,
            state => state,
        }
    }

    fn open(&mut self, config: &BreakerConfig, now: Instant) {
        self.trips = self.trips.saturating_add(1);
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.cooldown = calculate_cooldown(config, self.trips);
        self.probe_started = None;
        self.samples.clear();
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.cooldown = Duration::ZERO;
        self.trips = 0;
        self.probe_started = None;
        self.samples.clear();
    }
}

/// Cool-down before the `trips`-th half-open probe.
fn calculate_cooldown(config: &BreakerConfig, trips: u32) -> Duration {
    let exponent = trips.saturating_sub(1).min(32) as i32;
    let ms = config.half_open_initial_ms as f64 * config.half_open_exponent.powi(exponent);
    Duration::from_millis((ms as u64).min(config.half_open_max_ms))
}

// ---------------------------------------------------------------------------
// BreakerRegistry
// ---------------------------------------------------------------------------

/// Dial circuit breakers for all peers.
pub struct BreakerRegistry {
    config: BreakerConfig,
    circuits: DashMap<PeerAddress, PeerCircuit>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    /// Decide whether a dial to `peer` may proceed.
    pub fn check(&self, peer: &PeerAddress) -> BreakerVerdict {
        let mut circuit = match self.circuits.get_mut(peer) {
            Some(c) => c,
            None => return BreakerVerdict::Allow,
        };
        let now = Instant::now();

        let state = circuit.state;
        match state {
            CircuitState::Closed => BreakerVerdict::Allow,
            CircuitState::Open => match circuit.cooldown_remaining(now) {
                Some(retry_after) => BreakerVerdict::Reject { retry_after },
                None => {
                    debug!(peer = %peer, "dial breaker: cool-down expired, half-open");
                    circuit.state = CircuitState::HalfOpen;
                    circuit.probe_started = Some(now);
                    BreakerVerdict::AllowProbe
                }
            },
            CircuitState::HalfOpen => {
                // A probe that never reported back (its caller was cancelled)
                // stops blocking after one cool-down.
                let probe_window = circuit
                    .probe_started
                    .map(|at| now.duration_since(at))
                    .filter(|elapsed| *elapsed < circuit.cooldown)
                    .map(|elapsed| circuit.cooldown - elapsed);
                match probe_window {
                    Some(retry_after) => BreakerVerdict::Reject { retry_after },
                    None => {
                        circuit.probe_started = Some(now);
                        BreakerVerdict::AllowProbe
                    }
                }
            }
        }
    }

    /// Record a successful dial.
    pub fn record_success(&self, peer: &PeerAddress) {
        let mut circuit = self
            .circuits
            .entry(peer.clone())
            .or_insert_with(PeerCircuit::new);
        let now = Instant::now();
        let state = circuit.state;
        match state {
            CircuitState::Closed => {
                circuit.samples.push_back((now, false));
                circuit.prune(self.config.sampling_window(), now);
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                info!(peer = %peer, "dial breaker: probe succeeded, closing circuit");
                circuit.close();
            }
        }
    }

    /// Record a failed dial.
    pub fn record_failure(&self, peer: &PeerAddress) {
        let mut circuit = self
            .circuits
            .entry(peer.clone())
            .or_insert_with(PeerCircuit::new);
        let now = Instant::now();
        let state = circuit.state;
        match state {
            CircuitState::Closed => {
                circuit.samples.push_back((now, true));
                circuit.prune(self.config.sampling_window(), now);
                let samples = circuit.samples.len();
                let failures = circuit.failures();
                if samples >= self.config.minimum_samples
                    && failures as f64 / samples as f64 >= self.config.failure_threshold
                {
                    circuit.open(&self.config, now);
                    warn!(
                        peer = %peer,
                        samples,
                        failures,
                        cooldown_ms = circuit.cooldown.as_millis() as u64,
                        "dial breaker: failure ratio reached, opening circuit"
                    );
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                circuit.open(&self.config, now);
                warn!(
                    peer = %peer,
                    trips = circuit.trips,
                    cooldown_ms = circuit.cooldown.as_millis() as u64,
                    "dial breaker: probe failed, reopening circuit"
                );
            }
        }
    }

    /// Current circuit state for `peer`.
    pub fn state(&self, peer: &PeerAddress) -> CircuitState {
        self.circuits
            .get(peer)
            .map_or(CircuitState::Closed, |c| c.effective_state(Instant::now()))
    }

    /// Run `dial` through the breaker for `peer`.
    ///
    /// A rejected or failed dial is reported as
    /// [`RoseNetError::DialUnavailable`].
    pub async fn dial<F, Fut, T, E>(&self, peer: &PeerAddress, dial: F) -> RoseNetResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        if let BreakerVerdict::Reject { retry_after } = self.check(peer) {
            return Err(RoseNetError::DialUnavailable {
                peer: peer.clone(),
                reason: format!(
                    "dial breaker open, retry in {}ms",
                    retry_after.as_millis()
                ),
            });
        }
        match dial().await {
            Ok(value) => {
                self.record_success(peer);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(peer);
                Err(RoseNetError::DialUnavailable {
                    peer: peer.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Snapshot of every tracked peer.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        self.circuits
            .iter()
            .map(|entry| {
                let circuit = entry.value();
                let in_window = circuit
                    .samples
                    .iter()
                    .filter(|(at, _)| now.duration_since(*at) <= self.config.sampling_window());
                let (samples, failures) =
                    in_window.fold((0, 0), |(n, f), (_, failed)| (n + 1, f + usize::from(*failed)));
                BreakerSnapshot {
                    peer: entry.key().clone(),
                    state: circuit.effective_state(now),
                    samples,
                    failures,
                    trips: circuit.trips,
                    cooldown_remaining_ms: circuit
                        .cooldown_remaining(now)
                        .map(|d| d.as_millis() as u64),
                }
            })
            .collect()
    }

    /// Drop circuits nobody has dialed through for a whole sampling window.
    ///
    /// Closed circuits go once their samples age out. Circuits past their
    /// cool-down go once a window passes without a probe; open circuits still
    /// cooling down are kept.
    pub fn clear_idle(&self) {
        let now = Instant::now();
        let window = self.config.sampling_window();
        self.circuits.retain(|peer, circuit| {
            circuit.prune(window, now);
            let keep = match circuit.effective_state(now) {
                CircuitState::Closed => !circuit.samples.is_empty(),
                CircuitState::Open => true,
                CircuitState::HalfOpen => circuit
                    .last_activity()
                    .is_some_and(|at| now.duration_since(at) <= window),
            };
            if !keep {
                debug!(peer = %peer, "dial breaker: cleared idle entry");
            }
            keep
        });
    }

    /// Forget everything about `peer`.
    pub fn force_reset(&self, peer: &PeerAddress) {
        self.circuits.remove(peer);
        info!(peer = %peer, "dial breaker: force-reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            sampling_window_ms: 5_000,
            failure_threshold: 0.7,
            minimum_samples: 5,
            half_open_initial_ms: 1_000,
            half_open_max_ms: 30_000,
            half_open_exponent: 2.0,
        }
    }

    fn peer() -> PeerAddress {
        PeerAddress::new("peer-1")
    }

    #[test]
    fn test_unknown_peer_is_closed() {
        let breakers = BreakerRegistry::new(config());
        assert_eq!(breakers.check(&peer()), BreakerVerdict::Allow);
        assert_eq!(breakers.state(&peer()), CircuitState::Closed);
    }

    #[test]
    fn test_calculate_cooldown_grows_and_caps() {
        let cfg = config();
        assert_eq!(calculate_cooldown(&cfg, 1), Duration::from_millis(1_000));
        assert_eq!(calculate_cooldown(&cfg, 2), Duration::from_millis(2_000));
        assert_eq!(calculate_cooldown(&cfg, 3), Duration::from_millis(4_000));
        assert_eq!(calculate_cooldown(&cfg, 10), Duration::from_millis(30_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_needs_minimum_samples_before_opening() {
        let breakers = BreakerRegistry::new(config());
        for _ in 0..4 {
            breakers.record_failure(&peer());
        }
        assert_eq!(breakers.state(&peer()), CircuitState::Closed);
        breakers.record_failure(&peer());
        assert_eq!(breakers.state(&peer()), CircuitState::Open);
        assert!(matches!(
            breakers.check(&peer()),
            BreakerVerdict::Reject { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ratio_below_threshold_stays_closed() {
        let breakers = BreakerRegistry::new(config());
        // 3 failures out of 5 = 0.6 < 0.7
        breakers.record_success(&peer());
        breakers.record_success(&peer());
        for _ in 0..3 {
            breakers.record_failure(&peer());
        }
        assert_eq!(breakers.state(&peer()), CircuitState::Closed);
        // 4 of 6 = 0.67, still closed; 5 of 7 = 0.71 opens.
        breakers.record_failure(&peer());
        assert_eq!(breakers.state(&peer()), CircuitState::Closed);
        breakers.record_failure(&peer());
        assert_eq!(breakers.state(&peer()), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_samples_leave_the_window() {
        let breakers = BreakerRegistry::new(config());
        for _ in 0..4 {
            breakers.record_failure(&peer());
        }
        tokio::time::advance(Duration::from_millis(5_001)).await;
        breakers.record_failure(&peer());
        assert_eq!(breakers.state(&peer()), CircuitState::Closed);
        assert_eq!(breakers.snapshot()[0].samples, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_single_probe() {
        let breakers = BreakerRegistry::new(config());
        for _ in 0..5 {
            breakers.record_failure(&peer());
        }
        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(matches!(
            breakers.check(&peer()),
            BreakerVerdict::Reject { .. }
        ));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(breakers.state(&peer()), CircuitState::HalfOpen);
        assert_eq!(breakers.check(&peer()), BreakerVerdict::AllowProbe);
        // Second caller while the probe is in flight is refused until the
        // probe window runs out.
        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(
            breakers.check(&peer()),
            BreakerVerdict::Reject {
                retry_after: Duration::from_millis(600)
            }
        );

        breakers.record_success(&peer());
        assert_eq!(breakers.state(&peer()), CircuitState::Closed);
        assert_eq!(breakers.check(&peer()), BreakerVerdict::Allow);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_doubles_cooldown() {
        let breakers = BreakerRegistry::new(config());
        for _ in 0..5 {
            breakers.record_failure(&peer());
        }
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(breakers.check(&peer()), BreakerVerdict::AllowProbe);
        breakers.record_failure(&peer());

        let snap = &breakers.snapshot()[0];
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.trips, 2);
        assert_eq!(snap.cooldown_remaining_ms, Some(2_000));

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert!(matches!(
            breakers.check(&peer()),
            BreakerVerdict::Reject { .. }
        ));
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(breakers.check(&peer()), BreakerVerdict::AllowProbe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_wrapper_short_circuits_when_open() {
        let breakers = BreakerRegistry::new(config());
        for _ in 0..5 {
            let result: RoseNetResult<()> = breakers
                .dial(&peer(), || async { Err::<(), _>("connection refused") })
                .await;
            assert!(matches!(result, Err(RoseNetError::DialUnavailable { .. })));
        }

        let mut called = false;
        let result: RoseNetResult<()> = breakers
            .dial(&peer(), || {
                called = true;
                async { Ok::<(), &str>(()) }
            })
            .await;
        assert!(!called);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("dial breaker open"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_during_probe_reports_remaining_window() {
        let breakers = BreakerRegistry::new(config());
        for _ in 0..5 {
            breakers.record_failure(&peer());
        }
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(breakers.check(&peer()), BreakerVerdict::AllowProbe);
        tokio::time::advance(Duration::from_millis(250)).await;
        let err = breakers
            .dial(&peer(), || async { Ok::<(), &str>(()) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("retry in 750ms"), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_idle_drops_abandoned_open_circuit() {
        let breakers = BreakerRegistry::new(config());
        for _ in 0..5 {
            breakers.record_failure(&peer());
        }
        // Still cooling down.
        breakers.clear_idle();
        assert_eq!(breakers.snapshot().len(), 1);

        // Cool-down over but within one window of it: kept.
        tokio::time::advance(Duration::from_millis(3_000)).await;
        breakers.clear_idle();
        assert_eq!(breakers.snapshot().len(), 1);

        // Nobody probed for a whole window after the cool-down.
        tokio::time::advance(Duration::from_millis(3_001)).await;
        breakers.clear_idle();
        assert!(breakers.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reset_and_clear_idle() {
        let breakers = BreakerRegistry::new(config());
        for _ in 0..5 {
            breakers.record_failure(&peer());
        }
        breakers.force_reset(&peer());
        assert_eq!(breakers.state(&peer()), CircuitState::Closed);
        assert!(breakers.snapshot().is_empty());

        breakers.record_success(&PeerAddress::new("other"));
        assert_eq!(breakers.snapshot().len(), 1);
        tokio::time::advance(Duration::from_millis(6_000)).await;
        breakers.clear_idle();
        assert!(breakers.snapshot().is_empty());
    }
}

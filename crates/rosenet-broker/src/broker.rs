//! Queue-driven message broker with jittered exponential retry.
//!
//! Messages are routed one at a time by a single background task. A failed
//! route is re-queued after `base_delay × U[0.8, 1.2] × factor^round` until
//! `max_retries` rounds have been spent, then the message is dropped.

use rand::Rng;
use rosenet_types::BrokerConfig;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lower bound of the retry jitter multiplier.
const JITTER_MIN: f64 = 0.8;
/// Upper bound of the retry jitter multiplier.
const JITTER_MAX: f64 = 1.2;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Routing already started for this broker")]
    AlreadyRouting,
    #[error("Broker is shut down")]
    ShutDown,
}

/// A queued message and the number of failed routing rounds behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct WrappedMessage<M> {
    pub message: M,
    pub retries: u32,
}

/// Lifetime counters of a broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Messages accepted by [`MessageBroker::enqueue`].
    pub enqueued: u64,
    pub delivered: u64,
    /// Retries scheduled after a failed route.
    pub retried: u64,
    /// Messages given up on after `max_retries` rounds.
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BrokerStats {
        BrokerStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Delay before retry `round` (1-based).
pub fn retry_timeout(config: &BrokerConfig, round: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
    let exponent = i32::try_from(round).unwrap_or(i32::MAX);
    let millis = config.base_delay_ms as f64 * jitter * config.exponential_factor.powi(exponent);
    Duration::try_from_secs_f64(millis / 1000.0).unwrap_or(Duration::MAX)
}

/// Single-consumer broker routing messages of type `M`.
pub struct MessageBroker<M> {
    config: BrokerConfig,
    tx: mpsc::UnboundedSender<WrappedMessage<M>>,
    /// Taken by the first `start_routing` call.
    rx: Mutex<Option<mpsc::UnboundedReceiver<WrappedMessage<M>>>>,
    shutdown_tx: watch::Sender<bool>,
    counters: Arc<Counters>,
}

impl<M: Clone + Send + 'static> MessageBroker<M> {
    pub fn new(config: BrokerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            tx,
            rx: Mutex::new(Some(rx)),
            shutdown_tx,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Queue `message` for routing.
    pub fn enqueue(&self, message: M) -> Result<(), BrokerError> {
        if self.is_shut_down() {
            return Err(BrokerError::ShutDown);
        }
        self.tx
            .send(WrappedMessage {
                message,
                retries: 0,
            })
            .map_err(|_| BrokerError::ShutDown)?;
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Spawn the routing task.
    ///
    /// Messages are pulled strictly in order and `route` is awaited for each
    /// before the next one is taken. Only one routing task may exist per
    /// broker.
    pub fn start_routing<F, Fut, E>(&self, route: F) -> Result<JoinHandle<()>, BrokerError>
    where
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(BrokerError::ShutDown);
        }
        let mut rx = self
            .rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or(BrokerError::AlreadyRouting)?;

        let config = self.config.clone();
        let tx = self.tx.clone();
        let counters = self.counters.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        info!(max_retries = config.max_retries, "Starting message routing");

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Message routing: shutdown signal received");
                            break;
                        }
                    }
                    next = rx.recv() => {
                        let Some(wrapped) = next else {
                            break;
                        };
                        route_one(&config, &route, wrapped, &tx, &counters, &shutdown).await;
                    }
                }
            }
            debug!("Message routing stopped");
        }))
    }

    /// Stop the routing task. Pending retries are discarded.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn stats(&self) -> BrokerStats {
        self.counters.snapshot()
    }
}

async fn route_one<M, F, Fut, E>(
    config: &BrokerConfig,
    route: &F,
    wrapped: WrappedMessage<M>,
    tx: &mpsc::UnboundedSender<WrappedMessage<M>>,
    counters: &Counters,
    shutdown: &watch::Receiver<bool>,
) where
    M: Clone + Send + 'static,
    F: Fn(M) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let error = match route(wrapped.message.clone()).await {
        Ok(()) => {
            counters.delivered.fetch_add(1, Ordering::Relaxed);
            debug!(retries = wrapped.retries, "Message routed");
            return;
        }
        Err(e) => e,
    };

    let round = wrapped.retries + 1;
    if round > config.max_retries {
        counters.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(
            rounds = wrapped.retries,
            error = %error,
            "Message routing failed regardless of retries, dropping message"
        );
        return;
    }

    let delay = retry_timeout(config, round);
    counters.retried.fetch_add(1, Ordering::Relaxed);
    debug!(
        round,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "Message routing failed, scheduling retry"
    );

    let tx = tx.clone();
    let mut shutdown = shutdown.clone();
    let retry = WrappedMessage {
        message: wrapped.message,
        retries: round,
    };
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                if !*shutdown.borrow() {
                    let _ = tx.send(retry);
                }
            }
            _ = shutdown.changed() => {}
        }
    });
}

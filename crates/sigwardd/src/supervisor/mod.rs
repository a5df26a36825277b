//! Subscription supervisor.
//!
//! Keeps the enforcement loop fed: when the event subscription fails it is
//! re-established with exponential backoff until a circuit breaker gives up.
//! Events emitted by the engine while disconnected are not replayed; containers
//! created in that gap are never adjudicated.
//!
//! A subscription proves the engine healthy by delivering an event or by
//! staying up for `healthy_after`, which resets both the breaker and the
//! backoff. With reconnect disabled the first transport failure is final.

pub mod backoff;
pub mod circuit;

pub use backoff::{BackoffConfig, BackoffState};
pub use circuit::{CircuitBreaker, CircuitState};

use crate::config::ReconnectConfig;
use crate::engine::{EventSource, TransportError};
use crate::enforcer::{shutdown_requested, Enforcer, TerminationCause};
use crate::metrics::EnforcerMetrics;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    /// Reconnect disabled and the subscription failed
    #[error("event subscription failed: {0}")]
    Terminated(TransportError),

    #[error("giving up after {attempts} consecutive subscription failures, last: {last}")]
    GaveUp { attempts: u32, last: TransportError },
}

impl SupervisorError {
    pub fn last_error(&self) -> &TransportError {
        match self {
            SupervisorError::Terminated(e) => e,
            SupervisorError::GaveUp { last, .. } => last,
        }
    }
}

/// Supervisor for the event subscription
pub struct Supervisor {
    source: Arc<dyn EventSource>,
    enforcer: Enforcer,
    reconnect_enabled: bool,
    healthy_after: Duration,
    backoff: BackoffState,
    circuit: CircuitBreaker,
    metrics: Option<Arc<EnforcerMetrics>>,
}

impl Supervisor {
    pub fn new(source: Arc<dyn EventSource>, enforcer: Enforcer, config: &ReconnectConfig) -> Self {
        Self {
            source,
            enforcer,
            reconnect_enabled: config.enabled,
            healthy_after: Duration::from_millis(config.healthy_after_ms),
            backoff: BackoffState::new(BackoffConfig::from(config)),
            circuit: CircuitBreaker::new(config.failure_threshold),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EnforcerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    /// Subscribe and enforce until shutdown (Ok) or until reconnecting is
    /// disabled or exhausted (Err).
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SupervisorError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let failure = match self.source.subscribe().await {
                Ok(subscription) => {
                    self.circuit.record_connected();
                    info!("[READY] Enforcing signatures on container creation");

                    let report = self.enforcer.run(subscription, shutdown.clone()).await;
                    if report.events_seen > 0 || report.uptime >= self.healthy_after {
                        self.circuit.record_success();
                        self.backoff.reset();
                    }

                    match report.cause {
                        TerminationCause::Shutdown => return Ok(()),
                        TerminationCause::Transport(e) => e,
                    }
                }
                Err(e) => {
                    warn!("Event subscription failed: {}", e);
                    e
                }
            };

            if !self.reconnect_enabled {
                return Err(SupervisorError::Terminated(failure));
            }

            self.circuit.record_failure();
            if self.circuit.is_open() {
                return Err(SupervisorError::GaveUp {
                    attempts: self.circuit.failure_count(),
                    last: failure,
                });
            }

            let delay = self.backoff.next_backoff();
            warn!(
                attempt = self.backoff.attempts(),
                "Resubscribing to engine events in {:?} (events in the gap are not replayed)",
                delay
            );
            if let Some(metrics) = &self.metrics {
                metrics.reconnects_total.inc();
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown) => {}
            }
        }
    }
}

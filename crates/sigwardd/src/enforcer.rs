//! Enforcement loop.
//!
//! Drains a subscription, keeps only `(container, create)` events and for each
//! one runs inspect -> verify -> stop-on-failure. The loop has two states,
//! `Running` and `Terminated`; a transport error, the event lane closing or a
//! shutdown request end it. Events already queued when a transport error
//! arrives are adjudicated before the loop terminates.
//!
//! With `max_concurrent == 1` (the default) every event is fully adjudicated
//! before the next is read, so remediation happens in delivery order. Higher
//! values hand adjudications to tasks bounded by a semaphore. Each task only
//! ever acts on its own event's subject id.

use crate::alerts::{AlertSink, LogAlertSink};
use crate::engine::{
    ContainerInspector, EventSubscription, InspectError, Remediator, TransportError,
};
use crate::metrics::EnforcerMetrics;
use crate::oracle::SignatureOracle;
use sigward_common::{
    LifecycleEvent, RemediationAlert, RemediationOutcome, StopOptions, VerificationVerdict,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// What happened to one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Adjudication {
    /// Not a container creation
    Ignored,
    /// Container was gone before it could be inspected
    Vanished { subject_id: String },
    InspectionFailed { subject_id: String, reason: String },
    /// Signature verified, container left alone
    Verified { subject_id: String, verdict: VerificationVerdict },
    /// Verification failed and a stop was attempted
    Remediated {
        verdict: VerificationVerdict,
        outcome: RemediationOutcome,
    },
}

impl Adjudication {
    pub fn label(&self) -> &'static str {
        match self {
            Adjudication::Ignored => "ignored",
            Adjudication::Vanished { .. } => "vanished",
            Adjudication::InspectionFailed { .. } => "inspection_failed",
            Adjudication::Verified { .. } => "verified",
            Adjudication::Remediated { outcome, .. } if outcome.succeeded => "remediated",
            Adjudication::Remediated { .. } => "remediation_failed",
        }
    }
}

/// Why the loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationCause {
    Transport(TransportError),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LoopState {
    Running,
    Terminated(TerminationCause),
}

/// Summary of one [`Enforcer::run`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub cause: TerminationCause,
    /// Events read from the subscription, relevant or not
    pub events_seen: u64,
    /// How long the subscription was consumed before the loop ended
    pub uptime: Duration,
}

/// Per-event policy: inspect, verify, stop on failure
#[derive(Clone)]
pub struct Adjudicator {
    inspector: Arc<dyn ContainerInspector>,
    oracle: Arc<dyn SignatureOracle>,
    remediator: Arc<dyn Remediator>,
    alerts: Arc<dyn AlertSink>,
    metrics: Option<Arc<EnforcerMetrics>>,
    stop_options: StopOptions,
}

impl Adjudicator {
    pub async fn adjudicate(&self, event: &LifecycleEvent) -> Adjudication {
        let adjudication = self.decide(event).await;
        if let Some(metrics) = &self.metrics {
            metrics
                .adjudications_total
                .with_label_values(&[adjudication.label()])
                .inc();
        }
        adjudication
    }

    async fn decide(&self, event: &LifecycleEvent) -> Adjudication {
        if !event.is_container_create() {
            debug!(kind = %event.kind, action = %event.action, "Ignoring event");
            return Adjudication::Ignored;
        }

        let subject_id = event.subject_id.as_str();

        let descriptor = match self.inspector.inspect(subject_id).await {
            Ok(descriptor) => descriptor,
            Err(InspectError::NotFound(_)) => {
                info!(
                    container = %subject_id,
                    "Container vanished before inspection, nothing to enforce"
                );
                return Adjudication::Vanished {
                    subject_id: subject_id.to_string(),
                };
            }
            Err(e) => {
                warn!(container = %subject_id, "Skipping event: {}", e);
                return Adjudication::InspectionFailed {
                    subject_id: subject_id.to_string(),
                    reason: e.to_string(),
                };
            }
        };

        let image = descriptor.image_reference.as_str();
        let verdict = self.oracle.verify(image).await;
        if let Some(metrics) = &self.metrics {
            metrics.observe_verification(
                verdict.outcome.as_str(),
                Duration::from_millis(verdict.duration_ms),
            );
        }

        if verdict.passed {
            info!(container = %subject_id, "Image signature verification succeeded for {}", image);
            return Adjudication::Verified {
                subject_id: subject_id.to_string(),
                verdict,
            };
        }

        warn!(
            container = %subject_id,
            outcome = %verdict.outcome,
            "Image signature verification failed for {}. Stopping container.",
            image
        );
        debug!(container = %subject_id, "Verifier diagnostic: {}", verdict.diagnostic);

        // Always the event's own subject, never the descriptor's
        let outcome = self.remediator.stop(subject_id, self.stop_options).await;

        if outcome.succeeded {
            info!(
                container = %subject_id,
                status = outcome.status.as_str(),
                "Stopped container running unverified image {}",
                image
            );
        } else {
            error!(
                container = %subject_id,
                "Failed to stop container running unverified image {}: {}",
                image,
                outcome.diagnostic
            );
            if let Some(metrics) = &self.metrics {
                metrics.remediation_failures_total.inc();
            }
            self.alerts
                .remediation_failed(&RemediationAlert::new(&verdict, &outcome))
                .await;
        }

        Adjudication::Remediated { verdict, outcome }
    }
}

/// Drives an [`Adjudicator`] from an event subscription
pub struct Enforcer {
    adjudicator: Adjudicator,
    max_concurrent: usize,
}

impl Enforcer {
    pub fn new(
        inspector: Arc<dyn ContainerInspector>,
        oracle: Arc<dyn SignatureOracle>,
        remediator: Arc<dyn Remediator>,
    ) -> Self {
        Self {
            adjudicator: Adjudicator {
                inspector,
                oracle,
                remediator,
                alerts: Arc::new(LogAlertSink),
                metrics: None,
                stop_options: StopOptions::default(),
            },
            max_concurrent: 1,
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.adjudicator.alerts = alerts;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EnforcerMetrics>) -> Self {
        self.adjudicator.metrics = Some(metrics);
        self
    }

    pub fn with_stop_options(mut self, options: StopOptions) -> Self {
        self.adjudicator.stop_options = options;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Adjudicate a single event inline
    pub async fn adjudicate(&self, event: &LifecycleEvent) -> Adjudication {
        self.adjudicator.adjudicate(event).await
    }

    /// Run until the subscription fails or `shutdown` turns true.
    ///
    /// Adjudications already in flight are allowed to finish before returning.
    pub async fn run(
        &self,
        mut subscription: EventSubscription,
        mut shutdown: watch::Receiver<bool>,
    ) -> RunReport {
        let mut pool = WorkerPool::new(self.max_concurrent);
        let mut errors_open = true;
        let mut events_seen = 0u64;
        let started = Instant::now();

        let cause = loop {
            let state = tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown) => {
                    LoopState::Terminated(TerminationCause::Shutdown)
                }

                error = subscription.errors.recv(), if errors_open => match error {
                    Some(e) => {
                        // Events queued before the failure still get adjudicated
                        while let Ok(event) = subscription.events.try_recv() {
                            events_seen += 1;
                            self.dispatch(event, &mut pool).await;
                        }
                        LoopState::Terminated(TerminationCause::Transport(e))
                    }
                    None => {
                        errors_open = false;
                        LoopState::Running
                    }
                },

                event = subscription.events.recv() => match event {
                    Some(event) => {
                        events_seen += 1;
                        self.dispatch(event, &mut pool).await;
                        LoopState::Running
                    }
                    None => {
                        LoopState::Terminated(TerminationCause::Transport(TransportError::Closed))
                    }
                },
            };

            if let LoopState::Terminated(cause) = state {
                break cause;
            }
        };

        let uptime = started.elapsed();
        pool.drain().await;

        match &cause {
            TerminationCause::Shutdown => info!("Enforcement loop stopped on shutdown request"),
            TerminationCause::Transport(e) => error!("Enforcement loop terminated: {}", e),
        }

        RunReport {
            cause,
            events_seen,
            uptime,
        }
    }

    async fn dispatch(&self, event: LifecycleEvent, pool: &mut WorkerPool) {
        if let Some(metrics) = &self.adjudicator.metrics {
            metrics
                .events_total
                .with_label_values(&[event.action.as_str()])
                .inc();
        }

        if self.max_concurrent == 1 || !event.is_container_create() {
            self.adjudicator.adjudicate(&event).await;
            return;
        }

        pool.spawn(self.adjudicator.clone(), event).await;
    }
}

/// Resolves once the watch value is true. Never resolves if the sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Bounded set of adjudication tasks with one task per subject id
struct WorkerPool {
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    tasks: JoinSet<()>,
}

impl WorkerPool {
    fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tasks: JoinSet::new(),
        }
    }

    async fn spawn(&mut self, adjudicator: Adjudicator, event: LifecycleEvent) {
        while self.tasks.try_join_next().is_some() {}

        // Waiting here applies backpressure to the event lane
        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return;
        };

        let subject_id = event.subject_id.clone();
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            if !in_flight.insert(subject_id.clone()) {
                debug!(
                    container = %subject_id,
                    "Adjudication already in flight, dropping duplicate event"
                );
                return;
            }
        }

        let in_flight = Arc::clone(&self.in_flight);
        self.tasks.spawn(async move {
            adjudicator.adjudicate(&event).await;
            drop(permit);
            in_flight
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&subject_id);
        });
    }

    async fn drain(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!("Adjudication task failed: {}", e);
            }
        }
    }
}

//! In-memory engine, oracle and event source for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use sigward_common::{
    ContainerDescriptor, LifecycleEvent, RemediationOutcome, RemediationStatus, StopOptions,
    VerificationVerdict,
};
use sigwardd::engine::EVENT_LANE_CAPACITY;
use sigwardd::{
    ContainerInspector, EventSource, EventSubscription, InspectError, Remediator, SignatureOracle,
    TransportError,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Collaborator call, in the order it happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Inspect(String),
    Verify(String),
    Stop(String),
}

#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Call>>>);

impl Journal {
    pub fn record(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn stops(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Stop(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn verifies(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Verify(image) => Some(image),
                _ => None,
            })
            .collect()
    }
}

pub struct FakeInspector {
    journal: Journal,
    images: HashMap<String, String>,
    broken: HashSet<String>,
}

impl FakeInspector {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            images: HashMap::new(),
            broken: HashSet::new(),
        }
    }

    pub fn with_container(mut self, id: &str, image: &str) -> Self {
        self.images.insert(id.to_string(), image.to_string());
        self
    }

    /// Inspection of `id` fails with something other than not-found
    pub fn with_broken(mut self, id: &str) -> Self {
        self.broken.insert(id.to_string());
        self
    }
}

#[async_trait]
impl ContainerInspector for FakeInspector {
    async fn inspect(&self, subject_id: &str) -> Result<ContainerDescriptor, InspectError> {
        self.journal.record(Call::Inspect(subject_id.to_string()));

        if self.broken.contains(subject_id) {
            return Err(InspectError::Failed {
                id: subject_id.to_string(),
                reason: "engine returned 500: internal error".to_string(),
            });
        }

        match self.images.get(subject_id) {
            Some(image) => Ok(ContainerDescriptor {
                id: subject_id.to_string(),
                image_reference: image.clone(),
                name: None,
                image_id: None,
            }),
            None => Err(InspectError::NotFound(subject_id.to_string())),
        }
    }
}

/// Images pass only when registered as signed. Unknown images are rejected.
pub struct FakeOracle {
    journal: Journal,
    signed: HashSet<String>,
    latency: HashMap<String, Duration>,
}

impl FakeOracle {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            signed: HashSet::new(),
            latency: HashMap::new(),
        }
    }

    pub fn with_signed(mut self, image: &str) -> Self {
        self.signed.insert(image.to_string());
        self
    }

    pub fn with_latency(mut self, image: &str, latency: Duration) -> Self {
        self.latency.insert(image.to_string(), latency);
        self
    }
}

#[async_trait]
impl SignatureOracle for FakeOracle {
    async fn verify(&self, image_reference: &str) -> VerificationVerdict {
        self.journal.record(Call::Verify(image_reference.to_string()));

        if let Some(latency) = self.latency.get(image_reference) {
            tokio::time::sleep(*latency).await;
        }

        if self.signed.contains(image_reference) {
            VerificationVerdict::passed(image_reference)
        } else {
            VerificationVerdict::rejected(
                image_reference,
                "Error: no matching signatures: invalid signature",
            )
        }
    }
}

/// Stops succeed once, then report already stopped
pub struct FakeRemediator {
    journal: Journal,
    stopped: Mutex<HashSet<String>>,
    broken: HashSet<String>,
    pub last_options: Mutex<Option<StopOptions>>,
}

impl FakeRemediator {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            stopped: Mutex::new(HashSet::new()),
            broken: HashSet::new(),
            last_options: Mutex::new(None),
        }
    }

    /// Stop of `id` fails
    pub fn with_broken(mut self, id: &str) -> Self {
        self.broken.insert(id.to_string());
        self
    }
}

#[async_trait]
impl Remediator for FakeRemediator {
    async fn stop(&self, subject_id: &str, options: StopOptions) -> RemediationOutcome {
        self.journal.record(Call::Stop(subject_id.to_string()));
        *self.last_options.lock().unwrap() = Some(options);

        if self.broken.contains(subject_id) {
            return RemediationOutcome::failed(
                subject_id,
                "engine returned 500: cannot kill container",
            );
        }

        if self.stopped.lock().unwrap().insert(subject_id.to_string()) {
            RemediationOutcome::benign(subject_id, RemediationStatus::Stopped)
        } else {
            RemediationOutcome::benign(subject_id, RemediationStatus::AlreadyStopped)
        }
    }
}

pub fn create(id: &str) -> LifecycleEvent {
    LifecycleEvent::new("container", "create", id)
}

/// Subscription preloaded with `events`. When `error` is set it is queued on
/// the error lane; otherwise both lanes close once the events are read.
pub async fn subscription(
    events: Vec<LifecycleEvent>,
    error: Option<TransportError>,
) -> EventSubscription {
    let (tx, sub) = EventSubscription::channel(EVENT_LANE_CAPACITY);
    for event in events {
        assert!(tx.event(event).await);
    }
    if let Some(error) = error {
        assert!(tx.error(error).await);
    }
    sub
}

/// Receiver that never signals shutdown
pub fn no_shutdown() -> watch::Receiver<bool> {
    watch::channel(false).1
}

/// One scripted reaction to `subscribe`
pub enum Attempt {
    /// Subscription cannot be opened
    Refuse(TransportError),
    /// Deliver events, then break with the error
    Deliver(Vec<LifecycleEvent>, TransportError),
    /// Stay connected without events for a while, then break
    Quiet(Duration, TransportError),
    /// Deliver events and stay connected
    Hold(Vec<LifecycleEvent>),
}

#[derive(Default)]
pub struct ScriptedSource {
    attempts: Mutex<VecDeque<Attempt>>,
    subscribes: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(attempts: Vec<Attempt>) -> Self {
        Self {
            attempts: Mutex::new(attempts.into()),
            subscribes: AtomicUsize::new(0),
        }
    }

    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn subscribe(&self) -> Result<EventSubscription, TransportError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let attempt = self.attempts.lock().unwrap().pop_front();

        match attempt {
            None => Err(TransportError::Connect("connection refused".to_string())),
            Some(Attempt::Refuse(e)) => Err(e),
            Some(Attempt::Deliver(events, error)) => Ok(subscription(events, Some(error)).await),
            Some(Attempt::Quiet(uptime, error)) => {
                let (tx, sub) = EventSubscription::channel(EVENT_LANE_CAPACITY);
                tokio::spawn(async move {
                    tokio::time::sleep(uptime).await;
                    tx.error(error).await;
                });
                Ok(sub)
            }
            Some(Attempt::Hold(events)) => {
                let (tx, sub) = EventSubscription::channel(EVENT_LANE_CAPACITY);
                tokio::spawn(async move {
                    for event in events {
                        tx.event(event).await;
                    }
                    std::future::pending::<()>().await;
                    drop(tx);
                });
                Ok(sub)
            }
        }
    }
}

/// Captures formatted log output for the current thread
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

//! Container engine seams: event subscription, inspection and stop.
//!
//! The enforcement loop only talks to the engine through these traits, so the
//! Docker client and the in-memory fakes used by the tests are interchangeable.

use async_trait::async_trait;
use sigward_common::{ContainerDescriptor, LifecycleEvent, RemediationOutcome, StopOptions};
use thiserror::Error;
use tokio::sync::mpsc;

/// Default capacity of the event lane
pub const EVENT_LANE_CAPACITY: usize = 256;

/// Failure of the event-source connection itself
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("cannot reach event source: {0}")]
    Connect(String),

    #[error("event source rejected subscription: {0}")]
    Rejected(String),

    #[error("event stream broken: {0}")]
    Stream(String),

    #[error("event stream closed")]
    Closed,
}

/// Two-lane view of a live subscription.
///
/// Events and transport errors arrive on separate lanes and may interleave in
/// any order. A single consumer reads both.
pub struct EventSubscription {
    pub events: mpsc::Receiver<LifecycleEvent>,
    pub errors: mpsc::Receiver<TransportError>,
}

impl EventSubscription {
    /// Create a subscription together with the producer half feeding it
    pub fn channel(capacity: usize) -> (EventSender, EventSubscription) {
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (error_tx, error_rx) = mpsc::channel(1);
        (
            EventSender {
                events: event_tx,
                errors: error_tx,
            },
            EventSubscription {
                events: event_rx,
                errors: error_rx,
            },
        )
    }
}

/// Producer half of an [`EventSubscription`]
#[derive(Clone)]
pub struct EventSender {
    events: mpsc::Sender<LifecycleEvent>,
    errors: mpsc::Sender<TransportError>,
}

impl EventSender {
    /// Returns false once the consumer has gone away
    pub async fn event(&self, event: LifecycleEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    pub async fn error(&self, error: TransportError) -> bool {
        self.errors.send(error).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// Source of lifecycle notifications. Performs no semantic filtering.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self) -> Result<EventSubscription, TransportError>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InspectError {
    /// The container disappeared before it could be inspected
    #[error("container {0} not found")]
    NotFound(String),

    #[error("inspection of {id} failed: {reason}")]
    Failed { id: String, reason: String },
}

/// Resolves a container id to the image it was created from
#[async_trait]
pub trait ContainerInspector: Send + Sync {
    async fn inspect(&self, subject_id: &str) -> Result<ContainerDescriptor, InspectError>;
}

/// Stops containers. Stopping an already stopped or removed container is benign.
#[async_trait]
pub trait Remediator: Send + Sync {
    async fn stop(&self, subject_id: &str, options: StopOptions) -> RemediationOutcome;
}

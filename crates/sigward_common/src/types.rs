//! Domain types shared between the daemon and its tests.
//!
//! Everything here is per-event: nothing is cached or persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Event kind that carries container lifecycle notifications
pub const KIND_CONTAINER: &str = "container";

/// The only action the enforcement policy reacts to
pub const ACTION_CREATE: &str = "create";

/// A lifecycle notification as delivered by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Object type ("container", "image", "network", ...)
    pub kind: String,
    /// Lifecycle action ("create", "start", "destroy", ...)
    pub action: String,
    /// Opaque engine identifier of the subject
    pub subject_id: String,
    /// Engine payload as received
    pub raw_payload: serde_json::Value,
}

impl LifecycleEvent {
    pub fn new(
        kind: impl Into<String>,
        action: impl Into<String>,
        subject_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            action: action.into(),
            subject_id: subject_id.into(),
            raw_payload: serde_json::Value::Null,
        }
    }

    /// True for `(container, create)`, the single enforcement trigger
    pub fn is_container_create(&self) -> bool {
        self.kind == KIND_CONTAINER && self.action == ACTION_CREATE
    }
}

/// Container metadata resolved at inspection time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    pub id: String,
    /// Image reference the container was created from (e.g. `registry/app:1.2`)
    pub image_reference: String,
    pub name: Option<String>,
    /// Content-addressed image id, when the engine reports one
    pub image_id: Option<String>,
}

/// How the verifier call ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerdictOutcome {
    /// Verifier ran and accepted the signature
    Passed,
    /// Verifier ran and rejected the image
    Rejected { exit_code: Option<i32> },
    /// Verifier could not be started at all
    Unavailable,
    /// Verifier exceeded its time budget and was killed
    TimedOut,
}

impl VerdictOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictOutcome::Passed => "passed",
            VerdictOutcome::Rejected { .. } => "rejected",
            VerdictOutcome::Unavailable => "unavailable",
            VerdictOutcome::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for VerdictOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerdictOutcome::Rejected { exit_code: Some(code) } => {
                write!(f, "rejected (exit {})", code)
            }
            other => f.write_str(other.as_str()),
        }
    }
}

/// Result of a single signature verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationVerdict {
    pub image_reference: String,
    /// Policy decision: only a clean pass counts
    pub passed: bool,
    pub outcome: VerdictOutcome,
    /// Combined verifier output or invocation error
    pub diagnostic: String,
    pub duration_ms: u64,
}

impl VerificationVerdict {
    pub fn new(
        image_reference: impl Into<String>,
        outcome: VerdictOutcome,
        diagnostic: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            image_reference: image_reference.into(),
            passed: outcome == VerdictOutcome::Passed,
            outcome,
            diagnostic: diagnostic.into(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn passed(image_reference: impl Into<String>) -> Self {
        Self::new(image_reference, VerdictOutcome::Passed, String::new(), Duration::ZERO)
    }

    pub fn rejected(image_reference: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self::new(
            image_reference,
            VerdictOutcome::Rejected { exit_code: Some(1) },
            diagnostic,
            Duration::ZERO,
        )
    }
}

/// Options for the stop call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// Grace period before the engine kills the container.
    /// `None` leaves the choice to the engine.
    pub timeout: Option<Duration>,
}

/// What the stop call did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationStatus {
    Stopped,
    /// Engine reported the container was not running
    AlreadyStopped,
    /// Container no longer exists
    Gone,
    Failed,
}

impl RemediationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationStatus::Stopped => "stopped",
            RemediationStatus::AlreadyStopped => "already_stopped",
            RemediationStatus::Gone => "gone",
            RemediationStatus::Failed => "failed",
        }
    }
}

/// Result of a stop attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationOutcome {
    pub subject_id: String,
    pub succeeded: bool,
    pub status: RemediationStatus,
    pub diagnostic: String,
}

impl RemediationOutcome {
    /// Stopped, already stopped and gone all count as success
    pub fn benign(subject_id: impl Into<String>, status: RemediationStatus) -> Self {
        Self {
            subject_id: subject_id.into(),
            succeeded: status != RemediationStatus::Failed,
            status,
            diagnostic: String::new(),
        }
    }

    pub fn failed(subject_id: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            succeeded: false,
            status: RemediationStatus::Failed,
            diagnostic: diagnostic.into(),
        }
    }
}

/// Record emitted when a container could not be stopped after failing verification.
/// The container keeps running with an unverified image until someone intervenes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationAlert {
    pub timestamp: DateTime<Utc>,
    pub subject_id: String,
    pub image_reference: String,
    pub verdict: VerdictOutcome,
    pub diagnostic: String,
}

impl RemediationAlert {
    pub fn new(verdict: &VerificationVerdict, outcome: &RemediationOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            subject_id: outcome.subject_id.clone(),
            image_reference: verdict.image_reference.clone(),
            verdict: verdict.outcome.clone(),
            diagnostic: outcome.diagnostic.clone(),
        }
    }
}

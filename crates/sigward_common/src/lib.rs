//! Shared types for the sigward enforcement daemon.

pub mod error;
pub mod types;

pub use error::SigwardError;
pub use types::{
    ContainerDescriptor, LifecycleEvent, RemediationAlert, RemediationOutcome, RemediationStatus,
    StopOptions, VerdictOutcome, VerificationVerdict, ACTION_CREATE, KIND_CONTAINER,
};

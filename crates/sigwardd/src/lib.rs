//! sigward daemon library - exposes modules for testing.
//!
//! Watches the container engine for newly created containers, verifies the
//! signature of each container's image and stops containers whose image fails
//! verification.
//!
//! ```text
//! events ─► Supervisor ─► Enforcer ─► inspect ─► verify ─► stop
//!          (reconnect)    (filter)    (engine)   (cosign)   (engine)
//! ```

pub mod alerts;
pub mod config;
pub mod docker;
pub mod enforcer;
pub mod engine;
pub mod metrics;
pub mod oracle;
pub mod supervisor;

pub use alerts::{AlertSink, AlertSinks, JsonlAlertSink, LogAlertSink};
pub use config::{Config, ConfigError};
pub use docker::DockerClient;
pub use enforcer::{Adjudication, Enforcer, RunReport, TerminationCause};
pub use engine::{
    ContainerInspector, EventSender, EventSource, EventSubscription, InspectError, Remediator,
    TransportError,
};
pub use metrics::EnforcerMetrics;
pub use oracle::{CosignOracle, SignatureOracle};
pub use supervisor::{Supervisor, SupervisorError};

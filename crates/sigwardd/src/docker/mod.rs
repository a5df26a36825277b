//! Docker Engine API client over the local unix socket.
//!
//! One HTTP/1 connection per request. The event subscription keeps its
//! connection open and feeds an [`EventSubscription`] from a reader task.

pub mod events;

pub use events::{parse_event, DecodeError, EventDecoder, CREATE_FILTER_QUERY, MAX_LINE_BYTES};

use crate::config::DockerConfig;
use crate::engine::{
    ContainerInspector, EventSource, EventSubscription, InspectError, Remediator, TransportError,
    EVENT_LANE_CAPACITY,
};
use async_trait::async_trait;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::client::conn::http1::{self, SendRequest};
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use sigward_common::{ContainerDescriptor, RemediationOutcome, RemediationStatus, StopOptions};
use std::path::PathBuf;
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DockerError {
    #[error("cannot connect to {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(String),

    #[error("engine returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("malformed engine response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl DockerError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            DockerError::Status { status, .. } => StatusCode::from_u16(*status).ok(),
            _ => None,
        }
    }
}

/// Engine error body (`{"message": "..."}`)
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectBody {
    id: String,
    #[serde(default)]
    name: Option<String>,
    /// Content-addressed id of the image
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    config: Option<InspectConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: Option<String>,
}

impl InspectBody {
    fn into_descriptor(self) -> Option<ContainerDescriptor> {
        let image_reference = self
            .config
            .and_then(|c| c.image)
            .filter(|i| !i.is_empty())
            .or_else(|| self.image.clone())?;

        Some(ContainerDescriptor {
            id: self.id,
            image_reference,
            name: self.name.map(|n| n.trim_start_matches('/').to_string()),
            image_id: self.image,
        })
    }
}

/// Docker Engine API client
#[derive(Debug, Clone)]
pub struct DockerClient {
    socket_path: PathBuf,
    api_version: String,
    server_side_filter: bool,
}

impl DockerClient {
    pub fn new(config: &DockerConfig) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            api_version: config.api_version.clone(),
            server_side_filter: config.server_side_filter,
        }
    }

    fn uri(&self, path: &str) -> String {
        format!("/v{}{}", self.api_version, path)
    }

    fn events_uri(&self) -> String {
        if self.server_side_filter {
            self.uri(&format!("/events?filters={}", CREATE_FILTER_QUERY))
        } else {
            self.uri("/events")
        }
    }

    async fn connect(&self) -> Result<SendRequest<Empty<Bytes>>, DockerError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| DockerError::Connect {
                path: self.socket_path.display().to_string(),
                source,
            })?;

        let (sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Docker connection closed: {}", e);
            }
        });

        Ok(sender)
    }

    async fn send(&self, method: Method, uri: String) -> Result<Response<Incoming>, DockerError> {
        let mut sender = self.connect().await?;

        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, "docker")
            .body(Empty::<Bytes>::new())
            .map_err(|e| DockerError::Request(e.to_string()))?;

        Ok(sender.send_request(request).await?)
    }

    /// Send a request and collect the whole body
    async fn request(
        &self,
        method: Method,
        uri: String,
    ) -> Result<(StatusCode, Bytes), DockerError> {
        let response = self.send(method, uri).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        Ok((status, body))
    }

    /// Liveness check used at startup
    pub async fn ping(&self) -> Result<(), DockerError> {
        let (status, body) = self.request(Method::GET, self.uri("/_ping")).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(status, &body))
        }
    }

    /// `GET /containers/{id}/json`
    pub async fn inspect_container(&self, id: &str) -> Result<ContainerDescriptor, DockerError> {
        let (status, body) = self
            .request(Method::GET, self.uri(&format!("/containers/{}/json", id)))
            .await?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let parsed: InspectBody = serde_json::from_slice(&body)?;
        parsed.into_descriptor().ok_or_else(|| DockerError::Status {
            status: status.as_u16(),
            message: format!("container {} reports no image", id),
        })
    }

    /// `POST /containers/{id}/stop`
    pub async fn stop_container(
        &self,
        id: &str,
        options: StopOptions,
    ) -> Result<RemediationStatus, DockerError> {
        let path = match options.timeout {
            Some(grace) => format!("/containers/{}/stop?t={}", id, grace.as_secs()),
            None => format!("/containers/{}/stop", id),
        };

        let (status, body) = self.request(Method::POST, self.uri(&path)).await?;
        match status {
            StatusCode::NO_CONTENT => Ok(RemediationStatus::Stopped),
            StatusCode::NOT_MODIFIED => Ok(RemediationStatus::AlreadyStopped),
            StatusCode::NOT_FOUND => Ok(RemediationStatus::Gone),
            other => Err(status_error(other, &body)),
        }
    }

    /// Open `GET /events` and pump it into a two-lane subscription
    pub async fn events(&self) -> Result<EventSubscription, DockerError> {
        let response = self.send(Method::GET, self.events_uri()).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.into_body().collect().await?.to_bytes();
            return Err(status_error(status, &body));
        }

        let (tx, subscription) = EventSubscription::channel(EVENT_LANE_CAPACITY);
        let mut body = response.into_body();

        tokio::spawn(async move {
            let mut decoder = EventDecoder::new();
            loop {
                let frame = match body.frame().await {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        tx.error(TransportError::Stream(e.to_string())).await;
                        return;
                    }
                    None => {
                        tx.error(TransportError::Closed).await;
                        return;
                    }
                };

                let Ok(data) = frame.into_data() else {
                    continue;
                };

                for decoded in decoder.push(&data) {
                    match decoded {
                        Ok(event) => {
                            if !tx.event(event).await {
                                debug!("Event subscription dropped, closing stream");
                                return;
                            }
                        }
                        Err(e) => warn!("Skipping engine event: {}", e),
                    }
                }
            }
        });

        info!(
            socket = %self.socket_path.display(),
            filtered = self.server_side_filter,
            "Subscribed to engine events"
        );
        Ok(subscription)
    }
}

fn status_error(status: StatusCode, body: &[u8]) -> DockerError {
    let message = serde_json::from_slice::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());
    DockerError::Status {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl EventSource for DockerClient {
    async fn subscribe(&self) -> Result<EventSubscription, TransportError> {
        self.events().await.map_err(|e| match e {
            DockerError::Status { .. } => TransportError::Rejected(e.to_string()),
            other => TransportError::Connect(other.to_string()),
        })
    }
}

#[async_trait]
impl ContainerInspector for DockerClient {
    async fn inspect(&self, subject_id: &str) -> Result<ContainerDescriptor, InspectError> {
        self.inspect_container(subject_id).await.map_err(|e| {
            if e.status() == Some(StatusCode::NOT_FOUND) {
                InspectError::NotFound(subject_id.to_string())
            } else {
                InspectError::Failed {
                    id: subject_id.to_string(),
                    reason: e.to_string(),
                }
            }
        })
    }
}

#[async_trait]
impl Remediator for DockerClient {
    async fn stop(&self, subject_id: &str, options: StopOptions) -> RemediationOutcome {
        match self.stop_container(subject_id, options).await {
            Ok(status) => RemediationOutcome::benign(subject_id, status),
            Err(e) => RemediationOutcome::failed(subject_id, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn client(filter: bool) -> DockerClient {
        DockerClient::new(&DockerConfig {
            socket_path: PathBuf::from("/nonexistent/docker.sock"),
            api_version: "1.43".to_string(),
            server_side_filter: filter,
        })
    }

    #[test]
    fn test_uris_are_versioned() {
        let c = client(false);
        assert_eq!(c.uri("/_ping"), "/v1.43/_ping");
        assert_eq!(c.events_uri(), "/v1.43/events");
        assert_eq!(
            client(true).events_uri(),
            format!("/v1.43/events?filters={}", CREATE_FILTER_QUERY)
        );
    }

    #[test]
    fn test_inspect_body_prefers_config_image() {
        let body: InspectBody = serde_json::from_str(
            r#"{"Id":"c1","Name":"/web","Image":"sha256:abc","Config":{"Image":"registry/app:bad"}}"#,
        )
        .unwrap();
        let descriptor = body.into_descriptor().unwrap();

        assert_eq!(descriptor.image_reference, "registry/app:bad");
        assert_eq!(descriptor.image_id.as_deref(), Some("sha256:abc"));
        assert_eq!(descriptor.name.as_deref(), Some("web"));
    }

    #[test]
    fn test_inspect_body_falls_back_to_image_id() {
        let body: InspectBody = serde_json::from_str(
            r#"{"Id":"c1","Image":"sha256:abc","Config":{"Image":""}}"#,
        )
        .unwrap();
        assert_eq!(body.into_descriptor().unwrap().image_reference, "sha256:abc");
    }

    #[test]
    fn test_status_error_uses_engine_message() {
        let err = status_error(StatusCode::NOT_FOUND, br#"{"message":"No such container: c1"}"#);
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        assert!(err.to_string().contains("No such container: c1"));

        let err = status_error(StatusCode::INTERNAL_SERVER_ERROR, b"plain failure\n");
        assert!(err.to_string().ends_with("plain failure"));
    }

    #[tokio::test]
    async fn test_unreachable_socket_is_transport_error() {
        let result = client(true).subscribe().await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn test_unreachable_socket_fails_remediation() {
        let outcome = client(true)
            .stop("c1", StopOptions { timeout: Some(Duration::from_secs(3)) })
            .await;
        assert!(!outcome.succeeded);
        assert_eq!(outcome.subject_id, "c1");
    }
}

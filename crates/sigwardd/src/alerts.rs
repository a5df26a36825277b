//! Alerting for remediation failures.
//!
//! A failed stop leaves a container with an unverified image running, so it is
//! reported through every configured sink rather than only logged.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sigward_common::RemediationAlert;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{create_dir_all, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn remediation_failed(&self, alert: &RemediationAlert);
}

/// Structured error log line
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn remediation_failed(&self, alert: &RemediationAlert) {
        error!(
            container = %alert.subject_id,
            image = %alert.image_reference,
            verdict = %alert.verdict,
            "ALERT: container with unverified image is still running: {}",
            alert.diagnostic
        );
    }
}

/// Append-only JSONL file
#[derive(Debug, Clone)]
pub struct JsonlAlertSink {
    path: PathBuf,
}

impl JsonlAlertSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, alert: &RemediationAlert) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            create_dir_all(dir)
                .await
                .context("Failed to create alert log directory")?;
        }

        let json = serde_json::to_string(alert)? + "\n";

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .context("Failed to open alert log")?;

        file.write_all(json.as_bytes())
            .await
            .context("Failed to write alert log entry")?;

        file.sync_all().await.context("Failed to sync alert log")?;

        Ok(())
    }
}

#[async_trait]
impl AlertSink for JsonlAlertSink {
    async fn remediation_failed(&self, alert: &RemediationAlert) {
        if let Err(e) = self.append(alert).await {
            warn!("Failed to record alert in {}: {:#}", self.path.display(), e);
        }
    }
}

/// Fan-out over several sinks
#[derive(Default, Clone)]
pub struct AlertSinks {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl AlertSinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl AlertSink for AlertSinks {
    async fn remediation_failed(&self, alert: &RemediationAlert) {
        for sink in &self.sinks {
            sink.remediation_failed(alert).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigward_common::{RemediationOutcome, VerificationVerdict};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn alert(subject: &str) -> RemediationAlert {
        RemediationAlert::new(
            &VerificationVerdict::rejected("registry/app:bad", "no signatures"),
            &RemediationOutcome::failed(subject, "engine returned 500"),
        )
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    #[async_trait]
    impl AlertSink for Recording {
        async fn remediation_failed(&self, alert: &RemediationAlert) {
            self.0.lock().unwrap().push(alert.subject_id.clone());
        }
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_lines() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlAlertSink::new(dir.path().join("nested/alerts.jsonl"));

        sink.remediation_failed(&alert("c1")).await;
        sink.remediation_failed(&alert("c2")).await;

        let contents = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<RemediationAlert> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].subject_id, "c1");
        assert_eq!(lines[1].image_reference, "registry/app:bad");
        assert_eq!(lines[1].diagnostic, "engine returned 500");
    }

    #[tokio::test]
    async fn test_unwritable_sink_does_not_panic() {
        let sink = JsonlAlertSink::new("/proc/sigward-cannot-write/alerts.jsonl");
        sink.remediation_failed(&alert("c1")).await;
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_sink() {
        let a = Arc::new(Recording::default());
        let b = Arc::new(Recording::default());
        let sinks = AlertSinks::new()
            .with(a.clone())
            .with(Arc::new(LogAlertSink))
            .with(b.clone());

        sinks.remediation_failed(&alert("c7")).await;

        assert_eq!(*a.0.lock().unwrap(), vec!["c7".to_string()]);
        assert_eq!(*b.0.lock().unwrap(), vec!["c7".to_string()]);
    }
}

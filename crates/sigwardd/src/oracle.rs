//! Signature oracle: reduces an external verifier run to a verdict.
//!
//! A rejected image is a normal verdict, not an error. Anything other than a
//! clean pass (rejection, missing binary, timeout) yields `passed = false`.

use crate::config::OracleConfig;
use async_trait::async_trait;
use sigward_common::{VerdictOutcome, VerificationVerdict};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error};

#[async_trait]
pub trait SignatureOracle: Send + Sync {
    async fn verify(&self, image_reference: &str) -> VerificationVerdict;
}

/// Runs `cosign verify --key <key> [extra args] <image>`
#[derive(Debug, Clone)]
pub struct CosignOracle {
    program: PathBuf,
    key_path: PathBuf,
    timeout: Duration,
    extra_args: Vec<String>,
}

impl CosignOracle {
    pub fn new(
        program: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            key_path: key_path.into(),
            timeout,
            extra_args: Vec::new(),
        }
    }

    /// Build from config. `key_path` is the already-validated key.
    pub fn from_config(config: &OracleConfig, key_path: &Path) -> Self {
        Self::new(&config.cosign_path, key_path, config.timeout())
            .with_extra_args(config.extra_args.clone())
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn command(&self, image_reference: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("verify")
            .arg("--key")
            .arg(&self.key_path)
            .args(&self.extra_args)
            .arg(image_reference)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// stdout followed by stderr
fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !text.is_empty() && !stderr.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(&stderr);
    text.trim_end().to_string()
}

#[async_trait]
impl SignatureOracle for CosignOracle {
    async fn verify(&self, image_reference: &str) -> VerificationVerdict {
        let start = Instant::now();

        let child = match self.command(image_reference).spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(
                    program = %self.program.display(),
                    image = %image_reference,
                    "Signature verifier could not be started: {}", e
                );
                return VerificationVerdict::new(
                    image_reference,
                    VerdictOutcome::Unavailable,
                    format!("failed to run {}: {}", self.program.display(), e),
                    start.elapsed(),
                );
            }
        };

        // Dropping the child on timeout kills it
        let (outcome, diagnostic) = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let text = combined_output(&output);
                if output.status.success() {
                    (VerdictOutcome::Passed, text)
                } else {
                    (
                        VerdictOutcome::Rejected {
                            exit_code: output.status.code(),
                        },
                        text,
                    )
                }
            }
            Ok(Err(e)) => (VerdictOutcome::Unavailable, format!("verifier I/O failed: {}", e)),
            Err(_) => (
                VerdictOutcome::TimedOut,
                format!("verification exceeded {}s", self.timeout.as_secs_f64()),
            ),
        };

        let verdict =
            VerificationVerdict::new(image_reference, outcome, diagnostic, start.elapsed());
        debug!(
            image = %image_reference,
            outcome = %verdict.outcome,
            duration_ms = verdict.duration_ms,
            "cosign output: {}", verdict.diagnostic
        );
        verdict
    }
}

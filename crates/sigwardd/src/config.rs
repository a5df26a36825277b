//! Configuration management for sigwardd.
//!
//! Loads settings from /etc/sigward/config.toml or uses defaults. Every field
//! has a serde default so partial files are valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sigward_common::StopOptions;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Config file path
pub const CONFIG_PATH: &str = "/etc/sigward/config.toml";

/// Key file name looked up in the home directory when no key is configured
pub const DEFAULT_KEY_FILE: &str = "cosign.pub";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("public key {0} does not exist")]
    MissingKey(PathBuf),

    #[error("no public key configured and no home directory to look in")]
    NoKey,

    #[error("enforcement.max_concurrent must be at least 1")]
    ZeroConcurrency,

    #[error("oracle.timeout_secs must be at least 1")]
    ZeroOracleTimeout,

    #[error("reconnect.failure_threshold must be at least 1")]
    ZeroFailureThreshold,

    #[error("reconnect.multiplier must be a finite number >= 1.0 (got {0})")]
    BadMultiplier(String),
}

/// Engine connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Engine API version pinned in request paths
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Ask the engine to only send container create events
    #[serde(default = "default_true")]
    pub server_side_filter: bool,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/docker.sock")
}

fn default_api_version() -> String {
    "1.43".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            api_version: default_api_version(),
            server_side_filter: default_true(),
        }
    }
}

/// Signature verifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// cosign executable, resolved through PATH when relative
    #[serde(default = "default_cosign_path")]
    pub cosign_path: PathBuf,

    /// Public key passed as `--key`. Unset means `<home>/cosign.pub`.
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// Upper bound for a single verification
    #[serde(default = "default_oracle_timeout")]
    pub timeout_secs: u64,

    /// Extra arguments inserted before the image reference
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_cosign_path() -> PathBuf {
    PathBuf::from("cosign")
}

fn default_oracle_timeout() -> u64 {
    60
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            cosign_path: default_cosign_path(),
            key_path: None,
            timeout_secs: default_oracle_timeout(),
            extra_args: Vec::new(),
        }
    }
}

impl OracleConfig {
    /// Configured key, or the key file in the home directory
    pub fn resolved_key_path(&self) -> Option<PathBuf> {
        self.key_path
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(DEFAULT_KEY_FILE)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemediationConfig {
    /// Grace period for stop. Unset leaves it to the engine (10s on stock Docker).
    #[serde(default)]
    pub stop_timeout_secs: Option<u64>,
}

impl RemediationConfig {
    pub fn stop_options(&self) -> StopOptions {
        StopOptions {
            timeout: self.stop_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementConfig {
    /// Adjudications allowed in flight. 1 keeps strict delivery order.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_max_concurrent() -> usize {
    1
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// Event subscription supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// When false the first transport failure terminates the daemon
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Fraction of the delay randomised either way (0.0 - 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Consecutive failed subscriptions before giving up
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// A subscription that stays up this long counts as healthy even if the
    /// engine had nothing to report
    #[serde(default = "default_healthy_after")]
    pub healthy_after_ms: u64,
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

fn default_failure_threshold() -> u32 {
    10
}

fn default_healthy_after() -> u64 {
    60_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            failure_threshold: default_failure_threshold(),
            healthy_after_ms: default_healthy_after(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Address for the /metrics endpoint; disabled when unset
    #[serde(default)]
    pub listen: Option<SocketAddr>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    /// JSONL file receiving remediation failure alerts
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Complete daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub remediation: RemediationConfig,
    #[serde(default)]
    pub enforcement: EnforcementConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load from `path`, falling back to defaults when the file is absent
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Reject settings the daemon cannot run with. The key file must exist now,
    /// not at the first verification.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enforcement.max_concurrent == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.oracle.timeout_secs == 0 {
            return Err(ConfigError::ZeroOracleTimeout);
        }
        if self.reconnect.failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        if !(self.reconnect.multiplier >= 1.0 && self.reconnect.multiplier.is_finite()) {
            return Err(ConfigError::BadMultiplier(self.reconnect.multiplier.to_string()));
        }

        let key = self.oracle.resolved_key_path().ok_or(ConfigError::NoKey)?;
        if !key.is_file() {
            return Err(ConfigError::MissingKey(key));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();

        assert_eq!(config.docker.socket_path, PathBuf::from("/var/run/docker.sock"));
        assert_eq!(config.docker.api_version, "1.43");
        assert!(config.docker.server_side_filter);
        assert_eq!(config.oracle.cosign_path, PathBuf::from("cosign"));
        assert_eq!(config.oracle.timeout(), Duration::from_secs(60));
        assert_eq!(config.enforcement.max_concurrent, 1);
        assert!(config.reconnect.enabled);
        assert_eq!(config.remediation.stop_options().timeout, None);
        assert!(config.metrics.listen.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml(
            r#"
            [oracle]
            key_path = "/etc/sigward/cosign.pub"
            timeout_secs = 15

            [remediation]
            stop_timeout_secs = 5

            [metrics]
            listen = "127.0.0.1:9464"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.oracle.resolved_key_path(),
            Some(PathBuf::from("/etc/sigward/cosign.pub"))
        );
        assert_eq!(config.oracle.timeout_secs, 15);
        assert_eq!(config.oracle.cosign_path, PathBuf::from("cosign"));
        assert_eq!(
            config.remediation.stop_options().timeout,
            Some(Duration::from_secs(5))
        );
        assert_eq!(config.metrics.listen, Some("127.0.0.1:9464".parse().unwrap()));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(Config::from_toml("[enforcement]\nmax_concurrent = \"many\"").is_err());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let config = Config::load(Path::new("/nonexistent/sigward.toml")).unwrap();
        assert_eq!(config.enforcement.max_concurrent, 1);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[docker]\nsocket_path = \"/run/podman/podman.sock\"").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.docker.socket_path, PathBuf::from("/run/podman/podman.sock"));
    }

    #[test]
    fn test_validate_requires_existing_key() {
        let mut config = Config::default();
        config.oracle.key_path = Some(PathBuf::from("/nonexistent/cosign.pub"));

        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingKey(PathBuf::from("/nonexistent/cosign.pub")))
        );

        let key = NamedTempFile::new().unwrap();
        config.oracle.key_path = Some(key.path().to_path_buf());
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let key = NamedTempFile::new().unwrap();
        let mut config = Config::default();
        config.oracle.key_path = Some(key.path().to_path_buf());

        config.enforcement.max_concurrent = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroConcurrency));
        config.enforcement.max_concurrent = 4;

        config.oracle.timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroOracleTimeout));
        config.oracle.timeout_secs = 30;

        config.reconnect.failure_threshold = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroFailureThreshold));
        config.reconnect.failure_threshold = 3;

        config.reconnect.multiplier = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::BadMultiplier(_))));
    }

    #[test]
    fn test_validate_rejects_non_finite_multiplier() {
        let key = NamedTempFile::new().unwrap();
        let mut config = Config::default();
        config.oracle.key_path = Some(key.path().to_path_buf());

        for multiplier in [f64::INFINITY, f64::NAN] {
            config.reconnect.multiplier = multiplier;
            assert!(matches!(config.validate(), Err(ConfigError::BadMultiplier(_))));
        }

        // Large but finite is accepted; the backoff caps it
        config.reconnect.multiplier = 1e20;
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_toml_infinite_multiplier_fails_validation() {
        let mut config = Config::from_toml("[reconnect]\nmultiplier = inf").unwrap();
        let key = NamedTempFile::new().unwrap();
        config.oracle.key_path = Some(key.path().to_path_buf());

        assert!(matches!(config.validate(), Err(ConfigError::BadMultiplier(_))));
    }

    #[test]
    fn test_healthy_after_default_and_override() {
        assert_eq!(Config::default().reconnect.healthy_after_ms, 60_000);

        let config = Config::from_toml("[reconnect]\nhealthy_after_ms = 5000").unwrap();
        assert_eq!(config.reconnect.healthy_after_ms, 5000);
        assert_eq!(config.reconnect.failure_threshold, 10);
    }
}

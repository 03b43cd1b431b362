//! Engine configuration.
//!
//! [`EngineConfig`] is resolved once at startup and shared read-only with
//! every manager as `Arc<EngineConfig>`. Nothing below this module reads
//! environment variables or process-wide globals.
//!
//! ```yaml
//! # ~/.config/magikpod/engine.yaml
//! root: /var/lib/magikpod
//! run_root: /run/magikpod
//! runtime: crun
//! stop_timeout_secs: 10
//! kill_paused: allow
//! events_log_max_bytes: 1000000
//! ```

use crate::constants::{
    DEFAULT_EVENTS_LOG_MAX_BYTES, DEFAULT_INFRA_COMMAND, DEFAULT_INFRA_IMAGE,
    DEFAULT_RESTART_RETRIES, DEFAULT_STOP_TIMEOUT,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Name of the in-process supervisor backend.
pub const SIMULATED_RUNTIME: &str = "simulated";

/// What `kill` does with a paused container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KillPausedPolicy {
    /// Deliver the signal; a fatal signal moves the container to `stopped`.
    #[default]
    Allow,
    /// Reject with an invalid-state error.
    Reject,
}

/// Fully resolved engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Persistent storage root (images, container storage, store snapshot).
    pub root: PathBuf,
    /// Volatile run root (event log, supervisor state).
    pub run_root: PathBuf,
    /// Supervisor backend: `runc`, `crun`, or `simulated`.
    pub runtime: String,
    /// Explicit path to the OCI runtime binary.
    pub runtime_path: Option<PathBuf>,
    /// CRIU binary used for the checkpoint capability probe.
    pub criu_path: PathBuf,
    /// Image for pod infra containers.
    pub infra_image: String,
    /// Command run by pod infra containers.
    pub infra_command: Vec<String>,
    /// Default stop timeout in seconds.
    pub stop_timeout_secs: u64,
    /// Policy for `kill` against a paused container.
    pub kill_paused: KillPausedPolicy,
    /// Append events to `<run_root>/events.log`.
    pub events_log: bool,
    /// Size in bytes at which `events.log` rotates to `events.log.1`;
    /// `0` disables rotation.
    pub events_log_max_bytes: u64,
    /// Retry cap for `on-failure` restart policies without an explicit count.
    pub restart_retries: u32,
    /// Persist the entity store snapshot under `root`.
    pub persist_state: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .map(|d| d.join("magikpod"))
            .unwrap_or_else(|| PathBuf::from(".magikpod"));
        let run_root = dirs::runtime_dir()
            .map(|d| d.join("magikpod"))
            .unwrap_or_else(|| base.join("run"));

        Self {
            root: base.join("storage"),
            run_root,
            runtime: "crun".to_string(),
            runtime_path: None,
            criu_path: PathBuf::from("criu"),
            infra_image: DEFAULT_INFRA_IMAGE.to_string(),
            infra_command: vec![DEFAULT_INFRA_COMMAND.to_string()],
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT.as_secs(),
            kill_paused: KillPausedPolicy::default(),
            events_log: true,
            events_log_max_bytes: DEFAULT_EVENTS_LOG_MAX_BYTES,
            restart_retries: DEFAULT_RESTART_RETRIES,
            persist_state: true,
        }
    }
}

impl EngineConfig {
    /// Configuration rooted in a single directory, using the simulated supervisor.
    ///
    /// Used by tests and by `--root` on the command line.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            root: root.join("storage"),
            run_root: root.join("run"),
            runtime: SIMULATED_RUNTIME.to_string(),
            ..Self::default()
        }
    }

    /// Parses configuration from YAML. Missing fields take their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a file; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(yaml) => {
                debug!(path = %path.display(), "loading engine config");
                Self::from_yaml(&yaml)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("magikpod").join("engine.yaml"))
            .unwrap_or_else(|| PathBuf::from("engine.yaml"))
    }

    /// Default stop timeout.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.runtime.is_empty() {
            return Err(Error::InvalidSpec("runtime cannot be empty".to_string()));
        }
        if self.infra_command.is_empty() {
            return Err(Error::InvalidSpec(
                "infra_command cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml("runtime: runc\nkill_paused: reject\n").unwrap();
        assert_eq!(config.runtime, "runc");
        assert_eq!(config.kill_paused, KillPausedPolicy::Reject);
        assert_eq!(config.stop_timeout(), DEFAULT_STOP_TIMEOUT);
        assert_eq!(config.events_log_max_bytes, DEFAULT_EVENTS_LOG_MAX_BYTES);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = EngineConfig::load(&temp.path().join("absent.yaml")).unwrap();
        assert_eq!(config.kill_paused, KillPausedPolicy::Allow);
    }

    #[test]
    fn test_empty_runtime_rejected() {
        assert!(EngineConfig::from_yaml("runtime: \"\"\n").is_err());
    }
}

//! Process supervisor backends.
//!
//! - [`OciCliSupervisor`]: runc / crun subprocesses
//! - [`SimulatedSupervisor`]: in-process backend used by tests and demos

pub mod oci;
pub mod simulated;

pub use self::oci::OciCliSupervisor;
pub use self::simulated::SimulatedSupervisor;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::runtime::ProcessSupervisor;
use std::sync::Arc;

/// OCI runtimes driven through their command line.
pub const OCI_RUNTIMES: [&str; 2] = ["crun", "runc"];

/// Registry of supervisor backends, keyed by runtime name.
pub struct SupervisorRegistry {
    supervisors: Vec<Arc<dyn ProcessSupervisor>>,
    default: String,
}

impl SupervisorRegistry {
    /// Builds the registry for a configuration.
    ///
    /// The configured runtime becomes the default; the simulated backend is
    /// always registered.
    pub fn new(config: &EngineConfig) -> Self {
        let mut supervisors: Vec<Arc<dyn ProcessSupervisor>> =
            vec![Arc::new(SimulatedSupervisor::new())];
        for name in OCI_RUNTIMES {
            let binary = (config.runtime == name)
                .then(|| config.runtime_path.clone())
                .flatten();
            supervisors.push(Arc::new(OciCliSupervisor::new(
                name,
                binary,
                config.run_root.join(name),
                config.criu_path.clone(),
            )));
        }
        Self {
            supervisors,
            default: config.runtime.clone(),
        }
    }

    /// Registry holding exactly one backend, which is also the default.
    pub fn with_supervisor(supervisor: Arc<dyn ProcessSupervisor>) -> Self {
        let default = supervisor.name().to_string();
        Self {
            supervisors: vec![supervisor],
            default,
        }
    }

    /// Name of the default runtime.
    pub fn default_name(&self) -> &str {
        &self.default
    }

    /// Returns all registered backends.
    pub fn all(&self) -> &[Arc<dyn ProcessSupervisor>] {
        &self.supervisors
    }

    /// Gets a usable backend by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn ProcessSupervisor>> {
        let supervisor = self
            .supervisors
            .iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| Error::RuntimeUnsupported {
                runtime: name.to_string(),
                reason: "unknown runtime".to_string(),
            })?;
        if !supervisor.is_available() {
            return Err(Error::RuntimeUnsupported {
                runtime: name.to_string(),
                reason: supervisor
                    .unavailable_reason()
                    .unwrap_or_else(|| "unavailable".to_string()),
            });
        }
        Ok(Arc::clone(supervisor))
    }

    /// Gets the default backend.
    pub fn default_supervisor(&self) -> Result<Arc<dyn ProcessSupervisor>> {
        self.get(&self.default)
    }
}

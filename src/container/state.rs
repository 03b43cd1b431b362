//! Container state types.
//!
//! - `ContainerStatus`: position in the lifecycle state machine
//! - `ContainerState`: runtime facts (pid, exit code, checkpoint metadata)
//! - `Container`: the persisted record combining identity, spec and state

use super::spec::{ContainerSpec, NamespaceKind, NamespaceMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

// =============================================================================
// Container Status
// =============================================================================

/// Container lifecycle state.
///
/// ```text
///  created ──init──▶ initialized ──start──▶ running ◀──unpause── paused
///     │                                    │   │  └──pause──────▲
///     └────────────start───────────────────┘   │
///                                     stop/kill│checkpoint  exit
///                                              ▼            ▼
///                        start/restore ◀── stopped       exited ──▶ start
///                                              └──── rm ────┴──▶ removing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Record exists, nothing prepared in the runtime.
    #[default]
    Created,
    /// Storage mounted and runtime container created, process not started.
    Initialized,
    /// Process running.
    Running,
    /// Process frozen.
    Paused,
    /// Stopped by the user (stop, kill, checkpoint).
    Stopped,
    /// Process exited on its own.
    Exited,
    /// Removal in progress; re-running removal completes it.
    Removing,
}

impl ContainerStatus {
    /// All statuses, for filter validation.
    pub const ALL: [ContainerStatus; 7] = [
        Self::Created,
        Self::Initialized,
        Self::Running,
        Self::Paused,
        Self::Stopped,
        Self::Exited,
        Self::Removing,
    ];

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
            Self::Removing => "removing",
        }
    }

    /// True while a process exists (running or frozen).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// True if the process is gone (stopped or exited).
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Stopped | Self::Exited)
    }

    /// True if `init` is legal from this state.
    pub fn can_init(&self) -> bool {
        matches!(self, Self::Created | Self::Stopped | Self::Exited)
    }

    /// True if `start` is legal from this state.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Initialized | Self::Stopped | Self::Exited
        )
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContainerStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == lower)
            .ok_or_else(|| crate::error::Error::InvalidSpec(format!("unknown status '{s}'")))
    }
}

// =============================================================================
// Container State
// =============================================================================

/// Runtime facts about a container.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerState {
    /// Lifecycle state.
    pub status: ContainerStatus,
    /// Host PID while running or paused.
    pub pid: Option<u32>,
    /// Exit code of the last run.
    pub exit_code: Option<i32>,
    /// Last start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Last exit time.
    pub finished_at: Option<DateTime<Utc>>,
    /// A checkpoint of this container exists.
    pub checkpointed: bool,
    /// Time of the last checkpoint.
    pub checkpointed_at: Option<DateTime<Utc>>,
    /// The container was restored from a checkpoint.
    pub restored: bool,
    /// Time of the last restore.
    pub restored_at: Option<DateTime<Utc>>,
    /// Directory holding the CRIU images.
    pub checkpoint_path: Option<PathBuf>,
    /// CRIU dump log.
    pub checkpoint_log: Option<PathBuf>,
    /// CRIU restore log.
    pub restore_log: Option<PathBuf>,
    /// The last stop was requested by the user.
    pub stopped_by_user: bool,
    /// Automatic restarts performed by the restart policy.
    pub restart_count: u32,
    /// Last runtime error, if the last operation failed.
    pub error: Option<String>,
}

impl ContainerState {
    /// Records a successful start.
    pub fn mark_running(&mut self, pid: u32) {
        self.status = ContainerStatus::Running;
        self.pid = Some(pid);
        self.exit_code = None;
        self.started_at = Some(Utc::now());
        self.stopped_by_user = false;
        self.error = None;
    }

    /// Records the end of the process.
    pub fn mark_terminated(&mut self, status: ContainerStatus, exit_code: Option<i32>) {
        self.status = status;
        self.pid = None;
        self.exit_code = exit_code.or(self.exit_code);
        self.finished_at = Some(Utc::now());
    }
}

// =============================================================================
// Container Record
// =============================================================================

/// Persisted container record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    /// 64-hex ID, immutable.
    pub id: String,
    /// Unique name.
    pub name: String,
    /// Requested configuration.
    pub spec: ContainerSpec,
    /// Resolved image ID.
    pub image_id: String,
    /// Resolved image name.
    pub image_name: String,
    /// Pod membership.
    pub pod_id: Option<String>,
    /// True for a pod's infra container.
    pub is_infra: bool,
    /// Namespace modes after resolution against the pod. Never `Default`.
    pub namespaces: BTreeMap<NamespaceKind, NamespaceMode>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// OCI runtime that owns the process.
    pub runtime: String,
    /// Runtime facts.
    pub state: ContainerState,
}

impl Container {
    /// 12-character ID prefix.
    pub fn short_id(&self) -> &str {
        &self.id[..crate::constants::SHORT_ID_LEN.min(self.id.len())]
    }

    /// Current status.
    pub fn status(&self) -> ContainerStatus {
        self.state.status
    }

    /// Resolved mode for `kind`.
    pub fn namespace(&self, kind: NamespaceKind) -> NamespaceMode {
        self.namespaces
            .get(&kind)
            .cloned()
            .unwrap_or(NamespaceMode::Private)
    }

    /// Effective stop timeout.
    pub fn stop_timeout(&self, default: std::time::Duration) -> std::time::Duration {
        self.spec
            .stop_timeout
            .map(std::time::Duration::from_secs)
            .unwrap_or(default)
    }
}

//! Process supervisor trait - the engine's view of an OCI runtime.
//!
//! A supervisor owns the low-level process of one container at a time:
//!
//! ```text
//! create(id, bundle) → start(id) → [pause ⇄ resume] → kill(id, sig) → delete(id)
//!                        │
//!                        └─ checkpoint(id) ··· restore(id, bundle) → running
//! ```
//!
//! The lifecycle managers never talk to runc/crun directly. They validate
//! the requested transition first, then call the supervisor, then persist
//! the new state. Implementations only report what the process did.
//!
//! # Implementations
//!
//! - [`crate::runtimes::OciCliSupervisor`]: runc/crun subprocess invocations
//! - [`crate::runtimes::SimulatedSupervisor`]: in-process backend for tests

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

// =============================================================================
// Process State (OCI Runtime Spec)
// =============================================================================

/// OCI runtime process status, plus `paused` which runc/crun report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// The runtime is still setting the container up.
    Creating,
    /// Created but the user process has not been started.
    Created,
    /// The user process is running.
    Running,
    /// The process is frozen.
    Paused,
    /// The process has exited.
    Stopped,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// State reported by `<runtime> state <id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessState {
    /// Container ID.
    pub id: String,
    /// Process status.
    pub status: ProcessStatus,
    /// Host PID of the container init process, zero when none.
    #[serde(default)]
    pub pid: u32,
    /// Absolute path to the bundle directory.
    #[serde(default)]
    pub bundle: String,
}

impl ProcessState {
    /// Returns the PID if the process is alive.
    pub fn live_pid(&self) -> Option<u32> {
        match self.status {
            ProcessStatus::Running | ProcessStatus::Paused if self.pid > 0 => Some(self.pid),
            _ => None,
        }
    }
}

// =============================================================================
// Signals
// =============================================================================

/// Linux signals deliverable to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum Signal {
    Hup,
    Int,
    Quit,
    Ill,
    Trap,
    Abrt,
    Bus,
    Fpe,
    Kill,
    Usr1,
    Segv,
    Usr2,
    Pipe,
    Alrm,
    Term,
    Stkflt,
    Chld,
    Cont,
    Stop,
    Tstp,
    Ttin,
    Ttou,
    Urg,
    Xcpu,
    Xfsz,
    Vtalrm,
    Prof,
    Winch,
    Io,
    Pwr,
    Sys,
}

const SIGNALS: [(Signal, &str, i32); 31] = [
    (Signal::Hup, "HUP", 1),
    (Signal::Int, "INT", 2),
    (Signal::Quit, "QUIT", 3),
    (Signal::Ill, "ILL", 4),
    (Signal::Trap, "TRAP", 5),
    (Signal::Abrt, "ABRT", 6),
    (Signal::Bus, "BUS", 7),
    (Signal::Fpe, "FPE", 8),
    (Signal::Kill, "KILL", 9),
    (Signal::Usr1, "USR1", 10),
    (Signal::Segv, "SEGV", 11),
    (Signal::Usr2, "USR2", 12),
    (Signal::Pipe, "PIPE", 13),
    (Signal::Alrm, "ALRM", 14),
    (Signal::Term, "TERM", 15),
    (Signal::Stkflt, "STKFLT", 16),
    (Signal::Chld, "CHLD", 17),
    (Signal::Cont, "CONT", 18),
    (Signal::Stop, "STOP", 19),
    (Signal::Tstp, "TSTP", 20),
    (Signal::Ttin, "TTIN", 21),
    (Signal::Ttou, "TTOU", 22),
    (Signal::Urg, "URG", 23),
    (Signal::Xcpu, "XCPU", 24),
    (Signal::Xfsz, "XFSZ", 25),
    (Signal::Vtalrm, "VTALRM", 26),
    (Signal::Prof, "PROF", 27),
    (Signal::Winch, "WINCH", 28),
    (Signal::Io, "IO", 29),
    (Signal::Pwr, "PWR", 30),
    (Signal::Sys, "SYS", 31),
];

impl Signal {
    /// Returns the Linux signal number.
    pub fn as_i32(&self) -> i32 {
        SIGNALS
            .iter()
            .find(|(sig, _, _)| sig == self)
            .map(|(_, _, num)| *num)
            .unwrap_or(0)
    }

    /// Returns the name without the `SIG` prefix.
    pub fn name(&self) -> &'static str {
        SIGNALS
            .iter()
            .find(|(sig, _, _)| sig == self)
            .map(|(_, name, _)| *name)
            .unwrap_or("UNKNOWN")
    }

    /// Looks a signal up by number.
    pub fn from_number(num: i32) -> Option<Self> {
        SIGNALS
            .iter()
            .find(|(_, _, n)| *n == num)
            .map(|(sig, _, _)| *sig)
    }

    /// True if the default disposition terminates the process.
    pub fn terminates_by_default(&self) -> bool {
        !matches!(
            self,
            Self::Chld
                | Self::Cont
                | Self::Stop
                | Self::Tstp
                | Self::Ttin
                | Self::Ttou
                | Self::Urg
                | Self::Winch
        )
    }

    /// True if an attached client forwards this signal to the container.
    ///
    /// SIGKILL and SIGSTOP cannot be caught by the client. SIGCHLD, SIGPIPE,
    /// SIGURG and SIGWINCH concern the client itself.
    pub fn is_proxyable(&self) -> bool {
        !matches!(
            self,
            Self::Kill | Self::Stop | Self::Chld | Self::Pipe | Self::Urg | Self::Winch
        )
    }

    /// Exit code of a process terminated by this signal.
    pub fn exit_code(&self) -> i32 {
        crate::constants::SIGNAL_EXIT_OFFSET + self.as_i32()
    }
}

impl std::str::FromStr for Signal {
    type Err = Error;

    /// Parses `SIGTERM`, `TERM`, `term` or `15`.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if let Ok(num) = trimmed.parse::<i32>() {
            return Self::from_number(num).ok_or_else(|| Error::InvalidSignal(s.to_string()));
        }
        let upper = trimmed.to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        let name = match name {
            "IOT" => "ABRT",
            "CLD" => "CHLD",
            "POLL" => "IO",
            other => other,
        };
        SIGNALS
            .iter()
            .find(|(_, n, _)| *n == name)
            .map(|(sig, _, _)| *sig)
            .ok_or_else(|| Error::InvalidSignal(s.to_string()))
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SIG{}", self.name())
    }
}

impl From<Signal> for i32 {
    fn from(sig: Signal) -> Self {
        sig.as_i32()
    }
}

impl TryFrom<i32> for Signal {
    type Error = String;

    fn try_from(num: i32) -> std::result::Result<Self, Self::Error> {
        Self::from_number(num).ok_or_else(|| format!("invalid signal number {num}"))
    }
}

// =============================================================================
// Checkpoint / Restore Requests
// =============================================================================

/// Parameters for `<runtime> checkpoint`.
#[derive(Debug, Clone, Default)]
pub struct CheckpointRequest {
    /// Directory receiving the CRIU images.
    pub image_path: PathBuf,
    /// Directory receiving `dump.log` and statistics.
    pub work_path: PathBuf,
    /// Leave the process running after dumping.
    pub leave_running: bool,
    /// Checkpoint established TCP connections.
    pub tcp_established: bool,
    /// Checkpoint file locks.
    pub file_locks: bool,
}

/// Parameters for `<runtime> restore`.
#[derive(Debug, Clone, Default)]
pub struct RestoreRequest {
    /// Directory holding the CRIU images.
    pub image_path: PathBuf,
    /// Directory receiving `restore.log`.
    pub work_path: PathBuf,
    /// Restore established TCP connections.
    pub tcp_established: bool,
    /// Restore file locks.
    pub file_locks: bool,
}

/// Live resource usage of one container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Cumulative CPU time in nanoseconds.
    pub cpu_nanos: u64,
    /// Current memory usage in bytes.
    pub memory_bytes: u64,
    /// Memory limit in bytes, zero when unlimited.
    pub memory_limit: u64,
    /// Number of processes.
    pub pids: u64,
}

/// Stream of container output chunks; closed when the process exits.
pub type OutputStream = mpsc::Receiver<Vec<u8>>;

// =============================================================================
// Process Supervisor Trait
// =============================================================================

/// Interface to the process manager behind one OCI runtime.
///
/// Every operation addresses the container by its engine ID, which is also
/// the runtime container ID. Implementations must be safe to call
/// concurrently for different IDs; the engine serializes calls per ID.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Returns the runtime name (`runc`, `crun`, `simulated`).
    fn name(&self) -> &str;

    /// Checks if this runtime is usable on this host.
    fn is_available(&self) -> bool;

    /// Returns the reason why this runtime is unavailable (if any).
    fn unavailable_reason(&self) -> Option<String>;

    // =========================================================================
    // OCI Runtime Spec Operations
    // =========================================================================

    /// Creates the container from a bundle without starting the user process.
    ///
    /// Fails with [`Error::CommandNotFound`] or [`Error::CommandNotExecutable`]
    /// when the configured process cannot be executed.
    async fn create(&self, id: &str, bundle: &Path) -> Result<()>;

    /// Starts a created container and returns the host PID.
    async fn start(&self, id: &str) -> Result<u32>;

    /// Queries the runtime state.
    async fn state(&self, id: &str) -> Result<ProcessState>;

    /// Sends a signal to the container init process (or all processes).
    async fn kill(&self, id: &str, signal: Signal, all: bool) -> Result<()>;

    /// Freezes every process in the container.
    async fn pause(&self, id: &str) -> Result<()>;

    /// Thaws a frozen container.
    async fn resume(&self, id: &str) -> Result<()>;

    /// Deletes the runtime container. Deleting an unknown ID succeeds.
    async fn delete(&self, id: &str, force: bool) -> Result<()>;

    /// Waits for the process to exit and returns its exit code, or `None`
    /// when the backend cannot observe the status of a process that exited
    /// on its own.
    async fn wait(&self, id: &str) -> Result<Option<i32>>;

    // =========================================================================
    // Optional Operations
    // =========================================================================

    /// Probes whether checkpoint/restore is possible with this runtime.
    async fn probe_checkpoint(&self) -> Result<()> {
        Err(Error::RuntimeUnsupported {
            runtime: self.name().to_string(),
            reason: "checkpoint/restore not supported".to_string(),
        })
    }

    /// Dumps the process tree to `request.image_path`.
    async fn checkpoint(&self, id: &str, request: &CheckpointRequest) -> Result<()> {
        let _ = (id, request);
        Err(Error::RuntimeUnsupported {
            runtime: self.name().to_string(),
            reason: "checkpoint not supported".to_string(),
        })
    }

    /// Recreates a running container from CRIU images. Returns the host PID.
    async fn restore(&self, id: &str, bundle: &Path, request: &RestoreRequest) -> Result<u32> {
        let _ = (id, bundle, request);
        Err(Error::RuntimeUnsupported {
            runtime: self.name().to_string(),
            reason: "restore not supported".to_string(),
        })
    }

    /// Samples resource usage.
    async fn stats(&self, id: &str) -> Result<ResourceUsage> {
        let _ = id;
        Err(Error::NotSupported(format!(
            "stats not supported by {} runtime",
            self.name()
        )))
    }

    /// Lists host PIDs of all processes in the container.
    async fn processes(&self, id: &str) -> Result<Vec<u32>> {
        Ok(self.state(id).await?.live_pid().into_iter().collect())
    }

    /// Subscribes to container output. Buffered output is replayed first.
    async fn attach(&self, id: &str) -> Result<OutputStream> {
        let _ = id;
        Err(Error::NotSupported(format!(
            "attach not supported by {} runtime",
            self.name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_parsing() {
        assert_eq!("SIGTERM".parse::<Signal>().unwrap(), Signal::Term);
        assert_eq!("TERM".parse::<Signal>().unwrap(), Signal::Term);
        assert_eq!("15".parse::<Signal>().unwrap(), Signal::Term);
        assert_eq!("sigkill".parse::<Signal>().unwrap(), Signal::Kill);
        assert_eq!("9".parse::<Signal>().unwrap(), Signal::Kill);
        assert_eq!("IOT".parse::<Signal>().unwrap(), Signal::Abrt);
        assert!("INVALID".parse::<Signal>().is_err());
        assert!("0".parse::<Signal>().is_err());
        assert!("64".parse::<Signal>().is_err());
    }

    #[test]
    fn test_signal_display_and_exit_code() {
        assert_eq!(Signal::Tstp.to_string(), "SIGTSTP");
        assert_eq!(Signal::Kill.exit_code(), 137);
        assert!(!Signal::Winch.terminates_by_default());
        assert!(Signal::Term.is_proxyable());
        assert!(!Signal::Kill.is_proxyable());
    }

    #[test]
    fn test_process_state_live_pid() {
        let state = ProcessState {
            id: "c".to_string(),
            status: ProcessStatus::Paused,
            pid: 42,
            bundle: "/b".to_string(),
        };
        assert_eq!(state.live_pid(), Some(42));

        let stopped = ProcessState {
            status: ProcessStatus::Stopped,
            ..state
        };
        assert_eq!(stopped.live_pid(), None);
    }
}

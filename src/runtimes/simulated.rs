//! # Simulated Supervisor - In-Process Process Model
//!
//! A [`ProcessSupervisor`] that models container processes inside the engine
//! process. It reads the real bundle the engine generated, so command
//! resolution, namespace joins and checkpoint files behave like they would
//! with runc, without needing root, cgroups or CRIU.
//!
//! ## Process Model
//!
//! ```text
//!   create ──▶ Created ──start──▶ Running ⇄ Paused
//!                                  │  │
//!                     fatal signal │  │ exit(id, code) / builtin finishes
//!                                  ▼  ▼
//!                                 Stopped ──delete──▶ (gone)
//! ```
//!
//! - `args[0]` is resolved inside the rootfs using the bundle's `PATH`.
//!   A missing binary fails `create` with [`Error::CommandNotFound`], a
//!   directory or non-executable file with [`Error::CommandNotExecutable`].
//! - A few commands finish on their own: `true`, `false`, `echo ARGS`,
//!   `sleep SECS`. Everything else runs until signalled.
//! - Signals sent to a paused process are queued and delivered on resume,
//!   except SIGKILL which terminates the frozen process immediately.
//! - Namespace join paths must point at a live simulated process.

use crate::bundle::read_config;
use crate::constants::{MAX_OUTPUT_BUFFER, OUTPUT_CHANNEL_CAPACITY};
use crate::error::{Error, Result};
use crate::runtime::{
    CheckpointRequest, OutputStream, ProcessState, ProcessStatus, ProcessSupervisor,
    ResourceUsage, RestoreRequest, Signal,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Name reported by the simulated backend.
pub const SIMULATED_NAME: &str = "simulated";

/// First PID handed out.
const FIRST_PID: u32 = 1000;

/// Checkpoint inventory written into the image directory.
const INVENTORY_FILE: &str = "inventory.img";

/// Resident memory reported for every simulated process.
const SIMULATED_RSS: u64 = 4 * 1024 * 1024;

/// Contents of a simulated checkpoint.
#[derive(Debug, Serialize, Deserialize)]
struct Inventory {
    id: String,
    args: Vec<String>,
    pid: u32,
    output: Vec<u8>,
}

struct SimProcess {
    bundle: PathBuf,
    args: Vec<String>,
    status: ProcessStatus,
    pid: u32,
    started_at: Option<Instant>,
    pending: Vec<Signal>,
    output: Vec<u8>,
    subscribers: Vec<mpsc::Sender<Vec<u8>>>,
    exit_tx: watch::Sender<Option<i32>>,
}

impl SimProcess {
    fn new(bundle: PathBuf, args: Vec<String>) -> Self {
        let (exit_tx, _) = watch::channel(None);
        Self {
            bundle,
            args,
            status: ProcessStatus::Created,
            pid: 0,
            started_at: None,
            pending: Vec::new(),
            output: Vec::new(),
            subscribers: Vec::new(),
            exit_tx,
        }
    }

    fn write(&mut self, data: &[u8]) {
        self.output.extend_from_slice(data);
        if self.output.len() > MAX_OUTPUT_BUFFER {
            let excess = self.output.len() - MAX_OUTPUT_BUFFER;
            self.output.drain(..excess);
        }
        self.subscribers
            .retain(|tx| tx.try_send(data.to_vec()).is_ok() || !tx.is_closed());
    }

    fn terminate(&mut self, code: i32) {
        self.status = ProcessStatus::Stopped;
        self.pending.clear();
        self.subscribers.clear();
        self.exit_tx.send_replace(Some(code));
    }

    /// Delivers a signal to a running process.
    fn deliver(&mut self, signal: Signal) {
        if signal.terminates_by_default() {
            self.terminate(signal.exit_code());
        }
    }
}

/// In-process supervisor backend.
///
/// ## Thread Safety
///
/// Process state lives behind an `Arc<RwLock<..>>` shared with the timer
/// tasks of self-terminating commands; the lock is never held across an
/// await point.
pub struct SimulatedSupervisor {
    processes: Arc<RwLock<HashMap<String, SimProcess>>>,
    next_pid: AtomicU32,
    checkpoint_support: AtomicBool,
    exit_status: AtomicBool,
    failing_pauses: RwLock<HashSet<String>>,
}

impl Default for SimulatedSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSupervisor {
    /// Creates a supervisor with checkpoint support enabled.
    pub fn new() -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
            next_pid: AtomicU32::new(FIRST_PID),
            checkpoint_support: AtomicBool::new(true),
            exit_status: AtomicBool::new(true),
            failing_pauses: RwLock::new(HashSet::new()),
        }
    }

    /// Toggles whether the checkpoint probe succeeds.
    pub fn set_checkpoint_support(&self, supported: bool) {
        self.checkpoint_support.store(supported, Ordering::SeqCst);
    }

    /// Switches off exit status reporting. `wait` then only reports exits
    /// caused by a signal, the way a runtime without an exit monitor does.
    pub fn set_exit_status_reporting(&self, reported: bool) {
        self.exit_status.store(reported, Ordering::SeqCst);
    }

    /// Makes every later `pause` of container `id` fail.
    pub fn fail_pause(&self, id: &str) -> Result<()> {
        self.failing_pauses
            .write()
            .map_err(|_| Error::Internal("lock poisoned".to_string()))?
            .insert(id.to_string());
        Ok(())
    }

    /// Makes a running process exit with `code`.
    pub fn exit(&self, id: &str, code: i32) -> Result<()> {
        let mut processes = self.lock_write()?;
        let process = processes
            .get_mut(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        if !matches!(process.status, ProcessStatus::Running) {
            return Err(Error::runtime(id, "exit", "process is not running"));
        }
        process.terminate(code);
        debug!(container = %id, code, "simulated process exited");
        Ok(())
    }

    /// Host PIDs of every live simulated process.
    pub fn live_pids(&self) -> Vec<u32> {
        self.processes
            .read()
            .map(|p| {
                p.values()
                    .filter(|p| matches!(p.status, ProcessStatus::Running | ProcessStatus::Paused))
                    .map(|p| p.pid)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock_write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, SimProcess>>> {
        self.processes
            .write()
            .map_err(|_| Error::Internal("lock poisoned".to_string()))
    }

    fn allocate_pid(&self) -> u32 {
        self.next_pid.fetch_add(1, Ordering::SeqCst)
    }

    /// Resolves and validates the process of a bundle.
    fn load_bundle(&self, id: &str, bundle: &Path) -> Result<Vec<String>> {
        let spec = read_config(bundle).map_err(|e| Error::runtime(id, "create", e))?;
        let args = spec.process.args.clone();
        let Some(command) = args.first() else {
            return Err(Error::runtime(id, "create", "no process arguments"));
        };

        let rootfs = PathBuf::from(&spec.root.path);
        let path_env = spec
            .process
            .env
            .iter()
            .find_map(|e| e.strip_prefix("PATH="))
            .unwrap_or(crate::constants::DEFAULT_PATH_ENV);
        resolve_command(id, &rootfs, command, path_env)?;

        // Joined namespaces must belong to a live process.
        if let Some(linux) = &spec.linux {
            let live = self.live_pids();
            for ns in &linux.namespaces {
                let Some(path) = &ns.path else { continue };
                let pid = path
                    .strip_prefix("/proc/")
                    .and_then(|rest| rest.split('/').next())
                    .and_then(|pid| pid.parse::<u32>().ok());
                match pid {
                    Some(pid) if live.contains(&pid) => {}
                    _ => {
                        return Err(Error::runtime(
                            id,
                            "create",
                            format!("cannot join {} namespace at {}: no such process", ns.ns_type, path),
                        ));
                    }
                }
            }
        }
        Ok(args)
    }

    /// Runs the builtin behavior of self-terminating commands.
    fn run_builtin(&self, id: &str, args: &[String]) {
        let name = args
            .first()
            .and_then(|a| Path::new(a).file_name())
            .and_then(|n| n.to_str())
            .unwrap_or("");
        let finish = |code: i32, output: Option<String>| {
            if let Ok(mut processes) = self.processes.write()
                && let Some(process) = processes.get_mut(id)
            {
                if let Some(output) = output {
                    process.write(output.as_bytes());
                }
                process.terminate(code);
            }
        };
        match name {
            "true" => finish(0, None),
            "false" => finish(1, None),
            "echo" => finish(0, Some(format!("{}\n", args[1..].join(" ")))),
            "sleep" => {
                let secs = args.get(1).and_then(|s| s.parse::<f64>().ok());
                if let Some(secs) = secs.filter(|s| s.is_finite() && *s >= 0.0) {
                    let processes = Arc::clone(&self.processes);
                    let id = id.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                        if let Ok(mut guard) = processes.write()
                            && let Some(process) = guard.get_mut(&id)
                            && process.status == ProcessStatus::Running
                        {
                            process.terminate(0);
                        }
                    });
                }
            }
            _ => {}
        }
    }
}

/// Resolves `command` inside `rootfs`.
fn resolve_command(id: &str, rootfs: &Path, command: &str, path_env: &str) -> Result<PathBuf> {
    let candidates: Vec<PathBuf> = if command.contains('/') {
        vec![rootfs.join(command.trim_start_matches('/'))]
    } else {
        path_env
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(|dir| rootfs.join(dir.trim_start_matches('/')).join(command))
            .collect()
    };

    let mut not_executable = false;
    for candidate in candidates {
        let Ok(meta) = std::fs::metadata(&candidate) else {
            continue;
        };
        if meta.is_file() && is_executable(&meta) {
            return Ok(candidate);
        }
        not_executable = true;
    }

    if not_executable {
        Err(Error::CommandNotExecutable {
            id: id.to_string(),
            command: command.to_string(),
        })
    } else {
        Err(Error::CommandNotFound {
            id: id.to_string(),
            command: command.to_string(),
        })
    }
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    true
}

#[async_trait]
impl ProcessSupervisor for SimulatedSupervisor {
    fn name(&self) -> &str {
        SIMULATED_NAME
    }

    fn is_available(&self) -> bool {
        true
    }

    fn unavailable_reason(&self) -> Option<String> {
        None
    }

    async fn create(&self, id: &str, bundle: &Path) -> Result<()> {
        let args = self.load_bundle(id, bundle)?;
        let mut processes = self.lock_write()?;
        if let Some(existing) = processes.get(id)
            && existing.status != ProcessStatus::Stopped
        {
            return Err(Error::runtime(
                id,
                "create",
                format!("container exists in state {}", existing.status),
            ));
        }
        processes.insert(id.to_string(), SimProcess::new(bundle.to_path_buf(), args));
        debug!(container = %id, bundle = %bundle.display(), "simulated create");
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<u32> {
        let (pid, args) = {
            let mut processes = self.lock_write()?;
            let process = processes
                .get_mut(id)
                .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
            if process.status != ProcessStatus::Created {
                return Err(Error::runtime(
                    id,
                    "start",
                    format!("cannot start a container in state {}", process.status),
                ));
            }
            process.pid = self.allocate_pid();
            process.status = ProcessStatus::Running;
            process.started_at = Some(Instant::now());
            (process.pid, process.args.clone())
        };
        self.run_builtin(id, &args);
        info!(container = %id, pid, "simulated start");
        Ok(pid)
    }

    async fn state(&self, id: &str) -> Result<ProcessState> {
        let processes = self
            .processes
            .read()
            .map_err(|_| Error::Internal("lock poisoned".to_string()))?;
        let process = processes
            .get(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        Ok(ProcessState {
            id: id.to_string(),
            status: process.status,
            pid: if process.status == ProcessStatus::Stopped {
                0
            } else {
                process.pid
            },
            bundle: process.bundle.to_string_lossy().into_owned(),
        })
    }

    async fn kill(&self, id: &str, signal: Signal, _all: bool) -> Result<()> {
        let mut processes = self.lock_write()?;
        let process = processes
            .get_mut(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        match process.status {
            ProcessStatus::Running => process.deliver(signal),
            ProcessStatus::Paused if signal == Signal::Kill => {
                process.terminate(signal.exit_code());
            }
            ProcessStatus::Paused => process.pending.push(signal),
            other => {
                return Err(Error::runtime(
                    id,
                    "kill",
                    format!("container is not running (state {other})"),
                ));
            }
        }
        debug!(container = %id, signal = %signal, "simulated kill");
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        let failing = self
            .failing_pauses
            .read()
            .map_err(|_| Error::Internal("lock poisoned".to_string()))?
            .contains(id);
        if failing {
            return Err(Error::runtime(id, "pause", "cgroup freezer unavailable"));
        }
        let mut processes = self.lock_write()?;
        let process = processes
            .get_mut(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        if process.status != ProcessStatus::Running {
            return Err(Error::runtime(id, "pause", "container is not running"));
        }
        process.status = ProcessStatus::Paused;
        Ok(())
    }

    async fn resume(&self, id: &str) -> Result<()> {
        let mut processes = self.lock_write()?;
        let process = processes
            .get_mut(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        if process.status != ProcessStatus::Paused {
            return Err(Error::runtime(id, "resume", "container is not paused"));
        }
        process.status = ProcessStatus::Running;
        for signal in std::mem::take(&mut process.pending) {
            process.deliver(signal);
            if process.status == ProcessStatus::Stopped {
                break;
            }
        }
        Ok(())
    }

    async fn delete(&self, id: &str, force: bool) -> Result<()> {
        let mut processes = self.lock_write()?;
        let Some(process) = processes.get_mut(id) else {
            return Ok(());
        };
        if matches!(process.status, ProcessStatus::Running | ProcessStatus::Paused) {
            if !force {
                return Err(Error::runtime(id, "delete", "container is running"));
            }
            process.terminate(Signal::Kill.exit_code());
        }
        processes.remove(id);
        debug!(container = %id, "simulated delete");
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<Option<i32>> {
        let mut rx = {
            let processes = self
                .processes
                .read()
                .map_err(|_| Error::Internal("lock poisoned".to_string()))?;
            processes
                .get(id)
                .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?
                .exit_tx
                .subscribe()
        };
        let code = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::runtime(id, "wait", "container deleted while waiting"))?;
        let code = (*code).unwrap_or(0);
        if self.exit_status.load(Ordering::SeqCst) || code > 128 {
            Ok(Some(code))
        } else {
            Ok(None)
        }
    }

    async fn probe_checkpoint(&self) -> Result<()> {
        if self.checkpoint_support.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::RuntimeUnsupported {
                runtime: SIMULATED_NAME.to_string(),
                reason: "checkpoint support disabled".to_string(),
            })
        }
    }

    async fn checkpoint(&self, id: &str, request: &CheckpointRequest) -> Result<()> {
        self.probe_checkpoint().await?;
        let mut processes = self.lock_write()?;
        let process = processes
            .get_mut(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        if process.status != ProcessStatus::Running {
            return Err(Error::runtime(id, "checkpoint", "container is not running"));
        }

        let inventory = Inventory {
            id: id.to_string(),
            args: process.args.clone(),
            pid: process.pid,
            output: process.output.clone(),
        };
        std::fs::create_dir_all(&request.image_path)?;
        std::fs::create_dir_all(&request.work_path)?;
        std::fs::write(
            request.image_path.join(INVENTORY_FILE),
            serde_json::to_vec(&inventory)?,
        )?;
        std::fs::write(
            request.work_path.join(crate::constants::DUMP_LOG_FILE),
            format!("simulated dump of {} (pid {})\n", id, process.pid),
        )?;

        if !request.leave_running {
            process.terminate(0);
        }
        info!(container = %id, leave_running = request.leave_running, "simulated checkpoint");
        Ok(())
    }

    async fn restore(&self, id: &str, bundle: &Path, request: &RestoreRequest) -> Result<u32> {
        self.probe_checkpoint().await?;
        let data = std::fs::read(request.image_path.join(INVENTORY_FILE))
            .map_err(|e| Error::runtime(id, "restore", format!("read inventory: {e}")))?;
        let inventory: Inventory = serde_json::from_slice(&data)?;
        let args = self.load_bundle(id, bundle)?;

        let mut processes = self.lock_write()?;
        if let Some(existing) = processes.get(id)
            && existing.status != ProcessStatus::Stopped
        {
            return Err(Error::runtime(id, "restore", "container already exists"));
        }
        let mut process = SimProcess::new(bundle.to_path_buf(), args);
        process.pid = self.allocate_pid();
        process.status = ProcessStatus::Running;
        process.started_at = Some(Instant::now());
        process.output = inventory.output;
        let pid = process.pid;
        processes.insert(id.to_string(), process);

        std::fs::create_dir_all(&request.work_path)?;
        std::fs::write(
            request.work_path.join(crate::constants::RESTORE_LOG_FILE),
            format!("simulated restore of {} as pid {}\n", inventory.id, pid),
        )?;
        info!(container = %id, pid, "simulated restore");
        Ok(pid)
    }

    async fn stats(&self, id: &str) -> Result<ResourceUsage> {
        let processes = self
            .processes
            .read()
            .map_err(|_| Error::Internal("lock poisoned".to_string()))?;
        let process = processes
            .get(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        let live = matches!(process.status, ProcessStatus::Running | ProcessStatus::Paused);
        Ok(ResourceUsage {
            cpu_nanos: process
                .started_at
                .filter(|_| live)
                .map_or(0, |t| t.elapsed().as_nanos() as u64 / 100),
            memory_bytes: if live { SIMULATED_RSS } else { 0 },
            memory_limit: 0,
            pids: u64::from(live),
        })
    }

    async fn attach(&self, id: &str) -> Result<OutputStream> {
        let mut processes = self.lock_write()?;
        let process = processes
            .get_mut(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if !process.output.is_empty() {
            let _ = tx.try_send(process.output.clone());
        }
        if matches!(process.status, ProcessStatus::Running | ProcessStatus::Paused) {
            process.subscribers.push(tx);
        }
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{BundleContext, generate_oci_spec, write_config};
    use crate::container::spec::ContainerSpec;
    use crate::container::state::{Container, ContainerState};
    use tempfile::TempDir;

    fn bundle(temp: &TempDir, id: &str, command: &[&str]) -> PathBuf {
        let rootfs = temp.path().join(id).join("rootfs");
        std::fs::create_dir_all(rootfs.join("bin")).unwrap();
        for name in ["top", "echo", "sleep"] {
            let path = rootfs.join("bin").join(name);
            std::fs::write(&path, b"#!").unwrap();
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            }
        }
        std::fs::write(rootfs.join("bin/plain"), b"data").unwrap();

        let container = Container {
            id: id.to_string(),
            name: id.to_string(),
            spec: ContainerSpec::new("alpine").with_command(command.iter().copied()),
            image_id: String::new(),
            image_name: String::new(),
            pod_id: None,
            is_infra: false,
            namespaces: Default::default(),
            created_at: chrono::Utc::now(),
            runtime: SIMULATED_NAME.to_string(),
            state: ContainerState::default(),
        };
        let ctx = BundleContext {
            rootfs,
            ..Default::default()
        };
        let dir = temp.path().join(id).join("userdata");
        write_config(&dir, &generate_oci_spec(&container, &ctx)).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_lifecycle_and_signals() {
        let temp = TempDir::new().unwrap();
        let sup = SimulatedSupervisor::new();
        sup.create("c1", &bundle(&temp, "c1", &["top"])).await.unwrap();
        let pid = sup.start("c1").await.unwrap();
        assert!(pid >= FIRST_PID);

        sup.kill("c1", Signal::Winch, false).await.unwrap();
        assert_eq!(sup.state("c1").await.unwrap().status, ProcessStatus::Running);

        sup.kill("c1", Signal::Term, false).await.unwrap();
        assert_eq!(sup.wait("c1").await.unwrap(), Some(143));
        assert_eq!(sup.state("c1").await.unwrap().live_pid(), None);
    }

    #[tokio::test]
    async fn test_signals_queue_while_paused() {
        let temp = TempDir::new().unwrap();
        let sup = SimulatedSupervisor::new();
        sup.create("c1", &bundle(&temp, "c1", &["top"])).await.unwrap();
        sup.start("c1").await.unwrap();
        sup.pause("c1").await.unwrap();

        sup.kill("c1", Signal::Term, false).await.unwrap();
        assert_eq!(sup.state("c1").await.unwrap().status, ProcessStatus::Paused);
        sup.resume("c1").await.unwrap();
        assert_eq!(sup.state("c1").await.unwrap().status, ProcessStatus::Stopped);
    }

    #[tokio::test]
    async fn test_kill_paused_with_sigkill() {
        let temp = TempDir::new().unwrap();
        let sup = SimulatedSupervisor::new();
        sup.create("c1", &bundle(&temp, "c1", &["top"])).await.unwrap();
        sup.start("c1").await.unwrap();
        sup.pause("c1").await.unwrap();
        sup.kill("c1", Signal::Kill, false).await.unwrap();
        assert_eq!(sup.wait("c1").await.unwrap(), Some(137));
    }

    #[tokio::test]
    async fn test_command_resolution_errors() {
        let temp = TempDir::new().unwrap();
        let sup = SimulatedSupervisor::new();

        let err = sup
            .create("c1", &bundle(&temp, "c1", &["nosuchcmd"]))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 127);

        let err = sup
            .create("c2", &bundle(&temp, "c2", &["/bin/plain"]))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 126);

        let err = sup
            .create("c3", &bundle(&temp, "c3", &["/bin"]))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 126);
    }

    #[tokio::test]
    async fn test_builtin_echo_output() {
        let temp = TempDir::new().unwrap();
        let sup = SimulatedSupervisor::new();
        sup.create("c1", &bundle(&temp, "c1", &["echo", "hello"]))
            .await
            .unwrap();
        sup.start("c1").await.unwrap();
        assert_eq!(sup.wait("c1").await.unwrap(), Some(0));

        let mut out = sup.attach("c1").await.unwrap();
        assert_eq!(out.recv().await.unwrap(), b"hello\n");
        assert!(out.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unreported_exit_status() {
        let temp = TempDir::new().unwrap();
        let sup = SimulatedSupervisor::new();
        sup.set_exit_status_reporting(false);

        sup.create("c1", &bundle(&temp, "c1", &["echo", "hi"])).await.unwrap();
        sup.start("c1").await.unwrap();
        assert_eq!(sup.wait("c1").await.unwrap(), None);

        sup.create("c2", &bundle(&temp, "c2", &["top"])).await.unwrap();
        sup.start("c2").await.unwrap();
        sup.kill("c2", Signal::Term, false).await.unwrap();
        assert_eq!(sup.wait("c2").await.unwrap(), Some(143));
    }

    #[tokio::test]
    async fn test_pause_failure_injection() {
        let temp = TempDir::new().unwrap();
        let sup = SimulatedSupervisor::new();
        sup.create("c1", &bundle(&temp, "c1", &["top"])).await.unwrap();
        sup.start("c1").await.unwrap();
        sup.fail_pause("c1").unwrap();
        assert!(sup.pause("c1").await.is_err());
        assert_eq!(sup.state("c1").await.unwrap().status, ProcessStatus::Running);
    }

    #[tokio::test]
    async fn test_checkpoint_and_restore() {
        let temp = TempDir::new().unwrap();
        let sup = SimulatedSupervisor::new();
        let dir = bundle(&temp, "c1", &["top"]);
        sup.create("c1", &dir).await.unwrap();
        sup.start("c1").await.unwrap();

        let request = CheckpointRequest {
            image_path: dir.join("checkpoint"),
            work_path: dir.clone(),
            ..Default::default()
        };
        sup.checkpoint("c1", &request).await.unwrap();
        assert!(dir.join("checkpoint").join(INVENTORY_FILE).exists());
        assert_eq!(sup.state("c1").await.unwrap().status, ProcessStatus::Stopped);

        let restore = RestoreRequest {
            image_path: dir.join("checkpoint"),
            work_path: dir.clone(),
            ..Default::default()
        };
        let pid = sup.restore("c1", &dir, &restore).await.unwrap();
        assert_eq!(sup.state("c1").await.unwrap().live_pid(), Some(pid));

        sup.set_checkpoint_support(false);
        assert!(sup.probe_checkpoint().await.is_err());
    }
}

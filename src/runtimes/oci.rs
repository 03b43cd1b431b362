//! # OCI CLI Supervisor - runc / crun
//!
//! Drives an OCI runtime binary as a subprocess, one invocation per
//! operation:
//!
//! | Operation    | Invocation                                                        |
//! |--------------|-------------------------------------------------------------------|
//! | `create`     | `<rt> --root R create --bundle B --pid-file B/pidfile ID`         |
//! | `start`      | `<rt> --root R start ID`                                          |
//! | `state`      | `<rt> --root R state ID` (JSON)                                   |
//! | `kill`       | `<rt> --root R kill [--all] ID SIGNUM`                            |
//! | `pause`      | `<rt> --root R pause ID` / `resume ID`                            |
//! | `delete`     | `<rt> --root R delete [--force] ID`                               |
//! | `checkpoint` | `<rt> --root R checkpoint --image-path I --work-path W ID`        |
//! | `restore`    | `<rt> --root R restore --detach --image-path I --bundle B ID`     |
//! | `stats`      | `<rt> --root R events --stats ID` (JSON)                          |
//!
//! Every call is bounded by [`RUNTIME_CALL_TIMEOUT`]. The container's
//! stdout/stderr go to `ctr.log` in the bundle; `attach` tails that file.
//!
//! ## Exit Codes
//!
//! Without a conmon-style monitor the real exit status of the container
//! process is not observable. `wait` reports `128 + signal` when the engine
//! delivered a terminating signal and `None` otherwise; the engine then
//! records the exit code as unknown and `wait`/`run` fail instead of
//! reporting success.

use crate::constants::{
    CONTAINER_LOG_FILE, DEFAULT_PATH_ENV, MIN_CRIU_VERSION, OUTPUT_CHANNEL_CAPACITY,
    RUNTIME_CALL_TIMEOUT, STATE_POLL_INTERVAL,
};
use crate::error::{Error, Result};
use crate::runtime::{
    CheckpointRequest, OutputStream, ProcessState, ProcessStatus, ProcessSupervisor,
    ResourceUsage, RestoreRequest, Signal,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::RwLock;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Supervisor backed by a runc-compatible binary.
pub struct OciCliSupervisor {
    name: String,
    binary: Option<PathBuf>,
    state_root: PathBuf,
    criu: PathBuf,
    last_signal: RwLock<HashMap<String, Signal>>,
}

impl OciCliSupervisor {
    /// Creates a supervisor for runtime `name`.
    ///
    /// `binary` overrides the lookup of `name` in the standard binary
    /// directories.
    pub fn new(name: &str, binary: Option<PathBuf>, state_root: PathBuf, criu: PathBuf) -> Self {
        let binary = binary
            .filter(|p| p.exists())
            .or_else(|| find_binary(name));
        if binary.is_none() {
            debug!(runtime = %name, "OCI runtime binary not found");
        }
        Self {
            name: name.to_string(),
            binary,
            state_root,
            criu,
            last_signal: RwLock::new(HashMap::new()),
        }
    }

    fn binary(&self) -> Result<&Path> {
        self.binary
            .as_deref()
            .ok_or_else(|| Error::RuntimeUnsupported {
                runtime: self.name.clone(),
                reason: "binary not found".to_string(),
            })
    }

    /// Runs one runtime invocation and returns stdout.
    async fn run(&self, id: &str, operation: &str, args: &[&str]) -> Result<Vec<u8>> {
        let binary = self.binary()?;
        let mut cmd = Command::new(binary);
        cmd.arg("--root")
            .arg(&self.state_root)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(runtime = %self.name, container = %id, ?args, "invoking runtime");
        let output = tokio::time::timeout(RUNTIME_CALL_TIMEOUT, cmd.output())
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("{} {}", self.name, operation),
                duration: RUNTIME_CALL_TIMEOUT,
            })?
            .map_err(|e| Error::runtime(id, operation, e))?;

        if output.status.success() {
            return Ok(output.stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_failure(id, operation, &stderr))
    }

    fn record_signal(&self, id: &str, signal: Signal) {
        if let Ok(mut signals) = self.last_signal.write() {
            signals.insert(id.to_string(), signal);
        }
    }

    fn take_signal(&self, id: &str) -> Option<Signal> {
        self.last_signal.write().ok().and_then(|mut s| s.remove(id))
    }
}

/// Maps runtime stderr onto the error taxonomy.
fn classify_failure(id: &str, operation: &str, stderr: &str) -> Error {
    let lower = stderr.to_ascii_lowercase();
    let command = || {
        stderr
            .split('"')
            .nth(1)
            .unwrap_or_default()
            .to_string()
    };
    if lower.contains("executable file not found")
        || (lower.contains("no such file or directory") && lower.contains("exec"))
    {
        Error::CommandNotFound {
            id: id.to_string(),
            command: command(),
        }
    } else if lower.contains("permission denied") && lower.contains("exec") {
        Error::CommandNotExecutable {
            id: id.to_string(),
            command: command(),
        }
    } else if lower.contains("does not exist") || lower.contains("not found") {
        Error::ContainerNotFound(id.to_string())
    } else {
        Error::runtime(id, operation, stderr)
    }
}

/// Looks a binary up in the standard directories.
fn find_binary(name: &str) -> Option<PathBuf> {
    DEFAULT_PATH_ENV
        .split(':')
        .map(|dir| Path::new(dir).join(name))
        .find(|p| p.is_file())
}

/// Parses `criu --version` output into `major * 10000 + minor * 100 + patch`.
pub fn parse_criu_version(output: &str) -> Option<u32> {
    let line = output.lines().find(|l| l.starts_with("Version:"))?;
    let version = line.trim_start_matches("Version:").trim();
    let mut parts = version.split('.').map(|p| p.parse::<u32>().ok());
    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some(major * 10000 + minor * 100 + patch)
}

#[async_trait]
impl ProcessSupervisor for OciCliSupervisor {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.binary.is_some()
    }

    fn unavailable_reason(&self) -> Option<String> {
        if self.binary.is_some() {
            None
        } else {
            Some(format!("{} binary not found", self.name))
        }
    }

    async fn create(&self, id: &str, bundle: &Path) -> Result<()> {
        tokio::fs::create_dir_all(&self.state_root).await?;
        let binary = self.binary()?;
        let log = std::fs::File::create(bundle.join(CONTAINER_LOG_FILE))?;
        let log_err = log.try_clone()?;
        let pid_file = bundle.join("pidfile");

        let mut cmd = Command::new(binary);
        cmd.arg("--root")
            .arg(&self.state_root)
            .arg("create")
            .arg("--bundle")
            .arg(bundle)
            .arg("--pid-file")
            .arg(&pid_file)
            .arg(id)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        let status = tokio::time::timeout(RUNTIME_CALL_TIMEOUT, cmd.status())
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("{} create", self.name),
                duration: RUNTIME_CALL_TIMEOUT,
            })?
            .map_err(|e| Error::runtime(id, "create", e))?;
        if !status.success() {
            let log = tokio::fs::read_to_string(bundle.join(CONTAINER_LOG_FILE))
                .await
                .unwrap_or_default();
            return Err(classify_failure(id, "create", log.trim()));
        }
        info!(runtime = %self.name, container = %id, "created container");
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<u32> {
        self.run(id, "start", &["start", id]).await?;
        let state = self.state(id).await?;
        Ok(state.pid)
    }

    async fn state(&self, id: &str) -> Result<ProcessState> {
        let stdout = self.run(id, "state", &["state", id]).await?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    async fn kill(&self, id: &str, signal: Signal, all: bool) -> Result<()> {
        let num = signal.as_i32().to_string();
        let mut args = vec!["kill"];
        if all {
            args.push("--all");
        }
        args.extend([id, num.as_str()]);
        self.run(id, "kill", &args).await?;
        if signal.terminates_by_default() {
            self.record_signal(id, signal);
        }
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.run(id, "pause", &["pause", id]).await.map(|_| ())
    }

    async fn resume(&self, id: &str) -> Result<()> {
        self.run(id, "resume", &["resume", id]).await.map(|_| ())
    }

    async fn delete(&self, id: &str, force: bool) -> Result<()> {
        let mut args = vec!["delete"];
        if force {
            args.push("--force");
        }
        args.push(id);
        match self.run(id, "delete", &args).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn wait(&self, id: &str) -> Result<Option<i32>> {
        loop {
            match self.state(id).await {
                Ok(state) if state.status == ProcessStatus::Stopped => break,
                Ok(_) => tokio::time::sleep(STATE_POLL_INTERVAL).await,
                Err(e) if e.is_not_found() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(self.take_signal(id).map(|s| s.exit_code()))
    }

    async fn probe_checkpoint(&self) -> Result<()> {
        self.binary()?;
        let unsupported = |reason: String| Error::RuntimeUnsupported {
            runtime: self.name.clone(),
            reason,
        };
        let output = tokio::time::timeout(
            RUNTIME_CALL_TIMEOUT,
            Command::new(&self.criu).arg("--version").output(),
        )
        .await
        .map_err(|_| unsupported("criu --version timed out".to_string()))?
        .map_err(|e| unsupported(format!("criu not available: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_criu_version(&stdout) {
            Some(v) if v >= MIN_CRIU_VERSION => Ok(()),
            Some(v) => Err(unsupported(format!(
                "criu version {v} older than required {MIN_CRIU_VERSION}"
            ))),
            None => Err(unsupported("cannot parse criu version".to_string())),
        }
    }

    async fn checkpoint(&self, id: &str, request: &CheckpointRequest) -> Result<()> {
        let image = request.image_path.to_string_lossy().into_owned();
        let work = request.work_path.to_string_lossy().into_owned();
        let mut args = vec![
            "checkpoint",
            "--image-path",
            image.as_str(),
            "--work-path",
            work.as_str(),
        ];
        if request.leave_running {
            args.push("--leave-running");
        }
        if request.tcp_established {
            args.push("--tcp-established");
        }
        if request.file_locks {
            args.push("--file-locks");
        }
        args.push(id);
        self.run(id, "checkpoint", &args).await?;
        info!(runtime = %self.name, container = %id, "checkpointed container");
        Ok(())
    }

    async fn restore(&self, id: &str, bundle: &Path, request: &RestoreRequest) -> Result<u32> {
        let image = request.image_path.to_string_lossy().into_owned();
        let work = request.work_path.to_string_lossy().into_owned();
        let bundle_arg = bundle.to_string_lossy().into_owned();
        let mut args = vec![
            "restore",
            "--detach",
            "--image-path",
            image.as_str(),
            "--work-path",
            work.as_str(),
            "--bundle",
            bundle_arg.as_str(),
        ];
        if request.tcp_established {
            args.push("--tcp-established");
        }
        if request.file_locks {
            args.push("--file-locks");
        }
        args.push(id);
        self.run(id, "restore", &args).await?;
        let state = self.state(id).await?;
        info!(runtime = %self.name, container = %id, pid = state.pid, "restored container");
        Ok(state.pid)
    }

    async fn stats(&self, id: &str) -> Result<ResourceUsage> {
        let stdout = self.run(id, "stats", &["events", "--stats", id]).await?;
        let value: serde_json::Value = serde_json::from_slice(&stdout)?;
        let data = &value["data"];
        Ok(ResourceUsage {
            cpu_nanos: data["cpu"]["usage"]["total"].as_u64().unwrap_or(0),
            memory_bytes: data["memory"]["usage"]["usage"].as_u64().unwrap_or(0),
            memory_limit: data["memory"]["usage"]["limit"].as_u64().unwrap_or(0),
            pids: data["pids"]["current"].as_u64().unwrap_or(0),
        })
    }

    async fn processes(&self, id: &str) -> Result<Vec<u32>> {
        let stdout = self
            .run(id, "ps", &["ps", "--format", "json", id])
            .await?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    async fn attach(&self, id: &str) -> Result<OutputStream> {
        let state = self.state(id).await?;
        let log_path = Path::new(&state.bundle).join(CONTAINER_LOG_FILE);
        let mut file = tokio::fs::File::open(&log_path).await?;
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        let binary = self.binary()?.to_path_buf();
        let state_root = self.state_root.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                match file.read(&mut buf).await {
                    Ok(0) => {
                        let running = Command::new(&binary)
                            .arg("--root")
                            .arg(&state_root)
                            .args(["state", id.as_str()])
                            .output()
                            .await
                            .ok()
                            .and_then(|o| serde_json::from_slice::<ProcessState>(&o.stdout).ok())
                            .is_some_and(|s| s.live_pid().is_some());
                        if !running {
                            break;
                        }
                        tokio::time::sleep(STATE_POLL_INTERVAL).await;
                    }
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(container = %id, error = %e, "reading container log failed");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_criu_version() {
        assert_eq!(parse_criu_version("Version: 3.17.1\n"), Some(31701));
        assert_eq!(parse_criu_version("Version: 3.16\nGitID: v3.16"), Some(31600));
        assert_eq!(parse_criu_version("garbage"), None);
    }

    #[test]
    fn test_classify_failure() {
        let err = classify_failure(
            "c",
            "create",
            "exec: \"foo\": executable file not found in $PATH",
        );
        assert_eq!(err.exit_code(), 127);
        assert!(matches!(err, Error::CommandNotFound { ref command, .. } if command == "foo"));

        let err = classify_failure("c", "create", "exec /etc: permission denied");
        assert_eq!(err.exit_code(), 126);

        let err = classify_failure("c", "delete", "container \"c\" does not exist");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let sup = OciCliSupervisor::new(
            "definitely-not-a-runtime",
            None,
            PathBuf::from("/tmp/none"),
            PathBuf::from("criu"),
        );
        assert!(!sup.is_available());
        assert!(sup.unavailable_reason().is_some());
    }
}

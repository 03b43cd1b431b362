//! Container lifecycle manager.
//!
//! Drives the state machine described in [`crate::container`]: validates a
//! transition against the current record, calls the storage layer and the
//! process supervisor, persists the new state and records the event.

use crate::bundle::{BundleContext, generate_oci_spec, namespace_path, write_config};
use crate::config::{EngineConfig, KillPausedPolicy};
use crate::constants::RUNTIME_CALL_TIMEOUT;
use crate::container::spec::{ContainerSpec, NamespaceKind, NamespaceMode, RestartPolicy};
use crate::container::state::{Container, ContainerState, ContainerStatus};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventStatus};
use crate::image::Image;
use crate::inspect::{self, ContainerInspect};
use crate::pod::resolve_namespaces;
use crate::runtime::{ProcessSupervisor, ResourceUsage, Signal};
use crate::runtimes::SupervisorRegistry;
use crate::storage::{RUNTIME_HOLDER, StorageLayer, USER_HOLDER};
use crate::store::{EntityGuard, EntityStore, Filter, generate_id};
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How an attached session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The process exited with this code.
    Exited(i32),
    /// The client detached; the container keeps running.
    Detached,
}

/// Options for `rm`.
#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    /// Stop running containers first.
    pub force: bool,
    /// Stop timeout in seconds when forcing.
    pub timeout: Option<u64>,
}

/// Owns the container state machine.
///
/// Cheap to clone: every field is shared. Exit watchers hold a clone.
#[derive(Clone)]
pub struct ContainerManager {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) store: Arc<EntityStore>,
    pub(crate) storage: Arc<StorageLayer>,
    pub(crate) supervisors: Arc<SupervisorRegistry>,
    pub(crate) events: EventBus,
}

impl ContainerManager {
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<EntityStore>,
        storage: Arc<StorageLayer>,
        supervisors: Arc<SupervisorRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            store,
            storage,
            supervisors,
            events,
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    pub(crate) async fn lock(&self, id: &str) -> Result<EntityGuard> {
        self.store.lock_entity(id).await
    }

    pub(crate) fn supervisor(&self, container: &Container) -> Result<Arc<dyn ProcessSupervisor>> {
        self.supervisors.get(&container.runtime)
    }

    /// Resolves an image for a new container.
    pub(crate) fn lookup_image(&self, reference: &str) -> Result<Image> {
        self.storage.images().lookup(reference).map_err(|e| match e {
            Error::ImageNotFound(r) => Error::InvalidSpec(format!("image '{r}' not found")),
            other => other,
        })
    }

    pub(crate) fn record(&self, status: EventStatus, container: &Container) {
        self.events.record(Event::container(status, container));
    }

    /// Resolves batch targets. Explicit references are returned as given so
    /// each one fails or succeeds on its own.
    pub fn select(&self, references: &[String], all: bool, latest: bool) -> Result<Vec<String>> {
        if (all && latest) || ((all || latest) && !references.is_empty()) {
            return Err(Error::InvalidSpec(
                "--all, --latest and container names are mutually exclusive".to_string(),
            ));
        }
        if latest {
            return Ok(vec![self.store.latest_container()?.id]);
        }
        if all {
            return Ok(self
                .store
                .containers()?
                .into_iter()
                .filter(|c| !c.is_infra)
                .map(|c| c.id)
                .collect());
        }
        if references.is_empty() {
            return Err(Error::InvalidSpec(
                "at least one container name or ID must be given".to_string(),
            ));
        }
        Ok(references.to_vec())
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Creates a container in `created`. No process is started.
    #[instrument(skip(self, spec), fields(image = %spec.image))]
    pub fn create(&self, spec: ContainerSpec) -> Result<Container> {
        self.create_with(spec, false)
    }

    /// Creates a container; `infra` containers anchor their pod's namespaces.
    pub(crate) fn create_with(&self, mut spec: ContainerSpec, infra: bool) -> Result<Container> {
        spec.validate()?;
        let image = self.lookup_image(&spec.image)?;
        let pod = spec
            .pod
            .as_deref()
            .map(|p| self.store.resolve_pod(p))
            .transpose()?;

        let namespaces = if infra {
            NamespaceKind::ALL
                .into_iter()
                .map(|k| (k, NamespaceMode::Private))
                .collect()
        } else {
            resolve_namespaces(&spec.namespaces, pod.as_ref(), &self.store)?
        };

        let name = match &spec.name {
            Some(name) if self.store.name_in_use(name)? => {
                return Err(Error::NameConflict(name.clone()));
            }
            Some(name) => name.clone(),
            None => self.store.generate_name()?,
        };
        let supervisor = self.supervisors.default_supervisor()?;

        apply_image_defaults(&mut spec, &image);
        spec.name = Some(name.clone());
        spec.pod = pod.as_ref().map(|p| p.id.clone());

        let id = generate_id();
        let container = Container {
            id: id.clone(),
            name,
            spec,
            image_id: image.id.clone(),
            image_name: image.display_name(),
            pod_id: pod.map(|p| p.id),
            is_infra: infra,
            namespaces,
            created_at: Utc::now(),
            runtime: supervisor.name().to_string(),
            state: ContainerState::default(),
        };

        self.storage.create_container(&id)?;
        if let Err(e) = self.store.insert_container(container.clone()) {
            if let Err(cleanup) = self.storage.remove_container(&id, true) {
                warn!(container = %id, error = %cleanup, "failed to clean up storage");
            }
            return Err(e);
        }
        self.record(EventStatus::Create, &container);
        info!(container = %container.id, name = %container.name, "created container");
        Ok(container)
    }

    // =========================================================================
    // Init / Start
    // =========================================================================

    /// Prepares the process without starting it.
    #[instrument(skip(self))]
    pub async fn init(&self, reference: &str) -> Result<Container> {
        let id = self.store.resolve_container(reference)?.id;
        let _guard = self.lock(&id).await?;
        let mut container = self.store.get_container(&id)?;
        if !container.status().can_init() {
            return Err(Error::invalid_state(&id, container.status(), "init"));
        }
        let supervisor = self.supervisor(&container)?;
        self.prepare(&mut container, &supervisor).await?;
        Ok(container)
    }

    /// Starts a container and returns its updated record.
    #[instrument(skip(self))]
    pub async fn start(&self, reference: &str) -> Result<Container> {
        let id = self.store.resolve_container(reference)?.id;
        let _guard = self.lock(&id).await?;
        let mut container = self.store.get_container(&id)?;
        self.start_locked(&mut container).await?;
        Ok(container)
    }

    fn start_boxed(&self, id: String) -> BoxFuture<'_, Result<Container>> {
        Box::pin(async move { self.start(&id).await })
    }

    pub(crate) async fn start_locked(&self, container: &mut Container) -> Result<()> {
        if !container.status().can_start() {
            return Err(Error::invalid_state(
                &container.id,
                container.status(),
                "start",
            ));
        }
        let supervisor = self.supervisor(container)?;
        if container.status() != ContainerStatus::Initialized {
            self.prepare(container, &supervisor).await?;
        }

        let pid = match supervisor.start(&container.id).await {
            Ok(pid) => pid,
            Err(e) => {
                container.state.error = Some(e.to_string());
                if let Err(update) = self.store.update_container(container) {
                    warn!(container = %container.id, error = %update, "failed to record start error");
                }
                return Err(e);
            }
        };
        container.state.mark_running(pid);
        self.store.update_container(container)?;
        self.record(EventStatus::Start, container);
        info!(container = %container.id, pid, "started container");
        self.spawn_exit_watcher(container.id.clone(), supervisor, pid);
        Ok(())
    }

    /// Mounts the rootfs, writes the bundle and creates the process.
    async fn prepare(
        &self,
        container: &mut Container,
        supervisor: &Arc<dyn ProcessSupervisor>,
    ) -> Result<()> {
        if container.status().is_terminated()
            && let Err(e) = supervisor.delete(&container.id, true).await
            && !e.is_not_found()
        {
            return Err(e);
        }

        let bundle = self.write_bundle(container).await?;
        if let Err(e) = supervisor.create(&container.id, &bundle).await {
            container.state.error = Some(e.to_string());
            if let Err(unmount) = self.storage.unmount(&container.id, RUNTIME_HOLDER) {
                warn!(container = %container.id, error = %unmount, "failed to unmount after create failure");
            }
            if let Err(update) = self.store.update_container(container) {
                warn!(container = %container.id, error = %update, "failed to record create error");
            }
            return Err(e);
        }

        container.state.status = ContainerStatus::Initialized;
        container.state.error = None;
        self.store.update_container(container)?;
        self.record(EventStatus::Init, container);
        debug!(container = %container.id, bundle = %bundle.display(), "initialized container");
        Ok(())
    }

    /// Writes `config.json` into the container's userdata directory.
    pub(crate) async fn write_bundle(&self, container: &Container) -> Result<PathBuf> {
        let join_paths = self.namespace_joins(container).await?;
        let pod = container
            .pod_id
            .as_deref()
            .map(|p| self.store.get_pod(p))
            .transpose()?;
        let hostname = pod
            .filter(|_| container.namespace(NamespaceKind::Uts) == NamespaceMode::Pod)
            .map(|p| p.spec.hostname.clone().unwrap_or(p.name));

        let image = self.storage.images().lookup(&container.image_id)?;
        let rootfs = self.storage.mount(&container.id, &image, RUNTIME_HOLDER)?;
        let ctx = BundleContext {
            rootfs,
            join_paths,
            hostname,
        };
        let userdata = self.storage.userdata(&container.id);
        write_config(&userdata, &generate_oci_spec(container, &ctx))?;
        Ok(userdata)
    }

    /// Join paths for every namespace owned by another container, starting
    /// that container first when it is not running.
    async fn namespace_joins(&self, container: &Container) -> Result<HashMap<NamespaceKind, PathBuf>> {
        let anchor = match &container.pod_id {
            Some(pod_id) => self
                .store
                .get_pod(pod_id)?
                .anchor()
                .filter(|a| *a != container.id)
                .map(str::to_string),
            None => None,
        };

        let mut joins = HashMap::new();
        for kind in NamespaceKind::ALL {
            let target = match container.namespace(kind) {
                NamespaceMode::Pod => anchor.clone(),
                NamespaceMode::Container(id) => Some(id),
                _ => None,
            };
            let Some(target) = target else { continue };
            let pid = self.ensure_running(&target).await?;
            joins.insert(kind, namespace_path(pid, kind));
        }
        Ok(joins)
    }

    /// PID of a dependency, starting it if needed.
    async fn ensure_running(&self, id: &str) -> Result<u32> {
        let dependency = self.store.get_container(id)?;
        if dependency.status().is_active()
            && let Some(pid) = dependency.state.pid
        {
            return Ok(pid);
        }
        debug!(dependency = %id, "starting namespace dependency");
        let started = self.start_boxed(id.to_string()).await?;
        started
            .state
            .pid
            .ok_or_else(|| Error::invalid_state(id, started.status(), "join namespace"))
    }

    // =========================================================================
    // Exit Handling
    // =========================================================================

    pub(crate) fn spawn_exit_watcher(&self, id: String, supervisor: Arc<dyn ProcessSupervisor>, pid: u32) {
        let manager = self.clone();
        tokio::spawn(async move {
            match supervisor.wait(&id).await {
                Ok(code) => manager.handle_exit(&id, pid, code).await,
                Err(e) => debug!(container = %id, error = %e, "exit watcher ended"),
            }
        });
    }

    /// Records a process exit observed by the watcher.
    ///
    /// Ignored unless the record still shows the same live process: stop,
    /// kill and checkpoint update the record themselves.
    async fn handle_exit(&self, id: &str, pid: u32, code: Option<i32>) {
        let auto_remove = {
            let _guard = match self.lock(id).await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(container = %id, error = %e, "failed to lock container for exit");
                    return;
                }
            };
            let Ok(mut container) = self.store.get_container(id) else {
                return;
            };
            if !container.status().is_active() || container.state.pid != Some(pid) {
                return;
            }
            let status = if container.state.stopped_by_user {
                ContainerStatus::Stopped
            } else {
                ContainerStatus::Exited
            };
            if let Err(e) = self.finish_exit(&mut container, status, code) {
                warn!(container = %id, error = %e, "failed to record exit");
                return;
            }
            info!(container = %id, ?code, "container exited");

            if self.should_restart(&container, code) {
                container.state.restart_count += 1;
                if let Err(e) = self.start_locked(&mut container).await {
                    warn!(container = %id, error = %e, "restart policy failed to restart container");
                } else {
                    self.record(EventStatus::Restart, &container);
                }
                false
            } else {
                container.spec.auto_remove
            }
        };

        if auto_remove
            && let Err(e) = self.remove(id, RemoveOptions::default()).await
        {
            warn!(container = %id, error = %e, "failed to auto-remove container");
        }
    }

    fn should_restart(&self, container: &Container, code: Option<i32>) -> bool {
        if container.state.stopped_by_user {
            return false;
        }
        let cap = self.config.restart_retries;
        let count = container.state.restart_count;
        match container.spec.restart_policy {
            RestartPolicy::No => false,
            RestartPolicy::Always | RestartPolicy::UnlessStopped => count < cap,
            RestartPolicy::OnFailure { max_retries } => {
                code.is_some_and(|c| c != 0) && count < max_retries.unwrap_or(cap)
            }
        }
    }

    /// Moves a container whose process is gone to `status`.
    pub(crate) fn finish_exit(
        &self,
        container: &mut Container,
        status: ContainerStatus,
        code: Option<i32>,
    ) -> Result<()> {
        container.state.mark_terminated(status, code);
        if let Err(e) = self.storage.unmount(&container.id, RUNTIME_HOLDER) {
            warn!(container = %container.id, error = %e, "failed to unmount rootfs");
        }
        self.store.update_container(container)?;
        let mut died = Event::container(EventStatus::Died, container);
        if let Some(code) = code {
            died = died.with_attribute("containerExitCode", code);
        }
        self.events.record(died);
        Ok(())
    }

    pub(crate) async fn wait_exit(
        &self,
        supervisor: &Arc<dyn ProcessSupervisor>,
        id: &str,
        limit: Duration,
    ) -> Result<Option<i32>> {
        tokio::time::timeout(limit, supervisor.wait(id))
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("wait for {id} to exit"),
                duration: limit,
            })?
    }

    // =========================================================================
    // Stop / Kill
    // =========================================================================

    /// Stops a container: stop signal, then SIGKILL after the timeout.
    ///
    /// Stopping a stopped or exited container succeeds without doing anything.
    #[instrument(skip(self))]
    pub async fn stop(&self, reference: &str, timeout: Option<u64>) -> Result<Container> {
        let id = self.store.resolve_container(reference)?.id;
        let _guard = self.lock(&id).await?;
        let mut container = self.store.get_container(&id)?;
        self.stop_locked(&mut container, timeout.map(Duration::from_secs))
            .await?;
        Ok(container)
    }

    pub(crate) async fn stop_locked(
        &self,
        container: &mut Container,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let status = container.status();
        if status.is_terminated() {
            return Ok(());
        }
        if !status.is_active() {
            return Err(Error::invalid_state(&container.id, status, "stop"));
        }
        let supervisor = self.supervisor(container)?;
        let id = container.id.clone();
        let timeout =
            timeout.unwrap_or_else(|| container.stop_timeout(self.config.stop_timeout()));

        let code = if status == ContainerStatus::Paused {
            supervisor.kill(&id, Signal::Kill, true).await?;
            if let Err(e) = supervisor.resume(&id).await {
                debug!(container = %id, error = %e, "resume after kill");
            }
            self.wait_exit(&supervisor, &id, RUNTIME_CALL_TIMEOUT).await?
        } else if timeout.is_zero() {
            supervisor.kill(&id, Signal::Kill, true).await?;
            self.wait_exit(&supervisor, &id, RUNTIME_CALL_TIMEOUT).await?
        } else {
            let signal = container.spec.stop_signal.unwrap_or(Signal::Term);
            supervisor.kill(&id, signal, false).await?;
            match tokio::time::timeout(timeout, supervisor.wait(&id)).await {
                Ok(code) => code?,
                Err(_) => {
                    warn!(container = %id, ?timeout, "stop timed out, sending SIGKILL");
                    supervisor.kill(&id, Signal::Kill, true).await?;
                    self.wait_exit(&supervisor, &id, RUNTIME_CALL_TIMEOUT).await?
                }
            }
        };

        container.state.stopped_by_user = true;
        self.finish_exit(container, ContainerStatus::Stopped, code)?;
        self.record(EventStatus::Stop, container);
        info!(container = %id, ?code, "stopped container");
        Ok(())
    }

    /// Sends a signal without a grace period.
    #[instrument(skip(self))]
    pub async fn kill(&self, reference: &str, signal: Signal) -> Result<Container> {
        let id = self.store.resolve_container(reference)?.id;
        let _guard = self.lock(&id).await?;
        let mut container = self.store.get_container(&id)?;
        self.kill_locked(&mut container, signal).await?;
        Ok(container)
    }

    pub(crate) async fn kill_locked(&self, container: &mut Container, signal: Signal) -> Result<()> {
        match container.status() {
            ContainerStatus::Running => {}
            ContainerStatus::Paused if self.config.kill_paused == KillPausedPolicy::Allow => {}
            other => return Err(Error::invalid_state(&container.id, other, "kill")),
        }
        let supervisor = self.supervisor(container)?;
        supervisor.kill(&container.id, signal, false).await?;
        if signal.terminates_by_default() {
            container.state.stopped_by_user = true;
        }
        self.events.record(
            Event::container(EventStatus::Kill, container).with_attribute("signal", signal.as_i32()),
        );
        debug!(container = %container.id, %signal, "signalled container");

        let gone = supervisor
            .state(&container.id)
            .await
            .map(|s| s.live_pid().is_none())
            .unwrap_or(false);
        if gone {
            let code = self
                .wait_exit(&supervisor, &container.id, RUNTIME_CALL_TIMEOUT)
                .await?;
            let status = if container.state.stopped_by_user {
                ContainerStatus::Stopped
            } else {
                ContainerStatus::Exited
            };
            self.finish_exit(container, status, code)?;
        } else {
            self.store.update_container(container)?;
        }
        Ok(())
    }

    // =========================================================================
    // Pause / Unpause / Restart
    // =========================================================================

    /// Freezes a running container. Pausing a paused container is an error.
    #[instrument(skip(self))]
    pub async fn pause(&self, reference: &str) -> Result<Container> {
        let id = self.store.resolve_container(reference)?.id;
        let _guard = self.lock(&id).await?;
        let mut container = self.store.get_container(&id)?;
        self.pause_locked(&mut container).await?;
        Ok(container)
    }

    pub(crate) async fn pause_locked(&self, container: &mut Container) -> Result<()> {
        if container.status() != ContainerStatus::Running {
            return Err(Error::invalid_state(
                &container.id,
                container.status(),
                "pause",
            ));
        }
        self.supervisor(container)?.pause(&container.id).await?;
        container.state.status = ContainerStatus::Paused;
        self.store.update_container(container)?;
        self.record(EventStatus::Pause, container);
        info!(container = %container.id, "paused container");
        Ok(())
    }

    /// Thaws a paused container.
    #[instrument(skip(self))]
    pub async fn unpause(&self, reference: &str) -> Result<Container> {
        let id = self.store.resolve_container(reference)?.id;
        let _guard = self.lock(&id).await?;
        let mut container = self.store.get_container(&id)?;
        self.unpause_locked(&mut container).await?;
        Ok(container)
    }

    pub(crate) async fn unpause_locked(&self, container: &mut Container) -> Result<()> {
        if container.status() != ContainerStatus::Paused {
            return Err(Error::invalid_state(
                &container.id,
                container.status(),
                "unpause",
            ));
        }
        let supervisor = self.supervisor(container)?;
        supervisor.resume(&container.id).await?;
        container.state.status = ContainerStatus::Running;
        self.store.update_container(container)?;
        self.record(EventStatus::Unpause, container);
        info!(container = %container.id, "unpaused container");

        // Signals queued while frozen may have ended the process.
        let gone = supervisor
            .state(&container.id)
            .await
            .map(|s| s.live_pid().is_none())
            .unwrap_or(false);
        if gone {
            let code = self
                .wait_exit(&supervisor, &container.id, RUNTIME_CALL_TIMEOUT)
                .await?;
            let status = if container.state.stopped_by_user {
                ContainerStatus::Stopped
            } else {
                ContainerStatus::Exited
            };
            self.finish_exit(container, status, code)?;
        }
        Ok(())
    }

    /// Stops the container if it runs, then starts it again.
    #[instrument(skip(self))]
    pub async fn restart(&self, reference: &str, timeout: Option<u64>) -> Result<Container> {
        let id = self.store.resolve_container(reference)?.id;
        let _guard = self.lock(&id).await?;
        let mut container = self.store.get_container(&id)?;
        if container.status().is_active() {
            self.stop_locked(&mut container, timeout.map(Duration::from_secs))
                .await?;
        }
        self.start_locked(&mut container).await?;
        self.record(EventStatus::Restart, &container);
        Ok(container)
    }

    // =========================================================================
    // Wait / Attach
    // =========================================================================

    /// Blocks until the container reaches one of `conditions` (default:
    /// stopped or exited). Returns the exit code, or -1 for non-terminal
    /// conditions.
    #[instrument(skip(self))]
    pub async fn wait(
        &self,
        reference: &str,
        conditions: &[ContainerStatus],
        timeout: Option<Duration>,
    ) -> Result<i32> {
        let id = self.store.resolve_container(reference)?.id;
        let conditions: &[ContainerStatus] = if conditions.is_empty() {
            &[ContainerStatus::Stopped, ContainerStatus::Exited]
        } else {
            conditions
        };
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut changes = self.events.watch();

        loop {
            let _ = changes.borrow_and_update();
            let container = self.store.get_container(&id)?;
            let status = container.status();
            if conditions.contains(&status) {
                if !status.is_terminated() {
                    return Ok(-1);
                }
                return container.state.exit_code.ok_or_else(|| {
                    Error::NotSupported(format!(
                        "runtime {} did not report the exit status of {id}",
                        container.runtime
                    ))
                });
            }
            let changed = changes.changed();
            let woke = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, changed)
                    .await
                    .map_err(|_| Error::Timeout {
                        operation: format!("wait for {id}"),
                        duration: timeout.unwrap_or_default(),
                    })?,
                None => changed.await,
            };
            woke.map_err(|_| Error::Internal("event bus closed".to_string()))?;
        }
    }

    /// Streams the container's output into `output` until the process exits.
    ///
    /// Signals arriving on `signals` are forwarded when `sig_proxy` is set.
    /// Without it, the first signal detaches the session and the container
    /// keeps running.
    pub async fn attach(
        &self,
        reference: &str,
        sig_proxy: bool,
        output: &mut (dyn Write + Send),
        mut signals: mpsc::Receiver<Signal>,
    ) -> Result<AttachOutcome> {
        let container = self.store.resolve_container(reference)?;
        let supervisor = self.supervisor(&container)?;
        let mut stream = supervisor.attach(&container.id).await?;
        self.record(EventStatus::Attach, &container);

        let mut signals_open = true;
        loop {
            tokio::select! {
                chunk = stream.recv() => match chunk {
                    Some(data) => {
                        output.write_all(&data)?;
                        output.flush()?;
                    }
                    None => break,
                },
                signal = signals.recv(), if signals_open => match signal {
                    Some(signal) if sig_proxy && signal.is_proxyable() => {
                        debug!(container = %container.id, %signal, "forwarding signal");
                        if let Err(e) = self.kill(&container.id, signal).await {
                            debug!(container = %container.id, error = %e, "signal not delivered");
                        }
                    }
                    Some(signal) if sig_proxy => {
                        debug!(container = %container.id, %signal, "signal not proxyable");
                    }
                    Some(signal) => {
                        debug!(container = %container.id, %signal, "sig-proxy disabled, detaching");
                        return Ok(AttachOutcome::Detached);
                    }
                    None => signals_open = false,
                },
            }
        }

        let code = self.wait(&container.id, &[], None).await?;
        Ok(AttachOutcome::Exited(code))
    }

    // =========================================================================
    // Mount / Remove
    // =========================================================================

    /// Mounts the rootfs for the user and returns its path.
    #[instrument(skip(self))]
    pub async fn mount(&self, reference: &str) -> Result<PathBuf> {
        let id = self.store.resolve_container(reference)?.id;
        let _guard = self.lock(&id).await?;
        let container = self.store.get_container(&id)?;
        if container.status() == ContainerStatus::Removing {
            return Err(Error::invalid_state(&id, container.status(), "mount"));
        }
        let image = self.storage.images().lookup(&container.image_id)?;
        let path = self.storage.mount(&id, &image, USER_HOLDER)?;
        self.record(EventStatus::Mount, &container);
        Ok(path)
    }

    /// Drops the user's mount. `force` also drops the runtime's mount of a
    /// container that is not running. Returns the remaining mount count.
    #[instrument(skip(self))]
    pub async fn unmount(&self, reference: &str, force: bool) -> Result<u32> {
        let id = self.store.resolve_container(reference)?.id;
        let _guard = self.lock(&id).await?;
        let container = self.store.get_container(&id)?;
        let mut remaining = self.storage.unmount(&id, USER_HOLDER)?;
        if force && !container.status().is_active() {
            remaining = self.storage.unmount(&id, RUNTIME_HOLDER)?;
        }
        self.record(EventStatus::Unmount, &container);
        Ok(remaining)
    }

    /// Removes a container and its storage.
    ///
    /// Re-running an interrupted removal completes it.
    #[instrument(skip(self, options))]
    pub async fn remove(&self, reference: &str, options: RemoveOptions) -> Result<String> {
        let id = self.store.resolve_container(reference)?.id;
        let _guard = self.lock(&id).await?;
        let mut container = self.store.get_container(&id)?;

        if container.is_infra
            && let Some(pod_id) = &container.pod_id
            && self.store.get_pod(pod_id).is_ok()
        {
            return Err(Error::invalid_state(
                &id,
                container.status(),
                "remove the infra container of an existing pod",
            ));
        }
        let dependents: Vec<String> = self
            .store
            .containers()?
            .into_iter()
            .filter(|c| {
                c.namespaces
                    .values()
                    .any(|m| *m == NamespaceMode::Container(id.clone()))
            })
            .map(|c| c.name)
            .collect();
        if !dependents.is_empty() {
            return Err(Error::invalid_state(
                &id,
                container.status(),
                format!("remove (dependent containers: {})", dependents.join(", ")),
            ));
        }

        let status = container.status();
        if status.is_active() && !options.force {
            return Err(Error::invalid_state(&id, status, "remove"));
        }
        let external = self.storage.external_mounts(&id);
        if external > 0 && !options.force {
            return Err(Error::MountBusy {
                id: id.clone(),
                count: external,
            });
        }

        if status.is_active() {
            self.stop_locked(&mut container, options.timeout.map(Duration::from_secs))
                .await?;
        }
        self.release(&mut container).await?;
        self.store.remove_container(&id)?;
        self.record(EventStatus::Remove, &container);
        info!(container = %id, "removed container");
        Ok(id)
    }

    /// Deletes the process and storage of a container, leaving its record in
    /// `removing`.
    pub(crate) async fn release(&self, container: &mut Container) -> Result<()> {
        container.state.status = ContainerStatus::Removing;
        self.store.update_container(container)?;
        match self.supervisor(container) {
            Ok(supervisor) => {
                if let Err(e) = supervisor.delete(&container.id, true).await
                    && !e.is_not_found()
                {
                    warn!(container = %container.id, error = %e, "runtime delete failed");
                }
            }
            Err(e) => warn!(container = %container.id, error = %e, "runtime unavailable during removal"),
        }
        self.storage.remove_container(&container.id, true)
    }

    /// Removes every container that is not running. Returns their IDs.
    pub async fn prune(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for container in self.store.containers()? {
            if container.is_infra || container.status().is_active() {
                continue;
            }
            match self.remove(&container.id, RemoveOptions::default()).await {
                Ok(id) => removed.push(id),
                Err(e) => warn!(container = %container.id, error = %e, "prune skipped container"),
            }
        }
        Ok(removed)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Lists containers matching `filters`.
    pub fn list(&self, filters: &[Filter]) -> Result<Vec<Container>> {
        self.store.list_containers(filters)
    }

    /// Inspect documents in the order of `references`.
    pub fn inspect(&self, references: &[String]) -> Result<Vec<ContainerInspect>> {
        references
            .iter()
            .map(|reference| {
                let container = self.store.resolve_container(reference)?;
                let pod = container
                    .pod_id
                    .as_deref()
                    .and_then(|p| self.store.get_pod(p).ok());
                Ok(inspect::container(&container, pod.as_ref()))
            })
            .collect()
    }

    /// Live resource usage; zero for containers without a process.
    pub async fn usage(&self, container: &Container) -> Result<ResourceUsage> {
        if !container.status().is_active() {
            return Ok(ResourceUsage::default());
        }
        self.supervisor(container)?.stats(&container.id).await
    }

    /// Host PIDs of a running container.
    pub async fn processes(&self, container: &Container) -> Result<Vec<u32>> {
        if !container.status().is_active() {
            return Err(Error::invalid_state(
                &container.id,
                container.status(),
                "list processes",
            ));
        }
        let supervisor = self.supervisor(container)?;
        match supervisor.processes(&container.id).await {
            Ok(pids) => Ok(pids),
            Err(Error::NotSupported(_)) => Ok(supervisor
                .state(&container.id)
                .await?
                .live_pid()
                .into_iter()
                .collect()),
            Err(e) => Err(e),
        }
    }

    /// Marks containers whose process vanished (engine restart) as exited.
    pub async fn reconcile(&self) -> Result<()> {
        for container in self.store.containers()? {
            if !container.status().is_active() {
                continue;
            }
            let _guard = self.lock(&container.id).await?;
            let Ok(mut current) = self.store.get_container(&container.id) else {
                continue;
            };
            let live = match self.supervisor(&current) {
                Ok(supervisor) => supervisor
                    .state(&current.id)
                    .await
                    .ok()
                    .and_then(|s| s.live_pid()),
                Err(_) => None,
            };
            match live {
                Some(pid) if current.state.pid == Some(pid) => {}
                _ => {
                    warn!(container = %current.id, "process no longer exists, marking exited");
                    let code = current.state.exit_code;
                    self.finish_exit(&mut current, ContainerStatus::Exited, code)?;
                }
            }
        }
        Ok(())
    }
}

/// Fills unset entrypoint, command, env and working directory from the image.
fn apply_image_defaults(spec: &mut ContainerSpec, image: &Image) {
    let config = &image.config;
    if spec.entrypoint.is_empty() {
        spec.entrypoint = config.entrypoint.clone();
    }
    if spec.command.is_empty() {
        spec.command = config.cmd.clone();
    }
    for entry in &config.env {
        if let Some((key, value)) = entry.split_once('=') {
            spec.env
                .entry(key.to_string())
                .or_insert_with(|| value.to_string());
        }
    }
    if spec.working_dir.is_none() {
        spec.working_dir = config.working_dir.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageConfig;

    #[test]
    fn test_image_defaults_do_not_override() {
        let image = Image {
            id: "f".repeat(64),
            names: vec!["localhost/alpine:latest".to_string()],
            layers: Vec::new(),
            config: ImageConfig {
                entrypoint: Vec::new(),
                cmd: vec!["/bin/sh".to_string()],
                env: vec!["PATH=/bin".to_string(), "LANG=C".to_string()],
                working_dir: Some("/srv".to_string()),
                labels: Default::default(),
            },
            annotations: Default::default(),
            created: Utc::now(),
        };
        let mut spec = ContainerSpec::new("alpine").with_command(["top"]);
        spec.env.insert("LANG".to_string(), "en_US".to_string());
        apply_image_defaults(&mut spec, &image);
        assert_eq!(spec.command, vec!["top"]);
        assert_eq!(spec.env["LANG"], "en_US");
        assert_eq!(spec.env["PATH"], "/bin");
        assert_eq!(spec.working_dir.as_deref(), Some("/srv"));
    }
}

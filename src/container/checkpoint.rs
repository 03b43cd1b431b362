//! Checkpoint and restore.
//!
//! ## On-Disk Layout
//!
//! ```text
//!   <root>/overlay-containers/<id>/userdata/
//!   ├── config.json      OCI bundle
//!   ├── config.dump      container record at checkpoint time
//!   ├── spec.dump        copy of config.json
//!   ├── dump.log         checkpoint log
//!   ├── restore.log      restore log
//!   └── checkpoint/      process images
//! ```
//!
//! A checkpoint image is the container's base image plus one layer holding
//! `checkpoint/`, `config.dump` and `spec.dump`. Restoring from such an
//! image creates a new container; restoring a container restores it in
//! place.

use crate::bundle::{LayerFile, extract_layer, pack_directory};
use crate::constants::{
    ANNOTATION_CHECKPOINT_NAME, ANNOTATION_CHECKPOINT_RAW_IMAGE, ANNOTATION_CHECKPOINT_ROOTFS_ID,
    ANNOTATION_CHECKPOINT_ROOTFS_NAME, ANNOTATION_CHECKPOINT_RUNTIME, BUNDLE_CONFIG_FILE,
    CHECKPOINT_DIR, CONFIG_DUMP_FILE, SPEC_DUMP_FILE,
};
use crate::container::manager::ContainerManager;
use crate::container::spec::{ContainerSpec, NamespaceMode};
use crate::container::state::{Container, ContainerState, ContainerStatus};
use crate::error::{Error, Result};
use crate::events::{Event, EventStatus};
use crate::image::{Image, normalize_reference};
use crate::pod::resolve_namespaces;
use crate::runtime::{CheckpointRequest, RestoreRequest};
use crate::storage::RUNTIME_HOLDER;
use crate::store::generate_id;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// Statistics file CRIU leaves next to the dump.
const STATS_DUMP_FILE: &str = "stats-dump";

/// Options for `container checkpoint`.
#[derive(Debug, Clone, Default)]
pub struct CheckpointOptions {
    /// Keep `config.dump`, `spec.dump` and the statistics file.
    pub keep: bool,
    /// Leave the process running after the dump.
    pub leave_running: bool,
    /// Also commit the checkpoint as an image with this name.
    pub create_image: Option<String>,
    pub tcp_established: bool,
    pub file_locks: bool,
}

/// Options for `container restore`.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Name of the restored container (checkpoint images only).
    pub name: Option<String>,
    /// Keep the checkpoint files after restoring.
    pub keep: bool,
    /// Pod to restore into (checkpoint images only).
    pub pod: Option<String>,
    /// Drop static IP and MAC addresses from the network attachments.
    pub ignore_static_ip: bool,
    pub tcp_established: bool,
    pub file_locks: bool,
}

impl ContainerManager {
    // =========================================================================
    // Checkpoint
    // =========================================================================

    /// Dumps a running container. Unless `leave_running`, the container ends
    /// up `stopped` with `checkpointed` set.
    #[instrument(skip(self, options))]
    pub async fn checkpoint(&self, reference: &str, options: CheckpointOptions) -> Result<Container> {
        let id = self.store.resolve_container(reference)?.id;
        let _guard = self.lock(&id).await?;
        let mut container = self.store.get_container(&id)?;

        if container.status() != ContainerStatus::Running {
            return Err(Error::invalid_state(&id, container.status(), "checkpoint"));
        }
        if container.spec.auto_remove {
            return Err(Error::InvalidSpec(format!(
                "cannot checkpoint {}: container was created with auto-remove",
                container.name
            )));
        }
        let supervisor = self.supervisor(&container)?;
        supervisor.probe_checkpoint().await?;
        let image_target = match &options.create_image {
            Some(name) => Some((
                normalize_reference(name)?,
                self.storage.images().lookup(&container.image_id)?,
            )),
            None => None,
        };

        let userdata = self.storage.userdata(&id);
        let checkpoint_dir = self.storage.checkpoint_dir(&id);
        let config_dump = serde_json::to_vec_pretty(&container)?;
        let spec_dump = std::fs::read(userdata.join(BUNDLE_CONFIG_FILE))?;
        std::fs::write(userdata.join(CONFIG_DUMP_FILE), &config_dump)?;
        std::fs::write(userdata.join(SPEC_DUMP_FILE), &spec_dump)?;
        if checkpoint_dir.exists() {
            std::fs::remove_dir_all(&checkpoint_dir)?;
        }

        let request = CheckpointRequest {
            image_path: checkpoint_dir.clone(),
            work_path: userdata.clone(),
            leave_running: options.leave_running,
            tcp_established: options.tcp_established,
            file_locks: options.file_locks,
        };
        if let Err(e) = supervisor.checkpoint(&id, &request).await {
            remove_files(&userdata, &[CONFIG_DUMP_FILE, SPEC_DUMP_FILE]);
            return Err(e);
        }

        if !options.leave_running {
            container.state.mark_terminated(ContainerStatus::Stopped, Some(0));
            container.state.stopped_by_user = true;
            if let Err(e) = self.storage.unmount(&id, RUNTIME_HOLDER) {
                warn!(container = %id, error = %e, "failed to unmount rootfs");
            }
        }
        container.state.checkpointed = true;
        container.state.checkpointed_at = Some(Utc::now());
        container.state.checkpoint_path = Some(checkpoint_dir.clone());
        container.state.checkpoint_log = Some(self.storage.dump_log(&id));
        self.store.update_container(&container)?;

        // A failed commit leaves the checkpoint itself in place.
        let committed = image_target.map(|(name, base)| {
            let extra = [
                LayerFile::regular(CONFIG_DUMP_FILE, config_dump),
                LayerFile::regular(SPEC_DUMP_FILE, spec_dump),
            ];
            self.commit_checkpoint(&container, &name, &base, &checkpoint_dir, &extra)
        });
        if !options.keep {
            remove_files(&userdata, &[CONFIG_DUMP_FILE, SPEC_DUMP_FILE, STATS_DUMP_FILE]);
        }
        self.record(EventStatus::Checkpoint, &container);
        info!(container = %id, leave_running = options.leave_running, "checkpointed container");

        if let Some(committed) = committed {
            let image = committed?;
            self.events.record(Event::image(EventStatus::Commit, &image));
        }
        Ok(container)
    }

    fn commit_checkpoint(
        &self,
        container: &Container,
        name: &str,
        base: &Image,
        checkpoint_dir: &Path,
        extra: &[LayerFile],
    ) -> Result<Image> {
        let layer = pack_directory(checkpoint_dir, CHECKPOINT_DIR, extra)?;
        let annotations = BTreeMap::from([
            (ANNOTATION_CHECKPOINT_NAME.to_string(), container.name.clone()),
            (ANNOTATION_CHECKPOINT_RUNTIME.to_string(), container.runtime.clone()),
            (ANNOTATION_CHECKPOINT_ROOTFS_ID.to_string(), base.id.clone()),
            (ANNOTATION_CHECKPOINT_ROOTFS_NAME.to_string(), container.image_name.clone()),
            (ANNOTATION_CHECKPOINT_RAW_IMAGE.to_string(), container.spec.image.clone()),
        ]);
        self.storage
            .images()
            .commit(Some(name), base, &layer, annotations)
    }

    // =========================================================================
    // Restore
    // =========================================================================

    /// Restores a checkpoint. `reference` names either a checkpoint image,
    /// which yields a new container, or a checkpointed container.
    #[instrument(skip(self, options))]
    pub async fn restore(&self, reference: &str, options: RestoreOptions) -> Result<Container> {
        if let Ok(image) = self.storage.images().lookup(reference)
            && image.annotations.contains_key(ANNOTATION_CHECKPOINT_NAME)
        {
            return self.restore_image(&image, &options).await;
        }

        if options.name.is_some() || options.pod.is_some() {
            return Err(Error::InvalidSpec(
                "--name and --pod require a checkpoint image".to_string(),
            ));
        }
        let id = self.store.resolve_container(reference)?.id;
        let _guard = self.lock(&id).await?;
        let mut container = self.store.get_container(&id)?;
        if !container.state.checkpointed || !container.status().is_terminated() {
            return Err(Error::invalid_state(&id, container.status(), "restore"));
        }
        self.restore_locked(&mut container, &options).await?;
        Ok(container)
    }

    /// Brings a checkpointed record back to `running`.
    async fn restore_locked(&self, container: &mut Container, options: &RestoreOptions) -> Result<()> {
        let id = container.id.clone();
        let supervisor = self.supervisor(container)?;
        supervisor.probe_checkpoint().await?;

        let bundle = self.write_bundle(container).await?;
        if let Err(e) = supervisor.delete(&id, true).await
            && !e.is_not_found()
        {
            debug!(container = %id, error = %e, "stale runtime state");
        }
        let request = RestoreRequest {
            image_path: self.storage.checkpoint_dir(&id),
            work_path: bundle.clone(),
            tcp_established: options.tcp_established,
            file_locks: options.file_locks,
        };
        let pid = match supervisor.restore(&id, &bundle, &request).await {
            Ok(pid) => pid,
            Err(e) => {
                if let Err(unmount) = self.storage.unmount(&id, RUNTIME_HOLDER) {
                    warn!(container = %id, error = %unmount, "failed to unmount after restore failure");
                }
                container.state.error = Some(e.to_string());
                if let Err(update) = self.store.update_container(container) {
                    warn!(container = %id, error = %update, "failed to record restore error");
                }
                return Err(e);
            }
        };

        container.state.mark_running(pid);
        container.state.restored = true;
        container.state.restored_at = Some(Utc::now());
        container.state.restore_log = Some(self.storage.restore_log(&id));
        if options.keep {
            container.state.checkpointed = true;
            container.state.checkpoint_path = Some(self.storage.checkpoint_dir(&id));
            container.state.checkpoint_log = Some(self.storage.dump_log(&id));
        } else {
            self.discard_checkpoint(container);
        }
        self.store.update_container(container)?;
        self.record(EventStatus::Restore, container);
        info!(container = %id, pid, "restored container");
        self.spawn_exit_watcher(id, supervisor, pid);
        Ok(())
    }

    /// Creates and restores a new container from a checkpoint image.
    async fn restore_image(&self, image: &Image, options: &RestoreOptions) -> Result<Container> {
        let layer = image
            .top_layer()
            .ok_or_else(|| Error::InvalidSpec(format!("image {} has no layers", image.id)))?;
        let data = self.storage.images().layer(layer)?;

        let id = generate_id();
        let userdata = self.storage.create_container(&id)?;
        let container = match self.container_from_dump(&id, image, &data, &userdata, options) {
            Ok(container) => container,
            Err(e) => {
                if let Err(cleanup) = self.storage.remove_container(&id, true) {
                    warn!(container = %id, error = %cleanup, "failed to clean up storage");
                }
                return Err(e);
            }
        };
        if let Err(e) = self.store.insert_container(container.clone()) {
            if let Err(cleanup) = self.storage.remove_container(&id, true) {
                warn!(container = %id, error = %cleanup, "failed to clean up storage");
            }
            return Err(e);
        }
        self.record(EventStatus::Create, &container);

        let _guard = self.lock(&id).await?;
        let mut container = container;
        if let Err(e) = self.restore_locked(&mut container, options).await {
            if let Err(cleanup) = self.release(&mut container).await {
                warn!(container = %id, error = %cleanup, "failed to release restored container");
            }
            if let Err(cleanup) = self.store.remove_container(&id) {
                warn!(container = %id, error = %cleanup, "failed to remove restored record");
            }
            return Err(e);
        }
        Ok(container)
    }

    /// Unpacks a checkpoint layer into `userdata` and builds the new record.
    fn container_from_dump(
        &self,
        id: &str,
        image: &Image,
        layer: &[u8],
        userdata: &Path,
        options: &RestoreOptions,
    ) -> Result<Container> {
        let mut total = 0u64;
        extract_layer(layer, userdata, &mut total)?;
        let dump = std::fs::read(userdata.join(CONFIG_DUMP_FILE)).map_err(|e| {
            Error::InvalidSpec(format!("image {} is not a checkpoint: {}", image.id, e))
        })?;
        let original: Container = serde_json::from_slice(&dump)?;

        let name = options.name.clone().unwrap_or_else(|| original.name.clone());
        if self.store.name_in_use(&name)? {
            return Err(Error::NameConflict(name));
        }
        let pod = options
            .pod
            .as_deref()
            .map(|p| self.store.resolve_pod(p))
            .transpose()?;

        let mut spec: ContainerSpec = original.spec;
        spec.name = Some(name.clone());
        spec.pod = pod.as_ref().map(|p| p.id.clone());
        let requested: Vec<_> = spec
            .namespaces
            .iter()
            .map(|(kind, mode)| (kind, mode.clone()))
            .collect();
        for (kind, mode) in requested {
            let stale = match &mode {
                NamespaceMode::Pod => pod.as_ref().is_none_or(|p| !p.shares(kind)),
                NamespaceMode::Container(target) => self.store.resolve_container(target).is_err(),
                _ => false,
            };
            if stale {
                spec.namespaces.set(kind, NamespaceMode::Default);
            }
        }
        if options.ignore_static_ip {
            for network in &mut spec.networks {
                network.static_ip = None;
                network.static_mac = None;
            }
        }
        let namespaces = resolve_namespaces(&spec.namespaces, pod.as_ref(), &self.store)?;

        let image_id = image
            .annotations
            .get(ANNOTATION_CHECKPOINT_ROOTFS_ID)
            .cloned()
            .unwrap_or(original.image_id);
        let runtime = self.supervisors.default_supervisor()?.name().to_string();

        Ok(Container {
            id: id.to_string(),
            name,
            spec,
            image_id,
            image_name: original.image_name,
            pod_id: pod.map(|p| p.id),
            is_infra: false,
            namespaces,
            created_at: Utc::now(),
            runtime,
            state: ContainerState::default(),
        })
    }

    /// Deletes the process images and logs and clears the checkpoint facts.
    fn discard_checkpoint(&self, container: &mut Container) {
        let id = &container.id;
        let checkpoint_dir = self.storage.checkpoint_dir(id);
        if let Err(e) = std::fs::remove_dir_all(&checkpoint_dir)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(container = %id, error = %e, "failed to remove checkpoint directory");
        }
        let userdata = self.storage.userdata(id);
        remove_files(&userdata, &[CONFIG_DUMP_FILE, SPEC_DUMP_FILE, STATS_DUMP_FILE]);
        if let Some(log) = container.state.checkpoint_log.take() {
            let _ = std::fs::remove_file(log);
        }
        container.state.checkpointed = false;
        container.state.checkpointed_at = None;
        container.state.checkpoint_path = None;
    }
}

fn remove_files(dir: &Path, names: &[&str]) {
    for name in names {
        let path = dir.join(name);
        if let Err(e) = std::fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            debug!(path = %path.display(), error = %e, "failed to remove checkpoint file");
        }
    }
}

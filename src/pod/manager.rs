//! Pod lifecycle manager.
//!
//! Pod-wide operations iterate the members without a pod-wide lock; each
//! member transition takes that container's own lock. Only `pause` is
//! all-or-nothing: a failure unpauses the members already paused.

use crate::bundle::{LayerFile, pack_files};
use crate::constants::INFRA_NAME_SUFFIX;
use crate::container::clone::{CloneOptions, clone_name};
use crate::container::manager::ContainerManager;
use crate::container::spec::{ContainerSpec, NamespaceMode};
use crate::container::state::{Container, ContainerStatus};
use crate::error::{Error, Result};
use crate::events::{Event, EventStatus};
use crate::image::ImageConfig;
use crate::inspect::{self, PodInspect};
use crate::pod::PodReport;
use crate::pod::spec::PodSpec;
use crate::pod::state::{Pod, PodSummary};
use crate::runtime::{ResourceUsage, Signal};
use crate::store::{Filter, generate_id};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// One process of a pod, as reported by `pod top`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PodProcess {
    pub container_id: String,
    pub name: String,
    pub pid: u32,
}

/// Usage of one member container.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MemberUsage {
    pub id: String,
    pub name: String,
    pub usage: ResourceUsage,
}

/// Live usage of a pod's running members.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PodStats {
    pub pod_id: String,
    pub name: String,
    pub containers: Vec<MemberUsage>,
}

impl PodStats {
    /// Sum over all members.
    pub fn total(&self) -> ResourceUsage {
        self.containers
            .iter()
            .fold(ResourceUsage::default(), |mut acc, member| {
                acc.cpu_nanos += member.usage.cpu_nanos;
                acc.memory_bytes += member.usage.memory_bytes;
                acc.memory_limit += member.usage.memory_limit;
                acc.pids += member.usage.pids;
                acc
            })
    }
}

/// Options for `pod clone`.
#[derive(Debug, Clone, Default)]
pub struct PodCloneOptions {
    /// Name of the new pod; `<source>-clone` by default.
    pub name: Option<String>,
    /// Start the new pod.
    pub start: bool,
    /// Remove the source pod and its members afterwards.
    pub destroy: bool,
}

/// Drives pods and their members.
#[derive(Clone)]
pub struct PodManager {
    containers: ContainerManager,
}

impl PodManager {
    pub fn new(containers: ContainerManager) -> Self {
        Self { containers }
    }

    /// Resolves batch targets the same way the container manager does.
    pub fn select(&self, references: &[String], all: bool, latest: bool) -> Result<Vec<String>> {
        let store = &self.containers.store;
        if (all && latest) || ((all || latest) && !references.is_empty()) {
            return Err(Error::InvalidSpec(
                "--all, --latest and pod names are mutually exclusive".to_string(),
            ));
        }
        if latest {
            return Ok(vec![store.latest_pod()?.id]);
        }
        if all {
            return Ok(store.pods()?.into_iter().map(|p| p.id).collect());
        }
        if references.is_empty() {
            return Err(Error::InvalidSpec(
                "at least one pod name or ID must be given".to_string(),
            ));
        }
        Ok(references.to_vec())
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Creates a pod and, unless disabled, its infra container.
    #[instrument(skip(self, spec), fields(name = ?spec.name))]
    pub fn create(&self, spec: PodSpec) -> Result<Pod> {
        spec.validate()?;
        let store = &self.containers.store;
        let name = match &spec.name {
            Some(name) if store.name_in_use(name)? => return Err(Error::NameConflict(name.clone())),
            Some(name) => name.clone(),
            None => store.generate_name()?,
        };

        let pod = Pod {
            id: generate_id(),
            name,
            shared: spec.shared_namespaces(),
            spec,
            infra_id: None,
            members: Vec::new(),
            created_at: Utc::now(),
        };
        store.insert_pod(pod.clone())?;

        if pod.spec.infra
            && let Err(e) = self.create_infra(&pod)
        {
            if let Err(rollback) = store.remove_pod(&pod.id) {
                warn!(pod = %pod.id, error = %rollback, "failed to roll back pod");
            }
            return Err(e);
        }

        let pod = store.get_pod(&pod.id)?;
        self.containers.events.record(Event::pod(EventStatus::Create, &pod));
        info!(pod = %pod.id, name = %pod.name, infra = pod.infra_id.is_some(), "created pod");
        Ok(pod)
    }

    fn create_infra(&self, pod: &Pod) -> Result<Container> {
        let config = &self.containers.config;
        let image = pod
            .spec
            .infra_image
            .clone()
            .unwrap_or_else(|| config.infra_image.clone());
        self.ensure_infra_image(&image)?;

        let mut spec = ContainerSpec::new(image).with_pod(&pod.id);
        spec.name = Some(format!("{}{}", pod.short_id(), INFRA_NAME_SUFFIX));
        spec.entrypoint = config.infra_command.clone();
        spec.hostname = pod.spec.hostname.clone();
        self.containers.create_with(spec, true)
    }

    /// Imports the default infra image on first use.
    fn ensure_infra_image(&self, reference: &str) -> Result<()> {
        let images = self.containers.storage.images();
        let config = &self.containers.config;
        if images.exists(reference) || reference != config.infra_image {
            return Ok(());
        }
        let Some(command) = config.infra_command.first() else {
            return Err(Error::InvalidSpec("infra command is empty".to_string()));
        };
        let layer = pack_files(&[LayerFile::executable(
            command.trim_start_matches('/'),
            b"#!/bin/sh\nexec sleep infinity\n".to_vec(),
        )])?;
        let image_config = ImageConfig {
            entrypoint: config.infra_command.clone(),
            ..ImageConfig::default()
        };
        let image = images.import(reference, &[layer], image_config, BTreeMap::new())?;
        self.containers
            .events
            .record(Event::image(EventStatus::Import, &image));
        debug!(image = %image.id, "imported infra image");
        Ok(())
    }

    /// Creates a container inside a pod.
    #[instrument(skip(self, spec))]
    pub async fn add_member(&self, reference: &str, mut spec: ContainerSpec) -> Result<Container> {
        let pod = self.containers.store.resolve_pod(reference)?;
        let _guard = self.containers.lock(&pod.id).await?;
        spec.pod = Some(pod.id.clone());
        self.containers.create(spec)
    }

    // =========================================================================
    // Start / Stop / Kill / Restart
    // =========================================================================

    /// Starts the infra container, then every member not already running.
    #[instrument(skip(self))]
    pub async fn start(&self, reference: &str) -> Result<PodReport> {
        let (pod, containers) = self.snapshot(reference)?;
        let mut report = PodReport::new(&pod.id);
        for container in infra_first(&pod, containers) {
            if container.status().is_active() {
                report.record(&container.id, Ok(()));
                continue;
            }
            let result = self.containers.start(&container.id).await.map(|_| ());
            report.record(&container.id, result);
        }
        self.containers.events.record(Event::pod(EventStatus::Start, &pod));
        Ok(report)
    }

    /// Stops every member, then the infra container.
    #[instrument(skip(self))]
    pub async fn stop(&self, reference: &str, timeout: Option<u64>) -> Result<PodReport> {
        let (pod, containers) = self.snapshot(reference)?;
        let mut report = PodReport::new(&pod.id);
        for container in infra_last(&pod, containers) {
            if !container.status().is_active() {
                report.record(&container.id, Ok(()));
                continue;
            }
            let result = self.containers.stop(&container.id, timeout).await.map(|_| ());
            report.record(&container.id, result);
        }
        self.containers.events.record(Event::pod(EventStatus::Stop, &pod));
        Ok(report)
    }

    /// Signals every running member, then the infra container.
    #[instrument(skip(self))]
    pub async fn kill(&self, reference: &str, signal: Signal) -> Result<PodReport> {
        let (pod, containers) = self.snapshot(reference)?;
        let mut report = PodReport::new(&pod.id);
        for container in infra_last(&pod, containers) {
            if !container.status().is_active() {
                continue;
            }
            let result = self.containers.kill(&container.id, signal).await.map(|_| ());
            report.record(&container.id, result);
        }
        self.containers.events.record(
            Event::pod(EventStatus::Kill, &pod).with_attribute("signal", signal.as_i32()),
        );
        Ok(report)
    }

    /// Stops then starts every container of the pod.
    #[instrument(skip(self))]
    pub async fn restart(&self, reference: &str, timeout: Option<u64>) -> Result<PodReport> {
        let stopped = self.stop(reference, timeout).await?;
        if !stopped.is_ok() {
            return Ok(stopped);
        }
        let report = self.start(reference).await?;
        let pod = self.containers.store.get_pod(&report.pod_id)?;
        self.containers.events.record(Event::pod(EventStatus::Restart, &pod));
        Ok(report)
    }

    // =========================================================================
    // Pause / Unpause
    // =========================================================================

    /// Pauses every running member. The infra container keeps running.
    ///
    /// All or nothing: if one member fails, the members paused so far are
    /// unpaused again and the first error is returned.
    #[instrument(skip(self))]
    pub async fn pause(&self, reference: &str) -> Result<String> {
        let (pod, containers) = self.snapshot(reference)?;
        let targets: Vec<Container> = containers
            .into_iter()
            .filter(|c| !c.is_infra && c.status() == ContainerStatus::Running)
            .collect();

        let mut paused: Vec<String> = Vec::with_capacity(targets.len());
        for container in &targets {
            if let Err(e) = self.containers.pause(&container.id).await {
                warn!(pod = %pod.id, container = %container.id, error = %e, "pause failed, rolling back");
                for id in paused.iter().rev() {
                    if let Err(rollback) = self.containers.unpause(id).await {
                        warn!(pod = %pod.id, container = %id, error = %rollback, "failed to unpause during rollback");
                    }
                }
                return Err(e);
            }
            paused.push(container.id.clone());
        }

        self.containers.events.record(Event::pod(EventStatus::Pause, &pod));
        info!(pod = %pod.id, count = paused.len(), "paused pod");
        Ok(pod.id)
    }

    /// Unpauses every paused member.
    #[instrument(skip(self))]
    pub async fn unpause(&self, reference: &str) -> Result<PodReport> {
        let (pod, containers) = self.snapshot(reference)?;
        let mut report = PodReport::new(&pod.id);
        for container in containers {
            if container.status() != ContainerStatus::Paused {
                continue;
            }
            let result = self.containers.unpause(&container.id).await.map(|_| ());
            report.record(&container.id, result);
        }
        self.containers.events.record(Event::pod(EventStatus::Unpause, &pod));
        Ok(report)
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Removes a pod with its infra container and members.
    ///
    /// Without `force`, a running member fails the whole removal before
    /// anything is touched. A container outside the pod that joins a
    /// member's namespace always does.
    #[instrument(skip(self))]
    pub async fn remove(&self, reference: &str, force: bool, timeout: Option<u64>) -> Result<String> {
        let pod_id = self.containers.store.resolve_pod(reference)?.id;
        let _pod_guard = self.containers.lock(&pod_id).await?;
        let (pod, containers) = self.containers.store.pod_snapshot(&pod_id)?;

        let in_pod: HashSet<&str> = containers.iter().map(|c| c.id.as_str()).collect();
        let dependents: Vec<String> = self
            .containers
            .store
            .containers()?
            .into_iter()
            .filter(|c| {
                !in_pod.contains(c.id.as_str())
                    && c.namespaces.values().any(|m| {
                        matches!(m, NamespaceMode::Container(target) if in_pod.contains(target.as_str()))
                    })
            })
            .map(|c| c.name)
            .collect();
        if !dependents.is_empty() {
            return Err(Error::invalid_state(
                &pod.id,
                self.containers.store.pod_status(&pod.id)?,
                format!("remove pod (dependent containers: {})", dependents.join(", ")),
            ));
        }

        if !force
            && let Some(running) = containers
                .iter()
                .find(|c| !c.is_infra && c.status().is_active())
        {
            return Err(Error::invalid_state(
                &running.id,
                running.status(),
                format!("remove pod {} without --force", pod.name),
            ));
        }

        let timeout = timeout.map(Duration::from_secs);
        let mut released = Vec::with_capacity(containers.len());
        for container in infra_last(&pod, containers) {
            let _guard = self.containers.lock(&container.id).await?;
            let mut current = self.containers.store.get_container(&container.id)?;
            if current.status().is_active() {
                self.containers.stop_locked(&mut current, timeout).await?;
            }
            self.containers.release(&mut current).await?;
            released.push(current);
        }

        self.containers.store.remove_pod(&pod.id)?;
        for container in &released {
            self.containers.record(EventStatus::Remove, container);
        }
        self.containers.events.record(Event::pod(EventStatus::Remove, &pod));
        info!(pod = %pod.id, containers = released.len(), "removed pod");
        Ok(pod.id)
    }

    // =========================================================================
    // Clone
    // =========================================================================

    /// Clones a pod and every member into a new pod.
    ///
    /// Members are cloned with the container clone rules; `container:`
    /// namespace targets inside the pod are rewritten to the new members.
    #[instrument(skip(self, options))]
    pub async fn clone_pod(&self, reference: &str, options: PodCloneOptions) -> Result<Pod> {
        let store = &self.containers.store;
        let (source, containers) = self.snapshot(reference)?;

        let mut spec = source.spec.clone();
        spec.name = Some(match &options.name {
            Some(name) => name.clone(),
            None => clone_name(&source.name, |n| store.name_in_use(n).unwrap_or(true)),
        });
        let pod = self.create(spec)?;

        let mut remap = HashMap::new();
        if let (Some(old), Some(new)) = (&source.infra_id, &pod.infra_id) {
            remap.insert(old.clone(), new.clone());
        }
        for member in containers.iter().filter(|c| !c.is_infra) {
            let clone_options = CloneOptions {
                pod: Some(pod.id.clone()),
                ..CloneOptions::default()
            };
            match self
                .containers
                .clone_remapped(&member.id, clone_options, &remap)
                .await
            {
                Ok(clone) => {
                    remap.insert(member.id.clone(), clone.id);
                }
                Err(e) => {
                    if let Err(rollback) = self.remove(&pod.id, true, Some(0)).await {
                        warn!(pod = %pod.id, error = %rollback, "failed to roll back pod clone");
                    }
                    return Err(e);
                }
            }
        }
        self.containers.events.record(
            Event::pod(EventStatus::Clone, &pod).with_attribute("source", &source.id),
        );
        info!(source = %source.id, pod = %pod.id, "cloned pod");

        if options.destroy {
            self.remove(&source.id, true, None).await?;
        }
        if options.start {
            self.start(&pod.id).await?.into_result()?;
        }
        store.get_pod(&pod.id)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// `pod ps`.
    pub fn list(&self, filters: &[Filter]) -> Result<Vec<PodSummary>> {
        Ok(self
            .containers
            .store
            .list_pods(filters)?
            .into_iter()
            .map(|(pod, status)| PodSummary {
                number_of_containers: pod.all_containers().len(),
                id: pod.id,
                name: pod.name,
                status,
                infra_id: pod.infra_id,
                created: pod.created_at,
            })
            .collect())
    }

    /// Inspect documents in the order of `references`.
    pub fn inspect(&self, references: &[String]) -> Result<Vec<PodInspect>> {
        let store = &self.containers.store;
        references
            .iter()
            .map(|reference| {
                let id = store.resolve_pod(reference)?.id;
                let (pod, containers) = store.pod_snapshot(&id)?;
                let status = store.pod_status(&id)?;
                Ok(inspect::pod(&pod, status, &containers))
            })
            .collect()
    }

    /// Processes of the running containers, infra included.
    pub async fn top(&self, reference: &str) -> Result<Vec<PodProcess>> {
        let (pod, containers) = self.snapshot(reference)?;
        let mut processes = Vec::new();
        for container in containers.iter().filter(|c| c.status().is_active()) {
            for pid in self.containers.processes(container).await? {
                processes.push(PodProcess {
                    container_id: container.id.clone(),
                    name: container.name.clone(),
                    pid,
                });
            }
        }
        if processes.is_empty() {
            return Err(Error::invalid_state(&pod.id, "not running", "list processes"));
        }
        Ok(processes)
    }

    /// Usage of running members. A pod without running members yields an
    /// empty entry rather than an error.
    pub async fn stats(&self, references: &[String], all: bool) -> Result<Vec<PodStats>> {
        let ids = if all && references.is_empty() {
            self.containers
                .store
                .pods()?
                .into_iter()
                .map(|p| p.id)
                .collect()
        } else {
            self.select(references, all, false)?
        };

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let (pod, containers) = self.snapshot(&id)?;
            let mut members = Vec::new();
            for container in containers
                .iter()
                .filter(|c| !c.is_infra && c.status().is_active())
            {
                match self.containers.usage(container).await {
                    Ok(usage) => members.push(MemberUsage {
                        id: container.id.clone(),
                        name: container.name.clone(),
                        usage,
                    }),
                    Err(e) => debug!(container = %container.id, error = %e, "no usage sample"),
                }
            }
            out.push(PodStats {
                pod_id: pod.id,
                name: pod.name,
                containers: members,
            });
        }
        Ok(out)
    }

    fn snapshot(&self, reference: &str) -> Result<(Pod, Vec<Container>)> {
        let id = self.containers.store.resolve_pod(reference)?.id;
        self.containers.store.pod_snapshot(&id)
    }
}

/// Infra container first, members in creation order.
fn infra_first(pod: &Pod, mut containers: Vec<Container>) -> Vec<Container> {
    containers.sort_by_key(|c| {
        let infra = Some(&c.id) == pod.infra_id.as_ref();
        (!infra, c.created_at)
    });
    containers
}

/// Members in reverse creation order, infra container last.
fn infra_last(pod: &Pod, mut containers: Vec<Container>) -> Vec<Container> {
    containers = infra_first(pod, containers);
    containers.reverse();
    containers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::state::ContainerState;

    fn container(id: &str, infra: bool, offset: i64) -> Container {
        Container {
            id: id.to_string(),
            name: id.to_string(),
            spec: ContainerSpec::new("alpine"),
            image_id: String::new(),
            image_name: String::new(),
            pod_id: Some("p".to_string()),
            is_infra: infra,
            namespaces: Default::default(),
            created_at: Utc::now() + chrono::Duration::seconds(offset),
            runtime: "simulated".to_string(),
            state: ContainerState::default(),
        }
    }

    #[test]
    fn test_infra_ordering() {
        let pod = Pod {
            id: "p".to_string(),
            name: "p".to_string(),
            spec: PodSpec::named("p"),
            shared: Default::default(),
            infra_id: Some("infra".to_string()),
            members: vec!["a".to_string(), "b".to_string()],
            created_at: Utc::now(),
        };
        let containers = vec![
            container("b", false, 2),
            container("infra", true, 0),
            container("a", false, 1),
        ];
        let first: Vec<String> = infra_first(&pod, containers.clone())
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(first, ["infra", "a", "b"]);
        let last: Vec<String> = infra_last(&pod, containers)
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(last, ["b", "a", "infra"]);
    }

    #[test]
    fn test_stats_total() {
        let usage = ResourceUsage {
            cpu_nanos: 10,
            memory_bytes: 100,
            memory_limit: 0,
            pids: 1,
        };
        let stats = PodStats {
            pod_id: "p".to_string(),
            name: "p".to_string(),
            containers: vec![
                MemberUsage {
                    id: "a".to_string(),
                    name: "a".to_string(),
                    usage: usage.clone(),
                },
                MemberUsage {
                    id: "b".to_string(),
                    name: "b".to_string(),
                    usage,
                },
            ],
        };
        let total = stats.total();
        assert_eq!(total.memory_bytes, 200);
        assert_eq!(total.pids, 2);
    }
}

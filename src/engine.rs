//! # Engine - Wiring and Command Dispatch
//!
//! The engine owns the shared collaborators and hands them to the two
//! lifecycle managers:
//!
//! ```text
//!            EngineConfig (Arc, immutable)
//!                   │
//!   ┌───────────────┼──────────────────────────────┐
//!   │  EntityStore  StorageLayer  SupervisorRegistry  EventBus
//!   └───────┬───────────────┬──────────────────────┘
//!           ▼               ▼
//!   ContainerManager ◀── PodManager
//! ```
//!
//! Every user-facing operation is one [`Command`] variant; [`Engine::execute`]
//! dispatches it and returns an [`Output`] the CLI prints.

use crate::config::EngineConfig;
use crate::constants::STATE_FILE;
use crate::container::{
    BatchResult, CheckpointOptions, CloneOptions, ContainerManager, ContainerSpec,
    ContainerStatus, RemoveOptions, RestoreOptions,
};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventFormat, EventQuery, EventStatus};
use crate::image::ImageConfig;
use crate::pod::{PodCloneOptions, PodManager, PodReport, PodSpec};
use crate::runtime::{ProcessSupervisor, Signal};
use crate::runtimes::SupervisorRegistry;
use crate::storage::StorageLayer;
use crate::store::{EntityStore, parse_filters};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Batch target selection shared by most container and pod commands.
#[derive(Debug, Clone, Default)]
pub struct Targets {
    pub names: Vec<String>,
    pub all: bool,
    pub latest: bool,
}

impl Targets {
    pub fn one(name: impl Into<String>) -> Self {
        Self {
            names: vec![name.into()],
            ..Self::default()
        }
    }
}

/// Every operation the engine performs, with typed arguments.
#[derive(Debug, Clone)]
pub enum Command {
    // Containers
    Create { spec: Box<ContainerSpec> },
    Run { spec: Box<ContainerSpec> },
    Init { targets: Targets },
    Start { targets: Targets },
    Stop { targets: Targets, timeout: Option<u64> },
    Kill { targets: Targets, signal: String },
    Pause { targets: Targets },
    Unpause { targets: Targets },
    Restart { targets: Targets, timeout: Option<u64> },
    Remove { targets: Targets, force: bool, timeout: Option<u64> },
    Wait { targets: Targets, conditions: Vec<String>, timeout: Option<Duration> },
    Mount { target: String },
    Unmount { target: String, force: bool },
    Prune,
    List { all: bool, filters: Vec<String> },
    Inspect { targets: Targets },
    Top { target: String },
    Stats { targets: Targets },
    Checkpoint { targets: Targets, options: CheckpointOptions },
    Restore { targets: Targets, options: RestoreOptions },
    Clone { source: String, options: CloneOptions },
    // Events and images
    Events {
        since: Option<String>,
        until: Option<String>,
        filters: Vec<String>,
        /// `human`, `json`, or a template such as `{{.Status}} {{.ID}}`.
        format: Option<String>,
        /// Keep following the log; needs `until` to be collected here.
        stream: bool,
    },
    ImageImport { name: String, layer: PathBuf, config: ImageConfig },
    Images,
    // Pods
    PodCreate { spec: PodSpec },
    PodStart { targets: Targets },
    PodStop { targets: Targets, timeout: Option<u64> },
    PodKill { targets: Targets, signal: String },
    PodRestart { targets: Targets, timeout: Option<u64> },
    PodPause { targets: Targets },
    PodUnpause { targets: Targets },
    PodRemove { targets: Targets, force: bool, timeout: Option<u64> },
    PodClone { source: String, options: PodCloneOptions },
    PodList { filters: Vec<String> },
    PodInspect { targets: Targets },
    PodTop { target: String },
    PodStats { targets: Targets },
}

/// Result of a command, ready for printing.
#[derive(Debug)]
pub enum Output {
    /// Plain lines on stdout.
    Lines(Vec<String>),
    /// A JSON document.
    Json(serde_json::Value),
    /// Per-target results; any failure makes the command fail.
    Batch(Vec<BatchResult>),
    /// Exit code passed through from a container.
    Exit(i32),
}

impl Output {
    fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    /// Process exit code for this output.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Batch(results) => results
                .iter()
                .find_map(|r| r.result.as_ref().err().map(Error::exit_code))
                .unwrap_or(0),
            Self::Exit(code) => *code,
            _ => 0,
        }
    }
}

/// Lifecycle engine: configuration, stores and both managers.
pub struct Engine {
    config: Arc<EngineConfig>,
    containers: ContainerManager,
    pods: PodManager,
}

impl Engine {
    /// Opens the engine with the supervisors named by the configuration and
    /// reconciles records whose processes vanished.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let supervisors = SupervisorRegistry::new(&config);
        let engine = Self::assemble(config, supervisors)?;
        engine.containers.reconcile().await?;
        Ok(engine)
    }

    /// Opens the engine with one supervisor backend.
    pub fn with_supervisor(config: EngineConfig, supervisor: Arc<dyn ProcessSupervisor>) -> Result<Self> {
        Self::assemble(config, SupervisorRegistry::with_supervisor(supervisor))
    }

    fn assemble(config: EngineConfig, supervisors: SupervisorRegistry) -> Result<Self> {
        let store = if config.persist_state {
            EntityStore::open(&config.root)?
        } else {
            EntityStore::in_memory()
        };
        let events = if config.events_log {
            EventBus::open(&config.run_root, config.events_log_max_bytes)?
        } else {
            EventBus::in_memory()
        };
        let storage = StorageLayer::open(&config.root)?;
        info!(
            root = %config.root.display(),
            runtime = %supervisors.default_name(),
            state = %config.root.join(STATE_FILE).display(),
            "engine ready"
        );

        let config = Arc::new(config);
        let containers = ContainerManager::new(
            Arc::clone(&config),
            Arc::new(store),
            Arc::new(storage),
            Arc::new(supervisors),
            events,
        );
        let pods = PodManager::new(containers.clone());
        Ok(Self {
            config,
            containers,
            pods,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn containers(&self) -> &ContainerManager {
        &self.containers
    }

    pub fn pods(&self) -> &PodManager {
        &self.pods
    }

    pub fn events(&self) -> &EventBus {
        &self.containers.events
    }

    pub fn store(&self) -> &EntityStore {
        &self.containers.store
    }

    pub fn storage(&self) -> &StorageLayer {
        &self.containers.storage
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Executes one command.
    pub async fn execute(&self, command: Command) -> Result<Output> {
        debug!(?command, "executing command");
        let containers = &self.containers;
        match command {
            Command::Create { spec } => {
                let container = containers.create(*spec)?;
                Ok(Output::Lines(vec![container.id]))
            }
            Command::Run { spec } => {
                let container = containers.create(*spec)?;
                let container = containers.start(&container.id).await?;
                Ok(Output::Lines(vec![container.id]))
            }
            Command::Init { targets } => {
                self.container_batch(&targets, |m, id| async move { m.init(&id).await.map(|c| c.id) })
                    .await
            }
            Command::Start { targets } => {
                self.container_batch(&targets, |m, id| async move { m.start(&id).await.map(|c| c.id) })
                    .await
            }
            Command::Stop { targets, timeout } => {
                self.container_batch(&targets, move |m, id| async move {
                    m.stop(&id, timeout).await.map(|c| c.id)
                })
                .await
            }
            Command::Kill { targets, signal } => {
                let signal: Signal = signal.parse()?;
                self.container_batch(&targets, move |m, id| async move {
                    m.kill(&id, signal).await.map(|c| c.id)
                })
                .await
            }
            Command::Pause { targets } => {
                self.container_batch(&targets, |m, id| async move { m.pause(&id).await.map(|c| c.id) })
                    .await
            }
            Command::Unpause { targets } => {
                self.container_batch(&targets, |m, id| async move {
                    m.unpause(&id).await.map(|c| c.id)
                })
                .await
            }
            Command::Restart { targets, timeout } => {
                self.container_batch(&targets, move |m, id| async move {
                    m.restart(&id, timeout).await.map(|c| c.id)
                })
                .await
            }
            Command::Remove {
                targets,
                force,
                timeout,
            } => {
                let options = RemoveOptions { force, timeout };
                self.container_batch(&targets, move |m, id| {
                    let options = options.clone();
                    async move { m.remove(&id, options).await }
                })
                .await
            }
            Command::Wait {
                targets,
                conditions,
                timeout,
            } => {
                let conditions = conditions
                    .iter()
                    .map(|c| c.parse::<ContainerStatus>())
                    .collect::<Result<Vec<_>>>()?;
                let ids = containers.select(&targets.names, targets.all, targets.latest)?;
                let mut lines = Vec::with_capacity(ids.len());
                for id in ids {
                    lines.push(containers.wait(&id, &conditions, timeout).await?.to_string());
                }
                Ok(Output::Lines(lines))
            }
            Command::Mount { target } => {
                let path = containers.mount(&target).await?;
                Ok(Output::Lines(vec![path.display().to_string()]))
            }
            Command::Unmount { target, force } => {
                containers.unmount(&target, force).await?;
                Ok(Output::Lines(vec![target]))
            }
            Command::Prune => Ok(Output::Lines(containers.prune().await?)),
            Command::List { all, filters } => {
                let filters = parse_filters(&filters)?;
                let lines = containers
                    .list(&filters)?
                    .into_iter()
                    .filter(|c| all || c.status().is_active())
                    .map(|c| {
                        format!(
                            "{}  {}  {}  {}",
                            c.short_id(),
                            c.image_name,
                            c.status(),
                            c.name
                        )
                    })
                    .collect();
                Ok(Output::Lines(lines))
            }
            Command::Inspect { targets } => {
                let ids = containers.select(&targets.names, targets.all, targets.latest)?;
                Output::json(&containers.inspect(&ids)?)
            }
            Command::Top { target } => {
                let container = self.store().resolve_container(&target)?;
                let pids = containers.processes(&container).await?;
                Ok(Output::Lines(pids.iter().map(u32::to_string).collect()))
            }
            Command::Stats { targets } => {
                let ids = if targets.names.is_empty() && !targets.latest {
                    self.store()
                        .containers()?
                        .into_iter()
                        .filter(|c| c.status().is_active())
                        .map(|c| c.id)
                        .collect()
                } else {
                    containers.select(&targets.names, targets.all, targets.latest)?
                };
                let mut stats = BTreeMap::new();
                for id in ids {
                    let container = self.store().resolve_container(&id)?;
                    stats.insert(container.name.clone(), containers.usage(&container).await?);
                }
                Output::json(&stats)
            }
            Command::Checkpoint { targets, options } => {
                self.container_batch(&targets, move |m, id| {
                    let options = options.clone();
                    async move { m.checkpoint(&id, options).await.map(|c| c.id) }
                })
                .await
            }
            Command::Restore { targets, options } => {
                let names = if targets.all {
                    self.store()
                        .containers()?
                        .into_iter()
                        .filter(|c| c.state.checkpointed && c.status().is_terminated())
                        .map(|c| c.id)
                        .collect()
                } else {
                    containers.select(&targets.names, false, targets.latest)?
                };
                let mut results = Vec::with_capacity(names.len());
                for name in names {
                    let result = containers.restore(&name, options.clone()).await.map(|c| c.id);
                    results.push(BatchResult::new(name, result));
                }
                Ok(Output::Batch(results))
            }
            Command::Clone { source, options } => {
                let clone = containers.clone_container(&source, options).await?;
                Ok(Output::Lines(vec![clone.id]))
            }
            Command::Events {
                since,
                until,
                filters,
                format,
                stream,
            } => {
                let format = EventFormat::parse(format.as_deref())?;
                let query =
                    EventQuery::parse(since.as_deref(), until.as_deref(), &filters, stream)?;
                let lines = self
                    .events()
                    .query(query)
                    .await?
                    .iter()
                    .map(|e| format.render(e))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Output::Lines(lines))
            }
            Command::ImageImport {
                name,
                layer,
                config,
            } => {
                let data = std::fs::read(&layer)?;
                let image =
                    self.storage()
                        .images()
                        .import(&name, &[data], config, BTreeMap::new())?;
                self.events().record(Event::image(EventStatus::Import, &image));
                Ok(Output::Lines(vec![image.id]))
            }
            Command::Images => {
                let lines = self
                    .storage()
                    .images()
                    .list()?
                    .iter()
                    .map(|i| format!("{}  {}", &i.id[..12.min(i.id.len())], i.display_name()))
                    .collect();
                Ok(Output::Lines(lines))
            }
            Command::PodCreate { spec } => {
                let pod = self.pods.create(spec)?;
                Ok(Output::Lines(vec![pod.id]))
            }
            Command::PodStart { targets } => {
                self.pod_batch(&targets, |p, id| async move { p.start(&id).await?.into_result() })
                    .await
            }
            Command::PodStop { targets, timeout } => {
                self.pod_batch(&targets, move |p, id| async move {
                    p.stop(&id, timeout).await?.into_result()
                })
                .await
            }
            Command::PodKill { targets, signal } => {
                let signal: Signal = signal.parse()?;
                self.pod_batch(&targets, move |p, id| async move {
                    p.kill(&id, signal).await?.into_result()
                })
                .await
            }
            Command::PodRestart { targets, timeout } => {
                self.pod_batch(&targets, move |p, id| async move {
                    p.restart(&id, timeout).await.and_then(PodReport::into_result)
                })
                .await
            }
            Command::PodPause { targets } => {
                self.pod_batch(&targets, |p, id| async move { p.pause(&id).await })
                    .await
            }
            Command::PodUnpause { targets } => {
                self.pod_batch(&targets, |p, id| async move { p.unpause(&id).await?.into_result() })
                    .await
            }
            Command::PodRemove {
                targets,
                force,
                timeout,
            } => {
                self.pod_batch(&targets, move |p, id| async move {
                    p.remove(&id, force, timeout).await
                })
                .await
            }
            Command::PodClone { source, options } => {
                let pod = self.pods.clone_pod(&source, options).await?;
                Ok(Output::Lines(vec![pod.id]))
            }
            Command::PodList { filters } => {
                let filters = parse_filters(&filters)?;
                Output::json(&self.pods.list(&filters)?)
            }
            Command::PodInspect { targets } => {
                let ids = self.pods.select(&targets.names, targets.all, targets.latest)?;
                Output::json(&self.pods.inspect(&ids)?)
            }
            Command::PodTop { target } => Output::json(&self.pods.top(&target).await?),
            Command::PodStats { targets } => {
                let all = targets.all || (targets.names.is_empty() && !targets.latest);
                let stats = if targets.latest {
                    let ids = self.pods.select(&[], false, true)?;
                    self.pods.stats(&ids, false).await?
                } else {
                    self.pods.stats(&targets.names, all).await?
                };
                Output::json(&stats)
            }
        }
    }

    /// Runs `op` for every selected container; each target succeeds or
    /// fails on its own.
    async fn container_batch<F, Fut>(&self, targets: &Targets, op: F) -> Result<Output>
    where
        F: Fn(ContainerManager, String) -> Fut,
        Fut: std::future::Future<Output = Result<String>>,
    {
        let ids = self
            .containers
            .select(&targets.names, targets.all, targets.latest)?;
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let result = op(self.containers.clone(), id.clone()).await;
            results.push(BatchResult::new(id, result));
        }
        Ok(Output::Batch(results))
    }

    async fn pod_batch<F, Fut>(&self, targets: &Targets, op: F) -> Result<Output>
    where
        F: Fn(PodManager, String) -> Fut,
        Fut: std::future::Future<Output = Result<String>>,
    {
        let ids = self
            .pods
            .select(&targets.names, targets.all, targets.latest)?;
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let result = op(self.pods.clone(), id.clone()).await;
            results.push(BatchResult::new(id, result));
        }
        Ok(Output::Batch(results))
    }
}

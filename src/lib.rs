//! # magikpod
//!
//! **Container and Pod Lifecycle Engine**
//!
//! This crate implements the lifecycle core of a container engine: the
//! container state machine, pods with shared namespaces, checkpoint/restore,
//! clone, attach with signal forwarding, and the event log. Process
//! management is delegated to an OCI runtime (`runc`, `crun`) through the
//! [`ProcessSupervisor`] trait.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              magikpod                               │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Engine::execute(Command) ──▶ Output                                │
//! │        │                                                            │
//! │  ┌─────┴──────────────────┐   ┌───────────────────────────────┐     │
//! │  │   ContainerManager     │◀──│         PodManager            │     │
//! │  │ create/init/start/stop │   │ create/start/stop/pause/clone │     │
//! │  │ kill/pause/checkpoint  │   │ rm/ps/top/stats               │     │
//! │  │ restore/clone/attach   │   └───────────────────────────────┘     │
//! │  └─────┬──────────────────┘                                         │
//! │        │                                                            │
//! │  ┌─────┴─────────┬───────────────┬────────────────┬──────────────┐  │
//! │  │  EntityStore  │  StorageLayer │ ProcessSupervisor│  EventBus   │  │
//! │  │ records, locks│ images, mounts│  runc / crun /   │ append-only │  │
//! │  │ filters       │ checkpoints   │  simulated       │ log, follow │  │
//! │  └───────────────┴───────────────┴────────────────┴──────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **Validate, then act**: an illegal transition is rejected before any
//!   mutation, leaving the record untouched.
//! - **Per-entity locks**: every container transition holds that container's
//!   lock across the supervisor call, the store update and the event append.
//! - **Crash-tolerant removal**: storage is released before the record is
//!   deleted, and releasing already-released storage succeeds.
//! - **Atomic writes**: persisted files are written to a temp file and renamed.
//!
//! # Exit Codes
//!
//! | Code  | Meaning                               |
//! |-------|---------------------------------------|
//! | 0     | success                               |
//! | 125   | engine error (see [`ErrorKind`])      |
//! | 126   | command found but not executable      |
//! | 127   | command not found in the container    |
//! | other | exit code of the container process    |
//!
//! # Example
//!
//! ```rust,ignore
//! use magikpod::{ContainerSpec, Engine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> magikpod::Result<()> {
//!     let engine = Engine::open(EngineConfig::load(&EngineConfig::default_path())?).await?;
//!     let spec = ContainerSpec::new("alpine").with_name("web").with_command(["top"]);
//!     let container = engine.containers().create(spec)?;
//!     engine.containers().start(&container.id).await?;
//!     Ok(())
//! }
//! ```

pub mod bundle;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod events;
pub mod image;
pub mod inspect;
pub mod runtime;
pub mod storage;
pub mod store;

pub mod container;
pub mod pod;
pub mod runtimes;

// Re-exports
pub use config::{EngineConfig, KillPausedPolicy};
pub use constants::*;
pub use container::{
    AttachOutcome, CheckpointOptions, CloneOptions, Container, ContainerManager, ContainerSpec,
    ContainerStatus, RemoveOptions, RestoreOptions,
};
pub use engine::{Command, Engine, Output, Targets};
pub use error::{Error, ErrorKind, Result};
pub use events::{Event, EventBus, EventFormat, EventQuery, EventStatus, EventStream, EventType};
pub use image::{Image, ImageConfig, ImageStore};
pub use pod::{Pod, PodManager, PodSpec, PodStatus};
pub use runtime::{ProcessSupervisor, Signal};
pub use runtimes::{OciCliSupervisor, SimulatedSupervisor, SupervisorRegistry};
pub use storage::{BlobStore, StorageLayer};
pub use store::{EntityStore, Filter};

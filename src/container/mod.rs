//! # Container Lifecycle
//!
//! The container state machine and the manager that drives it.
//!
//! ## State Machine
//!
//! ```text
//!                 init               start
//!   create ──▶ created ──▶ initialized ──▶ running ⇄ paused
//!                 │                          │  ▲     │
//!                 └──────── start ───────────┘  │     │ stop / kill(SIGKILL)
//!                                               │     ▼
//!                          stop / kill / checkpoint   stopped ◀─┐
//!                                     natural exit ─▶ exited    │
//!                                                      │        │
//!                          start / init / restore ◀────┴────────┘
//!
//!   any non-removing state ── rm ──▶ removing ──▶ (gone)
//! ```
//!
//! | Operation   | Legal from                                  | Result      |
//! |-------------|---------------------------------------------|-------------|
//! | `init`      | created, stopped, exited                    | initialized |
//! | `start`     | created, initialized, stopped, exited       | running     |
//! | `stop`      | running, paused (stopped/exited: no-op)     | stopped     |
//! | `kill`      | running, paused (policy)                    | stopped     |
//! | `pause`     | running                                     | paused      |
//! | `unpause`   | paused                                      | running     |
//! | `checkpoint`| running                                     | stopped     |
//! | `restore`   | stopped/exited with a checkpoint            | running     |
//! | `rm`        | anything but running/paused (or `--force`)  | gone        |
//!
//! Illegal transitions are rejected with [`Error::InvalidState`] before any
//! mutation, so the record stays exactly as it was.
//!
//! ## Locking
//!
//! Every mutating operation holds the container's entity lock for the whole
//! transition: supervisor call, store update and event append. Concurrent
//! `start` calls therefore yield one success and one `InvalidState`.
//!
//! [`Error::InvalidState`]: crate::error::Error::InvalidState

pub mod checkpoint;
pub mod clone;
pub mod manager;
pub mod spec;
pub mod state;

pub use checkpoint::{CheckpointOptions, RestoreOptions};
pub use clone::{CloneOptions, clone_name};
pub use manager::{AttachOutcome, ContainerManager, RemoveOptions};
pub use spec::{ContainerSpec, NamespaceKind, NamespaceMode, Namespaces, Resources, RestartPolicy};
pub use state::{Container, ContainerState, ContainerStatus};

use crate::error::Error;

/// Outcome of one target of a batch operation.
#[derive(Debug)]
pub struct BatchResult {
    /// Reference as given by the caller.
    pub reference: String,
    /// Resolved ID on success.
    pub result: Result<String, Error>,
}

impl BatchResult {
    pub fn new(reference: impl Into<String>, result: crate::error::Result<String>) -> Self {
        Self {
            reference: reference.into(),
            result,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

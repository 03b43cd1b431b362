//! # Pods - Containers Sharing Namespaces
//!
//! A pod is a named group of containers that share a chosen set of Linux
//! namespaces. The namespaces are anchored by the pod's infra container, or,
//! for pods created without one, by the first member.
//!
//! ```text
//!   pod p1 (share = ipc,net,uts)
//!   ┌──────────────────────────────────────────────┐
//!   │  infra (catatonit) ── owns ipc, net, uts     │
//!   │     ▲        ▲                               │
//!   │     │ join   │ join                          │
//!   │  member A  member B    (own pid, cgroup)     │
//!   └──────────────────────────────────────────────┘
//! ```
//!
//! ## Namespace Resolution
//!
//! | Requested mode      | Pod shares the kind | Pod does not share it |
//! |---------------------|---------------------|-----------------------|
//! | default             | pod                 | private               |
//! | `pod`               | pod                 | rejected              |
//! | `container:<ref>`   | that container      | that container        |
//! | `host` / `private`  | as requested        | as requested          |
//!
//! ## State
//!
//! Pod state is never stored. It is recomputed from one snapshot of the
//! member states on every read, with the infra container excluded:
//! `Running > Paused > Stopped > Exited > Created`.

pub mod manager;
pub mod spec;
pub mod state;

pub use manager::{MemberUsage, PodCloneOptions, PodManager, PodProcess, PodStats};
pub use spec::PodSpec;
pub use state::{Pod, PodStatus, PodSummary};

use crate::container::spec::{NamespaceKind, NamespaceMode, Namespaces};
use crate::error::{Error, Result};
use crate::store::EntityStore;
use std::collections::BTreeMap;

/// Resolves requested namespace modes against a pod's share set.
///
/// `container:<ref>` targets are resolved to full container IDs.
pub fn resolve_namespaces(
    requested: &Namespaces,
    pod: Option<&Pod>,
    store: &EntityStore,
) -> Result<BTreeMap<NamespaceKind, NamespaceMode>> {
    let mut resolved = BTreeMap::new();
    for (kind, mode) in requested.iter() {
        let mode = match mode {
            NamespaceMode::Default => match pod {
                Some(pod) if pod.shares(kind) => NamespaceMode::Pod,
                _ => NamespaceMode::Private,
            },
            NamespaceMode::Pod => match pod {
                Some(pod) if pod.shares(kind) => NamespaceMode::Pod,
                Some(pod) => {
                    return Err(Error::InvalidSpec(format!(
                        "pod {} does not share the {} namespace",
                        pod.name,
                        kind.proc_name()
                    )));
                }
                None => {
                    return Err(Error::InvalidSpec(format!(
                        "{} namespace set to pod but the container is not in a pod",
                        kind.proc_name()
                    )));
                }
            },
            NamespaceMode::Container(reference) => {
                NamespaceMode::Container(store.resolve_container(reference)?.id)
            }
            NamespaceMode::Host => NamespaceMode::Host,
            NamespaceMode::Private => NamespaceMode::Private,
        };
        resolved.insert(kind, mode);
    }
    Ok(resolved)
}

/// Per-member outcome of a pod-wide operation.
#[derive(Debug, Default)]
pub struct PodReport {
    pub pod_id: String,
    /// Containers the operation acted on.
    pub succeeded: Vec<String>,
    /// Containers it failed for.
    pub errors: Vec<(String, Error)>,
}

impl PodReport {
    fn new(pod_id: &str) -> Self {
        Self {
            pod_id: pod_id.to_string(),
            ..Self::default()
        }
    }

    fn record(&mut self, id: &str, result: Result<()>) {
        match result {
            Ok(()) => self.succeeded.push(id.to_string()),
            Err(e) => self.errors.push((id.to_string(), e)),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// The pod ID, or the first member failure.
    pub fn into_result(mut self) -> Result<String> {
        if self.errors.is_empty() {
            Ok(self.pod_id)
        } else {
            Err(self.errors.swap_remove(0).1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::spec::PodSpec;
    use chrono::Utc;

    fn pod(shared: &[NamespaceKind]) -> Pod {
        Pod {
            id: "p".repeat(64),
            name: "p1".to_string(),
            spec: PodSpec::named("p1"),
            shared: shared.iter().copied().collect(),
            infra_id: None,
            members: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_default_follows_pod_share() {
        let store = EntityStore::in_memory();
        let p = pod(&[NamespaceKind::Net, NamespaceKind::Ipc]);
        let resolved = resolve_namespaces(&Namespaces::default(), Some(&p), &store).unwrap();
        assert_eq!(resolved[&NamespaceKind::Net], NamespaceMode::Pod);
        assert_eq!(resolved[&NamespaceKind::Ipc], NamespaceMode::Pod);
        assert_eq!(resolved[&NamespaceKind::Pid], NamespaceMode::Private);

        let resolved = resolve_namespaces(&Namespaces::default(), None, &store).unwrap();
        assert!(resolved.values().all(|m| *m == NamespaceMode::Private));
    }

    #[test]
    fn test_pod_mode_on_unshared_kind_rejected() {
        let store = EntityStore::in_memory();
        let p = pod(&[NamespaceKind::Net]);
        let mut requested = Namespaces::default();
        requested.set(NamespaceKind::Pid, NamespaceMode::Pod);
        let err = resolve_namespaces(&requested, Some(&p), &store).unwrap_err();
        assert!(err.to_string().contains("does not share the pid namespace"));
    }

    #[test]
    fn test_unknown_container_target() {
        let store = EntityStore::in_memory();
        let mut requested = Namespaces::default();
        requested.set(NamespaceKind::Net, NamespaceMode::Container("ghost".to_string()));
        assert!(resolve_namespaces(&requested, None, &store)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_report_first_error() {
        let mut report = PodReport::new("p");
        report.record("a", Ok(()));
        report.record("b", Err(Error::ContainerNotFound("b".to_string())));
        assert!(!report.is_ok());
        assert!(report.into_result().unwrap_err().is_not_found());
    }
}

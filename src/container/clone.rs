//! Container cloning.
//!
//! A clone is a new container built from a deep copy of the source's
//! resolved spec. Overrides replace the copied field outright. Namespace
//! modes are re-derived against the destination pod, so a clone moved into
//! a pod with a different share set never inherits stale `pod` modes.

use crate::constants::CLONE_SUFFIX;
use crate::container::manager::{ContainerManager, RemoveOptions};
use crate::container::spec::{ContainerSpec, NamespaceMode};
use crate::container::state::Container;
use crate::error::{Error, Result};
use crate::events::{Event, EventStatus};
use std::collections::HashMap;
use tracing::{info, instrument, warn};

/// Options for `container clone`.
#[derive(Debug, Clone, Default)]
pub struct CloneOptions {
    /// Name of the clone; derived from the source when absent.
    pub name: Option<String>,
    /// Image override.
    pub image: Option<String>,
    /// CPU override, replaces the source's CPU settings.
    pub cpus: Option<f64>,
    /// Memory override (`512m`, `1g`).
    pub memory: Option<String>,
    /// Pod to create the clone in.
    pub pod: Option<String>,
    /// Remove the source after a successful clone.
    pub destroy: bool,
    /// Allow destroying a running source.
    pub force: bool,
    /// Start the clone.
    pub run: bool,
}

/// Picks `<base>-clone`, `<base>-clone1`, ... skipping names in use.
///
/// A source already named `<base>-clone[N]` counts from the same base, so
/// repeated clones never stack suffixes.
pub fn clone_name(source: &str, in_use: impl Fn(&str) -> bool) -> String {
    let base = match source.rfind(CLONE_SUFFIX) {
        Some(pos)
            if pos > 0
                && source[pos + CLONE_SUFFIX.len()..]
                    .chars()
                    .all(|c| c.is_ascii_digit()) =>
        {
            &source[..pos]
        }
        _ => source,
    };
    let first = format!("{base}{CLONE_SUFFIX}");
    if !in_use(&first) {
        return first;
    }
    (1u32..)
        .map(|n| format!("{base}{CLONE_SUFFIX}{n}"))
        .find(|candidate| !in_use(candidate))
        .unwrap_or(first)
}

impl ContainerManager {
    /// Clones a container. With `destroy`, the source is removed only after
    /// the clone exists; if that removal fails the clone is rolled back.
    #[instrument(skip(self, options))]
    pub async fn clone_container(&self, reference: &str, options: CloneOptions) -> Result<Container> {
        self.clone_remapped(reference, options, &HashMap::new()).await
    }

    /// Clones a container, pointing `container:` namespace targets found in
    /// `remap` (source ID to clone ID) at their clones.
    pub(crate) async fn clone_remapped(
        &self,
        reference: &str,
        options: CloneOptions,
        remap: &HashMap<String, String>,
    ) -> Result<Container> {
        let source = self.store.resolve_container(reference)?;
        if source.is_infra {
            return Err(Error::InvalidSpec(format!(
                "cannot clone infra container {}",
                source.name
            )));
        }
        if options.destroy && source.status().is_active() && !options.force {
            return Err(Error::invalid_state(
                &source.id,
                source.status(),
                "destroy a running source without --force",
            ));
        }

        let spec = self.clone_spec(&source, &options, remap)?;
        let clone = self.create(spec)?;
        self.events.record(
            Event::container(EventStatus::Clone, &clone).with_attribute("source", &source.id),
        );
        info!(source = %source.id, clone = %clone.id, name = %clone.name, "cloned container");

        if options.destroy {
            let removal = RemoveOptions {
                force: true,
                timeout: None,
            };
            if let Err(e) = self.remove(&source.id, removal).await {
                if let Err(rollback) = self.remove(&clone.id, RemoveOptions::default()).await {
                    warn!(clone = %clone.id, error = %rollback, "failed to roll back clone");
                }
                return Err(e);
            }
        }

        if options.run {
            return self.start(&clone.id).await;
        }
        Ok(clone)
    }

    /// Deep copy of the source spec with the overrides applied.
    fn clone_spec(
        &self,
        source: &Container,
        options: &CloneOptions,
        remap: &HashMap<String, String>,
    ) -> Result<ContainerSpec> {
        let mut spec = source.spec.clone();

        spec.name = Some(match &options.name {
            Some(name) => name.clone(),
            None => {
                let taken = |n: &str| self.store.name_in_use(n).unwrap_or(true);
                clone_name(&source.name, taken)
            }
        });
        if let Some(image) = &options.image {
            spec.image = image.clone();
        }
        if let Some(cpus) = options.cpus {
            spec.resources.set_cpus(cpus)?;
        }
        if let Some(memory) = &options.memory {
            spec.resources.set_memory(memory)?;
        }

        let destination = match &options.pod {
            Some(pod) => Some(self.store.resolve_pod(pod)?.id),
            None => source.pod_id.clone(),
        };
        let moved = destination != source.pod_id;
        spec.pod = destination;

        let requested: Vec<_> = spec
            .namespaces
            .iter()
            .map(|(kind, mode)| (kind, mode.clone()))
            .collect();
        for (kind, mode) in requested {
            let mode = match mode {
                NamespaceMode::Pod if moved => NamespaceMode::Default,
                // The spec keeps the reference as typed; the record holds the
                // full ID it resolved to.
                NamespaceMode::Container(target) => {
                    let resolved = match source.namespaces.get(&kind) {
                        Some(NamespaceMode::Container(id)) => id.clone(),
                        _ => target,
                    };
                    let target = remap.get(&resolved).cloned().unwrap_or(resolved);
                    NamespaceMode::Container(target)
                }
                other => other,
            };
            spec.namespaces.set(kind, mode);
        }
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_name_first() {
        assert_eq!(clone_name("web", |_| false), "web-clone");
    }

    #[test]
    fn test_clone_name_increments() {
        let taken = ["web-clone", "web-clone1"];
        assert_eq!(clone_name("web", |n| taken.contains(&n)), "web-clone2");
    }

    #[test]
    fn test_clone_name_of_clone() {
        let taken = ["web-clone", "web-clone1"];
        assert_eq!(clone_name("web-clone1", |n| taken.contains(&n)), "web-clone2");
        assert_eq!(clone_name("web-clone", |n| n == "web-clone"), "web-clone1");
    }

    #[test]
    fn test_clone_name_keeps_inner_suffix() {
        assert_eq!(clone_name("-clone", |_| false), "-clone-clone");
        assert_eq!(clone_name("a-clonex", |_| false), "a-clonex-clone");
    }
}

//! Pod specification types.

use crate::constants::validate_name;
use crate::container::spec::{NamespaceKind, validate_string_map};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Namespaces shared by default when the pod has an infra container.
pub const DEFAULT_SHARED_NAMESPACES: [NamespaceKind; 3] =
    [NamespaceKind::Ipc, NamespaceKind::Net, NamespaceKind::Uts];

/// Pod configuration as requested by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSpec {
    /// Requested name; generated when absent.
    pub name: Option<String>,
    /// Create an infra container holding the shared namespaces.
    pub infra: bool,
    /// Shared namespaces. `None` selects the default for the infra mode.
    pub share: Option<BTreeSet<NamespaceKind>>,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Infra image override.
    pub infra_image: Option<String>,
    /// Hostname for the shared UTS namespace.
    pub hostname: Option<String>,
}

impl Default for PodSpec {
    fn default() -> Self {
        Self {
            name: None,
            infra: true,
            share: None,
            labels: BTreeMap::new(),
            infra_image: None,
            hostname: None,
        }
    }
}

impl PodSpec {
    /// Spec with a name and defaults for everything else.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Disables the infra container.
    #[must_use]
    pub fn without_infra(mut self) -> Self {
        self.infra = false;
        self
    }

    /// Sets the shared namespaces.
    #[must_use]
    pub fn with_share(mut self, share: impl IntoIterator<Item = NamespaceKind>) -> Self {
        self.share = Some(share.into_iter().collect());
        self
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Parses `--share` syntax: `ipc,net,uts` or `none`.
    pub fn parse_share(s: &str) -> Result<BTreeSet<NamespaceKind>> {
        if s.trim().is_empty() || s.trim() == "none" {
            return Ok(BTreeSet::new());
        }
        s.split(',').map(str::parse).collect()
    }

    /// Resolved shared namespace set.
    pub fn shared_namespaces(&self) -> BTreeSet<NamespaceKind> {
        match &self.share {
            Some(share) => share.clone(),
            None if self.infra => DEFAULT_SHARED_NAMESPACES.into_iter().collect(),
            None => BTreeSet::new(),
        }
    }

    /// Validates the spec.
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            validate_name(name)
                .map_err(|reason| Error::InvalidSpec(format!("pod name '{name}': {reason}")))?;
        }
        validate_string_map(&self.labels, "label")?;
        if !self.infra && self.infra_image.is_some() {
            return Err(Error::InvalidSpec(
                "infra image given for a pod without infra container".to_string(),
            ));
        }
        Ok(())
    }
}

//! Pod state types.
//!
//! - `Pod`: the persisted record
//! - `PodStatus`: aggregate state derived from member containers
//! - `PodSummary`: lightweight pod info for listing

use super::spec::PodSpec;
use crate::container::spec::NamespaceKind;
use crate::container::state::ContainerStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// =============================================================================
// Pod Status
// =============================================================================

/// Aggregate pod state.
///
/// Derived on every read from one snapshot of the member states, never
/// cached:
///
/// ```text
///   any member running          → Running
///   else any member paused      → Paused
///   else any member stopped     → Stopped
///   else any member exited      → Exited
///   else                        → Created
/// ```
///
/// The infra container does not count as a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum PodStatus {
    #[default]
    Created,
    Running,
    Paused,
    Stopped,
    Exited,
}

impl PodStatus {
    /// All statuses, for filter validation.
    pub const ALL: [PodStatus; 5] = [
        Self::Created,
        Self::Running,
        Self::Paused,
        Self::Stopped,
        Self::Exited,
    ];

    /// Aggregates member statuses.
    pub fn aggregate(members: impl IntoIterator<Item = ContainerStatus>) -> Self {
        let mut seen = [false; 4];
        for status in members {
            match status {
                ContainerStatus::Running => return Self::Running,
                ContainerStatus::Paused => seen[0] = true,
                ContainerStatus::Stopped => seen[1] = true,
                ContainerStatus::Exited => seen[2] = true,
                _ => seen[3] = true,
            }
        }
        if seen[0] {
            Self::Paused
        } else if seen[1] {
            Self::Stopped
        } else if seen[2] {
            Self::Exited
        } else {
            Self::Created
        }
    }

    /// PascalCase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Stopped => "Stopped",
            Self::Exited => "Exited",
        }
    }
}

impl std::fmt::Display for PodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PodStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::error::Error::InvalidSpec(format!("unknown pod status '{s}'")))
    }
}

// =============================================================================
// Pod Record
// =============================================================================

/// Persisted pod record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    /// 64-hex ID, immutable.
    pub id: String,
    /// Unique name.
    pub name: String,
    /// Requested configuration.
    pub spec: PodSpec,
    /// Resolved shared namespaces.
    pub shared: BTreeSet<NamespaceKind>,
    /// Infra container ID.
    pub infra_id: Option<String>,
    /// Member container IDs in insertion order, infra excluded.
    pub members: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Pod {
    /// 12-character ID prefix.
    pub fn short_id(&self) -> &str {
        &self.id[..crate::constants::SHORT_ID_LEN.min(self.id.len())]
    }

    /// Container anchoring the shared namespaces: the infra container, or the
    /// first member for infra-less pods.
    pub fn anchor(&self) -> Option<&str> {
        self.infra_id
            .as_deref()
            .or_else(|| self.members.first().map(String::as_str))
    }

    /// True if the pod shares `kind`.
    pub fn shares(&self, kind: NamespaceKind) -> bool {
        self.shared.contains(&kind)
    }

    /// Infra plus members, infra first.
    pub fn all_containers(&self) -> Vec<String> {
        self.infra_id
            .iter()
            .chain(self.members.iter())
            .cloned()
            .collect()
    }
}

// =============================================================================
// Pod Summary
// =============================================================================

/// Lightweight pod information for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PodSummary {
    pub id: String,
    pub name: String,
    pub status: PodStatus,
    pub infra_id: Option<String>,
    pub number_of_containers: usize,
    pub created: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ContainerStatus as C;

    #[test]
    fn test_aggregate() {
        assert_eq!(PodStatus::aggregate([]), PodStatus::Created);
        assert_eq!(
            PodStatus::aggregate([C::Exited, C::Running]),
            PodStatus::Running
        );
        assert_eq!(
            PodStatus::aggregate([C::Paused, C::Paused]),
            PodStatus::Paused
        );
        assert_eq!(
            PodStatus::aggregate([C::Exited, C::Stopped]),
            PodStatus::Stopped
        );
        assert_eq!(
            PodStatus::aggregate([C::Exited, C::Created]),
            PodStatus::Exited
        );
        assert_eq!(
            PodStatus::aggregate([C::Initialized]),
            PodStatus::Created
        );
    }

    #[test]
    fn test_pod_status_from_str() {
        assert_eq!("running".parse::<PodStatus>().unwrap(), PodStatus::Running);
        assert!("degraded".parse::<PodStatus>().is_err());
    }
}

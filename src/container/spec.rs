//! Container specification types.
//!
//! A [`ContainerSpec`] is the fully resolved, user-facing configuration of a
//! container. It owns every value it holds, so `Clone` produces an
//! independent deep copy: a clone can be mutated, started or removed without
//! touching its source.

use crate::constants::{MAX_IMAGE_REF_LEN, validate_name};
use crate::error::{Error, Result};
use crate::runtime::Signal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Constants for Spec Validation
// =============================================================================

/// Maximum number of environment variables per container.
pub const MAX_ENV_VARS: usize = 256;

/// Maximum length of an environment variable value (32 KiB).
pub const MAX_ENV_VALUE_LEN: usize = 32 * 1024;

/// Maximum number of labels or annotations per entity.
pub const MAX_LABELS: usize = 64;

/// Maximum length for label/annotation keys.
pub const MAX_LABEL_KEY_LEN: usize = 253;

/// Maximum length for label/annotation values.
pub const MAX_LABEL_VALUE_LEN: usize = 63 * 1024;

/// CFS period used when translating `--cpus` into a quota.
pub const DEFAULT_CPU_PERIOD: u64 = 100_000;

// =============================================================================
// Namespaces
// =============================================================================

/// Namespaces a pod can share between its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    Uts,
    Ipc,
    Net,
    Pid,
    Cgroup,
}

impl NamespaceKind {
    /// All shareable kinds.
    pub const ALL: [NamespaceKind; 5] = [
        NamespaceKind::Uts,
        NamespaceKind::Ipc,
        NamespaceKind::Net,
        NamespaceKind::Pid,
        NamespaceKind::Cgroup,
    ];

    /// Namespace type as written in OCI `config.json`.
    pub fn oci_type(&self) -> &'static str {
        match self {
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::Net => "network",
            Self::Pid => "pid",
            Self::Cgroup => "cgroup",
        }
    }

    /// Entry name under `/proc/<pid>/ns/`.
    pub fn proc_name(&self) -> &'static str {
        match self {
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::Net => "net",
            Self::Pid => "pid",
            Self::Cgroup => "cgroup",
        }
    }
}

impl std::fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.proc_name())
    }
}

impl std::str::FromStr for NamespaceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uts" => Ok(Self::Uts),
            "ipc" => Ok(Self::Ipc),
            "net" | "network" => Ok(Self::Net),
            "pid" => Ok(Self::Pid),
            "cgroup" => Ok(Self::Cgroup),
            other => Err(Error::InvalidSpec(format!(
                "unknown namespace '{other}'"
            ))),
        }
    }
}

/// How a container obtains one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode", content = "target")]
pub enum NamespaceMode {
    /// Not specified: shared with the pod when the pod shares it, private otherwise.
    #[default]
    Default,
    /// A fresh namespace.
    Private,
    /// The host's namespace.
    Host,
    /// The pod's shared namespace.
    Pod,
    /// The namespace of another container.
    Container(String),
}

impl std::str::FromStr for NamespaceMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" => Ok(Self::Default),
            "private" | "bridge" => Ok(Self::Private),
            "host" => Ok(Self::Host),
            "pod" => Ok(Self::Pod),
            other => match other.strip_prefix("container:") {
                Some(target) if !target.is_empty() => Ok(Self::Container(target.to_string())),
                _ => Err(Error::InvalidSpec(format!(
                    "invalid namespace mode '{other}'"
                ))),
            },
        }
    }
}

/// Requested namespace modes keyed by kind. Missing kinds are `Default`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Namespaces(BTreeMap<NamespaceKind, NamespaceMode>);

impl Namespaces {
    /// Returns the mode for `kind`.
    pub fn get(&self, kind: NamespaceKind) -> &NamespaceMode {
        static DEFAULT: NamespaceMode = NamespaceMode::Default;
        self.0.get(&kind).unwrap_or(&DEFAULT)
    }

    /// Sets the mode for `kind`.
    pub fn set(&mut self, kind: NamespaceKind, mode: NamespaceMode) {
        if mode == NamespaceMode::Default {
            self.0.remove(&kind);
        } else {
            self.0.insert(kind, mode);
        }
    }

    /// Iterates over every kind with its mode.
    pub fn iter(&self) -> impl Iterator<Item = (NamespaceKind, &NamespaceMode)> {
        NamespaceKind::ALL.into_iter().map(|k| (k, self.get(k)))
    }
}

// =============================================================================
// Restart Policy
// =============================================================================

/// What to do when the container process exits on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum RestartPolicy {
    /// Never restart.
    #[default]
    No,
    /// Always restart.
    Always,
    /// Restart on non-zero exit, optionally bounded.
    OnFailure { max_retries: Option<u32> },
    /// Restart unless the user stopped the container.
    UnlessStopped,
}

impl RestartPolicy {
    /// Policy name without the retry count.
    pub fn name(&self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Always => "always",
            Self::OnFailure { .. } => "on-failure",
            Self::UnlessStopped => "unless-stopped",
        }
    }

    /// Retry count for `on-failure`, zero otherwise.
    pub fn max_retries(&self) -> u32 {
        match self {
            Self::OnFailure { max_retries } => max_retries.unwrap_or(0),
            _ => 0,
        }
    }
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OnFailure {
                max_retries: Some(n),
            } => write!(f, "on-failure:{n}"),
            other => f.write_str(other.name()),
        }
    }
}

impl std::str::FromStr for RestartPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, count) = match s.split_once(':') {
            Some((name, count)) => (name, Some(count)),
            None => (s, None),
        };
        let policy = match name.to_ascii_lowercase().as_str() {
            "" | "no" | "never" => Self::No,
            "always" => Self::Always,
            "unless-stopped" => Self::UnlessStopped,
            "on-failure" => {
                let max_retries = count
                    .map(|c| {
                        c.parse::<u32>().map_err(|_| {
                            Error::InvalidSpec(format!("invalid restart retry count '{c}'"))
                        })
                    })
                    .transpose()?;
                return Ok(Self::OnFailure { max_retries });
            }
            other => {
                return Err(Error::InvalidSpec(format!(
                    "invalid restart policy '{other}'"
                )));
            }
        };
        if count.is_some() {
            return Err(Error::InvalidSpec(format!(
                "restart policy '{name}' does not take a retry count"
            )));
        }
        Ok(policy)
    }
}

impl From<RestartPolicy> for String {
    fn from(policy: RestartPolicy) -> Self {
        policy.to_string()
    }
}

impl TryFrom<String> for RestartPolicy {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

// =============================================================================
// Resources
// =============================================================================

/// A process resource limit (`--ulimit nofile=1024:2048`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ulimit {
    /// Resource name without the `RLIMIT_` prefix, lowercase.
    pub name: String,
    /// Soft limit.
    pub soft: i64,
    /// Hard limit.
    pub hard: i64,
}

impl std::str::FromStr for Ulimit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidSpec(format!("invalid ulimit '{s}'"));
        let (name, limits) = s.split_once('=').ok_or_else(invalid)?;
        let parse = |v: &str| -> Result<i64> {
            if v == "-1" || v == "unlimited" {
                Ok(-1)
            } else {
                v.parse::<i64>().map_err(|_| invalid())
            }
        };
        let (soft, hard) = match limits.split_once(':') {
            Some((soft, hard)) => (parse(soft)?, parse(hard)?),
            None => {
                let v = parse(limits)?;
                (v, v)
            }
        };
        if hard >= 0 && (soft < 0 || soft > hard) {
            return Err(Error::InvalidSpec(format!(
                "ulimit '{name}' soft limit exceeds hard limit"
            )));
        }
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err(invalid());
        }
        Ok(Self { name, soft, hard })
    }
}

/// cgroup and rlimit settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    /// CPU limit in units of 1e-9 CPUs.
    pub nano_cpus: i64,
    /// Relative CPU weight.
    pub cpu_shares: u64,
    /// CFS quota in microseconds.
    pub cpu_quota: i64,
    /// CFS period in microseconds.
    pub cpu_period: u64,
    /// Memory limit in bytes.
    pub memory: i64,
    /// Memory + swap limit in bytes, -1 for unlimited.
    pub memory_swap: i64,
    /// OOM score adjustment.
    pub oom_score_adj: Option<i32>,
    /// Maximum number of PIDs.
    pub pids_limit: i64,
    /// Process rlimits.
    pub ulimits: Vec<Ulimit>,
}

impl Resources {
    /// Sets the CPU limit from a fractional CPU count (`--cpus`).
    ///
    /// Replaces any previous quota and period.
    pub fn set_cpus(&mut self, cpus: f64) -> Result<()> {
        if !cpus.is_finite() || cpus < 0.0 {
            return Err(Error::InvalidSpec(format!("invalid CPU count {cpus}")));
        }
        #[allow(clippy::cast_possible_truncation)]
        let nano = (cpus * 1e9).round() as i64;
        self.nano_cpus = nano;
        self.cpu_quota = 0;
        self.cpu_period = 0;
        Ok(())
    }

    /// Sets the memory limit, accepting `512m`, `1g`, `1024`.
    pub fn set_memory(&mut self, memory: &str) -> Result<()> {
        self.memory = parse_bytes(memory)?;
        Ok(())
    }

    /// Effective CFS (quota, period) pair, derived from `nano_cpus` when set.
    pub fn cfs(&self) -> Option<(i64, u64)> {
        if self.nano_cpus > 0 {
            #[allow(clippy::cast_possible_wrap)]
            let quota = self.nano_cpus * DEFAULT_CPU_PERIOD as i64 / 1_000_000_000;
            Some((quota, DEFAULT_CPU_PERIOD))
        } else if self.cpu_quota > 0 {
            let period = if self.cpu_period > 0 {
                self.cpu_period
            } else {
                DEFAULT_CPU_PERIOD
            };
            Some((self.cpu_quota, period))
        } else {
            None
        }
    }

    fn validate(&self) -> Result<()> {
        if self.nano_cpus < 0 {
            return Err(Error::InvalidSpec("nano CPUs cannot be negative".to_string()));
        }
        if self.nano_cpus > 0 && self.cpu_quota > 0 {
            return Err(Error::InvalidSpec(
                "--cpus conflicts with --cpu-quota".to_string(),
            ));
        }
        if self.memory < 0 {
            return Err(Error::InvalidSpec("memory cannot be negative".to_string()));
        }
        if self.memory_swap > 0 && self.memory > 0 && self.memory_swap < self.memory {
            return Err(Error::InvalidSpec(
                "memory-swap must be at least the memory limit".to_string(),
            ));
        }
        if let Some(adj) = self.oom_score_adj
            && !(-1000..=1000).contains(&adj)
        {
            return Err(Error::InvalidSpec(format!(
                "oom-score-adj {adj} outside -1000..=1000"
            )));
        }
        Ok(())
    }
}

/// Parses a byte size such as `512m`, `1g`, `64k`, `100b` or `1024`.
pub fn parse_bytes(s: &str) -> Result<i64> {
    let trimmed = s.trim().to_ascii_lowercase();
    let invalid = || Error::InvalidSpec(format!("invalid size '{s}'"));
    let trimmed = trimmed.strip_suffix('b').unwrap_or(&trimmed);
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024_i64),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        Some(_) => (trimmed, 1),
        None => return Err(invalid()),
    };
    let value: f64 = digits.parse().map_err(|_| invalid())?;
    if value < 0.0 {
        return Err(invalid());
    }
    #[allow(clippy::cast_possible_truncation)]
    Ok((value * multiplier as f64) as i64)
}

// =============================================================================
// Network Attachments and Mounts
// =============================================================================

/// One network the container is attached to. Recorded, not plumbed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Network name.
    pub name: String,
    /// DNS aliases on that network.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Requested static IP address.
    #[serde(default)]
    pub static_ip: Option<String>,
    /// Requested static MAC address.
    #[serde(default)]
    pub static_mac: Option<String>,
}

impl NetworkAttachment {
    /// Attachment without aliases or static addresses.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            static_ip: None,
            static_mac: None,
        }
    }
}

/// A mount added by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Mount type: `bind`, `tmpfs` or `volume`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Host path or volume name.
    pub source: String,
    /// Path inside the container.
    pub destination: String,
    /// Mount options.
    #[serde(default)]
    pub options: Vec<String>,
}

impl std::str::FromStr for MountSpec {
    type Err = Error;

    /// Parses `-v` syntax: `SRC:DEST[:OPTS]`.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let (source, destination, options) = match parts.as_slice() {
            [src, dst] => (*src, *dst, Vec::new()),
            [src, dst, opts] => (
                *src,
                *dst,
                opts.split(',').map(str::to_string).collect(),
            ),
            _ => return Err(Error::InvalidSpec(format!("invalid volume '{s}'"))),
        };
        if !destination.starts_with('/') {
            return Err(Error::InvalidSpec(format!(
                "mount destination '{destination}' must be absolute"
            )));
        }
        let kind = if source.starts_with('/') { "bind" } else { "volume" };
        Ok(Self {
            kind: kind.to_string(),
            source: source.to_string(),
            destination: destination.to_string(),
            options,
        })
    }
}

// =============================================================================
// Container Specification
// =============================================================================

/// Container configuration as requested by the user.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSpec {
    /// Requested name; generated when absent.
    pub name: Option<String>,
    /// Image reference exactly as given.
    pub image: String,
    /// Command (arguments appended to the entrypoint).
    pub command: Vec<String>,
    /// Entrypoint override.
    pub entrypoint: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// OCI annotations.
    pub annotations: BTreeMap<String, String>,
    /// Hostname override.
    pub hostname: Option<String>,
    /// User to run as.
    pub user: Option<String>,
    /// Resource limits.
    pub resources: Resources,
    /// Capabilities added to the default set.
    pub cap_add: Vec<String>,
    /// Capabilities removed from the default set.
    pub cap_drop: Vec<String>,
    /// Network attachments in order.
    pub networks: Vec<NetworkAttachment>,
    /// User mounts.
    pub mounts: Vec<MountSpec>,
    /// Restart policy.
    pub restart_policy: RestartPolicy,
    /// Run with systemd init semantics.
    pub systemd: bool,
    /// Requested namespace modes.
    pub namespaces: Namespaces,
    /// Pod to join (ID or name).
    pub pod: Option<String>,
    /// Remove the container once it exits.
    pub auto_remove: bool,
    /// Stop timeout in seconds.
    pub stop_timeout: Option<u64>,
    /// Signal sent by `stop`.
    pub stop_signal: Option<Signal>,
}

impl ContainerSpec {
    /// Spec for `image` with everything else defaulted.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    /// Sets the name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the command.
    #[must_use]
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the pod to join.
    #[must_use]
    pub fn with_pod(mut self, pod: impl Into<String>) -> Self {
        self.pod = Some(pod.into());
        self
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Validates fields that do not depend on other entities.
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            validate_name(name)
                .map_err(|reason| Error::InvalidSpec(format!("name '{name}': {reason}")))?;
        }
        if self.image.trim().is_empty() {
            return Err(Error::InvalidImageReference {
                reference: self.image.clone(),
                reason: "empty image reference".to_string(),
            });
        }
        if self.image.len() > MAX_IMAGE_REF_LEN {
            return Err(Error::InvalidImageReference {
                reference: self.image.chars().take(64).collect(),
                reason: format!("exceeds {MAX_IMAGE_REF_LEN} bytes"),
            });
        }
        if self.env.len() > MAX_ENV_VARS {
            return Err(Error::InvalidSpec(format!(
                "too many environment variables: {} (max {})",
                self.env.len(),
                MAX_ENV_VARS
            )));
        }
        if let Some((key, _)) = self.env.iter().find(|(_, v)| v.len() > MAX_ENV_VALUE_LEN) {
            return Err(Error::InvalidSpec(format!(
                "env variable {key} value exceeds limit of {MAX_ENV_VALUE_LEN} bytes"
            )));
        }
        validate_string_map(&self.labels, "label")?;
        validate_string_map(&self.annotations, "annotation")?;
        self.resources.validate()?;
        for (kind, mode) in self.namespaces.iter() {
            if mode == &NamespaceMode::Pod && self.pod.is_none() {
                return Err(Error::InvalidSpec(format!(
                    "namespace {kind} set to pod but the container is not in a pod"
                )));
            }
        }
        Ok(())
    }
}

/// Validates label or annotation maps against count and size bounds.
pub fn validate_string_map(map: &BTreeMap<String, String>, kind: &str) -> Result<()> {
    if map.len() > MAX_LABELS {
        return Err(Error::InvalidSpec(format!(
            "too many {}s: {} (max {})",
            kind,
            map.len(),
            MAX_LABELS
        )));
    }
    for (key, val) in map {
        if key.is_empty() || key.len() > MAX_LABEL_KEY_LEN {
            return Err(Error::InvalidSpec(format!(
                "{kind} key '{key}' must be 1..={MAX_LABEL_KEY_LEN} bytes"
            )));
        }
        if val.len() > MAX_LABEL_VALUE_LEN {
            return Err(Error::InvalidSpec(format!(
                "{kind} value for '{key}' exceeds max length {MAX_LABEL_VALUE_LEN}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpus_to_nano_cpus() {
        let mut res = Resources::default();
        res.set_cpus(5.0).unwrap();
        assert_eq!(res.nano_cpus, 5_000_000_000);
        assert_eq!(res.cfs(), Some((500_000, DEFAULT_CPU_PERIOD)));
        res.set_cpus(0.5).unwrap();
        assert_eq!(res.nano_cpus, 500_000_000);
        assert!(res.set_cpus(-1.0).is_err());
    }

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("1024").unwrap(), 1024);
        assert_eq!(parse_bytes("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_bytes("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_bytes("64kb").unwrap(), 64 * 1024);
        assert!(parse_bytes("lots").is_err());
    }

    #[test]
    fn test_restart_policy_parsing() {
        assert_eq!("always".parse::<RestartPolicy>().unwrap(), RestartPolicy::Always);
        assert_eq!(
            "on-failure:3".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure {
                max_retries: Some(3)
            }
        );
        assert_eq!(
            RestartPolicy::OnFailure {
                max_retries: Some(3)
            }
            .to_string(),
            "on-failure:3"
        );
        assert!("always:3".parse::<RestartPolicy>().is_err());
        assert!("sometimes".parse::<RestartPolicy>().is_err());
    }

    #[test]
    fn test_ulimit_parsing() {
        let ul: Ulimit = "nofile=1024:2048".parse().unwrap();
        assert_eq!((ul.soft, ul.hard), (1024, 2048));
        let ul: Ulimit = "nproc=512".parse().unwrap();
        assert_eq!((ul.soft, ul.hard), (512, 512));
        assert!("nofile=4096:1024".parse::<Ulimit>().is_err());
    }

    #[test]
    fn test_namespace_mode_parsing() {
        assert_eq!(
            "container:abc".parse::<NamespaceMode>().unwrap(),
            NamespaceMode::Container("abc".to_string())
        );
        assert_eq!("host".parse::<NamespaceMode>().unwrap(), NamespaceMode::Host);
        assert!("container:".parse::<NamespaceMode>().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_image() {
        let spec = ContainerSpec::new("  ");
        assert_eq!(
            spec.validate().unwrap_err().kind(),
            crate::error::ErrorKind::InvalidSpec
        );
    }

    #[test]
    fn test_clone_is_independent() {
        let mut original = ContainerSpec::new("alpine").with_label("a", "1");
        let copy = original.clone();
        original.labels.insert("b".to_string(), "2".to_string());
        original.resources.set_cpus(2.0).unwrap();
        assert_eq!(copy.labels.len(), 1);
        assert_eq!(copy.resources.nano_cpus, 0);
    }
}

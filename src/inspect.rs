//! Inspect documents.
//!
//! Read-only projections of container and pod records into the stable JSON
//! schema scripts consume (`State.Status`, `HostConfig.NanoCpus`, ...).
//! Projection never touches the store.

use crate::constants::OCI_RUNTIME_SPEC_VERSION;
use crate::container::spec::{NamespaceKind, NamespaceMode};
use crate::container::state::{Container, ContainerStatus};
use crate::pod::state::{Pod, PodStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

// =============================================================================
// Container Document
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,
    pub created: DateTime<Utc>,
    pub path: String,
    pub args: Vec<String>,
    pub state: InspectState,
    pub image: String,
    pub image_name: String,
    pub name: String,
    pub restart_count: u32,
    pub pod: String,
    pub is_infra: bool,
    #[serde(rename = "OCIRuntime")]
    pub oci_runtime: String,
    pub config: InspectConfig,
    pub host_config: InspectHostConfig,
    pub network_settings: InspectNetworkSettings,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectState {
    pub oci_version: String,
    pub status: String,
    pub running: bool,
    pub paused: bool,
    pub restarting: bool,
    #[serde(rename = "OOMKilled")]
    pub oom_killed: bool,
    pub dead: bool,
    pub pid: u32,
    pub exit_code: i32,
    pub error: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub checkpointed: bool,
    pub checkpointed_at: Option<DateTime<Utc>>,
    pub restored: bool,
    pub restored_at: Option<DateTime<Utc>>,
    pub checkpoint_path: String,
    pub checkpoint_log: String,
    pub restore_log: String,
    pub stopped_by_user: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectConfig {
    pub hostname: String,
    pub user: String,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub image: String,
    pub working_dir: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub stop_signal: String,
    pub stop_timeout: u64,
    pub systemd_mode: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectHostConfig {
    pub nano_cpus: i64,
    pub cpu_shares: u64,
    pub cpu_quota: i64,
    pub cpu_period: u64,
    pub memory: i64,
    pub memory_swap: i64,
    pub oom_score_adj: i32,
    pub pids_limit: i64,
    pub ulimits: Vec<InspectUlimit>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub network_mode: String,
    pub ipc_mode: String,
    #[serde(rename = "UTSMode")]
    pub uts_mode: String,
    pub pid_mode: String,
    pub cgroupns_mode: String,
    pub restart_policy: InspectRestartPolicy,
    pub auto_remove: bool,
    pub binds: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectUlimit {
    pub name: String,
    pub soft: i64,
    pub hard: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectRestartPolicy {
    pub name: String,
    pub maximum_retry_count: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectNetworkSettings {
    pub networks: BTreeMap<String, InspectNetwork>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectNetwork {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    pub aliases: Vec<String>,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    pub mac_address: String,
}

/// Renders a namespace mode the way the host config reports it.
///
/// Pod-shared namespaces point at the pod's anchor container.
fn mode_string(container: &Container, pod: Option<&Pod>, kind: NamespaceKind) -> String {
    let private = if kind == NamespaceKind::Net {
        "bridge"
    } else {
        "private"
    };
    match container.namespace(kind) {
        NamespaceMode::Host => "host".to_string(),
        NamespaceMode::Container(id) => format!("container:{id}"),
        NamespaceMode::Pod => match pod.and_then(Pod::anchor) {
            Some(anchor) if anchor != container.id => format!("container:{anchor}"),
            _ => private.to_string(),
        },
        NamespaceMode::Private | NamespaceMode::Default => private.to_string(),
    }
}

fn path_string(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string()).unwrap_or_default()
}

/// Projects a container record.
pub fn container(container: &Container, pod: Option<&Pod>) -> ContainerInspect {
    let spec = &container.spec;
    let state = &container.state;
    let status = container.status();

    let mut args: Vec<String> = spec.entrypoint.iter().chain(&spec.command).cloned().collect();
    let path = if args.is_empty() {
        String::new()
    } else {
        args.remove(0)
    };

    let (cpu_quota, cpu_period) = spec.resources.cfs().unwrap_or((0, 0));

    let network_mode = mode_string(container, pod, NamespaceKind::Net);
    // Containers joining another network namespace have no networks of their own.
    let networks = if network_mode.starts_with("container:") || network_mode == "host" {
        BTreeMap::new()
    } else {
        spec.networks
            .iter()
            .map(|n| {
                (
                    n.name.clone(),
                    InspectNetwork {
                        network_id: n.name.clone(),
                        aliases: n.aliases.clone(),
                        ip_address: n.static_ip.clone().unwrap_or_default(),
                        mac_address: n.static_mac.clone().unwrap_or_default(),
                    },
                )
            })
            .collect()
    };

    ContainerInspect {
        id: container.id.clone(),
        created: container.created_at,
        path,
        args,
        state: InspectState {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            status: status.as_str().to_string(),
            running: status == ContainerStatus::Running,
            paused: status == ContainerStatus::Paused,
            restarting: false,
            oom_killed: false,
            dead: false,
            pid: state.pid.unwrap_or(0),
            exit_code: state.exit_code.unwrap_or(0),
            error: state.error.clone().unwrap_or_default(),
            started_at: state.started_at,
            finished_at: state.finished_at,
            checkpointed: state.checkpointed,
            checkpointed_at: state.checkpointed_at,
            restored: state.restored,
            restored_at: state.restored_at,
            checkpoint_path: path_string(state.checkpoint_path.as_deref()),
            checkpoint_log: path_string(state.checkpoint_log.as_deref()),
            restore_log: path_string(state.restore_log.as_deref()),
            stopped_by_user: state.stopped_by_user,
        },
        image: container.image_id.clone(),
        image_name: container.image_name.clone(),
        name: container.name.clone(),
        restart_count: state.restart_count,
        pod: container.pod_id.clone().unwrap_or_default(),
        is_infra: container.is_infra,
        oci_runtime: container.runtime.clone(),
        config: InspectConfig {
            hostname: spec
                .hostname
                .clone()
                .unwrap_or_else(|| container.short_id().to_string()),
            user: spec.user.clone().unwrap_or_default(),
            env: spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            cmd: spec.command.clone(),
            entrypoint: spec.entrypoint.clone(),
            image: container.image_name.clone(),
            working_dir: spec.working_dir.clone().unwrap_or_else(|| "/".to_string()),
            labels: spec.labels.clone(),
            annotations: spec.annotations.clone(),
            stop_signal: spec
                .stop_signal
                .map(|s| s.to_string())
                .unwrap_or_else(|| "SIGTERM".to_string()),
            stop_timeout: spec
                .stop_timeout
                .unwrap_or(crate::constants::DEFAULT_STOP_TIMEOUT.as_secs()),
            systemd_mode: spec.systemd,
        },
        host_config: InspectHostConfig {
            nano_cpus: spec.resources.nano_cpus,
            cpu_shares: spec.resources.cpu_shares,
            cpu_quota,
            cpu_period,
            memory: spec.resources.memory,
            memory_swap: spec.resources.memory_swap,
            oom_score_adj: spec.resources.oom_score_adj.unwrap_or(0),
            pids_limit: spec.resources.pids_limit,
            ulimits: spec
                .resources
                .ulimits
                .iter()
                .map(|u| InspectUlimit {
                    name: format!("RLIMIT_{}", u.name.to_ascii_uppercase()),
                    soft: u.soft,
                    hard: u.hard,
                })
                .collect(),
            cap_add: spec.cap_add.clone(),
            cap_drop: spec.cap_drop.clone(),
            network_mode,
            ipc_mode: mode_string(container, pod, NamespaceKind::Ipc),
            uts_mode: mode_string(container, pod, NamespaceKind::Uts),
            pid_mode: mode_string(container, pod, NamespaceKind::Pid),
            cgroupns_mode: mode_string(container, pod, NamespaceKind::Cgroup),
            restart_policy: InspectRestartPolicy {
                name: spec.restart_policy.name().to_string(),
                maximum_retry_count: spec.restart_policy.max_retries(),
            },
            auto_remove: spec.auto_remove,
            binds: spec
                .mounts
                .iter()
                .filter(|m| m.kind == "bind")
                .map(|m| {
                    if m.options.is_empty() {
                        format!("{}:{}", m.source, m.destination)
                    } else {
                        format!("{}:{}:{}", m.source, m.destination, m.options.join(","))
                    }
                })
                .collect(),
        },
        network_settings: InspectNetworkSettings { networks },
    }
}

// =============================================================================
// Pod Document
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PodInspect {
    pub id: String,
    pub name: String,
    pub created: DateTime<Utc>,
    pub state: String,
    pub hostname: String,
    pub labels: BTreeMap<String, String>,
    pub create_infra: bool,
    pub infra_container_id: String,
    pub shared_namespaces: Vec<String>,
    pub num_containers: usize,
    pub containers: Vec<PodInspectMember>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PodInspectMember {
    pub id: String,
    pub name: String,
    pub state: String,
}

/// Projects a pod with the records of its infra and member containers.
pub fn pod(pod: &Pod, status: PodStatus, containers: &[Container]) -> PodInspect {
    PodInspect {
        id: pod.id.clone(),
        name: pod.name.clone(),
        created: pod.created_at,
        state: status.as_str().to_string(),
        hostname: pod.spec.hostname.clone().unwrap_or_else(|| pod.name.clone()),
        labels: pod.spec.labels.clone(),
        create_infra: pod.infra_id.is_some(),
        infra_container_id: pod.infra_id.clone().unwrap_or_default(),
        shared_namespaces: pod
            .shared
            .iter()
            .map(|k| k.proc_name().to_string())
            .collect(),
        num_containers: containers.len(),
        containers: containers
            .iter()
            .map(|c| PodInspectMember {
                id: c.id.clone(),
                name: c.name.clone(),
                state: c.status().as_str().to_string(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::spec::ContainerSpec;
    use crate::container::state::ContainerState;
    use crate::pod::spec::PodSpec;

    fn record(id: &str) -> Container {
        let mut spec = ContainerSpec::new("alpine").with_command(["top"]);
        spec.resources.set_cpus(5.0).unwrap();
        spec.labels.insert("app".to_string(), "web".to_string());
        Container {
            id: id.to_string(),
            name: "c1".to_string(),
            spec,
            image_id: "f".repeat(64),
            image_name: "localhost/alpine:latest".to_string(),
            pod_id: None,
            is_infra: false,
            namespaces: BTreeMap::new(),
            created_at: Utc::now(),
            runtime: "simulated".to_string(),
            state: ContainerState::default(),
        }
    }

    #[test]
    fn test_container_schema_fields() {
        let c = record(&"a".repeat(64));
        let doc = serde_json::to_value(container(&c, None)).unwrap();
        assert_eq!(doc["State"]["Status"], "created");
        assert_eq!(doc["State"]["Checkpointed"], false);
        assert_eq!(doc["State"]["CheckpointPath"], "");
        assert_eq!(doc["HostConfig"]["NanoCpus"], 5_000_000_000i64);
        assert_eq!(doc["HostConfig"]["NetworkMode"], "bridge");
        assert_eq!(doc["Config"]["Labels"]["app"], "web");
        assert_eq!(doc["Path"], "top");
        assert!(doc["NetworkSettings"]["Networks"].is_object());
    }

    #[test]
    fn test_pod_network_mode_points_at_anchor() {
        let infra = "b".repeat(64);
        let pod = Pod {
            id: "p".repeat(64),
            name: "p1".to_string(),
            spec: PodSpec::named("p1"),
            shared: [NamespaceKind::Net].into_iter().collect(),
            infra_id: Some(infra.clone()),
            members: vec!["a".repeat(64)],
            created_at: Utc::now(),
        };
        let mut c = record(&"a".repeat(64));
        c.pod_id = Some(pod.id.clone());
        c.namespaces.insert(NamespaceKind::Net, NamespaceMode::Pod);
        let doc = container(&c, Some(&pod));
        assert_eq!(doc.host_config.network_mode, format!("container:{infra}"));
        assert_eq!(doc.host_config.ipc_mode, "private");
        assert!(doc.network_settings.networks.is_empty());
    }
}

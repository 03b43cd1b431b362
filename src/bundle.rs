//! OCI Runtime Bundle building and layer archives.
//!
//! Converts a container record into the `config.json` consumed by runc/crun,
//! and packs/unpacks the gzip'd tar layers the storage layer keeps as blobs.
//!
//! ## Namespace Joining
//!
//! Namespaces shared with a pod or another container are written as join
//! paths of the anchor's init process:
//!
//! ```json
//! { "type": "network", "path": "/proc/1234/ns/net" }
//! ```

use crate::constants::{
    DEFAULT_PATH_ENV, MAX_CHECKPOINT_SIZE, MAX_FILES_PER_LAYER, OCI_RUNTIME_SPEC_VERSION,
};
use crate::container::spec::{NamespaceKind, NamespaceMode};
use crate::container::state::Container;
use crate::error::{Error, Result};
use crate::storage::write_atomic;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, Header};
use tracing::{debug, warn};

/// Capabilities granted when the user neither adds nor drops any.
pub const DEFAULT_CAPABILITIES: [&str; 11] = [
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_NET_BIND_SERVICE",
    "CAP_SETFCAP",
    "CAP_SETGID",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYS_CHROOT",
];

// =============================================================================
// Bundle Generation
// =============================================================================

/// Resolved inputs for one bundle.
#[derive(Debug, Clone, Default)]
pub struct BundleContext {
    /// Absolute rootfs path.
    pub rootfs: PathBuf,
    /// Join paths for shared namespaces.
    pub join_paths: HashMap<NamespaceKind, PathBuf>,
    /// Hostname override coming from the pod.
    pub hostname: Option<String>,
}

/// Path of namespace `kind` of process `pid`.
pub fn namespace_path(pid: u32, kind: NamespaceKind) -> PathBuf {
    PathBuf::from(format!("/proc/{}/ns/{}", pid, kind.proc_name()))
}

/// Generates the OCI runtime spec for a container.
pub fn generate_oci_spec(container: &Container, ctx: &BundleContext) -> OciSpec {
    let spec = &container.spec;

    let mut env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    if !spec.env.contains_key("PATH") {
        env.push(format!("PATH={DEFAULT_PATH_ENV}"));
    }
    if spec.systemd {
        env.push("container=magikpod".to_string());
    }

    let mut args: Vec<String> = spec.entrypoint.clone();
    args.extend(spec.command.iter().cloned());
    if args.is_empty() {
        args.push("/bin/sh".to_string());
    }

    let capabilities = effective_capabilities(&spec.cap_add, &spec.cap_drop);
    let rlimits = spec
        .resources
        .ulimits
        .iter()
        .map(|u| OciRlimit {
            rlimit_type: format!("RLIMIT_{}", u.name.to_ascii_uppercase()),
            soft: u.soft,
            hard: u.hard,
        })
        .collect();

    let mut namespaces = vec![OciNamespace {
        ns_type: "mount".to_string(),
        path: None,
    }];
    for kind in NamespaceKind::ALL {
        match container.namespace(kind) {
            NamespaceMode::Host => {}
            NamespaceMode::Pod | NamespaceMode::Container(_) => {
                namespaces.push(OciNamespace {
                    ns_type: kind.oci_type().to_string(),
                    path: ctx
                        .join_paths
                        .get(&kind)
                        .map(|p| p.to_string_lossy().into_owned()),
                });
            }
            NamespaceMode::Private | NamespaceMode::Default => namespaces.push(OciNamespace {
                ns_type: kind.oci_type().to_string(),
                path: None,
            }),
        }
    }

    let mut mounts = default_mounts();
    for m in &spec.mounts {
        let mut options = m.options.clone();
        if m.kind == "bind" && !options.iter().any(|o| o == "bind" || o == "rbind") {
            options.push("rbind".to_string());
        }
        mounts.push(OciMount {
            destination: m.destination.clone(),
            mount_type: m.kind.clone(),
            source: m.source.clone(),
            options,
        });
    }

    let res = &spec.resources;
    let cpu = match (res.cpu_shares, res.cfs()) {
        (0, None) => None,
        (shares, cfs) => Some(OciCpu {
            shares: (shares > 0).then_some(shares),
            quota: cfs.map(|(q, _)| q),
            period: cfs.map(|(_, p)| p),
        }),
    };
    let memory = (res.memory > 0 || res.memory_swap != 0).then(|| OciMemory {
        limit: (res.memory > 0).then_some(res.memory),
        swap: (res.memory_swap != 0).then_some(res.memory_swap),
    });
    let pids = (res.pids_limit > 0).then(|| OciPids {
        limit: res.pids_limit,
    });
    let resources = (cpu.is_some() || memory.is_some() || pids.is_some()).then(|| {
        OciResources {
            memory,
            cpu,
            pids,
        }
    });

    let hostname = spec
        .hostname
        .clone()
        .or_else(|| ctx.hostname.clone())
        .unwrap_or_else(|| container.short_id().to_string());

    OciSpec {
        oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
        root: OciRoot {
            path: ctx.rootfs.to_string_lossy().into_owned(),
            readonly: false,
        },
        process: OciProcess {
            terminal: false,
            user: OciUser { uid: 0, gid: 0 },
            args,
            env,
            cwd: spec.working_dir.clone().unwrap_or_else(|| "/".to_string()),
            capabilities: Some(OciCapabilities {
                bounding: capabilities.clone(),
                effective: capabilities.clone(),
                permitted: capabilities,
            }),
            rlimits,
            oom_score_adj: res.oom_score_adj,
        },
        hostname,
        mounts,
        annotations: spec.annotations.clone(),
        linux: Some(OciLinux {
            namespaces,
            resources,
        }),
    }
}

/// Applies `--cap-add`/`--cap-drop` to the default capability set.
pub fn effective_capabilities(add: &[String], drop: &[String]) -> Vec<String> {
    let normalize = |c: &String| {
        let upper = c.trim().to_ascii_uppercase();
        if upper == "ALL" || upper.starts_with("CAP_") {
            upper
        } else {
            format!("CAP_{upper}")
        }
    };
    let add: Vec<String> = add.iter().map(normalize).collect();
    let drop: Vec<String> = drop.iter().map(normalize).collect();

    if drop.iter().any(|c| c == "ALL") {
        return add.into_iter().filter(|c| c != "ALL").collect();
    }
    let mut caps: BTreeSet<String> = DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect();
    caps.extend(add.into_iter().filter(|c| c != "ALL"));
    caps.retain(|c| !drop.contains(c));
    caps.into_iter().collect()
}

/// Writes `config.json` atomically into the bundle directory.
pub fn write_config(bundle: &Path, spec: &OciSpec) -> Result<PathBuf> {
    fs::create_dir_all(bundle)?;
    let path = bundle.join(crate::constants::BUNDLE_CONFIG_FILE);
    let json = serde_json::to_vec_pretty(spec)?;
    write_atomic(&path, &json)?;
    debug!(bundle = %bundle.display(), "wrote OCI config");
    Ok(path)
}

/// Reads `config.json` from a bundle directory.
pub fn read_config(bundle: &Path) -> Result<OciSpec> {
    let data = fs::read(bundle.join(crate::constants::BUNDLE_CONFIG_FILE))?;
    Ok(serde_json::from_slice(&data)?)
}

/// Returns default OCI mounts.
fn default_mounts() -> Vec<OciMount> {
    vec![
        OciMount {
            destination: "/proc".to_string(),
            mount_type: "proc".to_string(),
            source: "proc".to_string(),
            options: vec![],
        },
        OciMount {
            destination: "/dev".to_string(),
            mount_type: "tmpfs".to_string(),
            source: "tmpfs".to_string(),
            options: vec![
                "nosuid".to_string(),
                "strictatime".to_string(),
                "mode=755".to_string(),
            ],
        },
        OciMount {
            destination: "/dev/pts".to_string(),
            mount_type: "devpts".to_string(),
            source: "devpts".to_string(),
            options: vec![
                "nosuid".to_string(),
                "noexec".to_string(),
                "newinstance".to_string(),
            ],
        },
        OciMount {
            destination: "/sys".to_string(),
            mount_type: "sysfs".to_string(),
            source: "sysfs".to_string(),
            options: vec![
                "nosuid".to_string(),
                "noexec".to_string(),
                "nodev".to_string(),
                "ro".to_string(),
            ],
        },
    ]
}

// =============================================================================
// OCI Runtime Spec Types
// =============================================================================

/// OCI Runtime Spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciSpec {
    pub oci_version: String,
    pub root: OciRoot,
    pub process: OciProcess,
    pub hostname: String,
    pub mounts: Vec<OciMount>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<OciLinux>,
}

/// OCI root filesystem config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciRoot {
    pub path: String,
    pub readonly: bool,
}

/// OCI process config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciProcess {
    pub terminal: bool,
    pub user: OciUser,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<OciCapabilities>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rlimits: Vec<OciRlimit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oom_score_adj: Option<i32>,
}

/// OCI user config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciUser {
    pub uid: u32,
    pub gid: u32,
}

/// OCI capability sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciCapabilities {
    pub bounding: Vec<String>,
    pub effective: Vec<String>,
    pub permitted: Vec<String>,
}

/// OCI rlimit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciRlimit {
    #[serde(rename = "type")]
    pub rlimit_type: String,
    pub soft: i64,
    pub hard: i64,
}

/// OCI mount config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciMount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// OCI Linux-specific config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciLinux {
    pub namespaces: Vec<OciNamespace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<OciResources>,
}

/// OCI namespace config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// OCI resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<OciMemory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<OciCpu>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids: Option<OciPids>,
}

/// OCI memory limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciMemory {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap: Option<i64>,
}

/// OCI CPU limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciCpu {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
}

/// OCI PID limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciPids {
    pub limit: i64,
}

// =============================================================================
// Layer Archives
// =============================================================================

/// A file to place in a layer built from memory.
#[derive(Debug, Clone)]
pub struct LayerFile {
    /// Path relative to the layer root.
    pub path: String,
    /// File content.
    pub data: Vec<u8>,
    /// Unix permission bits.
    pub mode: u32,
}

impl LayerFile {
    /// Executable file.
    pub fn executable(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
            mode: 0o755,
        }
    }

    /// Regular, non-executable file.
    pub fn regular(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
            mode: 0o644,
        }
    }
}

/// Builds a gzip'd tar layer from in-memory files.
pub fn pack_files(files: &[LayerFile]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    for file in files {
        let mut header = Header::new_gnu();
        header.set_size(file.data.len() as u64);
        header.set_mode(file.mode);
        header.set_mtime(0);
        header.set_cksum();
        builder
            .append_data(&mut header, &file.path, file.data.as_slice())
            .map_err(|e| Error::Storage(format!("pack {}: {}", file.path, e)))?;
    }
    finish_archive(builder)
}

/// Builds a gzip'd tar layer from a directory tree plus extra in-memory files.
///
/// Directory entries land under `prefix` inside the archive.
pub fn pack_directory(dir: &Path, prefix: &str, extra: &[LayerFile]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);
    if dir.exists() {
        builder
            .append_dir_all(prefix, dir)
            .map_err(|e| Error::Storage(format!("pack {}: {}", dir.display(), e)))?;
    }
    for file in extra {
        let mut header = Header::new_gnu();
        header.set_size(file.data.len() as u64);
        header.set_mode(file.mode);
        header.set_mtime(0);
        header.set_cksum();
        builder
            .append_data(&mut header, &file.path, file.data.as_slice())
            .map_err(|e| Error::Storage(format!("pack {}: {}", file.path, e)))?;
    }
    finish_archive(builder)
}

fn finish_archive(builder: Builder<GzEncoder<Vec<u8>>>) -> Result<Vec<u8>> {
    let encoder = builder
        .into_inner()
        .map_err(|e| Error::Storage(format!("finish archive: {e}")))?;
    encoder
        .finish()
        .map_err(|e| Error::Storage(format!("compress archive: {e}")))
}

/// Extracts a gzip'd tar layer into `dest`, applying whiteouts.
///
/// # Security
///
/// Entries with absolute paths or `..` components are rejected, and the
/// cumulative extracted size and entry count are bounded.
pub fn extract_layer(data: &[u8], dest: &Path, total_size: &mut u64) -> Result<()> {
    fs::create_dir_all(dest)?;
    let decoder = GzDecoder::new(data);
    let mut archive = Archive::new(decoder);
    let mut count = 0usize;

    let entries = archive
        .entries()
        .map_err(|e| Error::Storage(format!("read layer: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::Storage(format!("read layer entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| Error::Storage(format!("layer entry path: {e}")))?
            .into_owned();

        // SECURITY: reject traversal before touching the filesystem
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(Error::Storage(format!(
                "path traversal in layer entry '{}'",
                path.display()
            )));
        }

        count += 1;
        if count > MAX_FILES_PER_LAYER {
            return Err(Error::Storage(format!(
                "layer exceeds {MAX_FILES_PER_LAYER} entries"
            )));
        }

        let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if let Some(target) = filename.strip_prefix(".wh.") {
            let target_path = dest
                .join(path.parent().unwrap_or(Path::new("")))
                .join(target);
            if target_path.is_dir() {
                let _ = fs::remove_dir_all(&target_path);
            } else if target_path.exists() {
                let _ = fs::remove_file(&target_path);
            }
            continue;
        }

        *total_size += entry.size();
        if *total_size > MAX_CHECKPOINT_SIZE {
            return Err(Error::Storage(format!(
                "extracted size exceeds {MAX_CHECKPOINT_SIZE} bytes"
            )));
        }

        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| Error::Storage(format!("unpack '{}': {}", path.display(), e)))?;
        if !unpacked {
            warn!(entry = %path.display(), "skipped layer entry outside destination");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::spec::ContainerSpec;
    use crate::container::state::ContainerState;
    use tempfile::TempDir;

    fn container(spec: ContainerSpec) -> Container {
        Container {
            id: "a".repeat(64),
            name: "test".to_string(),
            spec,
            image_id: "b".repeat(64),
            image_name: "localhost/alpine:latest".to_string(),
            pod_id: None,
            is_infra: false,
            namespaces: BTreeMap::new(),
            created_at: chrono::Utc::now(),
            runtime: "simulated".to_string(),
            state: ContainerState::default(),
        }
    }

    #[test]
    fn test_generate_spec_resources() {
        let mut spec = ContainerSpec::new("alpine").with_command(["top"]);
        spec.resources.set_cpus(4.0).unwrap();
        spec.resources.memory = 64 * 1024 * 1024;
        spec.resources.oom_score_adj = Some(100);
        spec.resources.ulimits.push("nofile=10:20".parse().unwrap());

        let oci = generate_oci_spec(&container(spec), &BundleContext::default());
        let cpu = oci.linux.as_ref().unwrap().resources.as_ref().unwrap();
        assert_eq!(cpu.cpu.as_ref().unwrap().quota, Some(400_000));
        assert_eq!(cpu.memory.as_ref().unwrap().limit, Some(64 * 1024 * 1024));
        assert_eq!(oci.process.oom_score_adj, Some(100));
        assert_eq!(oci.process.rlimits[0].rlimit_type, "RLIMIT_NOFILE");
        assert_eq!(oci.process.args, vec!["top".to_string()]);
        assert!(oci.process.env.iter().any(|e| e.starts_with("PATH=")));
    }

    #[test]
    fn test_join_paths_for_pod_namespaces() {
        let mut c = container(ContainerSpec::new("alpine"));
        c.namespaces.insert(NamespaceKind::Net, NamespaceMode::Pod);
        let mut ctx = BundleContext::default();
        ctx.join_paths
            .insert(NamespaceKind::Net, namespace_path(42, NamespaceKind::Net));

        let oci = generate_oci_spec(&c, &ctx);
        let ns = oci.linux.unwrap().namespaces;
        let net = ns.iter().find(|n| n.ns_type == "network").unwrap();
        assert_eq!(net.path.as_deref(), Some("/proc/42/ns/net"));
        let pid = ns.iter().find(|n| n.ns_type == "pid").unwrap();
        assert!(pid.path.is_none());
    }

    #[test]
    fn test_capabilities_add_drop() {
        let caps = effective_capabilities(&["net_admin".to_string()], &["CAP_KILL".to_string()]);
        assert!(caps.contains(&"CAP_NET_ADMIN".to_string()));
        assert!(!caps.contains(&"CAP_KILL".to_string()));

        let none = effective_capabilities(&[], &["all".to_string()]);
        assert!(none.is_empty());
    }

    #[test]
    fn test_pack_and_extract_layer() {
        let temp = TempDir::new().unwrap();
        let layer = pack_files(&[
            LayerFile::executable("bin/top", b"#!".to_vec()),
            LayerFile::regular("etc/hostname", b"box".to_vec()),
        ])
        .unwrap();

        let mut total = 0;
        extract_layer(&layer, temp.path(), &mut total).unwrap();
        assert!(temp.path().join("bin/top").exists());
        assert_eq!(fs::read(temp.path().join("etc/hostname")).unwrap(), b"box");

        let whiteout = pack_files(&[LayerFile::regular("etc/.wh.hostname", Vec::new())]).unwrap();
        extract_layer(&whiteout, temp.path(), &mut total).unwrap();
        assert!(!temp.path().join("etc/hostname").exists());
    }

    #[test]
    fn test_extract_rejects_traversal() {
        let temp = TempDir::new().unwrap();
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = Builder::new(encoder);
        let mut header = Header::new_gnu();
        let data = b"evil";
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        // Bypass the builder's own path validation.
        header.as_gnu_mut().unwrap().name[..9].copy_from_slice(b"../escape");
        header.set_cksum();
        builder.append(&header, &data[..]).unwrap();
        let layer = finish_archive(builder).unwrap();

        let mut total = 0;
        let err = extract_layer(&layer, &temp.path().join("root"), &mut total).unwrap_err();
        assert!(err.to_string().contains("traversal"));
    }
}

//! # Entity Store - Container and Pod Records
//!
//! The engine's database. Holds every container and pod record, enforces
//! name uniqueness across both kinds, resolves user references, and
//! evaluates list filters.
//!
//! ## Consistency
//!
//! ```text
//!   state.redb ── one redb write transaction per mutation: re-read,
//!        │         check (names, membership), write changed rows, commit
//!        │         (never held across an await)
//!        │
//!   locks/<id>.lock ── per-entity flock, taken after an in-process tokio
//!                      Mutex; held by lifecycle operations across the
//!                      supervisor call, store update and event
//! ```
//!
//! Several engine processes may share one root. Multi-record changes
//! (adding a member to a pod, removing a pod with its members) commit in one
//! transaction, so no reader ever observes a member whose pod is gone.
//!
//! ## Reference Resolution
//!
//! `exact ID → exact name → unique ID prefix`. A prefix matching several
//! entities is an [`Error::AmbiguousReference`].

use crate::constants::{ID_LEN, LOCK_RETRY_INTERVAL, LOCKS_DIR, STATE_FILE, STORE_LOCK_TIMEOUT};
use crate::container::state::{Container, ContainerStatus};
use crate::error::{Error, Result};
use crate::pod::state::{Pod, PodStatus};
use redb::{Database, DatabaseError, ReadableTable, Table, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

/// Adjectives for generated names.
const NAME_ADJECTIVES: [&str; 16] = [
    "brave", "calm", "eager", "fervent", "gifted", "happy", "jolly", "keen", "lucid", "nifty",
    "quirky", "serene", "sharp", "stoic", "vibrant", "zealous",
];

/// Nouns for generated names.
const NAME_NOUNS: [&str; 16] = [
    "babbage", "curie", "darwin", "euler", "feynman", "gauss", "hopper", "kepler", "lovelace",
    "newton", "noether", "pascal", "ritchie", "shannon", "turing", "wozniak",
];

/// Generates a 64-hex entity ID.
pub fn generate_id() -> String {
    hex::encode(Sha256::digest(uuid::Uuid::new_v4().as_bytes()))
}

// =============================================================================
// Filters
// =============================================================================

/// One `key=value` list filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub key: String,
    pub value: String,
}

impl std::str::FromStr for Filter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| Error::InvalidSpec(format!("invalid filter '{s}': expected key=value")))?;
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(Error::InvalidSpec(format!("invalid filter '{s}': empty key")));
        }
        Ok(Self {
            key,
            value: value.to_string(),
        })
    }
}

/// Parses repeated `--filter` arguments.
pub fn parse_filters<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Filter>> {
    raw.iter().map(|s| s.as_ref().parse()).collect()
}

/// Keys accepted by container list filters.
const CONTAINER_FILTER_KEYS: [&str; 6] = ["id", "name", "label", "status", "pod", "ancestor"];

/// Keys accepted by pod list filters.
const POD_FILTER_KEYS: [&str; 4] = ["id", "name", "label", "status"];

/// Groups filters by key.
///
/// `label` filters combine with AND, every other key ORs its values; the
/// groups combine with AND.
fn group_filters<'a>(filters: &'a [Filter], allowed: &[&str]) -> Result<BTreeMap<&'a str, Vec<&'a str>>> {
    let mut groups: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for filter in filters {
        if !allowed.contains(&filter.key.as_str()) {
            return Err(Error::InvalidSpec(format!(
                "invalid filter key '{}'",
                filter.key
            )));
        }
        groups.entry(filter.key.as_str()).or_default().push(filter.value.as_str());
    }
    Ok(groups)
}

fn matches_group(key: &str, values: &[&str], test: impl Fn(&str) -> bool) -> bool {
    if key == "label" {
        values.iter().all(|v| test(v))
    } else {
        values.iter().any(|v| test(v))
    }
}

/// Matches `key` or `key=value` against a label map.
pub fn label_matches(labels: &BTreeMap<String, String>, filter: &str) -> bool {
    match filter.split_once('=') {
        Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
        None => labels.contains_key(filter),
    }
}

// =============================================================================
// Entity Store
// =============================================================================

/// Container records (ID -> JSON).
const CONTAINERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("containers");

/// Pod records (ID -> JSON).
const PODS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("pods");

fn db_err<E: std::fmt::Display>(context: &'static str) -> impl Fn(E) -> Error {
    move |e| Error::Database(format!("{context}: {e}"))
}

#[derive(Debug, Default, Clone)]
struct Records {
    containers: BTreeMap<String, Container>,
    pods: BTreeMap<String, Pod>,
}

impl Records {
    fn name_owner(&self, name: &str) -> Option<&str> {
        self.containers
            .values()
            .find(|c| c.name == name)
            .map(|c| c.id.as_str())
            .or_else(|| {
                self.pods
                    .values()
                    .find(|p| p.name == name)
                    .map(|p| p.id.as_str())
            })
    }

    fn pod_status(&self, pod: &Pod) -> PodStatus {
        PodStatus::aggregate(
            pod.members
                .iter()
                .filter_map(|id| self.containers.get(id))
                .map(Container::status),
        )
    }
}

/// Serialized rows as read at the start of a write transaction.
#[derive(Default)]
struct Rows {
    containers: BTreeMap<String, Vec<u8>>,
    pods: BTreeMap<String, Vec<u8>>,
}

fn load_table<T, R>(table: &R) -> Result<(BTreeMap<String, T>, BTreeMap<String, Vec<u8>>)>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut records = BTreeMap::new();
    let mut rows = BTreeMap::new();
    for entry in table.iter().map_err(db_err("failed to scan table"))? {
        let (key, value) = entry.map_err(db_err("failed to read row"))?;
        let bytes = value.value().to_vec();
        records.insert(key.value().to_string(), serde_json::from_slice(&bytes)?);
        rows.insert(key.value().to_string(), bytes);
    }
    Ok((records, rows))
}

/// Writes the rows that changed and deletes the ones that disappeared.
fn store_table<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    before: &BTreeMap<String, Vec<u8>>,
    after: &BTreeMap<String, T>,
) -> Result<()> {
    for (id, record) in after {
        let bytes = serde_json::to_vec(record)?;
        if before.get(id) != Some(&bytes) {
            table
                .insert(id.as_str(), bytes.as_slice())
                .map_err(db_err("failed to write row"))?;
        }
    }
    for id in before.keys().filter(|id| !after.contains_key(*id)) {
        table
            .remove(id.as_str())
            .map_err(db_err("failed to delete row"))?;
    }
    Ok(())
}

enum Backend {
    Memory(RwLock<Records>),
    File(PathBuf),
}

/// Exclusive hold on one entity, shared by every engine on the same root.
///
/// Released on drop.
pub struct EntityGuard {
    _file: Option<File>,
    _local: OwnedMutexGuard<()>,
}

/// Record store for containers and pods.
///
/// The file backend opens the database for the span of one transaction,
/// so independent engine processes on the same root serialize on it.
pub struct EntityStore {
    backend: Backend,
    lock_dir: Option<PathBuf>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EntityStore {
    /// Store that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(RwLock::new(Records::default())),
            lock_dir: None,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Opens the store persisted at `<dir>/state.redb`.
    pub fn open(dir: &Path) -> Result<Self> {
        let lock_dir = dir.join(LOCKS_DIR);
        std::fs::create_dir_all(&lock_dir).map_err(|e| Error::StorageInitFailed {
            path: lock_dir.clone(),
            reason: e.to_string(),
        })?;
        let path = dir.join(STATE_FILE);
        let store = Self {
            backend: Backend::File(path.clone()),
            lock_dir: Some(lock_dir),
            locks: Mutex::new(HashMap::new()),
        };
        store.init_tables()?;
        debug!(path = %path.display(), "opened entity store");
        Ok(store)
    }

    /// Opens the database, waiting while another engine holds it.
    fn connect(path: &Path) -> Result<Database> {
        let deadline = Instant::now() + STORE_LOCK_TIMEOUT;
        loop {
            match Database::create(path) {
                Ok(db) => return Ok(db),
                Err(DatabaseError::DatabaseAlreadyOpen) if Instant::now() < deadline => {
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(Error::Database(format!(
                        "failed to open {}: {e}",
                        path.display()
                    )));
                }
            }
        }
    }

    fn init_tables(&self) -> Result<()> {
        let Backend::File(path) = &self.backend else {
            return Ok(());
        };
        let db = Self::connect(path)?;
        let txn = db
            .begin_write()
            .map_err(db_err("failed to begin write transaction"))?;
        txn.open_table(CONTAINERS_TABLE)
            .map_err(db_err("failed to create containers table"))?;
        txn.open_table(PODS_TABLE)
            .map_err(db_err("failed to create pods table"))?;
        txn.commit().map_err(db_err("failed to commit table creation"))
    }

    /// Runs `f` against a consistent snapshot.
    fn view<T>(&self, f: impl FnOnce(&Records) -> Result<T>) -> Result<T> {
        match &self.backend {
            Backend::Memory(records) => {
                let records = records
                    .read()
                    .map_err(|_| Error::Internal("lock poisoned".to_string()))?;
                f(&records)
            }
            Backend::File(path) => {
                let db = Self::connect(path)?;
                let txn = db
                    .begin_read()
                    .map_err(db_err("failed to begin read transaction"))?;
                let containers = txn
                    .open_table(CONTAINERS_TABLE)
                    .map_err(db_err("failed to open containers table"))?;
                let pods = txn
                    .open_table(PODS_TABLE)
                    .map_err(db_err("failed to open pods table"))?;
                let records = Records {
                    containers: load_table(&containers)?.0,
                    pods: load_table(&pods)?.0,
                };
                f(&records)
            }
        }
    }

    /// Runs `f` on a copy of the records and commits the copy only if `f`
    /// succeeds. The file backend re-reads inside the write transaction, so
    /// checks in `f` see every change committed by other engines.
    fn update<T>(&self, f: impl FnOnce(&mut Records) -> Result<T>) -> Result<T> {
        match &self.backend {
            Backend::Memory(records) => {
                let mut records = records
                    .write()
                    .map_err(|_| Error::Internal("lock poisoned".to_string()))?;
                let mut copy = records.clone();
                let out = f(&mut copy)?;
                *records = copy;
                Ok(out)
            }
            Backend::File(path) => {
                let db = Self::connect(path)?;
                let txn = db
                    .begin_write()
                    .map_err(db_err("failed to begin write transaction"))?;
                let (mut records, rows) = {
                    let containers = txn
                        .open_table(CONTAINERS_TABLE)
                        .map_err(db_err("failed to open containers table"))?;
                    let pods = txn
                        .open_table(PODS_TABLE)
                        .map_err(db_err("failed to open pods table"))?;
                    let (containers, container_rows) = load_table(&containers)?;
                    let (pods, pod_rows) = load_table(&pods)?;
                    (
                        Records { containers, pods },
                        Rows {
                            containers: container_rows,
                            pods: pod_rows,
                        },
                    )
                };

                let out = match f(&mut records) {
                    Ok(out) => out,
                    Err(e) => {
                        txn.abort().map_err(db_err("failed to abort transaction"))?;
                        return Err(e);
                    }
                };
                {
                    let mut containers = txn
                        .open_table(CONTAINERS_TABLE)
                        .map_err(db_err("failed to open containers table"))?;
                    store_table(&mut containers, &rows.containers, &records.containers)?;
                    let mut pods = txn
                        .open_table(PODS_TABLE)
                        .map_err(db_err("failed to open pods table"))?;
                    store_table(&mut pods, &rows.pods, &records.pods)?;
                }
                txn.commit().map_err(db_err("failed to commit transaction"))?;
                Ok(out)
            }
        }
    }

    // =========================================================================
    // Entity Locks
    // =========================================================================

    fn local_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        match self.locks.lock() {
            Ok(mut locks) => Arc::clone(locks.entry(id.to_string()).or_default()),
            // A poisoned lock table still hands out a fresh lock.
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Takes the exclusive lock of one entity.
    ///
    /// Tasks of this engine queue on an in-process mutex; the holder then
    /// takes an `flock` on `<root>/locks/<id>.lock`, which excludes other
    /// engines on the same root.
    pub async fn lock_entity(&self, id: &str) -> Result<EntityGuard> {
        let local = self.local_lock(id).lock_owned().await;
        let file = match &self.lock_dir {
            Some(dir) => Some(lock_file(&dir.join(format!("{id}.lock"))).await?),
            None => None,
        };
        Ok(EntityGuard {
            _file: file,
            _local: local,
        })
    }

    fn forget_lock(&self, id: &str) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(id);
        }
        if let Some(dir) = &self.lock_dir
            && let Err(e) = std::fs::remove_file(dir.join(format!("{id}.lock")))
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(entity = %id, error = %e, "failed to remove lock file");
        }
    }

    // =========================================================================
    // Names
    // =========================================================================

    /// True if a container or pod uses `name`.
    pub fn name_in_use(&self, name: &str) -> Result<bool> {
        self.view(|records| Ok(records.name_owner(name).is_some()))
    }

    /// Generates a free `adjective_noun` name.
    pub fn generate_name(&self) -> Result<String> {
        self.view(|records| {
            let seed = Sha256::digest(uuid::Uuid::new_v4().as_bytes());
            let base = format!(
                "{}_{}",
                NAME_ADJECTIVES[usize::from(seed[0]) % NAME_ADJECTIVES.len()],
                NAME_NOUNS[usize::from(seed[1]) % NAME_NOUNS.len()]
            );
            if records.name_owner(&base).is_none() {
                return Ok(base);
            }
            Ok((1..)
                .map(|n| format!("{base}{n}"))
                .find(|candidate| records.name_owner(candidate).is_none())
                .unwrap_or(base))
        })
    }

    // =========================================================================
    // Containers
    // =========================================================================

    /// Inserts a new container, joining its pod if it has one.
    pub fn insert_container(&self, container: Container) -> Result<()> {
        self.update(|records| {
            if records.containers.contains_key(&container.id) {
                return Err(Error::Internal(format!(
                    "duplicate container id {}",
                    container.id
                )));
            }
            if records.name_owner(&container.name).is_some() {
                return Err(Error::NameConflict(container.name.clone()));
            }
            if let Some(pod_id) = &container.pod_id {
                let pod = records
                    .pods
                    .get_mut(pod_id)
                    .ok_or_else(|| Error::PodNotFound(pod_id.clone()))?;
                if container.is_infra {
                    pod.infra_id = Some(container.id.clone());
                } else {
                    pod.members.push(container.id.clone());
                }
            }
            debug!(container = %container.id, name = %container.name, "inserted container");
            records.containers.insert(container.id.clone(), container);
            Ok(())
        })
    }

    /// Replaces an existing container record.
    pub fn update_container(&self, container: &Container) -> Result<()> {
        self.update(|records| {
            let slot = records
                .containers
                .get_mut(&container.id)
                .ok_or_else(|| Error::ContainerNotFound(container.id.clone()))?;
            *slot = container.clone();
            Ok(())
        })
    }

    /// Applies `f` to a stored container and returns the updated record.
    pub fn modify_container(
        &self,
        id: &str,
        f: impl FnOnce(&mut Container),
    ) -> Result<Container> {
        self.update(|records| {
            let container = records
                .containers
                .get_mut(id)
                .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
            f(container);
            Ok(container.clone())
        })
    }

    /// Gets a container by exact ID.
    pub fn get_container(&self, id: &str) -> Result<Container> {
        self.view(|records| {
            records
                .containers
                .get(id)
                .cloned()
                .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
        })
    }

    /// Removes a container record and detaches it from its pod.
    pub fn remove_container(&self, id: &str) -> Result<Container> {
        let container = self.update(|records| {
            let container = records
                .containers
                .remove(id)
                .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
            if let Some(pod) = container
                .pod_id
                .as_ref()
                .and_then(|p| records.pods.get_mut(p))
            {
                pod.members.retain(|m| m != id);
                if pod.infra_id.as_deref() == Some(id) {
                    pod.infra_id = None;
                }
            }
            Ok(container)
        })?;
        self.forget_lock(id);
        debug!(container = %id, "removed container record");
        Ok(container)
    }

    /// All containers, oldest first.
    pub fn containers(&self) -> Result<Vec<Container>> {
        let mut all: Vec<Container> =
            self.view(|records| Ok(records.containers.values().cloned().collect()))?;
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    /// Resolves an ID, name or unique ID prefix.
    pub fn resolve_container(&self, reference: &str) -> Result<Container> {
        self.view(|records| {
            resolve(
                records.containers.iter(),
                |c: &Container| c.name.as_str(),
                reference,
                || Error::ContainerNotFound(reference.to_string()),
            )
            .cloned()
        })
    }

    /// Most recently created container.
    pub fn latest_container(&self) -> Result<Container> {
        self.containers()?
            .pop()
            .ok_or_else(|| Error::ContainerNotFound("latest".to_string()))
    }

    /// Lists containers matching every filter group.
    pub fn list_containers(&self, filters: &[Filter]) -> Result<Vec<Container>> {
        let groups = group_filters(filters, &CONTAINER_FILTER_KEYS)?;
        for value in groups.get("status").into_iter().flatten() {
            value.parse::<ContainerStatus>()?;
        }

        let mut out: Vec<Container> = self.view(|records| {
            Ok(records
                .containers
                .values()
                .filter(|c| {
                    groups.iter().all(|(key, values)| {
                        matches_group(key, values, |v| match *key {
                            "id" => c.id.starts_with(v),
                            "name" => c.name == v || c.name.contains(v),
                            "label" => label_matches(&c.spec.labels, v),
                            "status" => c.status().as_str().eq_ignore_ascii_case(v),
                            "pod" => c.pod_id.as_ref().is_some_and(|pod_id| {
                                pod_id.starts_with(v)
                                    || records.pods.get(pod_id).is_some_and(|p| p.name == v)
                            }),
                            "ancestor" => {
                                c.image_id.starts_with(v)
                                    || c.image_name == v
                                    || c.spec.image == v
                            }
                            _ => false,
                        })
                    })
                })
                .cloned()
                .collect())
        })?;
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    // =========================================================================
    // Pods
    // =========================================================================

    /// Inserts a new pod.
    pub fn insert_pod(&self, pod: Pod) -> Result<()> {
        self.update(|records| {
            if records.name_owner(&pod.name).is_some() {
                return Err(Error::NameConflict(pod.name.clone()));
            }
            debug!(pod = %pod.id, name = %pod.name, "inserted pod");
            records.pods.insert(pod.id.clone(), pod);
            Ok(())
        })
    }

    /// Gets a pod by exact ID.
    pub fn get_pod(&self, id: &str) -> Result<Pod> {
        self.view(|records| {
            records
                .pods
                .get(id)
                .cloned()
                .ok_or_else(|| Error::PodNotFound(id.to_string()))
        })
    }

    /// Resolves an ID, name or unique ID prefix.
    pub fn resolve_pod(&self, reference: &str) -> Result<Pod> {
        self.view(|records| {
            resolve(
                records.pods.iter(),
                |p: &Pod| p.name.as_str(),
                reference,
                || Error::PodNotFound(reference.to_string()),
            )
            .cloned()
        })
    }

    /// All pods, oldest first.
    pub fn pods(&self) -> Result<Vec<Pod>> {
        let mut all: Vec<Pod> = self.view(|records| Ok(records.pods.values().cloned().collect()))?;
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    /// Most recently created pod.
    pub fn latest_pod(&self) -> Result<Pod> {
        self.pods()?
            .pop()
            .ok_or_else(|| Error::PodNotFound("latest".to_string()))
    }

    /// A pod with its infra and member records, read in one snapshot.
    pub fn pod_snapshot(&self, id: &str) -> Result<(Pod, Vec<Container>)> {
        self.view(|records| {
            let pod = records
                .pods
                .get(id)
                .cloned()
                .ok_or_else(|| Error::PodNotFound(id.to_string()))?;
            let containers = pod
                .all_containers()
                .iter()
                .filter_map(|c| records.containers.get(c).cloned())
                .collect();
            Ok((pod, containers))
        })
    }

    /// Aggregate pod status from one snapshot of the member states.
    pub fn pod_status(&self, id: &str) -> Result<PodStatus> {
        self.view(|records| {
            let pod = records
                .pods
                .get(id)
                .ok_or_else(|| Error::PodNotFound(id.to_string()))?;
            Ok(records.pod_status(pod))
        })
    }

    /// Lists pods matching every filter group, with their status.
    pub fn list_pods(&self, filters: &[Filter]) -> Result<Vec<(Pod, PodStatus)>> {
        let groups = group_filters(filters, &POD_FILTER_KEYS)?;
        for value in groups.get("status").into_iter().flatten() {
            value.parse::<PodStatus>()?;
        }

        let mut out: Vec<(Pod, PodStatus)> = self.view(|records| {
            Ok(records
                .pods
                .values()
                .map(|p| (p, records.pod_status(p)))
                .filter(|(p, status)| {
                    groups.iter().all(|(key, values)| {
                        matches_group(key, values, |v| match *key {
                            "id" => p.id.starts_with(v),
                            "name" => p.name == v || p.name.contains(v),
                            "label" => label_matches(&p.spec.labels, v),
                            "status" => status.as_str().eq_ignore_ascii_case(v),
                            _ => false,
                        })
                    })
                })
                .map(|(p, status)| (p.clone(), status))
                .collect())
        })?;
        out.sort_by(|a, b| a.0.created_at.cmp(&b.0.created_at).then(a.0.id.cmp(&b.0.id)));
        Ok(out)
    }

    /// Removes a pod and every container record that references it.
    pub fn remove_pod(&self, id: &str) -> Result<(Pod, Vec<Container>)> {
        let (pod, members) = self.update(|records| {
            let pod = records
                .pods
                .remove(id)
                .ok_or_else(|| Error::PodNotFound(id.to_string()))?;
            let member_ids: Vec<String> = records
                .containers
                .values()
                .filter(|c| c.pod_id.as_deref() == Some(id))
                .map(|c| c.id.clone())
                .collect();
            let members: Vec<Container> = member_ids
                .iter()
                .filter_map(|m| records.containers.remove(m))
                .collect();
            Ok((pod, members))
        })?;

        self.forget_lock(id);
        for member in &members {
            self.forget_lock(&member.id);
        }
        if members.len() != pod.all_containers().len() {
            warn!(pod = %id, "pod member list out of sync with container records");
        }
        Ok((pod, members))
    }
}

/// Takes an exclusive `flock` on `path`, polling while another engine
/// holds it.
async fn lock_file(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?;

    #[cfg(unix)]
    loop {
        use std::os::fd::AsRawFd;

        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret == 0 {
            break;
        }
        let err = std::io::Error::last_os_error();
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => {
                tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
            }
            _ => return Err(err.into()),
        }
    }

    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::spec::ContainerSpec;
    use crate::container::state::ContainerState;
    use crate::pod::spec::PodSpec;
    use tempfile::TempDir;

    fn container(name: &str) -> Container {
        Container {
            id: generate_id(),
            name: name.to_string(),
            spec: ContainerSpec::new("alpine"),
            image_id: "f".repeat(64),
            image_name: "localhost/alpine:latest".to_string(),
            pod_id: None,
            is_infra: false,
            namespaces: BTreeMap::new(),
            created_at: chrono::Utc::now(),
            runtime: "simulated".to_string(),
            state: ContainerState::default(),
        }
    }

    fn pod(name: &str) -> Pod {
        Pod {
            id: generate_id(),
            name: name.to_string(),
            spec: PodSpec::named(name),
            shared: Default::default(),
            infra_id: None,
            members: Vec::new(),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_generate_id_shape() {
        let id = generate_id();
        assert_eq!(id.len(), ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, generate_id());
    }

    #[test]
    fn test_names_unique_across_kinds() {
        let store = EntityStore::in_memory();
        store.insert_container(container("web")).unwrap();
        let err = store.insert_container(container("web")).unwrap_err();
        assert!(matches!(err, Error::NameConflict(_)));
        let err = store.insert_pod(pod("web")).unwrap_err();
        assert!(matches!(err, Error::NameConflict(_)));
    }

    #[test]
    fn test_resolution_order() {
        let store = EntityStore::in_memory();
        let mut a = container("a");
        a.id = format!("abc1{}", "0".repeat(60));
        let mut b = container("b");
        b.id = format!("abc2{}", "0".repeat(60));
        // A container whose name looks like the other's ID prefix.
        let mut c = container("abc2");
        c.id = format!("ffff{}", "0".repeat(60));
        store.insert_container(a.clone()).unwrap();
        store.insert_container(b.clone()).unwrap();
        store.insert_container(c.clone()).unwrap();

        assert_eq!(store.resolve_container(&a.id).unwrap().name, "a");
        assert_eq!(store.resolve_container("abc2").unwrap().id, c.id);
        assert_eq!(store.resolve_container("abc1").unwrap().id, a.id);
        assert!(matches!(
            store.resolve_container("abc").unwrap_err(),
            Error::AmbiguousReference { matches: 2, .. }
        ));
        assert!(store.resolve_container("zzz").unwrap_err().is_not_found());
        assert!(store.resolve_container("").unwrap_err().is_not_found());
    }

    #[test]
    fn test_label_filters_and_together() {
        let store = EntityStore::in_memory();
        let mut both = container("both");
        both.spec.labels.insert("foo".to_string(), "1".to_string());
        both.spec.labels.insert("foo2".to_string(), "x".to_string());
        let mut one = container("one");
        one.spec.labels.insert("foo".to_string(), "1".to_string());
        store.insert_container(both).unwrap();
        store.insert_container(one).unwrap();

        let filters = parse_filters(&["label=foo", "label=foo2"]).unwrap();
        let found = store.list_containers(&filters).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "both");

        let filters = parse_filters(&["label=foo=1"]).unwrap();
        assert_eq!(store.list_containers(&filters).unwrap().len(), 2);
    }

    #[test]
    fn test_same_key_filters_or_together() {
        let store = EntityStore::in_memory();
        let mut running = container("r");
        running.state.status = ContainerStatus::Running;
        store.insert_container(running).unwrap();
        store.insert_container(container("c")).unwrap();

        let filters = parse_filters(&["status=running", "status=created"]).unwrap();
        assert_eq!(store.list_containers(&filters).unwrap().len(), 2);
        let filters = parse_filters(&["status=running", "name=c"]).unwrap();
        assert!(store.list_containers(&filters).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_filter_key_rejected() {
        let store = EntityStore::in_memory();
        let filters = parse_filters(&["color=blue"]).unwrap();
        assert_eq!(
            store.list_containers(&filters).unwrap_err().kind(),
            crate::error::ErrorKind::InvalidSpec
        );
        assert!("nokey".parse::<Filter>().is_err());
    }

    #[test]
    fn test_pod_membership_and_removal() {
        let store = EntityStore::in_memory();
        let p = pod("p1");
        store.insert_pod(p.clone()).unwrap();
        let mut member = container("m1");
        member.pod_id = Some(p.id.clone());
        member.state.status = ContainerStatus::Running;
        store.insert_container(member.clone()).unwrap();

        assert_eq!(store.get_pod(&p.id).unwrap().members, vec![member.id.clone()]);
        assert_eq!(store.pod_status(&p.id).unwrap(), PodStatus::Running);

        let (_, removed) = store.remove_pod(&p.id).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(store.get_container(&member.id).is_err());
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let c = container("keep");
        {
            let store = EntityStore::open(temp.path()).unwrap();
            store.insert_container(c.clone()).unwrap();
            store
                .modify_container(&c.id, |c| c.state.status = ContainerStatus::Exited)
                .unwrap();
        }
        let store = EntityStore::open(temp.path()).unwrap();
        let loaded = store.resolve_container("keep").unwrap();
        assert_eq!(loaded.status(), ContainerStatus::Exited);
    }

    #[test]
    fn test_two_stores_on_one_root_share_records() {
        let temp = TempDir::new().unwrap();
        let first = EntityStore::open(temp.path()).unwrap();
        let second = EntityStore::open(temp.path()).unwrap();

        let a = container("same");
        first.insert_container(a.clone()).unwrap();
        let err = second.insert_container(container("same")).unwrap_err();
        assert!(matches!(err, Error::NameConflict(_)));

        second.insert_container(container("other")).unwrap();
        let names: Vec<String> = first
            .containers()
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["same".to_string(), "other".to_string()]);
        assert_eq!(second.resolve_container("same").unwrap().id, a.id);
    }

    #[test]
    fn test_failed_update_leaves_records_untouched() {
        let store = EntityStore::in_memory();
        let p = pod("p1");
        store.insert_pod(p.clone()).unwrap();
        let mut member = container("m1");
        member.pod_id = Some(p.id.clone());
        // Same name as the pod: the whole insert is rejected.
        member.name = "p1".to_string();
        assert!(store.insert_container(member).is_err());
        assert!(store.get_pod(&p.id).unwrap().members.is_empty());
        assert!(store.containers().unwrap().is_empty());
    }

    #[test]
    fn test_failed_update_leaves_database_untouched() {
        let temp = TempDir::new().unwrap();
        let store = EntityStore::open(temp.path()).unwrap();
        let p = pod("p1");
        store.insert_pod(p.clone()).unwrap();
        let mut member = container("m1");
        member.pod_id = Some(p.id.clone());
        member.name = "p1".to_string();
        assert!(store.insert_container(member).is_err());

        let reopened = EntityStore::open(temp.path()).unwrap();
        assert!(reopened.get_pod(&p.id).unwrap().members.is_empty());
        assert!(reopened.containers().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_entity_lock_excludes_within_engine() {
        let store = EntityStore::in_memory();
        let guard = store.lock_entity("x").await.unwrap();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            store.lock_entity("x"),
        )
        .await;
        assert!(blocked.is_err());
        assert!(store.lock_entity("y").await.is_ok());
        drop(guard);
        assert!(store.lock_entity("x").await.is_ok());
    }

    #[tokio::test]
    async fn test_entity_lock_excludes_across_stores() {
        let temp = TempDir::new().unwrap();
        let first = EntityStore::open(temp.path()).unwrap();
        let second = EntityStore::open(temp.path()).unwrap();

        let guard = first.lock_entity("x").await.unwrap();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            second.lock_entity("x"),
        )
        .await;
        assert!(blocked.is_err());
        drop(guard);
        assert!(second.lock_entity("x").await.is_ok());
    }
}

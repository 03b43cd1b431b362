//! # Storage Layer
//!
//! Content-addressed blobs, the image index, and per-container storage.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//! ├── blobs/sha256/ab/abcd1234...         layer blobs (sharded)
//! ├── images.json                         image index
//! ├── mounts.json                         rootfs mount holders per container
//! └── overlay-containers/<id>/
//!     ├── merged/                         root filesystem
//!     └── userdata/                       bundle (config.json, logs, checkpoint/)
//! ```
//!
//! ## Mount Reference Counting
//!
//! A container's rootfs is mounted on behalf of named holders (`runtime`
//! for the running process, `user` for explicit `mount` calls). Mounting
//! twice for the same holder does not add a reference, so the count always
//! equals the number of distinct consumers. Removal is refused while any
//! holder remains unless forced.
//!
//! ## Atomic Writes
//!
//! Blobs and index files are written to `<path>.tmp.<uuid>` and renamed
//! into place, so a crash never leaves a partial file behind.

use crate::bundle::extract_layer;
use crate::constants::{
    BLOB_STORE_DIR, CHECKPOINT_DIR, CONTAINER_STORAGE_DIR, DUMP_LOG_FILE, MOUNTS_FILE,
    RESTORE_LOG_FILE, USERDATA_DIR,
};
use crate::error::{Error, Result};
use crate::image::{Image, ImageStore};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Mount holder used by the lifecycle managers while a process exists.
pub const RUNTIME_HOLDER: &str = "runtime";

/// Mount holder used by explicit `mount`/`unmount` calls.
pub const USER_HOLDER: &str = "user";

/// Marker written once the rootfs has been fully populated.
const ROOTFS_READY_MARKER: &str = ".rootfs-ready";

const DIGEST_PREFIX: &str = "sha256:";

/// Writes a file via a uniquely named temp file and rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    // Unique temp name so concurrent writers never share a temp file.
    let temp_name = format!("tmp.{}", uuid::Uuid::now_v7());
    let temp_path = path.with_extension(temp_name);
    fs::write(&temp_path, data).map_err(|e| Error::Storage(e.to_string()))?;
    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        Error::Storage(format!("rename {}: {}", path.display(), e))
    })
}

// =============================================================================
// Blob Store
// =============================================================================

/// Content-addressed store for image layers, keyed by `sha256:<hex>`.
///
/// Layers are immutable once written; concurrent writers of one digest
/// race on a rename of identical bytes.
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn with_path(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root).map_err(|e| Error::StorageInitFailed {
            path: root.clone(),
            reason: e.to_string(),
        })?;
        debug!(path = %root.display(), "blob store ready");
        Ok(Self { root })
    }

    /// On-disk location of a layer.
    ///
    /// Only the hex part of the digest reaches the path, so a crafted
    /// digest cannot point outside the store.
    pub fn layer_path(&self, digest: &str) -> PathBuf {
        let hex: String = digest
            .strip_prefix(DIGEST_PREFIX)
            .unwrap_or(digest)
            .chars()
            .filter(char::is_ascii_hexdigit)
            .collect();
        match hex.get(..2) {
            Some(shard) => self.root.join(shard).join(&hex),
            None => self.root.join("_invalid"),
        }
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.layer_path(digest).is_file()
    }

    /// Reads a layer.
    pub fn read(&self, digest: &str) -> Result<Vec<u8>> {
        fs::read(self.layer_path(digest)).map_err(|_| Error::BlobNotFound {
            digest: digest.to_string(),
        })
    }

    /// Stores a layer and returns its digest. Storing known content is a
    /// no-op.
    pub fn insert(&self, data: &[u8]) -> Result<String> {
        let digest = format!("{DIGEST_PREFIX}{}", hex::encode(Sha256::digest(data)));
        let path = self.layer_path(&digest);
        if path.is_file() {
            return Ok(digest);
        }
        write_atomic(&path, data)?;
        debug!(%digest, size = data.len(), "stored layer");
        Ok(digest)
    }

    /// Deletes a layer; a missing layer is not an error.
    pub fn remove(&self, digest: &str) -> Result<()> {
        match fs::remove_file(self.layer_path(digest)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }
}

// =============================================================================
// Storage Layer
// =============================================================================

/// Image store plus per-container storage with mount reference counts.
pub struct StorageLayer {
    root: PathBuf,
    images: ImageStore,
    mounts_path: PathBuf,
    mounts: RwLock<BTreeMap<String, BTreeSet<String>>>,
}

impl StorageLayer {
    /// Opens (or initializes) storage under `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(CONTAINER_STORAGE_DIR)).map_err(|e| {
            Error::StorageInitFailed {
                path: root.clone(),
                reason: e.to_string(),
            }
        })?;
        let blobs = Arc::new(BlobStore::with_path(root.join(BLOB_STORE_DIR))?);
        let images = ImageStore::open(&root, blobs)?;

        let mounts_path = root.join(MOUNTS_FILE);
        let mounts = match fs::read(&mounts_path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!(root = %root.display(), "storage initialized");
        Ok(Self {
            root,
            images,
            mounts_path,
            mounts: RwLock::new(mounts),
        })
    }

    /// Storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The image index.
    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    // =========================================================================
    // Container Paths
    // =========================================================================

    /// `<root>/overlay-containers/<id>`.
    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.root.join(CONTAINER_STORAGE_DIR).join(id)
    }

    /// Bundle directory: `<root>/overlay-containers/<id>/userdata`.
    pub fn userdata(&self, id: &str) -> PathBuf {
        self.container_dir(id).join(USERDATA_DIR)
    }

    /// Root filesystem directory.
    pub fn rootfs(&self, id: &str) -> PathBuf {
        self.container_dir(id).join("merged")
    }

    /// CRIU image directory: `<userdata>/checkpoint`.
    pub fn checkpoint_dir(&self, id: &str) -> PathBuf {
        self.userdata(id).join(CHECKPOINT_DIR)
    }

    /// `<userdata>/dump.log`.
    pub fn dump_log(&self, id: &str) -> PathBuf {
        self.userdata(id).join(DUMP_LOG_FILE)
    }

    /// `<userdata>/restore.log`.
    pub fn restore_log(&self, id: &str) -> PathBuf {
        self.userdata(id).join(RESTORE_LOG_FILE)
    }

    // =========================================================================
    // Container Storage
    // =========================================================================

    /// Creates the storage directories of a new container.
    pub fn create_container(&self, id: &str) -> Result<PathBuf> {
        let userdata = self.userdata(id);
        fs::create_dir_all(&userdata)?;
        debug!(container = %id, "created container storage");
        Ok(userdata)
    }

    /// Mounts the rootfs for `holder`, populating it from `image` on first use.
    pub fn mount(&self, id: &str, image: &Image, holder: &str) -> Result<PathBuf> {
        let rootfs = self.rootfs(id);
        let marker = self.container_dir(id).join(ROOTFS_READY_MARKER);
        if !marker.exists() {
            if rootfs.exists() {
                fs::remove_dir_all(&rootfs)?;
            }
            let mut total = 0u64;
            for digest in &image.layers {
                let data = self.images.layer(digest)?;
                extract_layer(&data, &rootfs, &mut total)?;
            }
            fs::write(&marker, image.id.as_bytes())?;
            debug!(container = %id, image = %image.id, bytes = total, "populated rootfs");
        }

        let mut mounts = self
            .mounts
            .write()
            .map_err(|_| Error::Internal("lock poisoned".to_string()))?;
        if mounts
            .entry(id.to_string())
            .or_default()
            .insert(holder.to_string())
        {
            self.persist_mounts(&mounts)?;
            debug!(container = %id, holder = %holder, "mounted rootfs");
        }
        Ok(rootfs)
    }

    /// Drops `holder`'s mount. Returns the remaining count.
    pub fn unmount(&self, id: &str, holder: &str) -> Result<u32> {
        let mut mounts = self
            .mounts
            .write()
            .map_err(|_| Error::Internal("lock poisoned".to_string()))?;
        let Some(holders) = mounts.get_mut(id) else {
            return Ok(0);
        };
        let removed = holders.remove(holder);
        let remaining = holders.len() as u32;
        if remaining == 0 {
            mounts.remove(id);
        }
        if removed {
            self.persist_mounts(&mounts)?;
            debug!(container = %id, holder = %holder, remaining, "unmounted rootfs");
        }
        Ok(remaining)
    }

    /// Drops every holder of `id`.
    pub fn unmount_all(&self, id: &str) -> Result<()> {
        let mut mounts = self
            .mounts
            .write()
            .map_err(|_| Error::Internal("lock poisoned".to_string()))?;
        if mounts.remove(id).is_some() {
            self.persist_mounts(&mounts)?;
        }
        Ok(())
    }

    /// Number of distinct holders of `id`'s rootfs.
    pub fn mount_count(&self, id: &str) -> u32 {
        self.mounts
            .read()
            .map(|m| m.get(id).map_or(0, |h| h.len() as u32))
            .unwrap_or(0)
    }

    /// Holders other than the runtime itself.
    pub fn external_mounts(&self, id: &str) -> u32 {
        self.mounts
            .read()
            .map(|m| {
                m.get(id)
                    .map_or(0, |h| h.iter().filter(|h| *h != RUNTIME_HOLDER).count() as u32)
            })
            .unwrap_or(0)
    }

    /// Removes all storage of a container.
    ///
    /// Idempotent: removing storage that is already gone succeeds.
    pub fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let count = self.mount_count(id);
        if count > 0 && !force {
            return Err(Error::MountBusy {
                id: id.to_string(),
                count,
            });
        }
        self.unmount_all(id)?;
        let dir = self.container_dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => debug!(container = %id, "removed container storage"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Storage(format!("remove {}: {}", dir.display(), e))),
        }
        Ok(())
    }

    fn persist_mounts(&self, mounts: &BTreeMap<String, BTreeSet<String>>) -> Result<()> {
        write_atomic(&self.mounts_path, &serde_json::to_vec_pretty(mounts)?)
    }
}

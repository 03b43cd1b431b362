//! # Image Store - Local Images and Checkpoint Images
//!
//! Keeps the index of locally known images on top of the content-addressed
//! [`BlobStore`]. Layers are gzip'd tar blobs; an image is an ordered list of
//! layer digests plus a small config and annotations.
//!
//! ## Index
//!
//! ```text
//! <root>/images.json        [{ id, names, layers, config, annotations, created }]
//! <root>/blobs/sha256/..    layer blobs
//! ```
//!
//! ## Reference Resolution
//!
//! | Input                         | Matches                               |
//! |-------------------------------|---------------------------------------|
//! | `quay.io/libpod/alpine:3.10`  | exact name                            |
//! | `img1`                        | `localhost/img1:latest`               |
//! | `alpine`                      | any `<registry>/<path>/alpine:latest` |
//! | `sha256:<id>`, `<id>`         | full image ID                         |
//! | `3f2a`                        | unique ID prefix                      |
//!
//! Pulling from registries is out of scope: [`ImageStore::import`] is the
//! only ingress, and [`ImageStore::commit`] derives images from existing ones.

use crate::constants::{DEFAULT_TAG, IMAGE_INDEX_FILE, LOCAL_REGISTRY, MAX_IMAGE_REF_LEN};
use crate::error::{Error, Result};
use crate::storage::{BlobStore, write_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Maximum tag length.
const MAX_TAG_LEN: usize = 128;

/// Runtime defaults carried by an image.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Default entrypoint.
    pub entrypoint: Vec<String>,
    /// Default command.
    pub cmd: Vec<String>,
    /// Default environment, `KEY=VALUE`.
    pub env: Vec<String>,
    /// Default working directory.
    pub working_dir: Option<String>,
    /// Image labels.
    pub labels: BTreeMap<String, String>,
}

/// One local image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// 64-hex image ID.
    pub id: String,
    /// Fully qualified names (`registry/repo:tag`).
    pub names: Vec<String>,
    /// Layer digests, bottom first.
    pub layers: Vec<String>,
    /// Runtime defaults.
    pub config: ImageConfig,
    /// Image annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Creation time.
    pub created: DateTime<Utc>,
}

impl Image {
    /// First name, or the short ID for untagged images.
    pub fn display_name(&self) -> String {
        self.names
            .first()
            .cloned()
            .unwrap_or_else(|| self.id[..12.min(self.id.len())].to_string())
    }

    /// Digest of the top layer.
    pub fn top_layer(&self) -> Option<&str> {
        self.layers.last().map(String::as_str)
    }
}

// =============================================================================
// Reference Parsing
// =============================================================================

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Reference<'a> {
    registry: Option<&'a str>,
    repository: &'a str,
    tag: Option<&'a str>,
}

fn parse_reference(reference: &str) -> Result<Reference<'_>> {
    let invalid = |reason: &str| Error::InvalidImageReference {
        reference: reference.chars().take(64).collect(),
        reason: reason.to_string(),
    };

    if reference.is_empty() {
        return Err(invalid("empty image reference"));
    }
    if reference.len() > MAX_IMAGE_REF_LEN {
        return Err(invalid("reference too long"));
    }
    if reference.contains('@') {
        return Err(invalid("digest references are not supported"));
    }

    let (name, tag) = match reference.rfind(':') {
        Some(idx) if !reference[idx..].contains('/') => {
            (&reference[..idx], Some(&reference[idx + 1..]))
        }
        _ => (reference, None),
    };

    if let Some(tag) = tag {
        let valid = !tag.is_empty()
            && tag.len() <= MAX_TAG_LEN
            && tag
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
            && tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !valid {
            return Err(invalid("invalid tag"));
        }
    }

    let (registry, repository) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == LOCAL_REGISTRY =>
        {
            (Some(first), rest)
        }
        _ => (None, name),
    };

    if repository.is_empty() {
        return Err(invalid("empty repository name"));
    }
    if repository.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(invalid("repository name must be lowercase"));
    }
    for component in repository.split('/') {
        let valid = !component.is_empty()
            && component
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
            && component
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphanumeric())
            && component
                .chars()
                .last()
                .is_some_and(|c| c.is_ascii_alphanumeric());
        if !valid {
            return Err(invalid("invalid repository name"));
        }
    }

    Ok(Reference {
        registry,
        repository,
        tag,
    })
}

/// Normalizes a reference to `registry/repository:tag`.
///
/// References without a registry land under `localhost/`, references
/// without a tag get `:latest`.
pub fn normalize_reference(reference: &str) -> Result<String> {
    let parsed = parse_reference(reference.trim())?;
    Ok(format!(
        "{}/{}:{}",
        parsed.registry.unwrap_or(LOCAL_REGISTRY),
        parsed.repository,
        parsed.tag.unwrap_or(DEFAULT_TAG)
    ))
}

/// True if `s` looks like an image ID or ID prefix.
fn is_id_like(s: &str) -> bool {
    !s.is_empty() && s.len() <= 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

// =============================================================================
// Image Store
// =============================================================================

/// Index of local images.
///
/// The index lives in memory behind a lock and is rewritten atomically on
/// every change.
pub struct ImageStore {
    index_path: PathBuf,
    blobs: Arc<BlobStore>,
    images: RwLock<Vec<Image>>,
}

impl ImageStore {
    /// Opens the index under `root`, creating it if needed.
    pub fn open(root: &Path, blobs: Arc<BlobStore>) -> Result<Self> {
        let index_path = root.join(IMAGE_INDEX_FILE);
        let images = match std::fs::read(&index_path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(Error::StorageInitFailed {
                    path: index_path,
                    reason: e.to_string(),
                });
            }
        };
        Ok(Self {
            index_path,
            blobs,
            images: RwLock::new(images),
        })
    }

    /// Returns the blob store backing the layers.
    pub fn blobs(&self) -> &Arc<BlobStore> {
        &self.blobs
    }

    /// Registers a local image built from gzip'd tar layers.
    ///
    /// The name is normalized; if another image carried it, the name moves.
    pub fn import(
        &self,
        name: &str,
        layers: &[Vec<u8>],
        config: ImageConfig,
        annotations: BTreeMap<String, String>,
    ) -> Result<Image> {
        let normalized = normalize_reference(name)?;
        let mut digests = Vec::with_capacity(layers.len());
        for layer in layers {
            digests.push(self.blobs.insert(layer)?);
        }
        let image = self.register(Some(normalized), digests, config, annotations)?;
        info!(image = %image.id, name = %image.display_name(), "imported image");
        Ok(image)
    }

    /// Creates an image from `base` with one extra layer on top.
    pub fn commit(
        &self,
        name: Option<&str>,
        base: &Image,
        layer: &[u8],
        annotations: BTreeMap<String, String>,
    ) -> Result<Image> {
        let normalized = name.map(normalize_reference).transpose()?;
        let digest = self.blobs.insert(layer)?;
        let mut layers = base.layers.clone();
        layers.push(digest);
        let image = self.register(normalized, layers, base.config.clone(), annotations)?;
        info!(image = %image.id, base = %base.id, "committed image");
        Ok(image)
    }

    fn register(
        &self,
        name: Option<String>,
        layers: Vec<String>,
        config: ImageConfig,
        annotations: BTreeMap<String, String>,
    ) -> Result<Image> {
        let created = Utc::now();
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(&(&layers, &config, &annotations))?);
        hasher.update(created.to_rfc3339().as_bytes());
        hasher.update(uuid::Uuid::new_v4().as_bytes());
        let id = hex::encode(hasher.finalize());

        let image = Image {
            id,
            names: name.iter().cloned().collect(),
            layers,
            config,
            annotations,
            created,
        };

        let mut images = self
            .images
            .write()
            .map_err(|_| Error::Internal("lock poisoned".to_string()))?;
        if let Some(name) = &name {
            for other in images.iter_mut() {
                other.names.retain(|n| n != name);
            }
        }
        images.push(image.clone());
        self.persist(&images)?;
        Ok(image)
    }

    /// Resolves a reference to an image.
    pub fn lookup(&self, reference: &str) -> Result<Image> {
        let images = self
            .images
            .read()
            .map_err(|_| Error::Internal("lock poisoned".to_string()))?;
        let reference = reference.trim();
        let bare = reference.strip_prefix("sha256:").unwrap_or(reference);

        if let Some(img) = images
            .iter()
            .find(|i| i.names.iter().any(|n| n == reference))
        {
            return Ok(img.clone());
        }
        if bare.len() == 64
            && let Some(img) = images.iter().find(|i| i.id == bare)
        {
            return Ok(img.clone());
        }

        if let Ok(parsed) = parse_reference(reference) {
            let normalized = format!(
                "{}/{}:{}",
                parsed.registry.unwrap_or(LOCAL_REGISTRY),
                parsed.repository,
                parsed.tag.unwrap_or(DEFAULT_TAG)
            );
            if let Some(img) = images
                .iter()
                .find(|i| i.names.iter().any(|n| *n == normalized))
            {
                return Ok(img.clone());
            }
            if parsed.registry.is_none() {
                let suffix = format!(
                    "/{}:{}",
                    parsed.repository,
                    parsed.tag.unwrap_or(DEFAULT_TAG)
                );
                if let Some(img) = images
                    .iter()
                    .find(|i| i.names.iter().any(|n| n.ends_with(&suffix)))
                {
                    return Ok(img.clone());
                }
            }
        }

        if is_id_like(bare) {
            let matches: Vec<&Image> = images.iter().filter(|i| i.id.starts_with(bare)).collect();
            match matches.as_slice() {
                [one] => return Ok((*one).clone()),
                [] => {}
                many => {
                    return Err(Error::AmbiguousReference {
                        reference: reference.to_string(),
                        matches: many.len(),
                    });
                }
            }
        }

        Err(Error::ImageNotFound(reference.to_string()))
    }

    /// True if `reference` resolves.
    pub fn exists(&self, reference: &str) -> bool {
        self.lookup(reference).is_ok()
    }

    /// Lists all images, oldest first.
    pub fn list(&self) -> Result<Vec<Image>> {
        Ok(self
            .images
            .read()
            .map_err(|_| Error::Internal("lock poisoned".to_string()))?
            .clone())
    }

    /// Removes an image and any layer blobs no other image references.
    pub fn remove(&self, reference: &str) -> Result<Image> {
        let image = self.lookup(reference)?;
        let mut images = self
            .images
            .write()
            .map_err(|_| Error::Internal("lock poisoned".to_string()))?;
        images.retain(|i| i.id != image.id);
        self.persist(&images)?;

        for layer in &image.layers {
            if !images.iter().any(|i| i.layers.contains(layer)) {
                self.blobs.remove(layer)?;
            }
        }
        debug!(image = %image.id, "removed image");
        Ok(image)
    }

    /// Reads one layer blob.
    pub fn layer(&self, digest: &str) -> Result<Vec<u8>> {
        self.blobs.read(digest)
    }

    fn persist(&self, images: &[Image]) -> Result<()> {
        write_atomic(&self.index_path, &serde_json::to_vec_pretty(images)?)
    }
}

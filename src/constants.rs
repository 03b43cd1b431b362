//! # Engine Constants
//!
//! Defines the limits, timeouts, exit codes, on-disk layout names and
//! annotation keys used by the lifecycle engine. These constants are the
//! single source of truth for values that must agree between the managers,
//! the storage layer and the CLI.
//!
//! ## Cross-References
//!
//! - [`crate::container`]: stop timeouts, clone naming, name validation
//! - [`crate::pod`]: infra container naming and image
//! - [`crate::storage`]: directory layout and checkpoint file names
//! - [`crate::runtimes`]: supervisor timeouts and CRIU version floor

use std::time::Duration;

// =============================================================================
// Exit Codes
// =============================================================================
//
// The CLI reports 0 on success. Engine failures map to 125, while 126 and 127
// describe a command that could not be executed inside the container. Any
// other value is the contained process's own exit code passed through.
// =============================================================================

/// Engine-level error (bad target, bad signal, invalid spec, ...).
pub const EXIT_CODE_ENGINE_ERROR: i32 = 125;

/// The container command was found but is not executable.
pub const EXIT_CODE_NOT_EXECUTABLE: i32 = 126;

/// The container command does not exist.
pub const EXIT_CODE_NOT_FOUND: i32 = 127;

/// Offset added to a signal number to form the exit code of a signalled process.
pub const SIGNAL_EXIT_OFFSET: i32 = 128;

// =============================================================================
// Identity
// =============================================================================

/// Length of a full entity ID in hex characters.
pub const ID_LEN: usize = 64;

/// Length of the abbreviated ID shown to users.
pub const SHORT_ID_LEN: usize = 12;

/// Maximum length of a container or pod name.
///
/// **Security**: names end up in filesystem paths and log lines. Bounding the
/// length keeps both manageable.
pub const MAX_NAME_LEN: usize = 253;

/// Maximum image reference length in bytes.
///
/// **Attack Vector**: overly long references could exploit downstream parsers.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Suffix appended to the source name when cloning.
pub const CLONE_SUFFIX: &str = "-clone";

/// Suffix appended to the short pod ID to name the infra container.
pub const INFRA_NAME_SUFFIX: &str = "-infra";

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum total extracted size of a checkpoint layer (4 GiB).
///
/// **Attack Vector**: compression bombs in an imported checkpoint image.
pub const MAX_CHECKPOINT_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum number of entries unpacked from a single layer.
///
/// **Security**: prevents inode exhaustion from pathological archives.
pub const MAX_FILES_PER_LAYER: usize = 100_000;

/// Maximum bytes of container output retained by a supervisor per container.
pub const MAX_OUTPUT_BUFFER: usize = 1024 * 1024;

// =============================================================================
// Timeouts
// =============================================================================
//
// Every call into an external runtime binary is bounded. Lifecycle timeouts
// that users can pass on the command line (stop, rm, restart) default to
// DEFAULT_STOP_TIMEOUT.
// =============================================================================

/// Default grace period between SIGTERM and SIGKILL during stop (10 seconds).
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for a single OCI runtime subprocess call (2 minutes).
///
/// **Rationale**: checkpointing a large process tree can take a while, but a
/// runtime binary that never returns must not wedge the engine.
pub const RUNTIME_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval at which the OCI CLI supervisor polls runtime state.
pub const STATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Interval at which a following event stream checks the log for appends
/// made by other processes.
pub const EVENTS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a store operation waits for another process to release the
/// database.
pub const STORE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry interval while the database or an entity lock is held elsewhere.
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Default capacity of per-container output channels.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Default retry cap for the `on-failure` restart policy.
pub const DEFAULT_RESTART_RETRIES: u32 = 5;

// =============================================================================
// Storage Layout
// =============================================================================
//
// All paths are relative to the configured storage root or run root:
//
//   <root>/blobs/sha256/<2-char-prefix>/<hash>
//   <root>/images.json
//   <root>/overlay-containers/<id>/userdata/{config.json,rootfs,checkpoint,...}
//   <root>/state.redb
//   <run_root>/events.log
//   <run_root>/events.log.1
// =============================================================================

/// Subdirectory for content-addressed blob storage.
pub const BLOB_STORE_DIR: &str = "blobs";

/// File holding the image index.
pub const IMAGE_INDEX_FILE: &str = "images.json";

/// Subdirectory for per-container storage.
pub const CONTAINER_STORAGE_DIR: &str = "overlay-containers";

/// Per-container directory holding runtime data.
pub const USERDATA_DIR: &str = "userdata";

/// Entity store database.
pub const STATE_FILE: &str = "state.redb";

/// Directory of per-entity lock files.
pub const LOCKS_DIR: &str = "locks";

/// Mount reference counts.
pub const MOUNTS_FILE: &str = "mounts.json";

/// JSON-lines event log under the run root.
pub const EVENTS_LOG_FILE: &str = "events.log";

/// Previous generation of the event log, replaced on each rotation.
pub const EVENTS_ROTATED_FILE: &str = "events.log.1";

/// Size at which the event log rotates.
pub const DEFAULT_EVENTS_LOG_MAX_BYTES: u64 = 1_000_000;

/// Checkpoint image directory inside userdata.
pub const CHECKPOINT_DIR: &str = "checkpoint";

/// CRIU dump log inside userdata.
pub const DUMP_LOG_FILE: &str = "dump.log";

/// CRIU restore log inside userdata.
pub const RESTORE_LOG_FILE: &str = "restore.log";

/// Serialized container spec stored inside a checkpoint layer.
pub const CONFIG_DUMP_FILE: &str = "config.dump";

/// Serialized OCI spec stored inside a checkpoint layer.
pub const SPEC_DUMP_FILE: &str = "spec.dump";

/// Container output log inside userdata.
pub const CONTAINER_LOG_FILE: &str = "ctr.log";

/// OCI runtime bundle configuration file.
pub const BUNDLE_CONFIG_FILE: &str = "config.json";

// =============================================================================
// OCI and Checkpoint Metadata
// =============================================================================

/// OCI Runtime Spec version for generated `config.json`.
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

/// Default PATH injected when the container environment has none.
pub const DEFAULT_PATH_ENV: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Minimum CRIU version (3.16) encoded as major * 10000 + minor * 100 + patch.
pub const MIN_CRIU_VERSION: u32 = 31600;

/// Registry prefix applied to unqualified local image names.
pub const LOCAL_REGISTRY: &str = "localhost";

/// Tag applied to image names without one.
pub const DEFAULT_TAG: &str = "latest";

/// Image used for pod infra containers.
pub const DEFAULT_INFRA_IMAGE: &str = "localhost/podman-pause:latest";

/// Command run by pod infra containers.
pub const DEFAULT_INFRA_COMMAND: &str = "/catatonit";

/// Annotation: source container name.
pub const ANNOTATION_CHECKPOINT_NAME: &str = "io.podman.annotations.checkpoint.name";

/// Annotation: OCI runtime that produced the checkpoint.
pub const ANNOTATION_CHECKPOINT_RUNTIME: &str = "io.podman.annotations.checkpoint.runtime.name";

/// Annotation: ID of the base image.
pub const ANNOTATION_CHECKPOINT_ROOTFS_ID: &str =
    "io.podman.annotations.checkpoint.rootfsImageID";

/// Annotation: name of the base image.
pub const ANNOTATION_CHECKPOINT_ROOTFS_NAME: &str =
    "io.podman.annotations.checkpoint.rootfsImageName";

/// Annotation: image reference exactly as the user gave it.
pub const ANNOTATION_CHECKPOINT_RAW_IMAGE: &str =
    "io.podman.annotations.checkpoint.rawImageName";

// =============================================================================
// Name Validation Helper
// =============================================================================

/// Validates a container or pod name.
///
/// Names match `[a-zA-Z0-9][a-zA-Z0-9_.-]*` and are at most
/// [`MAX_NAME_LEN`] bytes.
#[inline]
#[must_use = "validation result must be checked"]
pub fn validate_name(name: &str) -> std::result::Result<(), &'static str> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err("name cannot be empty");
    };
    if name.len() > MAX_NAME_LEN {
        return Err("name exceeds maximum length");
    }
    if !first.is_ascii_alphanumeric() {
        return Err("name must start with an alphanumeric character");
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
        return Err("name contains invalid characters");
    }
    Ok(())
}

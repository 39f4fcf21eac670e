use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SiloError {
    #[error("invalid storage ID '{0}'")]
    InvalidStorageId(String),

    #[error("invalid volume ID '{0}'")]
    InvalidVolumeId(String),

    #[error("unable to parse volume name '{0}'")]
    InvalidVolname(String),

    #[error("unknown storage type '{0}'")]
    UnknownStorageType(String),

    #[error("invalid option '{option}': {reason}")]
    InvalidOption { option: String, reason: String },

    #[error("storage ID '{0}' already defined")]
    StorageExists(String),

    #[error("storage '{0}' does not exist")]
    NoSuchStorage(String),

    #[error("storage '{0}' is disabled")]
    StorageDisabled(String),

    #[error("storage '{storage}' is not available on node '{node}'")]
    NodeRestricted { storage: String, node: String },

    #[error("storage '{0}' is used as base of another storage")]
    UsedAsBase(String),

    #[error("can't rollback, more recent snapshots exist")]
    MoreRecentSnapshots,

    #[error("digest mismatch on '{0}' - file changed by another user, retry")]
    DigestMismatch(String),

    #[error("got lock timeout on '{0}' - aborting command")]
    LockTimeout(String),

    #[error("operation '{operation}' not supported by storage type '{ty}'")]
    NotSupported { operation: String, ty: String },

    #[error("command '{command}' failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("command '{command}' timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("storage '{storage}': {source}")]
    WithStorage {
        storage: String,
        #[source]
        source: Box<SiloError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl SiloError {
    /// Attach the storage the failing operation was dispatched to.
    pub fn in_storage(self, storeid: &str) -> Self {
        match self {
            // Already carries the storage in its message.
            SiloError::WithStorage { .. }
            | SiloError::NoSuchStorage(_)
            | SiloError::StorageDisabled(_)
            | SiloError::NodeRestricted { .. } => self,
            other => SiloError::WithStorage {
                storage: storeid.to_string(),
                source: Box::new(other),
            },
        }
    }

    pub fn not_supported(operation: &str, ty: &str) -> Self {
        SiloError::NotSupported {
            operation: operation.to_string(),
            ty: ty.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SiloError>;

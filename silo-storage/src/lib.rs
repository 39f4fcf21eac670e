//! Storage-abstraction core of the silo cluster virtualization manager.
//!
//! A uniform control plane over heterogeneous storage backends: volumes are
//! addressed by opaque `storeid:volname` identifiers and every backend sits
//! behind the [`StoragePlugin`] contract, so callers allocate, locate,
//! snapshot, clone, resize and free volumes without knowing whether a plain
//! directory, a ZFS pool or an appliance is underneath.

pub mod api;
pub mod manager;
pub mod plugins;
pub mod registry;
pub mod section;
pub mod volname;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use silo_core::{
    ContentType, ImageFormat, ParsedVolname, Result, SiloError, StorageStatus, VolumeEntry,
    VolumeFeature, VolumePath,
};

pub use api::{ConfigApi, ConfigStore, FileStore, MemoryStore};
pub use manager::StorageManager;
pub use registry::{default_registry, OptionDescriptor, OptionKind, PluginRegistry};
pub use section::{StorageConfig, StorageEntries, LOCAL_STORAGE_ID, LOCAL_STORAGE_PATH};

/// Allowed and default content sets of a storage type.
#[derive(Debug, Clone, Copy)]
pub struct ContentModes {
    pub allowed: &'static [ContentType],
    pub default: &'static [ContentType],
}

/// Allowed image formats of a storage type and the default applied when a
/// storage declares none.
#[derive(Debug, Clone, Copy)]
pub struct FormatModes {
    pub allowed: &'static [ImageFormat],
    pub default: ImageFormat,
}

/// The contract every storage backend implements.
///
/// Capabilities a backend does not have answer with the dedicated
/// "not supported" error instead of failing silently.
#[async_trait]
pub trait StoragePlugin: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn content_modes(&self) -> ContentModes;

    fn format_modes(&self) -> Option<FormatModes> {
        None
    }

    fn options(&self) -> &'static [OptionDescriptor];

    /// Networked types are implicitly shared across the cluster.
    fn shared_by_default(&self) -> bool {
        false
    }

    /// Decode a backend-local volume name. Deterministic, no I/O.
    fn parse_volname(&self, volname: &str) -> Result<ParsedVolname>;

    /// Resolve a volume to a file path, block device or URL.
    async fn path(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: Option<&str>,
    ) -> Result<VolumePath>;

    /// Allocate a new image; the name is generated when absent. Returns the
    /// new backend-local volume name.
    async fn alloc_image(
        &self,
        scfg: &StorageConfig,
        vmid: u32,
        format: ImageFormat,
        name: Option<&str>,
        size_kb: u64,
    ) -> Result<String> {
        let _ = (scfg, vmid, format, name, size_kb);
        Err(SiloError::not_supported("alloc_image", self.type_name()))
    }

    /// Remove a volume's backing store.
    async fn free_image(&self, scfg: &StorageConfig, volname: &str, is_base: bool) -> Result<()> {
        let _ = (scfg, volname, is_base);
        Err(SiloError::not_supported("free_image", self.type_name()))
    }

    /// Enumerate image volumes, optionally filtered by owner or an explicit
    /// allow-list of volume ids.
    async fn list_images(
        &self,
        scfg: &StorageConfig,
        vmid: Option<u32>,
        vollist: Option<&[String]>,
    ) -> Result<Vec<VolumeEntry>> {
        let _ = (scfg, vmid, vollist);
        Err(SiloError::not_supported("list_images", self.type_name()))
    }

    /// Space accounting. Degrades to an inactive zero report on transport
    /// failure; this never returns an error for an unreachable backend.
    async fn status(&self, scfg: &StorageConfig) -> Result<StorageStatus> {
        let _ = scfg;
        Ok(StorageStatus::inactive())
    }

    /// Idempotent.
    async fn activate_storage(&self, scfg: &StorageConfig) -> Result<()> {
        let _ = scfg;
        Ok(())
    }

    /// Idempotent.
    async fn deactivate_storage(&self, scfg: &StorageConfig) -> Result<()> {
        let _ = scfg;
        Ok(())
    }

    /// Idempotent.
    async fn activate_volume(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: Option<&str>,
    ) -> Result<()> {
        let _ = (scfg, volname, snap);
        Ok(())
    }

    /// Idempotent.
    async fn deactivate_volume(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: Option<&str>,
    ) -> Result<()> {
        let _ = (scfg, volname, snap);
        Ok(())
    }

    /// Create a linked clone for `vmid` from a base image.
    async fn clone_image(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        vmid: u32,
        snap: Option<&str>,
    ) -> Result<String> {
        let _ = (scfg, volname, vmid, snap);
        Err(SiloError::not_supported("clone_image", self.type_name()))
    }

    /// Convert an owned image into a write-protected base template.
    async fn create_base(&self, scfg: &StorageConfig, volname: &str) -> Result<String> {
        let _ = (scfg, volname);
        Err(SiloError::not_supported("create_base", self.type_name()))
    }

    /// Grow a volume to `size` bytes; returns the new size.
    async fn volume_resize(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        size: u64,
    ) -> Result<u64> {
        let _ = (scfg, volname, size);
        Err(SiloError::not_supported("volume_resize", self.type_name()))
    }

    async fn volume_snapshot(&self, scfg: &StorageConfig, volname: &str, snap: &str) -> Result<()> {
        let _ = (scfg, volname, snap);
        Err(SiloError::not_supported("volume_snapshot", self.type_name()))
    }

    async fn volume_snapshot_delete(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: &str,
    ) -> Result<()> {
        let _ = (scfg, volname, snap);
        Err(SiloError::not_supported(
            "volume_snapshot_delete",
            self.type_name(),
        ))
    }

    async fn volume_snapshot_rollback(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: &str,
    ) -> Result<()> {
        let _ = (scfg, volname, snap);
        Err(SiloError::not_supported(
            "volume_snapshot_rollback",
            self.type_name(),
        ))
    }

    async fn volume_rollback_is_possible(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: &str,
    ) -> Result<bool> {
        let _ = (scfg, volname, snap);
        Ok(false)
    }

    /// Virtual size and, where cheap to obtain, allocated size in bytes.
    async fn volume_size_info(
        &self,
        scfg: &StorageConfig,
        volname: &str,
    ) -> Result<(u64, Option<u64>)> {
        let _ = (scfg, volname);
        Err(SiloError::not_supported(
            "volume_size_info",
            self.type_name(),
        ))
    }

    /// Feature matrix lookup for (feature, volume state, format).
    fn volume_has_feature(
        &self,
        scfg: &StorageConfig,
        feature: VolumeFeature,
        volname: &str,
        snap: Option<&str>,
    ) -> Result<bool> {
        let _ = (scfg, feature, volname, snap);
        Ok(false)
    }
}

impl std::fmt::Debug for dyn StoragePlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoragePlugin")
            .field("type_name", &self.type_name())
            .finish()
    }
}

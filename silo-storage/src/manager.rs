//! Storage façade: resolves `storeid:volname` identifiers to a driver and
//! its configuration, enforces disable/node gating, and dispatches every
//! volume operation with the storage activated first.

use crate::registry::PluginRegistry;
use crate::section::{self, StorageConfig, StorageEntries};
use crate::{ConfigStore, StoragePlugin};
use silo_core::{
    parse_volume_id, ImageFormat, Result, SiloError, StorageLocker, StorageStatus, VolumeEntry,
    VolumeFeature, VolumePath,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Allocation (and anything else that picks a free name) is serialized per
/// storage; this is the only collision protection.
const VOLUME_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

pub struct StorageManager {
    registry: Arc<PluginRegistry>,
    store: Arc<dyn ConfigStore>,
    locker: Arc<StorageLocker>,
    /// Name of the node we run on; entries restricted to other nodes are not
    /// usable here.
    node: Option<String>,
}

impl StorageManager {
    pub fn new(
        registry: Arc<PluginRegistry>,
        store: Arc<dyn ConfigStore>,
        locker: Arc<StorageLocker>,
        node: Option<String>,
    ) -> Self {
        StorageManager {
            registry,
            store,
            locker,
            node,
        }
    }

    async fn load(&self) -> Result<StorageEntries> {
        let raw = self.store.read().await?;
        section::parse_config(&self.registry, &raw)
    }

    /// Look up a usable storage. With `noerr`, a disabled or unavailable
    /// storage yields `None` instead of an error.
    pub async fn resolve_opt(
        &self,
        storeid: &str,
        noerr: bool,
    ) -> Result<Option<(Arc<dyn StoragePlugin>, StorageConfig)>> {
        let cfg = self.load().await?;
        let Some(scfg) = cfg.entries.get(storeid) else {
            if noerr {
                return Ok(None);
            }
            return Err(SiloError::NoSuchStorage(storeid.to_string()));
        };
        if scfg.disable {
            if noerr {
                return Ok(None);
            }
            return Err(SiloError::StorageDisabled(storeid.to_string()));
        }
        if let Some(node) = &self.node {
            if !scfg.available_on(node) {
                if noerr {
                    return Ok(None);
                }
                return Err(SiloError::NodeRestricted {
                    storage: storeid.to_string(),
                    node: node.clone(),
                });
            }
        }
        let plugin = self.registry.lookup(&scfg.ty)?;
        Ok(Some((plugin, scfg.clone())))
    }

    pub async fn resolve(&self, storeid: &str) -> Result<(Arc<dyn StoragePlugin>, StorageConfig)> {
        match self.resolve_opt(storeid, false).await? {
            Some(resolved) => Ok(resolved),
            None => Err(SiloError::NoSuchStorage(storeid.to_string())),
        }
    }

    async fn activated(&self, storeid: &str) -> Result<(Arc<dyn StoragePlugin>, StorageConfig)> {
        let (plugin, scfg) = self.resolve(storeid).await?;
        plugin
            .activate_storage(&scfg)
            .await
            .map_err(|e| e.in_storage(storeid))?;
        Ok((plugin, scfg))
    }

    /// The image format used when the caller does not pick one.
    pub fn default_format(plugin: &dyn StoragePlugin, scfg: &StorageConfig) -> ImageFormat {
        scfg.format
            .or_else(|| plugin.format_modes().map(|modes| modes.default))
            .unwrap_or(ImageFormat::Raw)
    }

    pub async fn volume_path(&self, volid: &str, snap: Option<&str>) -> Result<VolumePath> {
        let (storeid, volname) = parse_volume_id(volid)?;
        let (plugin, scfg) = self.resolve(storeid).await?;
        plugin
            .path(&scfg, volname, snap)
            .await
            .map_err(|e| e.in_storage(storeid))
    }

    /// Allocate an image and return its fully qualified volume id.
    pub async fn alloc_image(
        &self,
        storeid: &str,
        vmid: u32,
        format: Option<ImageFormat>,
        name: Option<&str>,
        size_kb: u64,
    ) -> Result<String> {
        let (plugin, scfg) = self.activated(storeid).await?;
        let format = format.unwrap_or_else(|| Self::default_format(plugin.as_ref(), &scfg));
        debug!(storage = %storeid, vmid, %format, size_kb, "allocating image");

        let _lock = self
            .locker
            .lock(storeid, scfg.shared, VOLUME_LOCK_TIMEOUT)
            .await?;
        let volname = plugin
            .alloc_image(&scfg, vmid, format, name, size_kb)
            .await
            .map_err(|e| e.in_storage(storeid))?;
        Ok(format!("{storeid}:{volname}"))
    }

    pub async fn free_image(&self, volid: &str) -> Result<()> {
        let (storeid, volname) = parse_volume_id(volid)?;
        let (plugin, scfg) = self.activated(storeid).await?;
        let parsed = plugin.parse_volname(volname)?;

        let _lock = self
            .locker
            .lock(storeid, scfg.shared, VOLUME_LOCK_TIMEOUT)
            .await?;
        plugin
            .free_image(&scfg, volname, parsed.is_base)
            .await
            .map_err(|e| e.in_storage(storeid))
    }

    pub async fn list_images(
        &self,
        storeid: &str,
        vmid: Option<u32>,
    ) -> Result<Vec<VolumeEntry>> {
        let (plugin, scfg) = self.activated(storeid).await?;
        plugin
            .list_images(&scfg, vmid, None)
            .await
            .map_err(|e| e.in_storage(storeid))
    }

    /// Image volumes across every usable storage, optionally restricted to
    /// one owner.
    pub async fn vdisk_list(&self, vmid: Option<u32>) -> Result<Vec<VolumeEntry>> {
        let cfg = self.load().await?;
        let mut result = Vec::new();
        for storeid in cfg.entries.keys() {
            let Some((plugin, scfg)) = self.resolve_opt(storeid, true).await? else {
                continue;
            };
            if !scfg.content.contains(&silo_core::ContentType::Images) {
                continue;
            }
            plugin
                .activate_storage(&scfg)
                .await
                .map_err(|e| e.in_storage(storeid))?;
            let mut entries = plugin
                .list_images(&scfg, vmid, None)
                .await
                .map_err(|e| e.in_storage(storeid))?;
            result.append(&mut entries);
        }
        Ok(result)
    }

    pub async fn status(&self, storeid: &str) -> Result<StorageStatus> {
        let (plugin, scfg) = self.resolve(storeid).await?;
        if let Err(e) = plugin.activate_storage(&scfg).await {
            warn!(storage = %storeid, error = %e, "activation failed, reporting inactive");
            return Ok(StorageStatus::inactive());
        }
        plugin.status(&scfg).await.map_err(|e| e.in_storage(storeid))
    }

    /// Status of every storage visible on this node.
    pub async fn status_all(&self) -> Result<Vec<(String, StorageConfig, StorageStatus)>> {
        let cfg = self.load().await?;
        let mut result = Vec::new();
        for (storeid, scfg) in &cfg.entries {
            if let Some(node) = &self.node {
                if !scfg.available_on(node) {
                    continue;
                }
            }
            let status = if scfg.disable {
                StorageStatus::inactive()
            } else {
                match self.status(storeid).await {
                    Ok(status) => status,
                    Err(e) => {
                        warn!(storage = %storeid, error = %e, "status failed");
                        StorageStatus::inactive()
                    }
                }
            };
            result.push((storeid.clone(), scfg.clone(), status));
        }
        Ok(result)
    }

    pub async fn create_base(&self, volid: &str) -> Result<String> {
        let (storeid, volname) = parse_volume_id(volid)?;
        let (plugin, scfg) = self.activated(storeid).await?;
        let _lock = self
            .locker
            .lock(storeid, scfg.shared, VOLUME_LOCK_TIMEOUT)
            .await?;
        let newname = plugin
            .create_base(&scfg, volname)
            .await
            .map_err(|e| e.in_storage(storeid))?;
        Ok(format!("{storeid}:{newname}"))
    }

    pub async fn clone_image(
        &self,
        volid: &str,
        vmid: u32,
        snap: Option<&str>,
    ) -> Result<String> {
        let (storeid, volname) = parse_volume_id(volid)?;
        let (plugin, scfg) = self.activated(storeid).await?;
        let _lock = self
            .locker
            .lock(storeid, scfg.shared, VOLUME_LOCK_TIMEOUT)
            .await?;
        let newname = plugin
            .clone_image(&scfg, volname, vmid, snap)
            .await
            .map_err(|e| e.in_storage(storeid))?;
        Ok(format!("{storeid}:{newname}"))
    }

    pub async fn volume_resize(&self, volid: &str, size: u64) -> Result<u64> {
        let (storeid, volname) = parse_volume_id(volid)?;
        let (plugin, scfg) = self.activated(storeid).await?;
        plugin
            .volume_resize(&scfg, volname, size)
            .await
            .map_err(|e| e.in_storage(storeid))
    }

    pub async fn volume_snapshot(&self, volid: &str, snap: &str) -> Result<()> {
        let (storeid, volname) = parse_volume_id(volid)?;
        let (plugin, scfg) = self.activated(storeid).await?;
        plugin
            .volume_snapshot(&scfg, volname, snap)
            .await
            .map_err(|e| e.in_storage(storeid))
    }

    pub async fn volume_snapshot_delete(&self, volid: &str, snap: &str) -> Result<()> {
        let (storeid, volname) = parse_volume_id(volid)?;
        let (plugin, scfg) = self.activated(storeid).await?;
        plugin
            .volume_snapshot_delete(&scfg, volname, snap)
            .await
            .map_err(|e| e.in_storage(storeid))
    }

    pub async fn volume_snapshot_rollback(&self, volid: &str, snap: &str) -> Result<()> {
        let (storeid, volname) = parse_volume_id(volid)?;
        let (plugin, scfg) = self.activated(storeid).await?;
        plugin
            .volume_snapshot_rollback(&scfg, volname, snap)
            .await
            .map_err(|e| e.in_storage(storeid))
    }

    pub async fn volume_rollback_is_possible(&self, volid: &str, snap: &str) -> Result<bool> {
        let (storeid, volname) = parse_volume_id(volid)?;
        let (plugin, scfg) = self.resolve(storeid).await?;
        plugin
            .volume_rollback_is_possible(&scfg, volname, snap)
            .await
            .map_err(|e| e.in_storage(storeid))
    }

    pub async fn volume_size_info(&self, volid: &str) -> Result<(u64, Option<u64>)> {
        let (storeid, volname) = parse_volume_id(volid)?;
        let (plugin, scfg) = self.activated(storeid).await?;
        plugin
            .volume_size_info(&scfg, volname)
            .await
            .map_err(|e| e.in_storage(storeid))
    }

    pub async fn volume_has_feature(
        &self,
        feature: VolumeFeature,
        volid: &str,
        snap: Option<&str>,
    ) -> Result<bool> {
        let (storeid, volname) = parse_volume_id(volid)?;
        let (plugin, scfg) = self.resolve(storeid).await?;
        plugin
            .volume_has_feature(&scfg, feature, volname, snap)
            .map_err(|e| e.in_storage(storeid))
    }
}

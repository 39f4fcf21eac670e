//! Configuration API: create/read/update/delete of storage declarations.
//!
//! Every operation runs under the cluster configuration lock. Mutations are
//! all-or-nothing at the file level; updates carry an optional digest
//! precondition so concurrent writers fail instead of clobbering each other.
//! Backend side effects (VG creation, activation) run before the config
//! write, so a failed write can leave backend state needing manual
//! reconciliation; errors name the step that failed.

use crate::registry::PluginRegistry;
use crate::section::{self, StorageConfig, StorageEntries, LOCAL_STORAGE_ID};
use async_trait::async_trait;
use silo_core::{
    parse_volume_id, CommandRunner, CommandSpec, LockGuard, Result, SiloError, StorageLocker,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const CONFIG_LOCK_NAME: &str = "storage.cfg";
const CONFIG_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw access to the shared `storage.cfg` bytes. The production arm sits on
/// the cluster filesystem, which distributes writes to all nodes.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn read(&self) -> Result<String>;

    /// Replace the configuration atomically.
    async fn write(&self, raw: &str) -> Result<()>;
}

/// File-backed store; writes go to a temp file followed by a rename.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStore { path: path.into() }
    }
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn read(&self) -> Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, raw: &str) -> Result<()> {
        let tmp = self.path.with_extension(format!("tmp.{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, raw).await?;
        match tokio::fs::rename(&tmp, &self.path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e.into())
            }
        }
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStore {
    raw: tokio::sync::RwLock<String>,
}

impl MemoryStore {
    pub fn new(initial: impl Into<String>) -> Self {
        MemoryStore {
            raw: tokio::sync::RwLock::new(initial.into()),
        }
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn read(&self) -> Result<String> {
        Ok(self.raw.read().await.clone())
    }

    async fn write(&self, raw: &str) -> Result<()> {
        *self.raw.write().await = raw.to_string();
        Ok(())
    }
}

pub struct ConfigApi {
    registry: Arc<PluginRegistry>,
    store: Arc<dyn ConfigStore>,
    locker: Arc<StorageLocker>,
    runner: Arc<dyn CommandRunner>,
}

impl ConfigApi {
    pub fn new(
        registry: Arc<PluginRegistry>,
        store: Arc<dyn ConfigStore>,
        locker: Arc<StorageLocker>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        ConfigApi {
            registry,
            store,
            locker,
            runner,
        }
    }

    async fn lock_config(&self) -> Result<LockGuard> {
        // The configuration is cluster-wide, so this always takes the
        // cluster arm.
        self.locker
            .lock(CONFIG_LOCK_NAME, true, CONFIG_LOCK_TIMEOUT)
            .await
    }

    async fn load(&self) -> Result<StorageEntries> {
        let raw = self.store.read().await?;
        section::parse_config(&self.registry, &raw)
    }

    async fn persist(&self, entries: &BTreeMap<String, StorageConfig>) -> Result<String> {
        let raw = section::write_config(entries);
        self.store.write(&raw).await?;
        Ok(section::config_digest(&raw))
    }

    /// All entries, optionally restricted to one storage type, plus the
    /// current digest. Visibility filtering is the caller's concern.
    pub async fn list(&self, ty: Option<&str>) -> Result<(Vec<StorageConfig>, String)> {
        let _lock = self.lock_config().await?;
        let cfg = self.load().await?;
        let list = cfg
            .entries
            .values()
            .filter(|scfg| ty.is_none_or(|want| scfg.ty == want))
            .cloned()
            .collect();
        Ok((list, cfg.digest))
    }

    pub async fn read(&self, storeid: &str) -> Result<(StorageConfig, String)> {
        let _lock = self.lock_config().await?;
        let cfg = self.load().await?;
        let scfg = cfg.get(storeid)?.clone();
        Ok((scfg, cfg.digest))
    }

    pub async fn create(&self, params: &BTreeMap<String, String>) -> Result<()> {
        let _lock = self.lock_config().await?;
        let mut cfg = self.load().await?;

        let storeid = params
            .get("storage")
            .ok_or_else(|| SiloError::InvalidOption {
                option: "storage".to_string(),
                reason: "missing".to_string(),
            })?
            .clone();
        if cfg.entries.contains_key(&storeid) {
            return Err(SiloError::StorageExists(storeid));
        }

        let scfg = self.registry.check_config(&storeid, params, true, true)?;
        let plugin = self.registry.lookup(&scfg.ty)?;

        // An LVM storage on top of an iSCSI LUN: resolve and activate the
        // base, then create the volume group on its device.
        if scfg.ty == "lvm" {
            if let Some(base) = &scfg.base {
                let (base_store, base_volname) = parse_volume_id(base)?;
                let base_scfg = cfg
                    .entries
                    .get(base_store)
                    .ok_or_else(|| SiloError::NoSuchStorage(base_store.to_string()))?;
                if base_scfg.ty != "iscsi" {
                    return Err(SiloError::Config(format!(
                        "base storage ID '{base_store}' is not of type 'iscsi'"
                    )));
                }
                let base_plugin = self.registry.lookup(&base_scfg.ty)?;
                base_plugin
                    .activate_storage(base_scfg)
                    .await
                    .map_err(|e| e.in_storage(base_store))?;
                let device = base_plugin.path(base_scfg, base_volname, None).await?;
                let vgname = scfg.vgname.as_deref().ok_or_else(|| {
                    SiloError::Config(format!("storage '{storeid}' has no vgname"))
                })?;
                self.runner
                    .run_checked(CommandSpec::new(["vgcreate", vgname, device.path.as_str()]))
                    .await?;
            }
        }

        if !scfg.disable {
            plugin
                .activate_storage(&scfg)
                .await
                .map_err(|e| e.in_storage(&storeid))?;
        }

        cfg.entries.insert(storeid.clone(), scfg);
        self.persist(&cfg.entries).await?;
        info!(storage = %storeid, "storage created");
        Ok(())
    }

    /// Merge options over an existing entry; `digest`, when given, must match
    /// the configuration the caller saw. Returns the new digest.
    pub async fn update(
        &self,
        storeid: &str,
        params: &BTreeMap<String, String>,
        digest: Option<&str>,
    ) -> Result<String> {
        let _lock = self.lock_config().await?;
        let mut cfg = self.load().await?;

        if let Some(expected) = digest {
            if expected != cfg.digest {
                return Err(SiloError::DigestMismatch(CONFIG_LOCK_NAME.to_string()));
            }
        }

        let scfg = cfg
            .entries
            .get_mut(storeid)
            .ok_or_else(|| SiloError::NoSuchStorage(storeid.to_string()))?;
        self.registry.check_update(scfg, params)?;

        let new_digest = self.persist(&cfg.entries).await?;
        info!(storage = %storeid, "storage updated");
        Ok(new_digest)
    }

    pub async fn delete(&self, storeid: &str) -> Result<()> {
        let _lock = self.lock_config().await?;
        let mut cfg = self.load().await?;

        if storeid == LOCAL_STORAGE_ID {
            return Err(SiloError::Config(
                "cannot remove storage 'local'".to_string(),
            ));
        }
        if !cfg.entries.contains_key(storeid) {
            return Err(SiloError::NoSuchStorage(storeid.to_string()));
        }

        for (other_id, other) in &cfg.entries {
            if other_id == storeid {
                continue;
            }
            if let Some(base) = &other.base {
                let refers = parse_volume_id(base)
                    .map(|(base_store, _)| base_store == storeid)
                    .unwrap_or(false);
                if refers {
                    return Err(SiloError::UsedAsBase(storeid.to_string()));
                }
            }
        }

        cfg.entries.remove(storeid);
        self.persist(&cfg.entries).await?;
        info!(storage = %storeid, "storage removed");
        Ok(())
    }
}

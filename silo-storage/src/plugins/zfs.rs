//! ZFS pool backend over `zfs`/`zpool`.
//!
//! Raw images are zvols under the configured pool, container roots are
//! filesystem datasets with a `refquota`, and base templates carry a
//! `@__base__` snapshot that linked clones originate from.

use crate::registry::{OptionDescriptor, OptionKind};
use crate::section::StorageConfig;
use crate::volname;
use crate::{ContentModes, FormatModes, StoragePlugin};
use async_trait::async_trait;
use silo_core::{
    CommandOutput, CommandRunner, CommandSpec, ContentType, ImageFormat, ParsedVolname, Result,
    SiloError, StorageStatus, VolumeEntry, VolumeFeature, VolumePath, VolumeState,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const UDEV_TIMEOUT: Duration = Duration::from_secs(10);

/// Snapshot every base template carries; clones originate here.
const BASE_SNAPSHOT: &str = "__base__";

const DESTROY_ATTEMPTS: u32 = 6;
const DESTROY_RETRY_DELAY: Duration = Duration::from_secs(1);

const CONTENT_ALLOWED: &[ContentType] = &[
    ContentType::Images,
    ContentType::Rootdir,
    ContentType::None,
];
const CONTENT_DEFAULT: &[ContentType] = &[ContentType::Images];

const FORMATS: FormatModes = FormatModes {
    allowed: &[ImageFormat::Raw, ImageFormat::Subvol],
    default: ImageFormat::Raw,
};

const OPTIONS: &[OptionDescriptor] = &[
    OptionDescriptor::fixed("pool", OptionKind::Text),
    OptionDescriptor::optional("blocksize", OptionKind::Text),
    OptionDescriptor::optional("sparse", OptionKind::Bool),
    OptionDescriptor::optional("content", OptionKind::Content),
    OptionDescriptor::optional("nodes", OptionKind::Nodes),
    OptionDescriptor::optional("disable", OptionKind::Bool),
];

pub struct ZfsPoolPlugin {
    runner: Arc<dyn CommandRunner>,
}

impl ZfsPoolPlugin {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        ZfsPoolPlugin { runner }
    }

    fn pool<'a>(&self, scfg: &'a StorageConfig) -> Result<&'a str> {
        scfg.pool
            .as_deref()
            .ok_or_else(|| SiloError::Config(format!("storage '{}' has no pool", scfg.storage)))
    }

    async fn zfs(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        self.runner
            .run(CommandSpec::new(args.iter().copied()).timeout(timeout))
            .await
    }

    async fn zfs_checked(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        self.runner
            .run_checked(CommandSpec::new(args.iter().copied()).timeout(timeout))
            .await
    }

    /// Wait for the zvol device node to appear.
    async fn udev_settle(&self, pool: &str, name: &str) -> Result<()> {
        self.zfs_checked(
            &["udevadm", "trigger", "--subsystem-match", "block"],
            DEFAULT_TIMEOUT,
        )
        .await?;
        let exit_if = format!("--exit-if-exists=/dev/zvol/{pool}/{name}");
        self.zfs_checked(
            &["udevadm", "settle", "--timeout", "10", &exit_if],
            UDEV_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn dataset_exists(&self, dataset: &str) -> Result<bool> {
        let out = self
            .zfs(&["zfs", "list", "-H", dataset], DEFAULT_TIMEOUT)
            .await?;
        Ok(out.success())
    }

    /// Smallest unused `…-<vmid>-disk-N` dataset name within the pool. Only
    /// the storage lock held by the caller prevents races.
    async fn find_free_diskname(
        &self,
        pool: &str,
        vmid: u32,
        format: ImageFormat,
    ) -> Result<String> {
        let out = self
            .zfs_checked(
                &[
                    "zfs",
                    "list",
                    "-o",
                    "name",
                    "-t",
                    "volume,filesystem",
                    "-Hr",
                    pool,
                ],
                LIST_TIMEOUT,
            )
            .await?;
        let mut used = Vec::new();
        for line in out.stdout.lines() {
            let Some(rest) = line.trim().strip_prefix(&format!("{pool}/")) else {
                continue;
            };
            let leaf = rest.rsplit('/').next().unwrap_or(rest);
            if let Some(n) = volname::disk_index(leaf, vmid) {
                used.push(n);
            }
        }
        let n = volname::find_free_disk_index(&used).ok_or_else(|| {
            SiloError::Storage(format!("unable to allocate an image name for VM {vmid}"))
        })?;
        let prefix = if format == ImageFormat::Subvol {
            "subvol"
        } else {
            "vm"
        };
        Ok(format!("{prefix}-{vmid}-disk-{n}"))
    }
}

#[async_trait]
impl StoragePlugin for ZfsPoolPlugin {
    fn type_name(&self) -> &'static str {
        "zfspool"
    }

    fn content_modes(&self) -> ContentModes {
        ContentModes {
            allowed: CONTENT_ALLOWED,
            default: CONTENT_DEFAULT,
        }
    }

    fn format_modes(&self) -> Option<FormatModes> {
        Some(FORMATS)
    }

    fn options(&self) -> &'static [OptionDescriptor] {
        OPTIONS
    }

    fn parse_volname(&self, volname: &str) -> Result<ParsedVolname> {
        volname::parse_zfs_volname(volname)
    }

    async fn path(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: Option<&str>,
    ) -> Result<VolumePath> {
        let parsed = self.parse_volname(volname)?;
        let pool = self.pool(scfg)?;
        let path = if parsed.format == Some(ImageFormat::Subvol) {
            match snap {
                Some(snap) => format!("/{pool}/{}/.zfs/snapshot/{snap}", parsed.name),
                None => format!("/{pool}/{}", parsed.name),
            }
        } else {
            match snap {
                Some(snap) => format!("/dev/zvol/{pool}/{}@{snap}", parsed.name),
                None => format!("/dev/zvol/{pool}/{}", parsed.name),
            }
        };
        Ok(VolumePath {
            path,
            vmid: parsed.vmid,
            vtype: parsed.vtype,
        })
    }

    async fn alloc_image(
        &self,
        scfg: &StorageConfig,
        vmid: u32,
        format: ImageFormat,
        name: Option<&str>,
        size_kb: u64,
    ) -> Result<String> {
        if !FORMATS.allowed.contains(&format) {
            return Err(SiloError::Storage(format!(
                "unsupported image format '{format}'"
            )));
        }
        let pool = self.pool(scfg)?;

        let name = match name {
            Some(name) => {
                let (is_base, owner, fmt) = volname::parse_zfs_dataset_name(name)?;
                if is_base || owner != vmid || fmt != format {
                    return Err(SiloError::Storage(format!(
                        "illegal volume name '{name}' for VM {vmid}"
                    )));
                }
                name.to_string()
            }
            None => self.find_free_diskname(pool, vmid, format).await?,
        };

        let dataset = format!("{pool}/{name}");
        if self.dataset_exists(&dataset).await? {
            return Err(SiloError::Storage(format!(
                "volume '{dataset}' already exists"
            )));
        }

        if format == ImageFormat::Subvol {
            let refquota = format!("refquota={size_kb}k");
            self.zfs_checked(
                &[
                    "zfs",
                    "create",
                    "-o",
                    "acltype=posixacl",
                    "-o",
                    "xattr=sa",
                    "-o",
                    &refquota,
                    &dataset,
                ],
                DEFAULT_TIMEOUT,
            )
            .await?;
        } else {
            let mut args = vec!["zfs", "create"];
            if scfg.sparse {
                args.push("-s");
            }
            if let Some(blocksize) = &scfg.blocksize {
                args.push("-b");
                args.push(blocksize);
            }
            let size = format!("{size_kb}k");
            args.push("-V");
            args.push(&size);
            args.push(&dataset);
            self.zfs_checked(&args, DEFAULT_TIMEOUT).await?;
            self.udev_settle(pool, &name).await?;
        }

        Ok(name)
    }

    async fn free_image(&self, scfg: &StorageConfig, volname: &str, _is_base: bool) -> Result<()> {
        let parsed = self.parse_volname(volname)?;
        let pool = self.pool(scfg)?;
        let dataset = format!("{pool}/{}", parsed.name);

        for attempt in 1..=DESTROY_ATTEMPTS {
            let out = self
                .zfs(&["zfs", "destroy", "-r", &dataset], DEFAULT_TIMEOUT)
                .await?;
            if out.success() {
                return Ok(());
            }
            if out.stderr.contains("dataset does not exist") {
                return Ok(());
            }
            if out.stderr.contains("dataset is busy") && attempt < DESTROY_ATTEMPTS {
                debug!(dataset = %dataset, attempt, "dataset busy, retrying destroy");
                tokio::time::sleep(DESTROY_RETRY_DELAY).await;
                continue;
            }
            return Err(SiloError::CommandFailed {
                command: format!("zfs destroy -r {dataset}"),
                stderr: out.stderr.trim().to_string(),
            });
        }
        unreachable!("destroy loop always returns");
    }

    async fn list_images(
        &self,
        scfg: &StorageConfig,
        vmid: Option<u32>,
        vollist: Option<&[String]>,
    ) -> Result<Vec<VolumeEntry>> {
        let pool = self.pool(scfg)?;
        let out = self
            .zfs_checked(
                &[
                    "zfs",
                    "list",
                    "-o",
                    "name,volsize,origin,type,refquota",
                    "-t",
                    "volume,filesystem",
                    "-Hr",
                    pool,
                ],
                LIST_TIMEOUT,
            )
            .await?;

        let mut result = Vec::new();
        for line in out.stdout.lines() {
            let fields: Vec<&str> = line.split('\t').collect();
            let &[name, volsize, origin, ty, refquota] = fields.as_slice() else {
                continue;
            };
            let Some(rest) = name.strip_prefix(&format!("{pool}/")) else {
                continue;
            };
            if rest.contains('/') {
                continue;
            }
            let Ok((_, owner, format)) = volname::parse_zfs_dataset_name(rest) else {
                continue;
            };
            if vmid.is_some_and(|want| want != owner) {
                continue;
            }
            let size = if ty == "filesystem" {
                parse_zfs_size(refquota).unwrap_or(0)
            } else {
                parse_zfs_size(volsize).unwrap_or(0)
            };
            // A clone's origin snapshot encodes its lineage.
            let parent = origin
                .strip_prefix(&format!("{pool}/"))
                .filter(|_| origin != "-")
                .map(str::to_string);
            let volname = match parent.as_deref().and_then(|p| p.split_once('@')) {
                Some((basename, BASE_SNAPSHOT)) => format!("{basename}/{rest}"),
                _ => rest.to_string(),
            };
            let volid = format!("{}:{volname}", scfg.storage);
            if let Some(allow) = vollist {
                if !allow.iter().any(|want| want == &volid) {
                    continue;
                }
            }
            result.push(VolumeEntry {
                volid,
                size,
                format,
                vmid: Some(owner),
                used: None,
                parent,
            });
        }
        Ok(result)
    }

    async fn status(&self, scfg: &StorageConfig) -> Result<StorageStatus> {
        let pool = self.pool(scfg)?;
        let probe = self
            .zfs(
                &["zfs", "get", "-Hp", "-o", "value", "available,used", pool],
                DEFAULT_TIMEOUT,
            )
            .await;

        let parsed = match probe {
            Ok(out) if out.success() => {
                let mut lines = out.stdout.lines();
                let avail = lines.next().and_then(|l| l.trim().parse::<u64>().ok());
                let used = lines.next().and_then(|l| l.trim().parse::<u64>().ok());
                avail.zip(used)
            }
            _ => None,
        };

        match parsed {
            Some((avail, used)) => Ok(StorageStatus {
                total: avail + used,
                avail,
                used,
                active: true,
            }),
            None => {
                warn!(pool = %pool, "could not get pool status");
                Ok(StorageStatus::inactive())
            }
        }
    }

    async fn activate_storage(&self, scfg: &StorageConfig) -> Result<()> {
        let pool = self.pool(scfg)?;
        let root = pool.split('/').next().unwrap_or(pool);
        let out = self
            .zfs_checked(&["zpool", "list", "-o", "name", "-H"], DEFAULT_TIMEOUT)
            .await?;
        let imported = out.stdout.lines().any(|line| line.trim() == root);
        if !imported {
            debug!(pool = %root, "pool not imported, importing");
            self.zfs_checked(
                &["zpool", "import", "-d", "/dev/disk/by-id/", "-a"],
                DEFAULT_TIMEOUT,
            )
            .await?;
        }
        Ok(())
    }

    async fn clone_image(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        vmid: u32,
        snap: Option<&str>,
    ) -> Result<String> {
        let parsed = self.parse_volname(volname)?;
        if !parsed.is_base {
            return Err(SiloError::Storage(
                "clone feature requires a base image".to_string(),
            ));
        }
        let pool = self.pool(scfg)?;
        let snap = snap.unwrap_or(BASE_SNAPSHOT);

        let name = self
            .find_free_diskname(pool, vmid, ImageFormat::Raw)
            .await?;
        let origin = format!("{pool}/{}@{snap}", parsed.name);
        let target = format!("{pool}/{name}");
        self.zfs_checked(&["zfs", "clone", &origin, &target], DEFAULT_TIMEOUT)
            .await?;
        self.udev_settle(pool, &name).await?;

        Ok(format!("{}/{name}", parsed.name))
    }

    async fn create_base(&self, scfg: &StorageConfig, volname: &str) -> Result<String> {
        let parsed = self.parse_volname(volname)?;
        if parsed.format == Some(ImageFormat::Subvol) {
            return Err(SiloError::Storage(
                "cannot convert a subvolume to a base image".to_string(),
            ));
        }
        if parsed.is_base {
            return Err(SiloError::Storage(format!(
                "volume '{volname}' is already a base image"
            )));
        }
        let pool = self.pool(scfg)?;

        let stripped = parsed
            .name
            .strip_prefix("vm-")
            .ok_or_else(|| SiloError::InvalidVolname(parsed.name.clone()))?;
        let newname = format!("base-{stripped}");

        let from = format!("{pool}/{}", parsed.name);
        let to = format!("{pool}/{newname}");
        self.zfs_checked(&["zfs", "rename", &from, &to], DEFAULT_TIMEOUT)
            .await?;
        let snapshot = format!("{to}@{BASE_SNAPSHOT}");
        self.zfs_checked(&["zfs", "snapshot", &snapshot], DEFAULT_TIMEOUT)
            .await?;

        let mut renamed = parsed.clone();
        renamed.name = newname;
        renamed.is_base = true;
        Ok(volname::format_zfs_volname(&renamed))
    }

    async fn volume_resize(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        size: u64,
    ) -> Result<u64> {
        let parsed = self.parse_volname(volname)?;
        let pool = self.pool(scfg)?;
        let dataset = format!("{pool}/{}", parsed.name);
        let prop = if parsed.format == Some(ImageFormat::Subvol) {
            format!("refquota={size}")
        } else {
            format!("volsize={size}")
        };
        self.zfs_checked(&["zfs", "set", &prop, &dataset], DEFAULT_TIMEOUT)
            .await?;
        Ok(size)
    }

    async fn volume_snapshot(&self, scfg: &StorageConfig, volname: &str, snap: &str) -> Result<()> {
        let parsed = self.parse_volname(volname)?;
        let pool = self.pool(scfg)?;
        let snapshot = format!("{pool}/{}@{snap}", parsed.name);
        self.zfs_checked(&["zfs", "snapshot", &snapshot], DEFAULT_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn volume_snapshot_delete(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: &str,
    ) -> Result<()> {
        let parsed = self.parse_volname(volname)?;
        let pool = self.pool(scfg)?;
        let snapshot = format!("{pool}/{}@{snap}", parsed.name);
        self.zfs_checked(&["zfs", "destroy", &snapshot], DEFAULT_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn volume_snapshot_rollback(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: &str,
    ) -> Result<()> {
        if !self.volume_rollback_is_possible(scfg, volname, snap).await? {
            return Err(SiloError::MoreRecentSnapshots);
        }
        let parsed = self.parse_volname(volname)?;
        let pool = self.pool(scfg)?;
        let snapshot = format!("{pool}/{}@{snap}", parsed.name);
        self.zfs_checked(&["zfs", "rollback", &snapshot], DEFAULT_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Rollback only works onto the newest snapshot.
    async fn volume_rollback_is_possible(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: &str,
    ) -> Result<bool> {
        let parsed = self.parse_volname(volname)?;
        let pool = self.pool(scfg)?;
        let dataset = format!("{pool}/{}", parsed.name);
        let out = self
            .zfs_checked(
                &[
                    "zfs",
                    "list",
                    "-t",
                    "snapshot",
                    "-H",
                    "-o",
                    "name",
                    "-s",
                    "creation",
                    &dataset,
                ],
                LIST_TIMEOUT,
            )
            .await?;

        let target = format!("{dataset}@{snap}");
        let mut newest = None;
        let mut found = false;
        for line in out.stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == target {
                found = true;
            }
            newest = Some(line.to_string());
        }
        if !found {
            return Err(SiloError::Storage(format!(
                "snapshot '{target}' does not exist"
            )));
        }
        Ok(newest.as_deref() == Some(target.as_str()))
    }

    async fn volume_size_info(
        &self,
        scfg: &StorageConfig,
        volname: &str,
    ) -> Result<(u64, Option<u64>)> {
        let parsed = self.parse_volname(volname)?;
        let pool = self.pool(scfg)?;
        let dataset = format!("{pool}/{}", parsed.name);
        let prop = if parsed.format == Some(ImageFormat::Subvol) {
            "refquota"
        } else {
            "volsize"
        };
        let out = self
            .zfs_checked(
                &["zfs", "get", "-Hp", "-o", "value", prop, &dataset],
                DEFAULT_TIMEOUT,
            )
            .await?;
        let size = out
            .stdout
            .lines()
            .next()
            .and_then(|l| l.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                SiloError::Storage(format!("could not read size of '{dataset}'"))
            })?;
        Ok((size, None))
    }

    fn volume_has_feature(
        &self,
        _scfg: &StorageConfig,
        feature: VolumeFeature,
        volname: &str,
        snap: Option<&str>,
    ) -> Result<bool> {
        let parsed = self.parse_volname(volname)?;
        let state = parsed.state(snap);
        Ok(match feature {
            VolumeFeature::Snapshot => {
                matches!(state, VolumeState::Current | VolumeState::Snap)
            }
            VolumeFeature::Clone => state == VolumeState::Base,
            VolumeFeature::Template => state == VolumeState::Current,
            VolumeFeature::Copy => {
                matches!(state, VolumeState::Base | VolumeState::Current)
            }
        })
    }
}

/// Decode a `zfs list` size column: plain bytes or a human-readable value
/// with a binary suffix; `-` and `none` mean unset.
fn parse_zfs_size(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() || value == "-" || value == "none" {
        return None;
    }
    if value.bytes().all(|b| b.is_ascii_digit()) {
        return value.parse().ok();
    }
    let (number, suffix) = value.split_at(value.len() - 1);
    let shift = match suffix {
        "K" => 10,
        "M" => 20,
        "G" => 30,
        "T" => 40,
        "P" => 50,
        _ => return None,
    };
    let number: f64 = number.parse().ok()?;
    Some((number * (1u64 << shift) as f64) as u64)
}

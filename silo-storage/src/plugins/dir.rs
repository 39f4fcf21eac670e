//! POSIX-file backend over `qemu-img`.
//!
//! Layout under the configured path:
//!
//! ```text
//! images/<vmid>/<name>.<ext>
//! private/<vmid>            (container roots)
//! template/iso/*.iso
//! template/cache/*.tar.gz
//! dump/*                    (backups)
//! ```
//!
//! Linked clones are qcow2 files whose backing reference is the relative
//! path `../<basevmid>/<basename>`, so a whole storage stays relocatable.

use crate::registry::{OptionDescriptor, OptionKind};
use crate::section::StorageConfig;
use crate::volname;
use crate::{ContentModes, FormatModes, StoragePlugin};
use async_trait::async_trait;
use serde_json::Value;
use silo_core::{
    CommandRunner, CommandSpec, ContentType, ImageFormat, ParsedVolname, Result, SiloError,
    StorageStatus, VolumeEntry, VolumeFeature, VolumePath, VolumeState,
};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const CONTENT_ALLOWED: &[ContentType] = &[
    ContentType::Images,
    ContentType::Rootdir,
    ContentType::Iso,
    ContentType::Vztmpl,
    ContentType::Backup,
    ContentType::None,
];
const CONTENT_DEFAULT: &[ContentType] = &[ContentType::Images];

const FORMATS: FormatModes = FormatModes {
    allowed: &[ImageFormat::Raw, ImageFormat::Qcow2, ImageFormat::Vmdk],
    default: ImageFormat::Raw,
};

const OPTIONS: &[OptionDescriptor] = &[
    OptionDescriptor::fixed("path", OptionKind::Path),
    OptionDescriptor::optional("content", OptionKind::Content),
    OptionDescriptor::optional("nodes", OptionKind::Nodes),
    OptionDescriptor::optional("disable", OptionKind::Bool),
    OptionDescriptor::optional("shared", OptionKind::Bool),
    OptionDescriptor::optional("maxfiles", OptionKind::Uint),
    OptionDescriptor::optional("format", OptionKind::Format),
];

pub struct DirPlugin {
    runner: Arc<dyn CommandRunner>,
}

impl DirPlugin {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        DirPlugin { runner }
    }

    fn base_path<'a>(&self, scfg: &'a StorageConfig) -> Result<&'a Path> {
        scfg.path
            .as_deref()
            .ok_or_else(|| SiloError::Config(format!("storage '{}' has no path", scfg.storage)))
    }

    fn volume_file(&self, scfg: &StorageConfig, parsed: &ParsedVolname) -> Result<PathBuf> {
        let base = self.base_path(scfg)?;
        let file = match parsed.vtype {
            ContentType::Images => {
                let vmid = owner_vmid(parsed)?;
                base.join("images").join(vmid.to_string()).join(&parsed.name)
            }
            ContentType::Iso => base.join("template/iso").join(&parsed.name),
            ContentType::Vztmpl => base.join("template/cache").join(&parsed.name),
            ContentType::Backup => base.join("dump").join(&parsed.name),
            ContentType::Rootdir => base.join("private").join(&parsed.name),
            ContentType::None => {
                return Err(SiloError::InvalidVolname(parsed.name.clone()));
            }
        };
        Ok(file)
    }

    async fn qemu_img_info(&self, file: &Path) -> Result<Value> {
        let file_str = file.display().to_string();
        let output = self
            .runner
            .run_checked(CommandSpec::new([
                "qemu-img",
                "info",
                "--output=json",
                file_str.as_str(),
            ]))
            .await?;
        Ok(serde_json::from_str(&output.stdout)?)
    }

    /// Virtual size, allocated size and backing reference of an image file.
    async fn file_info(&self, file: &Path) -> Result<(u64, Option<u64>, Option<String>)> {
        let info = self.qemu_img_info(file).await?;
        let size = info["virtual-size"].as_u64().ok_or_else(|| {
            SiloError::Storage(format!(
                "no virtual size reported for '{}'",
                file.display()
            ))
        })?;
        let used = info["actual-size"].as_u64();
        let backing = info["backing-filename"].as_str().map(str::to_string);
        Ok((size, used, backing))
    }

    /// Smallest unused `vm-<vmid>-disk-N.<format>` name in `imgdir`. The
    /// caller must hold the storage lock; this scan is the only collision
    /// protection.
    async fn find_free_diskname(
        &self,
        imgdir: &Path,
        vmid: u32,
        format: ImageFormat,
    ) -> Result<String> {
        let mut used = Vec::new();
        match tokio::fs::read_dir(imgdir).await {
            Ok(mut dir) => {
                while let Some(entry) = dir.next_entry().await? {
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    let Some((stem, _ext)) = name.rsplit_once('.') else {
                        continue;
                    };
                    if let Some(n) = volname::disk_index(stem, vmid) {
                        used.push(n);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let n = volname::find_free_disk_index(&used).ok_or_else(|| {
            SiloError::Storage(format!("unable to allocate an image name for VM {vmid}"))
        })?;
        Ok(format!("vm-{vmid}-disk-{n}.{format}"))
    }

    fn check_format(&self, format: ImageFormat) -> Result<()> {
        if FORMATS.allowed.contains(&format) {
            Ok(())
        } else {
            Err(SiloError::Storage(format!(
                "unsupported image format '{format}'"
            )))
        }
    }
}

fn owner_vmid(parsed: &ParsedVolname) -> Result<u32> {
    parsed
        .vmid
        .ok_or_else(|| SiloError::InvalidVolname(parsed.name.clone()))
}

fn image_format(parsed: &ParsedVolname) -> ImageFormat {
    parsed.format.unwrap_or(ImageFormat::Raw)
}

#[async_trait]
impl StoragePlugin for DirPlugin {
    fn type_name(&self) -> &'static str {
        "dir"
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
        volname::parse_dir_volname(volname)
    }

    async fn path(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        _snap: Option<&str>,
    ) -> Result<VolumePath> {
        let parsed = self.parse_volname(volname)?;
        let file = self.volume_file(scfg, &parsed)?;
        Ok(VolumePath {
            path: file.display().to_string(),
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
        self.check_format(format)?;

        let base = self.base_path(scfg)?;
        let imgdir = base.join("images").join(vmid.to_string());
        tokio::fs::create_dir_all(&imgdir).await?;

        let name = match name {
            Some(name) => {
                let (is_base, owner, fmt) = volname::parse_dir_image_name(name)?;
                if is_base || owner != vmid {
                    return Err(SiloError::Storage(format!(
                        "illegal image name '{name}' for VM {vmid}"
                    )));
                }
                if fmt != format {
                    return Err(SiloError::Storage(format!(
                        "illegal image name '{name}' - wrong extension for format '{format}'"
                    )));
                }
                name.to_string()
            }
            None => self.find_free_diskname(&imgdir, vmid, format).await?,
        };

        let file = imgdir.join(&name);
        if tokio::fs::try_exists(&file).await? {
            return Err(SiloError::Storage(format!(
                "disk image '{}' already exists",
                file.display()
            )));
        }

        let mut argv = vec!["qemu-img".to_string(), "create".to_string()];
        if format == ImageFormat::Qcow2 {
            argv.push("-o".to_string());
            argv.push("preallocation=metadata".to_string());
        }
        argv.push("-f".to_string());
        argv.push(format.to_string());
        argv.push(file.display().to_string());
        argv.push(format!("{size_kb}K"));
        self.runner.run_checked(CommandSpec::new(argv)).await?;

        Ok(format!("{vmid}/{name}"))
    }

    async fn free_image(&self, scfg: &StorageConfig, volname: &str, is_base: bool) -> Result<()> {
        let parsed = self.parse_volname(volname)?;
        if parsed.vtype == ContentType::Rootdir {
            return Err(SiloError::not_supported("free_image (rootdir)", "dir"));
        }
        let file = self.volume_file(scfg, &parsed)?;

        if is_base {
            // Clear the write protection applied by create_base.
            let file_str = file.display().to_string();
            match self
                .runner
                .run(CommandSpec::new(["chattr", "-i", file_str.as_str()]))
                .await
            {
                Ok(out) if !out.success() => {
                    warn!(file = %file_str, stderr = %out.stderr.trim(), "chattr -i failed")
                }
                Err(e) => warn!(file = %file_str, error = %e, "chattr -i failed"),
                Ok(_) => {}
            }
            if let Err(e) =
                tokio::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o644)).await
            {
                warn!(file = %file_str, error = %e, "clearing read-only mode failed");
            }
        }

        tokio::fs::remove_file(&file).await.map_err(|e| {
            SiloError::Storage(format!("removing '{}' failed: {e}", file.display()))
        })?;
        Ok(())
    }

    async fn list_images(
        &self,
        scfg: &StorageConfig,
        vmid: Option<u32>,
        vollist: Option<&[String]>,
    ) -> Result<Vec<VolumeEntry>> {
        let base = self.base_path(scfg)?;
        let images = base.join("images");
        let mut result = Vec::new();

        let mut owners = Vec::new();
        match tokio::fs::read_dir(&images).await {
            Ok(mut dir) => {
                while let Some(entry) = dir.next_entry().await? {
                    let name = entry.file_name();
                    let Some(owner) = name.to_str().and_then(volname::parse_vmid) else {
                        continue;
                    };
                    if vmid.is_some_and(|want| want != owner) {
                        continue;
                    }
                    owners.push(owner);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        owners.sort_unstable();

        for owner in owners {
            let imgdir = images.join(owner.to_string());
            let mut dir = match tokio::fs::read_dir(&imgdir).await {
                Ok(dir) => dir,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let mut names = Vec::new();
            while let Some(entry) = dir.next_entry().await? {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
            names.sort_unstable();

            for name in names {
                let Ok((_, file_owner, format)) = volname::parse_dir_image_name(&name) else {
                    continue;
                };
                if file_owner != owner {
                    continue;
                }
                let file = imgdir.join(&name);
                let (size, used, backing) = match self.file_info(&file).await {
                    Ok(info) => info,
                    Err(e) => {
                        warn!(file = %file.display(), error = %e, "skipping unreadable image");
                        continue;
                    }
                };
                // A relative backing reference encodes linked-clone lineage.
                let volname = match backing
                    .as_deref()
                    .and_then(|b| b.strip_prefix("../"))
                    .filter(|rel| volname::parse_dir_volname(rel).is_ok())
                {
                    Some(rel) => format!("{rel}/{owner}/{name}"),
                    None => format!("{owner}/{name}"),
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
                    used,
                    parent: backing,
                });
            }
        }

        // The other content namespaces, for storages that declare them.
        let namespaces = [
            (ContentType::Iso, "template/iso", "iso"),
            (ContentType::Vztmpl, "template/cache", "vztmpl"),
            (ContentType::Backup, "dump", "backup"),
            (ContentType::Rootdir, "private", "rootdir"),
        ];
        for (content, subdir, prefix) in namespaces {
            if !scfg.content.contains(&content) {
                continue;
            }
            let mut dir = match tokio::fs::read_dir(base.join(subdir)).await {
                Ok(dir) => dir,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let mut names = Vec::new();
            while let Some(entry) = dir.next_entry().await? {
                if let Some(name) = entry.file_name().to_str() {
                    let size = match entry.metadata().await {
                        Ok(meta) if meta.is_file() => meta.len(),
                        _ => 0,
                    };
                    names.push((name.to_string(), size));
                }
            }
            names.sort_unstable();

            for (name, size) in names {
                let volname = format!("{prefix}/{name}");
                let Ok(parsed) = volname::parse_dir_volname(&volname) else {
                    continue;
                };
                if vmid.is_some() && vmid != parsed.vmid {
                    continue;
                }
                let volid = format!("{}:{volname}", scfg.storage);
                if let Some(allow) = vollist {
                    if !allow.iter().any(|want| want == &volid) {
                        continue;
                    }
                }
                result.push(VolumeEntry {
                    volid,
                    size,
                    format: ImageFormat::Raw,
                    vmid: parsed.vmid,
                    used: None,
                    parent: None,
                });
            }
        }
        Ok(result)
    }

    async fn status(&self, scfg: &StorageConfig) -> Result<StorageStatus> {
        let base = self.base_path(scfg)?;
        match nix::sys::statvfs::statvfs(base) {
            Ok(st) => {
                let bsize = st.fragment_size() as u64;
                let total = st.blocks() as u64 * bsize;
                let avail = st.blocks_available() as u64 * bsize;
                let used = (st.blocks() as u64 - st.blocks_free() as u64) * bsize;
                Ok(StorageStatus {
                    total,
                    avail,
                    used,
                    active: true,
                })
            }
            Err(e) => {
                warn!(storage = %scfg.storage, error = %e, "status probe failed");
                Ok(StorageStatus::inactive())
            }
        }
    }

    async fn activate_storage(&self, scfg: &StorageConfig) -> Result<()> {
        let base = self.base_path(scfg)?;
        if !tokio::fs::try_exists(base).await? {
            return Err(SiloError::Storage(format!(
                "directory '{}' does not exist",
                base.display()
            )));
        }

        let mut subdirs: Vec<&str> = Vec::new();
        for ct in &scfg.content {
            match ct {
                ContentType::Images => subdirs.push("images"),
                ContentType::Iso => subdirs.push("template/iso"),
                ContentType::Vztmpl => subdirs.push("template/cache"),
                ContentType::Backup => subdirs.push("dump"),
                ContentType::Rootdir => {
                    subdirs.push("private");
                    subdirs.push("dump");
                }
                ContentType::None => {}
            }
        }
        subdirs.sort_unstable();
        subdirs.dedup();

        for subdir in subdirs {
            let dir = base.join(subdir);
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                warn!(dir = %dir.display(), error = %e, "creating content directory failed");
            }
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
        if snap.is_some() {
            return Err(SiloError::not_supported("clone_image from snapshot", "dir"));
        }
        let parsed = self.parse_volname(volname)?;
        if !parsed.is_base {
            return Err(SiloError::Storage(
                "clone feature requires a base image".to_string(),
            ));
        }
        let base_vmid = owner_vmid(&parsed)?;

        let base = self.base_path(scfg)?;
        let imgdir = base.join("images").join(vmid.to_string());
        tokio::fs::create_dir_all(&imgdir).await?;

        let newname = self
            .find_free_diskname(&imgdir, vmid, ImageFormat::Qcow2)
            .await?;

        // Run with the clone's image dir as working directory so the
        // relative backing reference resolves.
        let backing = format!("../{base_vmid}/{}", parsed.name);
        debug!(base = %backing, clone = %newname, "cloning base image");
        self.runner
            .run_checked(
                CommandSpec::new([
                    "qemu-img",
                    "create",
                    "-b",
                    backing.as_str(),
                    "-f",
                    "qcow2",
                    newname.as_str(),
                ])
                .cwd(&imgdir),
            )
            .await?;

        Ok(format!("{base_vmid}/{}/{vmid}/{newname}", parsed.name))
    }

    async fn create_base(&self, scfg: &StorageConfig, volname: &str) -> Result<String> {
        let parsed = self.parse_volname(volname)?;
        if parsed.vtype != ContentType::Images {
            return Err(SiloError::Storage(format!(
                "cannot convert volume of type '{}' to a base image",
                parsed.vtype
            )));
        }
        if parsed.is_base {
            return Err(SiloError::Storage(format!(
                "volume '{volname}' is already a base image"
            )));
        }
        let file = self.volume_file(scfg, &parsed)?;

        // The lineage encoded in the volume name and the qcow2 backing
        // reference must agree before the rename.
        let (_, _, backing) = self.file_info(&file).await?;
        let expected = match (&parsed.basename, parsed.base_vmid) {
            (Some(basename), Some(base_vmid)) => Some(format!("../{base_vmid}/{basename}")),
            _ => None,
        };
        if backing != expected {
            return Err(SiloError::Storage(format!(
                "backing file check failed for '{volname}': found {:?}, expected {:?}",
                backing, expected
            )));
        }

        let stripped = parsed
            .name
            .strip_prefix("vm-")
            .ok_or_else(|| SiloError::InvalidVolname(parsed.name.clone()))?;
        let newname = format!("base-{stripped}");
        let newfile = file.with_file_name(&newname);
        tokio::fs::rename(&file, &newfile).await?;

        tokio::fs::set_permissions(&newfile, std::fs::Permissions::from_mode(0o444)).await?;

        // Immutability is best effort; not every filesystem supports it.
        let newfile_str = newfile.display().to_string();
        match self
            .runner
            .run(CommandSpec::new(["chattr", "+i", newfile_str.as_str()]))
            .await
        {
            Ok(out) if !out.success() => {
                warn!(file = %newfile_str, stderr = %out.stderr.trim(), "chattr +i failed")
            }
            Err(e) => warn!(file = %newfile_str, error = %e, "chattr +i failed"),
            Ok(_) => {}
        }

        let mut renamed = parsed.clone();
        renamed.name = newname;
        renamed.is_base = true;
        Ok(volname::format_dir_volname(&renamed))
    }

    async fn volume_resize(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        size: u64,
    ) -> Result<u64> {
        let parsed = self.parse_volname(volname)?;
        let format = image_format(&parsed);
        if !matches!(format, ImageFormat::Raw | ImageFormat::Qcow2) {
            return Err(SiloError::Storage(format!(
                "resize is not supported for image format '{format}'"
            )));
        }
        let file = self.volume_file(scfg, &parsed)?;
        let file_str = file.display().to_string();
        let size_str = size.to_string();
        self.runner
            .run_checked(CommandSpec::new([
                "qemu-img",
                "resize",
                file_str.as_str(),
                size_str.as_str(),
            ]))
            .await?;
        Ok(size)
    }

    async fn volume_snapshot(&self, scfg: &StorageConfig, volname: &str, snap: &str) -> Result<()> {
        self.qcow2_snapshot_op(scfg, volname, snap, "-c").await
    }

    async fn volume_snapshot_delete(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: &str,
    ) -> Result<()> {
        self.qcow2_snapshot_op(scfg, volname, snap, "-d").await
    }

    async fn volume_snapshot_rollback(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: &str,
    ) -> Result<()> {
        self.qcow2_snapshot_op(scfg, volname, snap, "-a").await
    }

    async fn volume_rollback_is_possible(
        &self,
        _scfg: &StorageConfig,
        volname: &str,
        _snap: &str,
    ) -> Result<bool> {
        let parsed = self.parse_volname(volname)?;
        Ok(image_format(&parsed) == ImageFormat::Qcow2)
    }

    async fn volume_size_info(
        &self,
        scfg: &StorageConfig,
        volname: &str,
    ) -> Result<(u64, Option<u64>)> {
        let parsed = self.parse_volname(volname)?;
        let file = self.volume_file(scfg, &parsed)?;
        let (size, used, _) = self.file_info(&file).await?;
        Ok((size, used))
    }

    fn volume_has_feature(
        &self,
        _scfg: &StorageConfig,
        feature: VolumeFeature,
        volname: &str,
        snap: Option<&str>,
    ) -> Result<bool> {
        let parsed = self.parse_volname(volname)?;
        let format = image_format(&parsed);
        let state = parsed.state(snap);
        let file_formats = [ImageFormat::Raw, ImageFormat::Qcow2, ImageFormat::Vmdk];
        Ok(match feature {
            VolumeFeature::Snapshot => {
                matches!(state, VolumeState::Current | VolumeState::Snap)
                    && format == ImageFormat::Qcow2
            }
            VolumeFeature::Clone => {
                state == VolumeState::Base && file_formats.contains(&format)
            }
            VolumeFeature::Template => {
                state == VolumeState::Current && file_formats.contains(&format)
            }
            VolumeFeature::Copy => match state {
                VolumeState::Base | VolumeState::Current => file_formats.contains(&format),
                VolumeState::Snap => format == ImageFormat::Qcow2,
            },
        })
    }
}

impl DirPlugin {
    async fn qcow2_snapshot_op(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: &str,
        op: &str,
    ) -> Result<()> {
        let parsed = self.parse_volname(volname)?;
        let format = image_format(&parsed);
        if format != ImageFormat::Qcow2 {
            return Err(SiloError::Storage(format!(
                "snapshots are not supported for image format '{format}'"
            )));
        }
        let file = self.volume_file(scfg, &parsed)?;
        let file_str = file.display().to_string();
        self.runner
            .run_checked(CommandSpec::new([
                "qemu-img",
                "snapshot",
                op,
                snap,
                file_str.as_str(),
            ]))
            .await?;
        Ok(())
    }
}

use crate::{Result, SiloError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Check a storage identifier against the `[a-z][a-z0-9._-]*[a-z0-9]` grammar.
pub fn parse_storage_id(s: &str) -> Result<&str> {
    let bytes = s.as_bytes();
    if bytes.len() < 2 {
        return Err(SiloError::InvalidStorageId(s.to_string()));
    }
    if !bytes[0].is_ascii_lowercase() {
        return Err(SiloError::InvalidStorageId(s.to_string()));
    }
    let last = bytes[bytes.len() - 1];
    if !(last.is_ascii_lowercase() || last.is_ascii_digit()) {
        return Err(SiloError::InvalidStorageId(s.to_string()));
    }
    let middle_ok = bytes[1..bytes.len() - 1]
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-'));
    if !middle_ok {
        return Err(SiloError::InvalidStorageId(s.to_string()));
    }
    Ok(s)
}

/// Split a fully qualified `storeid:volname` volume identifier.
pub fn parse_volume_id(volid: &str) -> Result<(&str, &str)> {
    let (storeid, volname) = volid
        .split_once(':')
        .ok_or_else(|| SiloError::InvalidVolumeId(volid.to_string()))?;
    if parse_storage_id(storeid).is_err() || volname.is_empty() {
        return Err(SiloError::InvalidVolumeId(volid.to_string()));
    }
    Ok((storeid, volname))
}

/// Role a storage declares it can hold, and the class of a parsed volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Images,
    Rootdir,
    Iso,
    Vztmpl,
    Backup,
    None,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Images => "images",
            ContentType::Rootdir => "rootdir",
            ContentType::Iso => "iso",
            ContentType::Vztmpl => "vztmpl",
            ContentType::Backup => "backup",
            ContentType::None => "none",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = SiloError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "images" => Ok(ContentType::Images),
            "rootdir" => Ok(ContentType::Rootdir),
            "iso" => Ok(ContentType::Iso),
            "vztmpl" => Ok(ContentType::Vztmpl),
            "backup" => Ok(ContentType::Backup),
            "none" => Ok(ContentType::None),
            other => Err(SiloError::InvalidOption {
                option: "content".to_string(),
                reason: format!("unknown content type '{other}'"),
            }),
        }
    }
}

/// On-disk representation of an image volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Raw,
    Qcow2,
    Vmdk,
    /// ZFS filesystem dataset backing a container root.
    Subvol,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vmdk => "vmdk",
            ImageFormat::Subvol => "subvol",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = SiloError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(ImageFormat::Raw),
            "qcow2" => Ok(ImageFormat::Qcow2),
            "vmdk" => Ok(ImageFormat::Vmdk),
            "subvol" => Ok(ImageFormat::Subvol),
            other => Err(SiloError::InvalidOption {
                option: "format".to_string(),
                reason: format!("unknown format '{other}'"),
            }),
        }
    }
}

/// Capability a caller can probe per volume via `volume_has_feature`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeFeature {
    Snapshot,
    Clone,
    Template,
    Copy,
}

impl fmt::Display for VolumeFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolumeFeature::Snapshot => "snapshot",
            VolumeFeature::Clone => "clone",
            VolumeFeature::Template => "template",
            VolumeFeature::Copy => "copy",
        };
        f.write_str(s)
    }
}

/// State a feature is probed against: the live volume, a base template, or a
/// named snapshot of the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Current,
    Base,
    Snap,
}

/// Decoded backend-local volume name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedVolname {
    pub vtype: ContentType,
    /// Last path component: the file or dataset name itself.
    pub name: String,
    pub vmid: Option<u32>,
    /// Base image name when this volume is a linked clone.
    pub basename: Option<String>,
    pub base_vmid: Option<u32>,
    pub is_base: bool,
    pub format: Option<ImageFormat>,
}

impl ParsedVolname {
    pub fn state(&self, snap: Option<&str>) -> VolumeState {
        if snap.is_some() {
            VolumeState::Snap
        } else if self.is_base {
            VolumeState::Base
        } else {
            VolumeState::Current
        }
    }
}

/// One volume as reported by `list_images`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeEntry {
    pub volid: String,
    pub size: u64,
    pub format: ImageFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vmid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// Space accounting for one storage, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageStatus {
    pub total: u64,
    pub avail: u64,
    pub used: u64,
    pub active: bool,
}

impl StorageStatus {
    /// The degraded result for an unreachable storage; probes never fail hard.
    pub fn inactive() -> Self {
        StorageStatus {
            total: 0,
            avail: 0,
            used: 0,
            active: false,
        }
    }
}

/// Resolved location of a volume: a file path, a block device, or a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumePath {
    pub path: String,
    pub vmid: Option<u32>,
    pub vtype: ContentType,
}

//! LVM volume-group backend: configuration surface only.
//!
//! The config layer needs the type for its `base`-on-iSCSI preconditions and
//! the delete-dependency rule; the actual volume operations live outside
//! this core and answer "not supported" here.

use crate::registry::{OptionDescriptor, OptionKind};
use crate::section::StorageConfig;
use crate::volname;
use crate::{ContentModes, StoragePlugin};
use async_trait::async_trait;
use silo_core::{ContentType, ImageFormat, ParsedVolname, Result, SiloError, VolumePath};

const CONTENT_ALLOWED: &[ContentType] = &[ContentType::Images, ContentType::None];
const CONTENT_DEFAULT: &[ContentType] = &[ContentType::Images];

const OPTIONS: &[OptionDescriptor] = &[
    OptionDescriptor::fixed("vgname", OptionKind::Text),
    OptionDescriptor::optional("base", OptionKind::Text),
    OptionDescriptor::optional("shared", OptionKind::Bool),
    OptionDescriptor::optional("content", OptionKind::Content),
    OptionDescriptor::optional("nodes", OptionKind::Nodes),
    OptionDescriptor::optional("disable", OptionKind::Bool),
];

pub struct LvmPlugin;

impl LvmPlugin {
    pub fn new() -> Self {
        LvmPlugin
    }
}

impl Default for LvmPlugin {
    fn default() -> Self {
        LvmPlugin::new()
    }
}

#[async_trait]
impl StoragePlugin for LvmPlugin {
    fn type_name(&self) -> &'static str {
        "lvm"
    }

    fn content_modes(&self) -> ContentModes {
        ContentModes {
            allowed: CONTENT_ALLOWED,
            default: CONTENT_DEFAULT,
        }
    }

    fn options(&self) -> &'static [OptionDescriptor] {
        OPTIONS
    }

    fn parse_volname(&self, volname: &str) -> Result<ParsedVolname> {
        // Logical volumes use the dataset shape without an extension.
        let (is_base, vmid, _) = volname::parse_zfs_dataset_name(volname)?;
        Ok(ParsedVolname {
            vtype: ContentType::Images,
            name: volname.to_string(),
            vmid: Some(vmid),
            basename: None,
            base_vmid: None,
            is_base,
            format: Some(ImageFormat::Raw),
        })
    }

    async fn path(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: Option<&str>,
    ) -> Result<VolumePath> {
        if snap.is_some() {
            return Err(SiloError::not_supported("path with snapshot", "lvm"));
        }
        let parsed = self.parse_volname(volname)?;
        let vgname = scfg
            .vgname
            .as_deref()
            .ok_or_else(|| SiloError::Config(format!("storage '{}' has no vgname", scfg.storage)))?;
        Ok(VolumePath {
            path: format!("/dev/{vgname}/{volname}"),
            vmid: parsed.vmid,
            vtype: parsed.vtype,
        })
    }
}

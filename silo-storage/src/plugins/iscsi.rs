//! iSCSI backend: configuration surface only.
//!
//! Exposes LUNs of a remote target; volumes are never allocated or freed
//! here, and an LVM storage may sit on top of one of these LUNs via its
//! `base` option.

use crate::registry::{OptionDescriptor, OptionKind};
use crate::section::StorageConfig;
use crate::{ContentModes, StoragePlugin};
use async_trait::async_trait;
use silo_core::{ContentType, ImageFormat, ParsedVolname, Result, SiloError, VolumePath};

const CONTENT_ALLOWED: &[ContentType] = &[ContentType::Images, ContentType::None];
const CONTENT_DEFAULT: &[ContentType] = &[ContentType::None];

const OPTIONS: &[OptionDescriptor] = &[
    OptionDescriptor::fixed("portal", OptionKind::Text),
    OptionDescriptor::fixed("target", OptionKind::Text),
    OptionDescriptor::optional("shared", OptionKind::Bool),
    OptionDescriptor::optional("content", OptionKind::Content),
    OptionDescriptor::optional("nodes", OptionKind::Nodes),
    OptionDescriptor::optional("disable", OptionKind::Bool),
];

pub struct IscsiPlugin;

impl IscsiPlugin {
    pub fn new() -> Self {
        IscsiPlugin
    }
}

impl Default for IscsiPlugin {
    fn default() -> Self {
        IscsiPlugin::new()
    }
}

#[async_trait]
impl StoragePlugin for IscsiPlugin {
    fn type_name(&self) -> &'static str {
        "iscsi"
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

    /// Remote targets are reachable from every node.
    fn shared_by_default(&self) -> bool {
        true
    }

    fn parse_volname(&self, volname: &str) -> Result<ParsedVolname> {
        if volname.is_empty() || volname.contains('/') {
            return Err(SiloError::InvalidVolname(volname.to_string()));
        }
        Ok(ParsedVolname {
            vtype: ContentType::Images,
            name: volname.to_string(),
            vmid: None,
            basename: None,
            base_vmid: None,
            is_base: false,
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
            return Err(SiloError::not_supported("path with snapshot", "iscsi"));
        }
        let parsed = self.parse_volname(volname)?;
        let portal = scfg
            .portal
            .as_deref()
            .ok_or_else(|| SiloError::Config(format!("storage '{}' has no portal", scfg.storage)))?;
        let target = scfg
            .target
            .as_deref()
            .ok_or_else(|| SiloError::Config(format!("storage '{}' has no target", scfg.storage)))?;
        Ok(VolumePath {
            path: format!("iscsi://{portal}/{target}/{volname}"),
            vmid: None,
            vtype: parsed.vtype,
        })
    }
}

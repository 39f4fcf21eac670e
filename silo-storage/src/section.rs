//! The cluster-wide `storage.cfg` section format.
//!
//! ```text
//! <type>: <storeid>
//!         key value
//!         key value
//! ```
//!
//! Indented lines belong to the preceding header. Unknown keys survive a
//! parse/write cycle verbatim; a duplicate storage ID keeps the last
//! definition and warns. The writer emits sections sorted by storage ID with
//! properties in alphabetical order, so equal configurations serialize to
//! equal bytes and the digest is meaningful.

use crate::registry::PluginRegistry;
use serde::Serialize;
use silo_core::{ContentType, ImageFormat, Result, SiloError};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::warn;

/// The storage that always exists on every node.
pub const LOCAL_STORAGE_ID: &str = "local";
pub const LOCAL_STORAGE_PATH: &str = "/var/lib/silo";

/// One decoded storage declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageConfig {
    pub storage: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub content: BTreeSet<ContentType>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub nodes: BTreeSet<String>,
    pub disable: bool,
    pub shared: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxfiles: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<ImageFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vgname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub portal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocksize: Option<String>,
    pub sparse: bool,
    /// Keys this version does not know; written back verbatim.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl StorageConfig {
    pub fn new(storage: impl Into<String>, ty: impl Into<String>) -> Self {
        StorageConfig {
            storage: storage.into(),
            ty: ty.into(),
            content: BTreeSet::new(),
            nodes: BTreeSet::new(),
            disable: false,
            shared: false,
            maxfiles: None,
            format: None,
            path: None,
            pool: None,
            vgname: None,
            base: None,
            portal: None,
            target: None,
            blocksize: None,
            sparse: false,
            extra: BTreeMap::new(),
        }
    }

    /// Whether this storage is usable from `node`.
    pub fn available_on(&self, node: &str) -> bool {
        self.nodes.is_empty() || self.nodes.contains(node)
    }
}

/// A parsed configuration plus the digest of the bytes it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntries {
    pub entries: BTreeMap<String, StorageConfig>,
    pub digest: String,
}

impl StorageEntries {
    pub fn get(&self, storeid: &str) -> Result<&StorageConfig> {
        self.entries
            .get(storeid)
            .ok_or_else(|| SiloError::NoSuchStorage(storeid.to_string()))
    }
}

/// Hash of the serialized configuration, used as the optimistic-concurrency
/// precondition on updates.
pub fn config_digest(raw: &str) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, raw.as_bytes());
    hex::encode(digest.as_ref())
}

/// Parse `storage.cfg` bytes and inject the guaranteed `local` entry.
pub fn parse_config(registry: &PluginRegistry, raw: &str) -> Result<StorageEntries> {
    let mut entries: BTreeMap<String, StorageConfig> = BTreeMap::new();
    let mut current: Option<(String, String, BTreeMap<String, String>)> = None;

    let flush = |section: Option<(String, String, BTreeMap<String, String>)>,
                     entries: &mut BTreeMap<String, StorageConfig>|
     -> Result<()> {
        if let Some((ty, storeid, mut params)) = section {
            params.insert("type".to_string(), ty);
            let scfg = registry.check_config(&storeid, &params, true, false)?;
            if entries.insert(storeid.clone(), scfg).is_some() {
                warn!(storage = %storeid, "duplicate storage ID, using last definition");
            }
        }
        Ok(())
    };

    for (lineno, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            let (key, value) = line
                .trim()
                .split_once(char::is_whitespace)
                .map(|(k, v)| (k, v.trim()))
                .unwrap_or((line.trim(), ""));
            match current.as_mut() {
                Some((_, _, params)) => {
                    params.insert(key.to_string(), value.to_string());
                }
                None => {
                    return Err(SiloError::Config(format!(
                        "line {}: property outside of section",
                        lineno + 1
                    )));
                }
            }
        } else {
            let (ty, storeid) = line.split_once(':').ok_or_else(|| {
                SiloError::Config(format!("line {}: expected section header", lineno + 1))
            })?;
            flush(current.take(), &mut entries)?;
            current = Some((
                ty.trim().to_string(),
                storeid.trim().to_string(),
                BTreeMap::new(),
            ));
        }
    }
    flush(current.take(), &mut entries)?;

    inject_local_entry(&mut entries);

    Ok(StorageEntries {
        entries,
        digest: config_digest(raw),
    })
}

/// Exactly one `local` dir storage always exists: fixed path, never disabled,
/// never node-restricted, and its content always covers container roots and
/// templates.
fn inject_local_entry(entries: &mut BTreeMap<String, StorageConfig>) {
    let local = entries
        .entry(LOCAL_STORAGE_ID.to_string())
        .or_insert_with(|| {
            let mut scfg = StorageConfig::new(LOCAL_STORAGE_ID, "dir");
            scfg.content.insert(ContentType::Images);
            scfg.content.insert(ContentType::Iso);
            scfg
        });
    local.ty = "dir".to_string();
    local.path = Some(PathBuf::from(LOCAL_STORAGE_PATH));
    local.disable = false;
    local.nodes.clear();
    local.content.remove(&ContentType::None);
    local.content.insert(ContentType::Rootdir);
    local.content.insert(ContentType::Vztmpl);
}

/// Serialize entries in the stable section format.
pub fn write_config(entries: &BTreeMap<String, StorageConfig>) -> String {
    let mut out = String::new();
    for (storeid, scfg) in entries {
        out.push_str(&format!("{}: {}\n", scfg.ty, storeid));
        for (key, value) in encode_properties(scfg) {
            out.push_str(&format!("\t{key} {value}\n"));
        }
        out.push('\n');
    }
    if out.ends_with("\n\n") {
        out.pop();
    }
    out
}

fn encode_properties(scfg: &StorageConfig) -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    if !scfg.content.is_empty() {
        let mut joined: Vec<&str> = scfg.content.iter().map(ContentType::as_str).collect();
        joined.sort_unstable();
        props.insert("content".to_string(), joined.join(","));
    }
    if !scfg.nodes.is_empty() {
        let joined: Vec<&str> = scfg.nodes.iter().map(String::as_str).collect();
        props.insert("nodes".to_string(), joined.join(","));
    }
    if scfg.disable {
        props.insert("disable".to_string(), "1".to_string());
    }
    if scfg.shared {
        props.insert("shared".to_string(), "1".to_string());
    }
    if scfg.sparse {
        props.insert("sparse".to_string(), "1".to_string());
    }
    if let Some(maxfiles) = scfg.maxfiles {
        props.insert("maxfiles".to_string(), maxfiles.to_string());
    }
    if let Some(format) = scfg.format {
        props.insert("format".to_string(), format.to_string());
    }
    if let Some(path) = &scfg.path {
        props.insert("path".to_string(), path.display().to_string());
    }
    for (key, value) in [
        ("pool", &scfg.pool),
        ("vgname", &scfg.vgname),
        ("base", &scfg.base),
        ("portal", &scfg.portal),
        ("target", &scfg.target),
        ("blocksize", &scfg.blocksize),
    ] {
        if let Some(value) = value {
            props.insert(key.to_string(), value.clone());
        }
    }
    for (key, value) in &scfg.extra {
        props.insert(key.clone(), value.clone());
    }
    props
}

//! The storage-type registry: per-type option tables, value codecs, and the
//! create/update schemas assembled from them.
//!
//! The default registry is process-global and immutable after startup; tests
//! build private registries wired to a scripted command runner.

use crate::plugins::{DirPlugin, IscsiPlugin, LvmPlugin, ZfsPoolPlugin};
use crate::section::StorageConfig;
use crate::StoragePlugin;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use silo_core::{
    parse_storage_id, CommandRunner, ContentType, ImageFormat, Result, SiloError, SystemRunner,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// How an option's string value is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// Comma-separated set of content types.
    Content,
    /// Comma-separated set of node names.
    Nodes,
    /// One of the type's allowed image formats.
    Format,
    Bool,
    Uint,
    Text,
    /// Absolute filesystem path.
    Path,
}

impl OptionKind {
    fn json_type(&self) -> &'static str {
        match self {
            OptionKind::Bool => "boolean",
            OptionKind::Uint => "integer",
            _ => "string",
        }
    }
}

/// One settable option of a storage type. `fixed` options can only be given
/// at creation time and are required there.
#[derive(Debug, Clone, Copy)]
pub struct OptionDescriptor {
    pub name: &'static str,
    pub kind: OptionKind,
    pub fixed: bool,
}

impl OptionDescriptor {
    pub const fn fixed(name: &'static str, kind: OptionKind) -> Self {
        OptionDescriptor {
            name,
            kind,
            fixed: true,
        }
    }

    pub const fn optional(name: &'static str, kind: OptionKind) -> Self {
        OptionDescriptor {
            name,
            kind,
            fixed: false,
        }
    }
}

pub struct PluginRegistry {
    plugins: BTreeMap<&'static str, Arc<dyn StoragePlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry {
            plugins: BTreeMap::new(),
        }
    }

    /// All built-in storage types, wired to the given command runner.
    pub fn with_defaults(runner: Arc<dyn CommandRunner>) -> Self {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(DirPlugin::new(runner.clone())));
        registry.register(Arc::new(ZfsPoolPlugin::new(runner)));
        registry.register(Arc::new(LvmPlugin::new()));
        registry.register(Arc::new(IscsiPlugin::new()));
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn StoragePlugin>) {
        debug!(ty = plugin.type_name(), "registering storage type");
        self.plugins.insert(plugin.type_name(), plugin);
    }

    pub fn lookup(&self, ty: &str) -> Result<Arc<dyn StoragePlugin>> {
        self.plugins
            .get(ty)
            .cloned()
            .ok_or_else(|| SiloError::UnknownStorageType(ty.to_string()))
    }

    pub fn types(&self) -> Vec<&'static str> {
        self.plugins.keys().copied().collect()
    }

    /// Validate creation parameters (or one section of the config file, with
    /// `strict` off so unknown keys survive) and build the decoded entry.
    pub fn check_config(
        &self,
        storeid: &str,
        params: &BTreeMap<String, String>,
        create: bool,
        strict: bool,
    ) -> Result<StorageConfig> {
        let ty = params.get("type").ok_or_else(|| SiloError::InvalidOption {
            option: "type".to_string(),
            reason: "missing".to_string(),
        })?;
        let plugin = self.lookup(ty)?;
        parse_storage_id(storeid)?;

        let mut scfg = StorageConfig::new(storeid, plugin.type_name());
        scfg.shared = plugin.shared_by_default();
        self.apply_params(plugin.as_ref(), &mut scfg, params, create, strict)?;

        if create {
            for desc in plugin.options().iter().filter(|desc| desc.fixed) {
                if !params.contains_key(desc.name) {
                    return Err(SiloError::InvalidOption {
                        option: desc.name.to_string(),
                        reason: format!("required for storage type '{ty}'"),
                    });
                }
            }
            if scfg.content.is_empty() {
                scfg.content = plugin.content_modes().default.iter().copied().collect();
            }
        }

        Ok(scfg)
    }

    /// Merge update parameters over an existing entry, key-wise, last write
    /// wins. Fixed options are rejected; the type itself is never updatable.
    pub fn check_update(
        &self,
        scfg: &mut StorageConfig,
        params: &BTreeMap<String, String>,
    ) -> Result<()> {
        if params.contains_key("type") {
            return Err(SiloError::InvalidOption {
                option: "type".to_string(),
                reason: "storage type cannot be changed".to_string(),
            });
        }
        let plugin = self.lookup(&scfg.ty)?;
        self.apply_params(plugin.as_ref(), scfg, params, false, true)
    }

    fn apply_params(
        &self,
        plugin: &dyn StoragePlugin,
        scfg: &mut StorageConfig,
        params: &BTreeMap<String, String>,
        create: bool,
        strict: bool,
    ) -> Result<()> {
        for (key, value) in params {
            if matches!(key.as_str(), "type" | "storage" | "digest") {
                continue;
            }
            let desc = plugin.options().iter().find(|desc| desc.name == key);
            match desc {
                Some(desc) => {
                    if !create && desc.fixed {
                        return Err(SiloError::InvalidOption {
                            option: key.clone(),
                            reason: "fixed option can only be set on storage creation"
                                .to_string(),
                        });
                    }
                    apply_option(plugin, scfg, desc, value)?;
                }
                None if strict => {
                    return Err(SiloError::InvalidOption {
                        option: key.clone(),
                        reason: format!("unknown option for storage type '{}'", scfg.ty),
                    });
                }
                None => {
                    debug!(option = %key, ty = %scfg.ty, "keeping unknown option verbatim");
                    scfg.extra.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    /// Union schema for storage creation; `storage` and `type` are required,
    /// unknown keys are rejected.
    pub fn create_schema(&self) -> Value {
        self.schema(false)
    }

    /// Union schema for updates: fixed options are excluded and an optional
    /// `digest` guards against concurrent modification.
    pub fn update_schema(&self) -> Value {
        self.schema(true)
    }

    fn schema(&self, update: bool) -> Value {
        let mut props = serde_json::Map::new();
        props.insert(
            "storage".to_string(),
            json!({ "type": "string", "description": "storage identifier" }),
        );
        if !update {
            props.insert(
                "type".to_string(),
                json!({ "type": "string", "enum": self.types() }),
            );
        } else {
            props.insert(
                "digest".to_string(),
                json!({
                    "type": "string",
                    "optional": true,
                    "description": "prevent changes if the configuration was modified concurrently",
                }),
            );
        }
        for plugin in self.plugins.values() {
            for desc in plugin.options() {
                if update && desc.fixed {
                    continue;
                }
                let entry = props
                    .entry(desc.name.to_string())
                    .or_insert_with(|| json!({ "type": desc.kind.json_type() }));
                if !update && desc.fixed {
                    entry["fixed"] = json!(true);
                }
            }
        }
        let required: Vec<&str> = if update {
            vec!["storage"]
        } else {
            vec!["storage", "type"]
        };
        json!({
            "type": "object",
            "additionalProperties": false,
            "properties": Value::Object(props),
            "required": required,
        })
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        PluginRegistry::new()
    }
}

fn apply_option(
    plugin: &dyn StoragePlugin,
    scfg: &mut StorageConfig,
    desc: &OptionDescriptor,
    value: &str,
) -> Result<()> {
    match desc.name {
        "content" => scfg.content = decode_content(plugin, value)?,
        "nodes" => scfg.nodes = decode_nodes(value)?,
        "format" => scfg.format = Some(decode_format(plugin, value)?),
        "disable" => scfg.disable = decode_bool(desc.name, value)?,
        "shared" => scfg.shared = decode_bool(desc.name, value)?,
        "sparse" => scfg.sparse = decode_bool(desc.name, value)?,
        "maxfiles" => {
            scfg.maxfiles = Some(value.parse().map_err(|_| SiloError::InvalidOption {
                option: desc.name.to_string(),
                reason: format!("'{value}' is not a non-negative integer"),
            })?)
        }
        "path" => {
            if !value.starts_with('/') {
                return Err(SiloError::InvalidOption {
                    option: desc.name.to_string(),
                    reason: format!("'{value}' is not an absolute path"),
                });
            }
            scfg.path = Some(PathBuf::from(value));
        }
        "pool" => scfg.pool = Some(decode_text(desc.name, value)?),
        "vgname" => scfg.vgname = Some(decode_text(desc.name, value)?),
        "base" => scfg.base = Some(decode_text(desc.name, value)?),
        "portal" => scfg.portal = Some(decode_text(desc.name, value)?),
        "target" => scfg.target = Some(decode_text(desc.name, value)?),
        "blocksize" => scfg.blocksize = Some(decode_text(desc.name, value)?),
        other => {
            return Err(SiloError::InvalidOption {
                option: other.to_string(),
                reason: "no decoder registered".to_string(),
            });
        }
    }
    Ok(())
}

fn decode_content(plugin: &dyn StoragePlugin, value: &str) -> Result<BTreeSet<ContentType>> {
    let mut set = BTreeSet::new();
    for token in value.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        set.insert(token.parse::<ContentType>()?);
    }
    if set.is_empty() {
        return Err(SiloError::InvalidOption {
            option: "content".to_string(),
            reason: "empty content list".to_string(),
        });
    }
    if set.contains(&ContentType::None) && set.len() > 1 {
        return Err(SiloError::InvalidOption {
            option: "content".to_string(),
            reason: "'none' cannot be combined with other content types".to_string(),
        });
    }
    let allowed = plugin.content_modes().allowed;
    for ct in &set {
        if !allowed.contains(ct) {
            return Err(SiloError::InvalidOption {
                option: "content".to_string(),
                reason: format!(
                    "content type '{ct}' not allowed for storage type '{}'",
                    plugin.type_name()
                ),
            });
        }
    }
    Ok(set)
}

fn decode_nodes(value: &str) -> Result<BTreeSet<String>> {
    let mut set = BTreeSet::new();
    for token in value.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let valid = token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'));
        if !valid {
            return Err(SiloError::InvalidOption {
                option: "nodes".to_string(),
                reason: format!("invalid node name '{token}'"),
            });
        }
        set.insert(token.to_string());
    }
    Ok(set)
}

fn decode_format(plugin: &dyn StoragePlugin, value: &str) -> Result<ImageFormat> {
    let modes = plugin
        .format_modes()
        .ok_or_else(|| SiloError::InvalidOption {
            option: "format".to_string(),
            reason: format!(
                "storage type '{}' has no configurable format",
                plugin.type_name()
            ),
        })?;
    let format: ImageFormat = value.parse()?;
    if !modes.allowed.contains(&format) {
        return Err(SiloError::InvalidOption {
            option: "format".to_string(),
            reason: format!(
                "format '{format}' not allowed for storage type '{}'",
                plugin.type_name()
            ),
        });
    }
    Ok(format)
}

fn decode_bool(option: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => Err(SiloError::InvalidOption {
            option: option.to_string(),
            reason: format!("'{other}' is not a boolean"),
        }),
    }
}

fn decode_text(option: &str, value: &str) -> Result<String> {
    if value.is_empty() {
        return Err(SiloError::InvalidOption {
            option: option.to_string(),
            reason: "empty value".to_string(),
        });
    }
    Ok(value.to_string())
}

static DEFAULT_REGISTRY: Lazy<Arc<PluginRegistry>> =
    Lazy::new(|| Arc::new(PluginRegistry::with_defaults(Arc::new(SystemRunner))));

/// The process-global registry wired to the real command runner.
pub fn default_registry() -> Arc<PluginRegistry> {
    DEFAULT_REGISTRY.clone()
}

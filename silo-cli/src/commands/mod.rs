mod add;
mod alloc;
mod free;
mod list;
mod path;
mod remove;
mod set;
mod status;

use crate::output::OutputFormat;
use clap::{Args, Subcommand};
use silo_core::{CommandRunner, Result, SiloError, StorageLocker, SystemRunner};
use silo_storage::{default_registry, ConfigApi, ConfigStore, FileStore, StorageManager};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a command needs to talk to the storage layer.
pub struct Context {
    pub api: ConfigApi,
    pub manager: StorageManager,
    pub format: OutputFormat,
}

impl Context {
    pub fn new(
        config: PathBuf,
        lock_dir: PathBuf,
        node: Option<String>,
        format: OutputFormat,
    ) -> Self {
        let registry = default_registry();
        let store: Arc<dyn ConfigStore> = Arc::new(FileStore::new(config));
        let locker = Arc::new(StorageLocker::node_local(
            lock_dir.clone(),
            lock_dir.join("cluster"),
        ));
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        Context {
            api: ConfigApi::new(registry.clone(), store.clone(), locker.clone(), runner),
            manager: StorageManager::new(registry, store, locker, node),
            format,
        }
    }
}

/// Storage options shared by `add` and `set`.
#[derive(Args, Debug, Default)]
pub struct StorageOptions {
    /// Filesystem path (dir storages)
    #[arg(long)]
    path: Option<String>,

    /// ZFS pool or dataset (zfspool storages)
    #[arg(long)]
    pool: Option<String>,

    /// Volume group name (lvm storages)
    #[arg(long)]
    vgname: Option<String>,

    /// Backing iSCSI volume id of an LVM storage
    #[arg(long)]
    base: Option<String>,

    /// iSCSI portal
    #[arg(long)]
    portal: Option<String>,

    /// iSCSI target
    #[arg(long)]
    target: Option<String>,

    /// Allowed content types, comma separated
    #[arg(long)]
    content: Option<String>,

    /// Restrict the storage to these nodes, comma separated
    #[arg(long)]
    nodes: Option<String>,

    /// Default image format
    #[arg(long = "image-format")]
    image_format: Option<String>,

    /// ZFS zvol block size
    #[arg(long)]
    blocksize: Option<String>,

    /// Backup retention
    #[arg(long)]
    maxfiles: Option<u32>,

    /// Storage is reachable identically from all nodes
    #[arg(long)]
    shared: Option<bool>,

    #[arg(long)]
    disable: Option<bool>,

    /// Allocate zvols sparsely
    #[arg(long)]
    sparse: Option<bool>,

    /// Additional options as key=value
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    options: Vec<String>,
}

impl StorageOptions {
    pub fn into_params(self) -> Result<BTreeMap<String, String>> {
        let mut params = BTreeMap::new();
        let text = [
            ("path", self.path),
            ("pool", self.pool),
            ("vgname", self.vgname),
            ("base", self.base),
            ("portal", self.portal),
            ("target", self.target),
            ("content", self.content),
            ("nodes", self.nodes),
            ("format", self.image_format),
            ("blocksize", self.blocksize),
        ];
        for (key, value) in text {
            if let Some(value) = value {
                params.insert(key.to_string(), value);
            }
        }
        if let Some(maxfiles) = self.maxfiles {
            params.insert("maxfiles".to_string(), maxfiles.to_string());
        }
        for (key, value) in [
            ("shared", self.shared),
            ("disable", self.disable),
            ("sparse", self.sparse),
        ] {
            if let Some(value) = value {
                params.insert(key.to_string(), if value { "1" } else { "0" }.to_string());
            }
        }
        for option in self.options {
            let (key, value) = option.split_once('=').ok_or_else(|| {
                SiloError::Config(format!("invalid option '{option}', expected key=value"))
            })?;
            params.insert(key.to_string(), value.to_string());
        }
        Ok(params)
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add a new storage definition
    Add {
        /// Storage type
        #[arg(value_name = "TYPE")]
        ty: String,

        /// Storage identifier
        storage: String,

        #[command(flatten)]
        options: StorageOptions,
    },

    /// Change an existing storage definition
    Set {
        /// Storage identifier
        storage: String,

        /// Only apply when the configuration digest still matches
        #[arg(long)]
        digest: Option<String>,

        #[command(flatten)]
        options: StorageOptions,
    },

    /// Remove a storage definition
    Remove {
        /// Storage identifier
        storage: String,
    },

    /// Show storage usage
    Status {
        /// Storage identifier (all storages if omitted)
        storage: Option<String>,
    },

    /// List the volumes of a storage
    List {
        /// Storage identifier
        storage: String,

        /// Only volumes owned by this vmid
        #[arg(long)]
        vmid: Option<u32>,
    },

    /// Allocate a new volume
    Alloc {
        /// Storage identifier
        storage: String,

        /// Owning vmid
        vmid: u32,

        /// Size (e.g. 4G, 512M, or kibibytes)
        size: String,

        /// Explicit volume name
        #[arg(long)]
        name: Option<String>,

        /// Image format
        #[arg(long = "image-format")]
        format: Option<String>,
    },

    /// Free a volume
    Free {
        /// Volume identifier (storage:volname)
        volid: String,
    },

    /// Print the path of a volume
    Path {
        /// Volume identifier (storage:volname)
        volid: String,

        /// Resolve a snapshot of the volume
        #[arg(long)]
        snapshot: Option<String>,
    },
}

pub async fn execute(command: Command, ctx: Context) -> Result<()> {
    match command {
        Command::Add {
            ty,
            storage,
            options,
        } => add::execute(ty, storage, options, ctx).await,
        Command::Set {
            storage,
            digest,
            options,
        } => set::execute(storage, digest, options, ctx).await,
        Command::Remove { storage } => remove::execute(storage, ctx).await,
        Command::Status { storage } => status::execute(storage, ctx).await,
        Command::List { storage, vmid } => list::execute(storage, vmid, ctx).await,
        Command::Alloc {
            storage,
            vmid,
            size,
            name,
            format,
        } => alloc::execute(storage, vmid, size, name, format, ctx).await,
        Command::Free { volid } => free::execute(volid, ctx).await,
        Command::Path { volid, snapshot } => path::execute(volid, snapshot, ctx).await,
    }
}

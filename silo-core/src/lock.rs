//! Mutual exclusion around configuration and allocation.
//!
//! Two arms behind one interface: a node-local `flock` on a lock file, and
//! the cluster-wide lock (a lock directory on the cluster filesystem).
//! Tests swap both arms for an in-process mutex.

use crate::{Result, SiloError};
use async_trait::async_trait;
use nix::fcntl::{Flock, FlockArg};
use std::any::Any;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Held lock; releasing is dropping the guard.
pub struct LockGuard {
    _held: Box<dyn Any + Send>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").finish()
    }
}

#[async_trait]
pub trait LockArm: Send + Sync {
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard>;
}

/// Node-local arm: exclusive `flock` on `<dir>/silo-storage-<name>`,
/// retried until the timeout elapses.
pub struct FileLockArm {
    dir: PathBuf,
}

impl FileLockArm {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileLockArm { dir: dir.into() }
    }
}

#[async_trait]
impl LockArm for FileLockArm {
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("silo-storage-{name}"));
        let start = Instant::now();

        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;

            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(flock) => {
                    debug!(lock = %path.display(), "acquired file lock");
                    return Ok(LockGuard {
                        _held: Box::new(flock),
                    });
                }
                Err((_, _errno)) => {
                    let elapsed = start.elapsed();
                    if elapsed >= timeout {
                        return Err(SiloError::LockTimeout(name.to_string()));
                    }
                    let remaining = timeout - elapsed;
                    tokio::time::sleep(LOCK_RETRY_INTERVAL.min(remaining)).await;
                }
            }
        }
    }
}

/// In-process arm: one async mutex per lock name. Used by tests and as the
/// stand-in for the cluster filesystem's lock service.
#[derive(Default)]
pub struct MemoryLockArm {
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryLockArm {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockArm for MemoryLockArm {
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard> {
        let slot = {
            let mut slots = self.slots.lock().unwrap();
            slots
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        match tokio::time::timeout(timeout, slot.lock_owned()).await {
            Ok(guard) => Ok(LockGuard {
                _held: Box::new(guard),
            }),
            Err(_) => Err(SiloError::LockTimeout(name.to_string())),
        }
    }
}

/// Dispatches to the node-local or cluster arm depending on whether the
/// guarded resource is shared cluster-wide.
pub struct StorageLocker {
    local: Arc<dyn LockArm>,
    cluster: Arc<dyn LockArm>,
}

impl StorageLocker {
    pub fn new(local: Arc<dyn LockArm>, cluster: Arc<dyn LockArm>) -> Self {
        StorageLocker { local, cluster }
    }

    /// Both arms on the local filesystem; the cluster arm's lock directory is
    /// expected to live on the cluster filesystem mount.
    pub fn node_local(local_dir: impl Into<PathBuf>, cluster_dir: impl Into<PathBuf>) -> Self {
        StorageLocker {
            local: Arc::new(FileLockArm::new(local_dir)),
            cluster: Arc::new(FileLockArm::new(cluster_dir)),
        }
    }

    /// Both arms in-process; for tests.
    pub fn in_process() -> Self {
        StorageLocker {
            local: Arc::new(MemoryLockArm::new()),
            cluster: Arc::new(MemoryLockArm::new()),
        }
    }

    pub async fn lock(&self, name: &str, shared: bool, timeout: Duration) -> Result<LockGuard> {
        let arm = if shared { &self.cluster } else { &self.local };
        arm.acquire(name, timeout).await
    }
}

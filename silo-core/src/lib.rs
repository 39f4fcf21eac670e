pub mod command;
pub mod error;
pub mod lock;
pub mod types;

pub use command::{CommandOutput, CommandRunner, CommandSpec, FakeRunner, SystemRunner};
pub use error::{Result, SiloError};
pub use lock::{FileLockArm, LockArm, LockGuard, MemoryLockArm, StorageLocker};
pub use types::*;

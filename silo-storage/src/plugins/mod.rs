//! Built-in storage backends.

mod dir;
mod iscsi;
mod lvm;
mod zfs;

pub use dir::DirPlugin;
pub use iscsi::IscsiPlugin;
pub use lvm::LvmPlugin;
pub use zfs::ZfsPoolPlugin;

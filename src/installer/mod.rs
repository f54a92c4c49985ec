//! Local installation backends
//!
//! This module handles:
//! - The installer abstraction the agent triggers installs through
//! - Install locks (in-process and lock-file based)
//! - The RAUC D-Bus binding and its signal forwarder

mod lock;
pub mod rauc;
mod traits;

pub use lock::{FileLock, ProcessLock};
pub use rauc::{forward_signals, RaucInstaller, INSTALLER_INTERFACE};
pub use traits::{Installer, LockKeeper};

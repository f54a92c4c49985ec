//! Abstractions over the local update service and install locking

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

/// Local update service able to install a downloaded bundle.
///
/// Progress and completion are not returned here; they arrive as bus
/// notifications through the event bridge.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Ask the service to install the bundle at `bundle`
    async fn install(&self, bundle: &Path) -> Result<()>;

    /// Human-readable name for logs
    fn name(&self) -> &'static str;
}

/// Mutual exclusion for triggering installations
#[async_trait]
pub trait LockKeeper: Send + Sync {
    /// Try to take the lock for `owner`; false if someone else holds it
    async fn lock(&self, owner: &str) -> Result<bool>;

    /// Release the lock if `owner` holds it
    async fn unlock(&self, owner: &str) -> Result<()>;
}

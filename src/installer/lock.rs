//! Install lock implementations

use super::traits::LockKeeper;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Lock shared by installers living in the same process
#[derive(Debug, Default)]
pub struct ProcessLock {
    holder: Mutex<Option<String>>,
}

impl ProcessLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder, if any
    pub async fn holder(&self) -> Option<String> {
        self.holder.lock().await.clone()
    }
}

#[async_trait]
impl LockKeeper for ProcessLock {
    async fn lock(&self, owner: &str) -> Result<bool> {
        let mut holder = self.holder.lock().await;
        match holder.as_deref() {
            None => {
                *holder = Some(owner.to_string());
                Ok(true)
            }
            Some(current) => Ok(current == owner),
        }
    }

    async fn unlock(&self, owner: &str) -> Result<()> {
        let mut holder = self.holder.lock().await;
        if holder.as_deref() == Some(owner) {
            *holder = None;
        }
        Ok(())
    }
}

/// Lock file shared with other processes.
///
/// The file is created exclusively and records the owner; it is removed on
/// unlock only by that owner.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn current_owner(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(owner) => Ok(Some(owner.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read lock file {}", self.path.display())),
        }
    }
}

#[async_trait]
impl LockKeeper for FileLock {
    async fn lock(&self, owner: &str) -> Result<bool> {
        let created = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await;

        match created {
            Ok(mut file) => {
                file.write_all(owner.as_bytes()).await?;
                file.flush().await?;
                debug!("Acquired install lock {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Ok(self.current_owner().await?.as_deref() == Some(owner))
            }
            Err(e) => Err(e)
                .with_context(|| format!("Failed to create lock file {}", self.path.display())),
        }
    }

    async fn unlock(&self, owner: &str) -> Result<()> {
        match self.current_owner().await? {
            Some(current) if current == owner => {
                tokio::fs::remove_file(&self.path).await.with_context(|| {
                    format!("Failed to remove lock file {}", self.path.display())
                })?;
                debug!("Released install lock {}", self.path.display());
            }
            Some(current) => {
                warn!("Install lock is held by {}, not releasing", current);
            }
            None => {}
        }
        Ok(())
    }
}

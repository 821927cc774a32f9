//! Persistence hooks for the serialized credential store
//!
//! The broker never touches storage directly. It hands an opaque
//! [`TokenCacheBlob`] to a [`TokenCacheStore`], which may be a file, a
//! secret manager, or memory.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::{MailError, Result};

/// Opaque serialized form of every cached account and token
#[derive(Clone, PartialEq, Eq)]
pub struct TokenCacheBlob(String);

impl TokenCacheBlob {
    pub fn new(data: impl Into<String>) -> Self {
        Self(data.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for TokenCacheBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenCacheBlob({} bytes)", self.0.len())
    }
}

/// Load/save hooks injected into the credential broker
#[async_trait]
pub trait TokenCacheStore: Send + Sync {
    /// Previously saved blob, or `None` when nothing was stored yet
    async fn load(&self) -> Result<Option<TokenCacheBlob>>;

    /// Persist a blob, replacing whatever was stored
    async fn save(&self, blob: &TokenCacheBlob) -> Result<()>;
}

/// Token cache stored in a single file
///
/// Writes go to a uniquely named sibling file which is then renamed over the
/// target, so concurrent writers never leave a torn file behind.
#[derive(Debug, Clone)]
pub struct FileTokenCache {
    path: PathBuf,
}

impl FileTokenCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the cache file if it exists
    pub async fn clear(&self) -> Result<()> {
        if self.path.exists() {
            tokio::fs::remove_file(&self.path).await?;
            tracing::info!("Removed token cache at {:?}", self.path);
        }
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "token_cache".to_string());
        self.path
            .with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()))
    }
}

#[async_trait]
impl TokenCacheStore for FileTokenCache {
    async fn load(&self) -> Result<Option<TokenCacheBlob>> {
        if !self.path.exists() {
            tracing::debug!("No token cache at {:?}", self.path);
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            MailError::TokenCacheError(format!("Failed to read {:?}: {}", self.path, e))
        })?;
        Ok(Some(TokenCacheBlob::new(content)))
    }

    async fn save(&self, blob: &TokenCacheBlob) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, blob.as_str()).await?;
        secure_token_file(&temp).await?;

        if let Err(e) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(MailError::TokenCacheError(format!(
                "Failed to replace {:?}: {}",
                self.path, e
            )));
        }

        tracing::debug!("Saved token cache to {:?}", self.path);
        Ok(())
    }
}

/// In-memory token cache, mostly for tests and short-lived sessions
#[derive(Debug, Default)]
pub struct MemoryTokenCache {
    blob: Mutex<Option<TokenCacheBlob>>,
    saves: Mutex<usize>,
}

impl MemoryTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(blob: TokenCacheBlob) -> Self {
        Self {
            blob: Mutex::new(Some(blob)),
            saves: Mutex::new(0),
        }
    }

    /// Currently stored blob
    pub async fn snapshot(&self) -> Option<TokenCacheBlob> {
        self.blob.lock().await.clone()
    }

    /// Number of times `save` was called
    pub async fn save_count(&self) -> usize {
        *self.saves.lock().await
    }
}

#[async_trait]
impl TokenCacheStore for MemoryTokenCache {
    async fn load(&self) -> Result<Option<TokenCacheBlob>> {
        Ok(self.blob.lock().await.clone())
    }

    async fn save(&self, blob: &TokenCacheBlob) -> Result<()> {
        *self.blob.lock().await = Some(blob.clone());
        *self.saves.lock().await += 1;
        Ok(())
    }
}

/// Restrict the token file to its owner (0600)
#[cfg(unix)]
pub async fn secure_token_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

/// Windows relies on the profile directory ACLs
#[cfg(not(unix))]
pub async fn secure_token_file(_path: &Path) -> Result<()> {
    Ok(())
}

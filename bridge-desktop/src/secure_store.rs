//! Credential cache backed by a private directory.
//!
//! Each key is stored in its own file; file names are the URL-safe base64 of
//! the key so arbitrary key strings map to portable names. Clearing the store
//! removes the directory, which is how a corrupted credential cache is reset.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bridge_traits::{
    error::{BridgeError, Result},
    storage::SecureStore,
};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const DEFAULT_DIR_NAME: &str = "dicom-transfer/credentials";

/// Directory-based secure storage implementation
pub struct DirectorySecureStore {
    root: PathBuf,
}

impl DirectorySecureStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a store under the user's data directory.
    pub fn default_location() -> Result<Self> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| {
                BridgeError::NotAvailable("No data directory available for credentials".to_string())
            })?;
        Ok(Self::new(base.join(DEFAULT_DIR_NAME)))
    }

    /// Directory holding the cached credentials
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(URL_SAFE_NO_PAD.encode(key.as_bytes()))
    }

    fn key_from_file_name(name: &str) -> Option<String> {
        let bytes = URL_SAFE_NO_PAD.decode(name).ok()?;
        String::from_utf8(bytes).ok()
    }

    async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o700);
            if let Err(e) = tokio::fs::set_permissions(&self.root, permissions).await {
                warn!(error = %e, "Failed to restrict credential directory permissions");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SecureStore for DirectorySecureStore {
    async fn set_secret(&self, key: &str, value: &[u8]) -> Result<()> {
        self.ensure_root().await?;

        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(key = key, "Stored secret in credential cache");
        Ok(())
    }

    async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(value) => {
                debug!(key = key, "Retrieved secret from credential cache");
                Ok(Some(value))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(key = key, "Secret not found in credential cache");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_secret(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => {
                debug!(key = key, "Deleted secret from credential cache");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(key) = entry
                .file_name()
                .to_str()
                .and_then(Self::key_from_file_name)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn clear_all(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                info!(path = %self.root.display(), "Credential cache deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

//! Credential Cache
//!
//! Persists the long-lived refresh credential behind the [`SecureStore`]
//! bridge. Values are JSON-encoded and never logged.
//!
//! ```ignore
//! let credentials = CredentialStore::new(secure_store);
//! credentials
//!     .store(&StoredCredential::new("1//0g-refresh"))
//!     .await?;
//! let cached = credentials.load().await?;
//! ```

use crate::error::{AuthError, Result};
use bridge_traits::storage::SecureStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Key the refresh credential is stored under.
pub const REFRESH_CREDENTIAL_KEY: &str = "dicom-transfer.refresh-credential";

/// Cached refresh credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    pub refresh_token: String,
    /// Client the credential was issued to, if different from the configured one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl StoredCredential {
    pub fn new(refresh_token: impl Into<String>) -> Self {
        Self {
            refresh_token: refresh_token.into(),
            client_id: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

impl fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredCredential")
            .field("refresh_token", &"[REDACTED]")
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// Credential cache on top of a host [`SecureStore`].
#[derive(Clone)]
pub struct CredentialStore {
    secure_store: Arc<dyn SecureStore>,
}

impl CredentialStore {
    pub fn new(secure_store: Arc<dyn SecureStore>) -> Self {
        Self { secure_store }
    }

    /// Returns `None` when nothing is cached.
    pub async fn load(&self) -> Result<Option<StoredCredential>> {
        let raw = self
            .secure_store
            .get_secret(REFRESH_CREDENTIAL_KEY)
            .await
            .map_err(|e| AuthError::SecureStorageUnavailable(e.to_string()))?;

        let Some(raw) = raw else {
            debug!("No cached credential");
            return Ok(None);
        };

        let credential = serde_json::from_slice::<StoredCredential>(&raw).map_err(|e| {
            warn!("Cached credential is unreadable");
            AuthError::SerializationFailed(e.to_string())
        })?;

        Ok(Some(credential))
    }

    pub async fn store(&self, credential: &StoredCredential) -> Result<()> {
        let raw = serde_json::to_vec(credential)
            .map_err(|e| AuthError::SerializationFailed(e.to_string()))?;

        self.secure_store
            .set_secret(REFRESH_CREDENTIAL_KEY, &raw)
            .await
            .map_err(|e| AuthError::SecureStorageUnavailable(e.to_string()))?;

        debug!("Cached credential updated");
        Ok(())
    }

    /// Delete every cached credential.
    pub async fn clear(&self) -> Result<()> {
        self.secure_store
            .clear_all()
            .await
            .map_err(|e| AuthError::SecureStorageUnavailable(e.to_string()))?;

        info!("Credential cache cleared");
        Ok(())
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore").finish_non_exhaustive()
    }
}

//! # Transfer Configuration Module
//!
//! Provides configuration management for the DICOM transfer core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a
//! [`TransferConfig`] that holds the target store, pipeline tuning, sign-in
//! settings and the host bridges. It fails fast: an invalid or missing
//! required value is reported when [`TransferConfigBuilder::build`] runs, not
//! when the first transfer is attempted.
//!
//! ## Required Values
//!
//! - `project_id`, `location_id`, `dataset_name`, `store_name` - identify the
//!   remote DICOM store
//!
//! ## Optional Dependencies (with platform defaults)
//!
//! - `HttpClient` - HTTP operations (desktop default: reqwest)
//! - `SecureStore` - Credential cache (desktop default: private directory)
//!
//! When the `desktop-shims` feature is enabled, desktop-ready defaults for both
//! bridges are injected automatically if not provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::TransferConfig;
//!
//! let config = TransferConfig::builder()
//!     .project_id("my-project")
//!     .location_id("us-central1")
//!     .dataset_name("imaging")
//!     .store_name("incoming")
//!     .import_directory("/var/lib/dicom/import")
//!     .poll_interval_ms(20_000)
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use bridge_traits::{HttpClient, SecureStore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default Cloud Healthcare API root.
pub const DEFAULT_HEALTHCARE_BASE_URL: &str = "https://healthcare.googleapis.com/v1";

/// Default OAuth token endpoint.
pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Default token introspection endpoint.
pub const DEFAULT_TOKEN_INFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20_000);
pub const DEFAULT_MAX_EXPORT_WORKERS: usize = 5;
pub const DEFAULT_MAX_IMPORT_WORKERS: usize = 5;
pub const DEFAULT_SIGN_IN_ATTEMPTS: u32 = 4;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);

const MAX_WORKERS: usize = 64;
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Identifies one remote DICOM store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreDescriptor {
    pub project_id: String,
    pub location_id: String,
    pub dataset_name: String,
    pub store_name: String,
}

impl StoreDescriptor {
    pub fn new(
        project_id: impl Into<String>,
        location_id: impl Into<String>,
        dataset_name: impl Into<String>,
        store_name: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            location_id: location_id.into(),
            dataset_name: dataset_name.into(),
            store_name: store_name.into(),
        }
    }

    /// `projects/{p}/locations/{l}/datasets/{d}`
    pub fn dataset_path(&self) -> String {
        format!(
            "projects/{}/locations/{}/datasets/{}",
            self.project_id, self.location_id, self.dataset_name
        )
    }

    /// `projects/{p}/locations/{l}/datasets/{d}/dicomStores/{s}`
    pub fn store_path(&self) -> String {
        format!("{}/dicomStores/{}", self.dataset_path(), self.store_name)
    }

    /// Check that every identifier is present and usable as a path segment.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("project_id", &self.project_id),
            ("location_id", &self.location_id),
            ("dataset_name", &self.dataset_name),
            ("store_name", &self.store_name),
        ];

        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{} cannot be empty", name)));
            }
            if value.contains('/') || value.contains('?') || value.contains('#') {
                return Err(Error::Config(format!(
                    "{} must be a single path segment, got '{}'",
                    name, value
                )));
            }
        }

        Ok(())
    }
}

impl fmt::Display for StoreDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.store_path())
    }
}

/// Sign-in settings consumed by the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSettings {
    /// Registered OAuth client; also the audience an access token must carry.
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_url: String,
    pub token_info_url: String,
    /// Total sign-in attempts before giving up.
    pub sign_in_attempts: u32,
    /// Base delay between sign-in attempts; doubles each retry. `None` retries
    /// immediately.
    pub sign_in_backoff: Option<Duration>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            token_url: DEFAULT_TOKEN_URL.to_string(),
            token_info_url: DEFAULT_TOKEN_INFO_URL.to_string(),
            sign_in_attempts: DEFAULT_SIGN_IN_ATTEMPTS,
            sign_in_backoff: None,
        }
    }
}

/// Configuration for the transfer core.
///
/// Use [`TransferConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct TransferConfig {
    /// Remote DICOM store both pipelines talk to
    pub store: StoreDescriptor,

    /// Directory downloads are written to (required to run the importer)
    pub import_directory: Option<PathBuf>,

    /// Delay between import polling cycles
    pub poll_interval: Duration,

    /// Concurrent uploads
    pub max_export_workers: usize,

    /// Concurrent downloads
    pub max_import_workers: usize,

    /// Send the original file name in a Content-Disposition part header
    pub include_content_disposition: bool,

    /// Cloud Healthcare API root, e.g. `https://healthcare.googleapis.com/v1`
    pub healthcare_base_url: String,

    pub auth: AuthSettings,

    pub connect_timeout: Duration,
    pub read_timeout: Duration,

    /// HTTP client used for every network call
    pub http_client: Arc<dyn HttpClient>,

    /// Credential cache
    pub secure_store: Arc<dyn SecureStore>,
}

impl fmt::Debug for TransferConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferConfig")
            .field("store", &self.store)
            .field("import_directory", &self.import_directory)
            .field("poll_interval", &self.poll_interval)
            .field("max_export_workers", &self.max_export_workers)
            .field("max_import_workers", &self.max_import_workers)
            .field(
                "include_content_disposition",
                &self.include_content_disposition,
            )
            .field("healthcare_base_url", &self.healthcare_base_url)
            .field("client_id", &self.auth.client_id)
            .field(
                "client_secret",
                &self.auth.client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("sign_in_attempts", &self.auth.sign_in_attempts)
            .field("sign_in_backoff", &self.auth.sign_in_backoff)
            .field("http_client", &"HttpClient { ... }")
            .field("secure_store", &"SecureStore { ... }")
            .finish()
    }
}

impl TransferConfig {
    /// Creates a new builder for constructing a `TransferConfig`.
    pub fn builder() -> TransferConfigBuilder {
        TransferConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Store identifiers are present single path segments
    /// - Worker counts are within 1..=64
    /// - Poll interval is at least one second
    /// - The API root is an absolute http(s) URL
    /// - At least one sign-in attempt is allowed
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;

        for (name, value) in [
            ("max_export_workers", self.max_export_workers),
            ("max_import_workers", self.max_import_workers),
        ] {
            if value == 0 || value > MAX_WORKERS {
                return Err(Error::Config(format!(
                    "{} must be between 1 and {}, got {}",
                    name, MAX_WORKERS, value
                )));
            }
        }

        if self.poll_interval < MIN_POLL_INTERVAL {
            return Err(Error::Config(format!(
                "Poll interval must be at least {}ms, got {}ms",
                MIN_POLL_INTERVAL.as_millis(),
                self.poll_interval.as_millis()
            )));
        }

        validate_http_url("healthcare_base_url", &self.healthcare_base_url)?;
        validate_http_url("token_url", &self.auth.token_url)?;
        validate_http_url("token_info_url", &self.auth.token_info_url)?;

        if self.auth.sign_in_attempts == 0 {
            return Err(Error::Config(
                "sign_in_attempts must be at least 1".to_string(),
            ));
        }

        if let Some(dir) = &self.import_directory {
            if dir.as_os_str().is_empty() {
                return Err(Error::Config("Import directory cannot be empty".to_string()));
            }
        }

        Ok(())
    }
}

fn validate_http_url(name: &str, value: &str) -> Result<()> {
    let parsed = url::Url::parse(value)
        .map_err(|e| Error::Config(format!("{} is not a valid URL ({}): {}", name, value, e)))?;

    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::Config(format!(
            "{} must use http or https, got '{}'",
            name, other
        ))),
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn http_client_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "HttpClient implementation is required for all transfers. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use the default ReqwestHttpClient. \
                 Embedded hosts: inject an adapter with .http_client()."
            .to_string(),
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn secure_store_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "SecureStore".to_string(),
        message: "SecureStore implementation is required for the credential cache. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use the default DirectorySecureStore. \
                 Embedded hosts: inject an adapter with .secure_store()."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client(
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client = ReqwestHttpClient::with_timeouts(connect_timeout, read_timeout)
        .map_err(|e| Error::Internal(format!("Failed to create default HttpClient: {}", e)))?;
    let client: Arc<dyn HttpClient> = Arc::new(client);
    Ok(client)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client(
    _connect_timeout: Duration,
    _read_timeout: Duration,
) -> Result<Arc<dyn HttpClient>> {
    Err(http_client_missing_error())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_secure_store(credential_dir: Option<PathBuf>) -> Result<Arc<dyn SecureStore>> {
    use bridge_desktop::DirectorySecureStore;

    let store = match credential_dir {
        Some(dir) => DirectorySecureStore::new(dir),
        None => DirectorySecureStore::default_location()
            .map_err(|e| Error::Internal(format!("Failed to locate credential cache: {}", e)))?,
    };
    let store: Arc<dyn SecureStore> = Arc::new(store);
    Ok(store)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_secure_store(_credential_dir: Option<PathBuf>) -> Result<Arc<dyn SecureStore>> {
    Err(secure_store_missing_error())
}

/// Builder for constructing [`TransferConfig`] instances.
///
/// Call [`build()`](TransferConfigBuilder::build) to validate and create the
/// final config.
#[derive(Default)]
pub struct TransferConfigBuilder {
    project_id: Option<String>,
    location_id: Option<String>,
    dataset_name: Option<String>,
    store_name: Option<String>,
    import_directory: Option<PathBuf>,
    poll_interval: Option<Duration>,
    max_export_workers: Option<usize>,
    max_import_workers: Option<usize>,
    include_content_disposition: bool,
    healthcare_base_url: Option<String>,
    auth: AuthSettings,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    credential_dir: Option<PathBuf>,
    http_client: Option<Arc<dyn HttpClient>>,
    secure_store: Option<Arc<dyn SecureStore>>,
}

impl TransferConfigBuilder {
    pub fn project_id(mut self, value: impl Into<String>) -> Self {
        self.project_id = Some(value.into());
        self
    }

    pub fn location_id(mut self, value: impl Into<String>) -> Self {
        self.location_id = Some(value.into());
        self
    }

    pub fn dataset_name(mut self, value: impl Into<String>) -> Self {
        self.dataset_name = Some(value.into());
        self
    }

    pub fn store_name(mut self, value: impl Into<String>) -> Self {
        self.store_name = Some(value.into());
        self
    }

    /// Sets all four store identifiers at once.
    pub fn store(self, store: StoreDescriptor) -> Self {
        self.project_id(store.project_id)
            .location_id(store.location_id)
            .dataset_name(store.dataset_name)
            .store_name(store.store_name)
    }

    /// Directory the importer writes downloaded objects to.
    ///
    /// Its existence is checked when the importer starts.
    pub fn import_directory<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.import_directory = Some(path.into());
        self
    }

    /// Default: 20 000 ms
    pub fn poll_interval_ms(mut self, millis: u64) -> Self {
        self.poll_interval = Some(Duration::from_millis(millis));
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Default: 5
    pub fn max_export_workers(mut self, workers: usize) -> Self {
        self.max_export_workers = Some(workers);
        self
    }

    /// Default: 5
    pub fn max_import_workers(mut self, workers: usize) -> Self {
        self.max_import_workers = Some(workers);
        self
    }

    /// Default: false
    pub fn include_content_disposition(mut self, enabled: bool) -> Self {
        self.include_content_disposition = enabled;
        self
    }

    pub fn healthcare_base_url(mut self, url: impl Into<String>) -> Self {
        self.healthcare_base_url = Some(url.into());
        self
    }

    /// OAuth client id; tokens are checked against it as their audience.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.auth.client_id = Some(client_id.into());
        self
    }

    pub fn client_secret(mut self, secret: impl Into<String>) -> Self {
        self.auth.client_secret = Some(secret.into());
        self
    }

    pub fn token_url(mut self, url: impl Into<String>) -> Self {
        self.auth.token_url = url.into();
        self
    }

    pub fn token_info_url(mut self, url: impl Into<String>) -> Self {
        self.auth.token_info_url = url.into();
        self
    }

    /// Default: 4
    pub fn sign_in_attempts(mut self, attempts: u32) -> Self {
        self.auth.sign_in_attempts = attempts;
        self
    }

    /// Default: none (retry immediately)
    pub fn sign_in_backoff(mut self, base_delay: Duration) -> Self {
        self.auth.sign_in_backoff = Some(base_delay);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Location of the desktop credential cache. Ignored when a secure store
    /// is injected.
    pub fn credential_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.credential_dir = Some(path.into());
        self
    }

    /// Sets the HTTP client implementation.
    ///
    /// If not provided, the desktop default (reqwest-based) is used when the
    /// `desktop-shims` feature is enabled.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the secure store implementation.
    ///
    /// If not provided, the desktop default (directory-based) is used when the
    /// `desktop-shims` feature is enabled.
    pub fn secure_store(mut self, store: Arc<dyn SecureStore>) -> Self {
        self.secure_store = Some(store);
        self
    }

    /// Builds the final `TransferConfig` instance.
    ///
    /// # Errors
    ///
    /// - A store identifier is missing or malformed
    /// - A bridge is missing and no desktop default is available
    /// - A tuning value is out of range
    pub fn build(self) -> Result<TransferConfig> {
        let project_id = self.project_id.ok_or_else(|| {
            Error::Config("Project id is required. Use .project_id() to set it.".to_string())
        })?;

        let location_id = self.location_id.ok_or_else(|| {
            Error::Config("Location id is required. Use .location_id() to set it.".to_string())
        })?;

        let dataset_name = self.dataset_name.ok_or_else(|| {
            Error::Config("Dataset name is required. Use .dataset_name() to set it.".to_string())
        })?;

        let store_name = self.store_name.ok_or_else(|| {
            Error::Config("Store name is required. Use .store_name() to set it.".to_string())
        })?;

        let connect_timeout = self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let read_timeout = self.read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT);

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client(connect_timeout, read_timeout)?,
        };

        let secure_store = match self.secure_store {
            Some(store) => store,
            None => provide_default_secure_store(self.credential_dir)?,
        };

        let config = TransferConfig {
            store: StoreDescriptor::new(project_id, location_id, dataset_name, store_name),
            import_directory: self.import_directory,
            poll_interval: self.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL),
            max_export_workers: self
                .max_export_workers
                .unwrap_or(DEFAULT_MAX_EXPORT_WORKERS),
            max_import_workers: self
                .max_import_workers
                .unwrap_or(DEFAULT_MAX_IMPORT_WORKERS),
            include_content_disposition: self.include_content_disposition,
            healthcare_base_url: self
                .healthcare_base_url
                .unwrap_or_else(|| DEFAULT_HEALTHCARE_BASE_URL.to_string()),
            auth: self.auth,
            connect_timeout,
            read_timeout,
            http_client,
            secure_store,
        };

        config.validate()?;

        Ok(config)
    }
}

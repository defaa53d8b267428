//! Cloud Healthcare DICOMweb client
//!
//! URL layout, relative to the API root:
//!
//! ```text
//! projects/{p}/locations/{l}/datasets/{d}/dicomStores                      list / create
//! projects/{p}/locations/{l}/datasets/{d}/dicomStores/{s}/dicomWeb/studies  QIDO (GET) / STOW (POST)
//! .../dicomWeb/studies/{study_uid}                                          WADO (GET)
//! ```

use bridge_traits::http::{
    BodyStream, HttpClient, HttpMethod, HttpRequest, HttpResponse, StreamingResponse,
};
use core_runtime::config::StoreDescriptor;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::{HealthcareError, Result};
use crate::types::{study_instance_uid, DicomStoreList, RemoteObjectRef};

/// `Accept` header for whole-study retrieval in any transfer syntax.
pub const STUDY_ACCEPT: &str = "multipart/related; type=application/dicom; transfer-syntax=*";

/// `Accept` header for STOW-RS responses.
pub const STOW_ACCEPT: &str = "application/dicom+json";

const QIDO_ACCEPT: &str = "application/dicom+json";

/// Timeout for small JSON calls. Uploads and downloads rely on the client's
/// read timeout instead.
const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_METADATA_ATTEMPTS: u32 = 3;

/// Client for one Cloud Healthcare API root.
///
/// # Example
///
/// ```ignore
/// let client = HealthcareClient::new(http_client, "https://healthcare.googleapis.com/v1");
/// let studies = client.list_study_refs(&token, &store).await?;
/// ```
#[derive(Clone)]
pub struct HealthcareClient {
    http_client: Arc<dyn HttpClient>,
    base_url: String,
}

impl HealthcareClient {
    pub fn new(http_client: Arc<dyn HttpClient>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http_client,
            base_url,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn store_url(&self, store: &StoreDescriptor) -> String {
        format!("{}/{}", self.base_url, store.store_path())
    }

    pub fn studies_url(&self, store: &StoreDescriptor) -> String {
        format!("{}/dicomWeb/studies", self.store_url(store))
    }

    pub fn study_url(&self, store: &StoreDescriptor, study_uid: &str) -> String {
        format!("{}/{}", self.studies_url(store), study_uid)
    }

    fn stores_url(&self, store: &StoreDescriptor) -> String {
        format!("{}/{}/dicomStores", self.base_url, store.dataset_path())
    }

    /// Short ids of every DICOM store in the dataset.
    #[instrument(skip(self, token), fields(dataset = %store.dataset_path()))]
    pub async fn list_dicom_stores(&self, token: &str, store: &StoreDescriptor) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.stores_url(store);
            if let Some(page) = &page_token {
                url.push_str("?pageToken=");
                url.extend(url::form_urlencoded::byte_serialize(page.as_bytes()));
            }

            let response = self.get_json(token, url, "application/json").await?;
            let page: DicomStoreList = response
                .json()
                .map_err(|e| HealthcareError::ParseError(e.to_string()))?;

            names.extend(page.dicom_stores.iter().map(|s| s.short_name().to_string()));

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        debug!(count = names.len(), "Listed DICOM stores");
        Ok(names)
    }

    /// Sent once, whatever the answer.
    #[instrument(skip(self, token), fields(store = %store.store_name))]
    pub async fn create_dicom_store(&self, token: &str, store: &StoreDescriptor) -> Result<()> {
        let store_id: String =
            url::form_urlencoded::byte_serialize(store.store_name.as_bytes()).collect();
        let url = format!("{}?dicomStoreId={}", self.stores_url(store), store_id);

        let request = HttpRequest::new(HttpMethod::Post, url)
            .bearer_token(token)
            .header("Content-Type", "application/json")
            .body(bytes::Bytes::from_static(b"{}"))
            .timeout(METADATA_TIMEOUT);

        let response = self.http_client.execute(request).await?;
        if !response.is_success() {
            warn!(status = response.status, "Store creation rejected");
            return Err(HealthcareError::from_status(response.status, &response.body));
        }

        if !response.body.is_empty() {
            let body: Value = response
                .json()
                .map_err(|e| HealthcareError::ParseError(e.to_string()))?;
            if let Some(error) = body.get("error") {
                return Err(HealthcareError::ApiError {
                    status_code: response.status,
                    message: error.to_string(),
                });
            }
        }

        info!("Created DICOM store");
        Ok(())
    }

    /// Create the store if it does not exist. Returns `true` if it was created.
    pub async fn ensure_dicom_store(&self, token: &str, store: &StoreDescriptor) -> Result<bool> {
        let existing = self.list_dicom_stores(token, store).await?;
        if existing.iter().any(|name| *name == store.store_name) {
            debug!(store = %store.store_name, "DICOM store exists");
            return Ok(false);
        }

        info!(store = %store.store_name, "DICOM store missing, creating it");
        self.create_dicom_store(token, store).await?;
        Ok(true)
    }

    /// Every study in the store, in listing order.
    ///
    /// One unpaginated QIDO-RS request. Results without a Study Instance UID
    /// are skipped.
    #[instrument(skip(self, token), fields(store = %store.store_name))]
    pub async fn list_study_refs(
        &self,
        token: &str,
        store: &StoreDescriptor,
    ) -> Result<Vec<RemoteObjectRef>> {
        let response = self
            .get_json(token, self.studies_url(store), QIDO_ACCEPT)
            .await?;

        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        let results: Vec<Value> = response
            .json()
            .map_err(|e| HealthcareError::ParseError(e.to_string()))?;

        let mut refs = Vec::with_capacity(results.len());
        for result in &results {
            match study_instance_uid(result) {
                Some(uid) => refs.push(RemoteObjectRef {
                    remote_id: uid.to_string(),
                    url: self.study_url(store, uid),
                }),
                None => warn!("Study result without a Study Instance UID"),
            }
        }

        debug!(count = refs.len(), "Listed studies");
        Ok(refs)
    }

    /// POST a multipart body to the store.
    ///
    /// The response is returned whatever its status; only transport failures
    /// are errors. Never retried because the body is consumed.
    #[instrument(skip(self, token, content_type, body), fields(store = %store.store_name))]
    pub async fn store_instances(
        &self,
        token: &str,
        store: &StoreDescriptor,
        content_type: &str,
        body: BodyStream,
    ) -> Result<HttpResponse> {
        let request = HttpRequest::new(HttpMethod::Post, self.studies_url(store))
            .bearer_token(token)
            .header("Content-Type", content_type)
            .header("Accept", STOW_ACCEPT)
            .stream_body(body);

        let response = self.http_client.execute(request).await?;
        debug!(status = response.status, "STOW response");
        Ok(response)
    }

    /// GET a study as a multipart stream.
    ///
    /// The response is returned whatever its status; only transport failures
    /// are errors.
    #[instrument(skip(self, token))]
    pub async fn retrieve_study(&self, token: &str, url: &str) -> Result<StreamingResponse> {
        let request = HttpRequest::new(HttpMethod::Get, url)
            .bearer_token(token)
            .header("Accept", STUDY_ACCEPT);

        let response = self.http_client.execute_streaming(request).await?;
        debug!(status = response.status, "WADO response");
        Ok(response)
    }

    /// GET with retries on 429, 5xx and transport errors. The only retry
    /// layer for metadata calls; `execute` itself sends once.
    async fn get_json(&self, token: &str, url: String, accept: &str) -> Result<HttpResponse> {
        let mut attempt = 0;

        loop {
            let request = HttpRequest::new(HttpMethod::Get, url.clone())
                .bearer_token(token)
                .header("Accept", accept)
                .timeout(METADATA_TIMEOUT);

            match self.http_client.execute(request).await {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status;
                    let retryable = status == 429 || response.is_server_error();
                    attempt += 1;

                    if !retryable || attempt >= MAX_METADATA_ATTEMPTS {
                        warn!(status, attempt, "API request failed");
                        return Err(HealthcareError::from_status(status, &response.body));
                    }

                    let backoff = Duration::from_millis(100 * 2u64.pow(attempt));
                    warn!(
                        status,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "API request failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_METADATA_ATTEMPTS {
                        warn!(attempt, error = %e, "API request failed");
                        return Err(e.into());
                    }

                    let backoff = Duration::from_millis(100 * 2u64.pow(attempt));
                    warn!(attempt, error = %e, "API request failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

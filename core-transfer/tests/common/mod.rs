//! Fakes shared by the pipeline integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::{
    error::Result as BridgeResult, BridgeError, HttpClient, HttpMethod, HttpRequest,
    HttpResponse, RequestBody, StreamingResponse,
};
use bytes::Bytes;
use core_auth::{AccessTokenProvider, AuthError};
use core_runtime::StoreDescriptor;
use core_transfer::multipart::MultipartEncoder;
use futures::StreamExt;
use parking_lot::Mutex;
use provider_google_healthcare::HealthcareClient;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const BASE_URL: &str = "https://healthcare.test/v1";
pub const WADO_BOUNDARY: &str = "wado-boundary";

pub fn store() -> StoreDescriptor {
    StoreDescriptor::new("proj", "us-central1", "dataset", "store")
}

pub fn client(fake: &Arc<FakeDicomStore>) -> HealthcareClient {
    HealthcareClient::new(Arc::clone(fake) as Arc<dyn HttpClient>, BASE_URL)
}

pub fn study_url(uid: &str) -> String {
    format!("{}/{}/dicomWeb/studies/{}", BASE_URL, store().store_path(), uid)
}

// ============================================================================
// Token provider
// ============================================================================

#[derive(Default)]
pub struct FakeTokenProvider {
    pub calls: AtomicUsize,
    pub fail: bool,
}

impl FakeTokenProvider {
    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }
}

#[async_trait]
impl AccessTokenProvider for FakeTokenProvider {
    async fn access_token(&self) -> core_auth::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AuthError::SignInExhausted {
                attempts: 4,
                last: Box::new(AuthError::ExchangeFailed("offline".to_string())),
            });
        }
        Ok("test-token".to_string())
    }
}

// ============================================================================
// DICOM store
// ============================================================================

/// One STOW-RS request as the store saw it.
#[derive(Debug, Clone)]
pub struct RecordedUpload {
    pub content_type: String,
    pub authorization: Option<String>,
    pub body: Vec<u8>,
}

/// In-memory DICOMweb endpoint that counts what it is asked to do.
pub struct FakeDicomStore {
    pub upload_delay: Duration,
    upload_statuses: Mutex<VecDeque<u16>>,
    default_upload_status: Mutex<u16>,
    pub uploads: Mutex<Vec<RecordedUpload>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub requests: AtomicUsize,

    studies: Mutex<Vec<String>>,
    study_status: Mutex<HashMap<String, u16>>,
    study_parts: Mutex<HashMap<String, usize>>,
    part_filenames: Mutex<HashMap<String, String>>,
    download_delay: Mutex<Duration>,
    pub listings: AtomicUsize,
    pub downloads: AtomicUsize,
    listing_fails: Mutex<bool>,
}

impl FakeDicomStore {
    pub fn new() -> Self {
        Self::with_upload_delay(Duration::ZERO)
    }

    pub fn with_upload_delay(upload_delay: Duration) -> Self {
        Self {
            upload_delay,
            upload_statuses: Mutex::new(VecDeque::new()),
            default_upload_status: Mutex::new(200),
            uploads: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            studies: Mutex::new(Vec::new()),
            study_status: Mutex::new(HashMap::new()),
            study_parts: Mutex::new(HashMap::new()),
            part_filenames: Mutex::new(HashMap::new()),
            download_delay: Mutex::new(Duration::ZERO),
            listings: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            listing_fails: Mutex::new(false),
        }
    }

    /// Statuses for the next uploads, in order; later uploads get the default.
    pub fn queue_upload_statuses(&self, statuses: &[u16]) {
        self.upload_statuses.lock().extend(statuses.iter().copied());
    }

    pub fn set_default_upload_status(&self, status: u16) {
        *self.default_upload_status.lock() = status;
    }

    pub fn set_studies(&self, uids: &[&str]) {
        *self.studies.lock() = uids.iter().map(|uid| uid.to_string()).collect();
    }

    pub fn set_study_status(&self, uid: &str, status: u16) {
        self.study_status.lock().insert(uid.to_string(), status);
    }

    /// Serve `uid` as a multipart body with `parts` instances.
    pub fn set_study_parts(&self, uid: &str, parts: usize) {
        self.study_parts.lock().insert(uid.to_string(), parts);
    }

    /// Give every part of `uid` a Content-Disposition carrying `filename`.
    pub fn set_part_filename(&self, uid: &str, filename: &str) {
        self.part_filenames
            .lock()
            .insert(uid.to_string(), filename.to_string());
    }

    /// Hold each study download this long before answering.
    pub fn set_download_delay(&self, delay: Duration) {
        *self.download_delay.lock() = delay;
    }

    pub fn fail_listing(&self, fail: bool) {
        *self.listing_fails.lock() = fail;
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().len()
    }

    pub fn study_payload(uid: &str) -> Vec<u8> {
        format!("DICM-{}", uid).into_bytes()
    }

    pub fn instance_payload(uid: &str, index: usize) -> Vec<u8> {
        format!("DICM-{}-{}", uid, index).into_bytes()
    }

    fn study_body(&self, uid: &str) -> Vec<u8> {
        let parts = self.study_parts.lock().get(uid).copied().unwrap_or(1);
        let filename = self.part_filenames.lock().get(uid).cloned();
        if parts == 1 {
            let encoder = MultipartEncoder::with_boundary(WADO_BOUNDARY);
            return encoder
                .encode_bytes(&Self::study_payload(uid), filename.as_deref())
                .to_vec();
        }

        let disposition = filename
            .map(|name| format!("Content-Disposition: attachment; filename=\"{}\"\r\n", name))
            .unwrap_or_default();
        let mut body = Vec::new();
        for index in 0..parts {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Type: application/dicom\r\n{}\r\n",
                    WADO_BOUNDARY, disposition
                )
                .as_bytes(),
            );
            body.extend_from_slice(&Self::instance_payload(uid, index));
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", WADO_BOUNDARY).as_bytes());
        body
    }

    fn json(status: u16, body: serde_json::Value) -> HttpResponse {
        HttpResponse {
            status,
            headers: HashMap::from([(
                "Content-Type".to_string(),
                "application/json".to_string(),
            )]),
            body: Bytes::from(body.to_string()),
        }
    }

    async fn store_instances(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let content_type = request
            .header_value("Content-Type")
            .unwrap_or_default()
            .to_string();
        let authorization = request.header_value("Authorization").map(str::to_string);

        let mut body = Vec::new();
        match request.body {
            Some(RequestBody::Stream(mut stream)) => {
                while let Some(chunk) = stream.next().await {
                    body.extend_from_slice(&chunk?);
                }
            }
            Some(RequestBody::Bytes(bytes)) => body.extend_from_slice(&bytes),
            None => {}
        }

        self.uploads.lock().push(RecordedUpload {
            content_type,
            authorization,
            body,
        });

        if !self.upload_delay.is_zero() {
            tokio::time::sleep(self.upload_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let status = self
            .upload_statuses
            .lock()
            .pop_front()
            .unwrap_or(*self.default_upload_status.lock());
        Ok(Self::json(status, serde_json::json!({})))
    }

    fn list_studies(&self) -> HttpResponse {
        self.listings.fetch_add(1, Ordering::SeqCst);
        if *self.listing_fails.lock() {
            return Self::json(400, serde_json::json!({"error": "bad request"}));
        }

        let results: Vec<serde_json::Value> = self
            .studies
            .lock()
            .iter()
            .map(|uid| serde_json::json!({"0020000D": {"vr": "UI", "Value": [uid]}}))
            .collect();
        Self::json(200, serde_json::Value::Array(results))
    }
}

#[async_trait]
impl HttpClient for FakeDicomStore {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let studies_url = format!("{}/{}/dicomWeb/studies", BASE_URL, store().store_path());
        let stores_url = format!("{}/{}/dicomStores", BASE_URL, store().dataset_path());

        let method = request.method;
        match method {
            HttpMethod::Post if request.url == studies_url => self.store_instances(request).await,
            HttpMethod::Get if request.url == studies_url => Ok(self.list_studies()),
            HttpMethod::Get if request.url.starts_with(&stores_url) => Ok(Self::json(
                200,
                serde_json::json!({
                    "dicomStores": [{"name": format!("{}/dicomStores/store", store().dataset_path())}]
                }),
            )),
            _ => Ok(Self::json(404, serde_json::json!({"error": "not found"}))),
        }
    }

    async fn execute_streaming(&self, request: HttpRequest) -> BridgeResult<StreamingResponse> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.downloads.fetch_add(1, Ordering::SeqCst);

        let uid = request
            .url
            .rsplit('/')
            .next()
            .ok_or_else(|| BridgeError::OperationFailed("bad url".to_string()))?
            .to_string();
        let status = self.study_status.lock().get(&uid).copied().unwrap_or(200);

        let delay = *self.download_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let (headers, body) = if status == 200 {
            (
                HashMap::from([(
                    "Content-Type".to_string(),
                    format!(
                        "multipart/related; type=\"application/dicom\"; boundary={}",
                        WADO_BOUNDARY
                    ),
                )]),
                self.study_body(&uid),
            )
        } else {
            (HashMap::new(), b"not found".to_vec())
        };

        Ok(StreamingResponse {
            status,
            headers,
            body: Box::new(std::io::Cursor::new(body)),
        })
    }
}

// ============================================================================
// Downstream consumer
// ============================================================================

#[derive(Default)]
pub struct RecordingReceiver {
    pub received: Mutex<Vec<PathBuf>>,
}

impl RecordingReceiver {
    pub fn count(&self) -> usize {
        self.received.lock().len()
    }
}

#[async_trait]
impl core_transfer::FileReceiver for RecordingReceiver {
    async fn file_received(&self, path: &Path) {
        self.received.lock().push(path.to_path_buf());
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

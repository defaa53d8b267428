//! # Import Pipeline
//!
//! Polls the DICOM store for studies and downloads each one into a local
//! directory, then hands the files to a [`FileReceiver`].
//!
//! ## Cycle
//!
//! ```text
//! Idle ──(interval)──► Listing ──► Dispatching ──► Idle
//!   └──(shutdown)──► Stopped
//! ```
//!
//! Each cycle lists the store once (unpaginated) and queues one download per
//! listed study, skipping studies whose previous download is still in flight.
//! Downloads run on a fixed-size pool and write every multipart part to
//! `<name>.part` before renaming it, so the receiver never sees a partial file.
//! Names taken from a Content-Disposition header are prefixed with the study
//! id so concurrent studies never share a path.
//!
//! Only HTTP 200 downloads are recorded in the status sink. Any other status
//! and any failed download are logged and retried on a later cycle.

use crate::error::{Result, TransferError};
use crate::multipart::{
    boundary_from_content_type, filename_from_content_disposition, filename_from_url,
    sanitize_filename, MultipartReader,
};
use crate::status::{Direction, OutcomeStatus, TransferStatusSink};
use async_trait::async_trait;
use core_auth::AccessTokenProvider;
use core_runtime::config::{StoreDescriptor, TransferConfig, DEFAULT_MAX_IMPORT_WORKERS, DEFAULT_POLL_INTERVAL};
use core_runtime::events::{CoreEvent, EventBus, TransferEvent};
use parking_lot::Mutex;
use provider_google_healthcare::{HealthcareClient, RemoteObjectRef};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const PART_SUFFIX: &str = "part";

/// Downstream consumer of downloaded files.
#[async_trait]
pub trait FileReceiver: Send + Sync {
    /// Called once per persisted file, after it has its final name.
    async fn file_received(&self, path: &Path);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Listing,
    Dispatching,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSettings {
    pub directory: PathBuf,
    pub poll_interval: Duration,
    pub max_workers: usize,
}

impl ImportSettings {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_workers: DEFAULT_MAX_IMPORT_WORKERS,
        }
    }

    pub fn from_config(config: &TransferConfig) -> Result<Self> {
        let directory = config.import_directory.clone().ok_or_else(|| {
            TransferError::Configuration("import directory is not configured".to_string())
        })?;

        Ok(Self {
            directory,
            poll_interval: config.poll_interval,
            max_workers: config.max_import_workers,
        })
    }
}

/// Files written for one study.
#[derive(Debug, Default)]
struct Download {
    files: Vec<PathBuf>,
}

struct ImportContext {
    tokens: Arc<dyn AccessTokenProvider>,
    client: HealthcareClient,
    store: StoreDescriptor,
    sink: Arc<TransferStatusSink>,
    receiver: Arc<dyn FileReceiver>,
    directory: PathBuf,
    permits: Arc<Semaphore>,
    /// Studies queued or downloading.
    in_flight: Mutex<HashSet<String>>,
    state: Mutex<PollerState>,
    event_bus: Option<EventBus>,
}

impl ImportContext {
    fn set_state(&self, state: PollerState) {
        *self.state.lock() = state;
    }

    async fn list(&self) -> Result<Vec<RemoteObjectRef>> {
        self.set_state(PollerState::Listing);
        let token = self.tokens.access_token().await?;
        Ok(self.client.list_study_refs(&token, &self.store).await?)
    }

    /// Queue a download for every listed study not already in flight.
    fn dispatch(self: &Arc<Self>, refs: Vec<RemoteObjectRef>, workers: &mut JoinSet<()>) {
        self.set_state(PollerState::Dispatching);

        let listed = refs.len();
        let mut queued = 0;
        for remote in refs {
            if !self.in_flight.lock().insert(remote.remote_id.clone()) {
                debug!(study = %remote.remote_id, "Download still in flight, skipping");
                continue;
            }
            queued += 1;

            let context = Arc::clone(self);
            workers.spawn(async move {
                let Ok(_permit) = Arc::clone(&context.permits).acquire_owned().await else {
                    return;
                };
                context.run_download(remote).await;
            });
        }

        debug!(listed, queued, "Dispatched downloads");
        self.set_state(PollerState::Idle);
    }

    #[instrument(skip(self, remote), fields(study = %remote.remote_id))]
    async fn run_download(&self, remote: RemoteObjectRef) {
        match self.download(&remote).await {
            Ok(Some(download)) => {
                for path in &download.files {
                    self.receiver.file_received(path).await;
                }
                info!(files = download.files.len(), "Downloaded study");
                self.sink.record_outcome(
                    Direction::Download,
                    remote.url.clone(),
                    OutcomeStatus::Ok,
                    Some(format!("{} file(s)", download.files.len())),
                );
            }
            Ok(None) => {}
            Err(e) => warn!(url = %remote.url, error = %e, "Download failed"),
        }
        self.in_flight.lock().remove(&remote.remote_id);
    }

    /// `Ok(None)` when the store answered with anything but 200.
    async fn download(&self, remote: &RemoteObjectRef) -> Result<Option<Download>> {
        let token = self.tokens.access_token().await?;
        let response = self.client.retrieve_study(&token, &remote.url).await?;

        if response.status != 200 {
            warn!(status = response.status, url = %remote.url, "Study not downloaded");
            return Ok(None);
        }

        let boundary = response
            .header("Content-Type")
            .and_then(boundary_from_content_type);
        let fallback = match response
            .header("Content-Disposition")
            .and_then(filename_from_content_disposition)
        {
            Some(name) => scoped_name(&remote.remote_id, &name),
            None => filename_from_url(&remote.url)
                .map(|name| sanitize_filename(&name))
                .unwrap_or_else(|| sanitize_filename(&remote.remote_id)),
        };

        let mut parts = MultipartReader::new(response.body, boundary);
        let mut download = Download::default();

        let result = self
            .save_parts(&mut parts, &remote.remote_id, &fallback, &mut download)
            .await;
        if let Err(e) = result {
            for path in &download.files {
                let _ = tokio::fs::remove_file(path).await;
            }
            return Err(e);
        }

        if download.files.is_empty() {
            return Err(TransferError::Protocol(
                "multipart response contained no parts".to_string(),
            ));
        }
        Ok(Some(download))
    }

    async fn save_parts<R>(
        &self,
        parts: &mut MultipartReader<R>,
        study: &str,
        fallback: &str,
        download: &mut Download,
    ) -> Result<()>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut index = 0;
        while let Some(headers) = parts.next_part().await? {
            let name = match headers.filename() {
                Some(name) => scoped_name(study, &name),
                None => fallback.to_string(),
            };
            let name = numbered_name(&name, index);

            let final_path = self.directory.join(&name);
            let part_path = self.directory.join(format!("{}.{}", name, PART_SUFFIX));

            let mut file = tokio::fs::File::create(&part_path).await?;
            let written = match parts.copy_body(&mut file).await {
                Ok(written) => written,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&part_path).await;
                    return Err(e);
                }
            };
            file.flush().await?;
            drop(file);

            tokio::fs::rename(&part_path, &final_path).await?;
            debug!(file = %name, bytes = written, "Saved part");

            download.files.push(final_path);
            index += 1;
        }
        Ok(())
    }
}

/// `<study>_<name>`, sanitized. A name that already is the study id is kept.
fn scoped_name(study: &str, name: &str) -> String {
    let study = sanitize_filename(study);
    let name = sanitize_filename(name);
    if name == study {
        name
    } else {
        format!("{}_{}", study, name)
    }
}

/// `name` for the first part, `name_<index>` (before a `.dcm` extension) after.
fn numbered_name(name: &str, index: usize) -> String {
    if index == 0 {
        return name.to_string();
    }

    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".dcm") && name.len() > 4 {
        let (stem, ext) = name.split_at(name.len() - 4);
        format!("{}_{}{}", stem, index, ext)
    } else {
        format!("{}_{}", name, index)
    }
}

/// Poller and download pool for one DICOM store.
pub struct ImportService {
    context: Arc<ImportContext>,
    settings: ImportSettings,
    cancel: CancellationToken,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl ImportService {
    pub fn new(
        tokens: Arc<dyn AccessTokenProvider>,
        client: HealthcareClient,
        store: StoreDescriptor,
        sink: Arc<TransferStatusSink>,
        receiver: Arc<dyn FileReceiver>,
        settings: ImportSettings,
    ) -> Self {
        Self {
            context: Arc::new(ImportContext {
                tokens,
                client,
                store,
                sink,
                receiver,
                directory: settings.directory.clone(),
                permits: Arc::new(Semaphore::new(settings.max_workers)),
                in_flight: Mutex::new(HashSet::new()),
                state: Mutex::new(PollerState::Idle),
                event_bus: None,
            }),
            settings,
            cancel: CancellationToken::new(),
            poller: Mutex::new(None),
        }
    }

    /// Must be called before [`start`](Self::start).
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        if let Some(context) = Arc::get_mut(&mut self.context) {
            context.event_bus = Some(event_bus);
        }
        self
    }

    pub fn settings(&self) -> &ImportSettings {
        &self.settings
    }

    pub fn state(&self) -> PollerState {
        *self.context.state.lock()
    }

    /// Run the first listing and start polling.
    ///
    /// Fails if the import directory is missing, if sign-in fails, or if the
    /// first listing fails or is interrupted.
    #[instrument(skip(self), fields(store = %self.context.store))]
    pub async fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::ShutDown);
        }
        if self.poller.lock().is_some() {
            return Err(TransferError::AlreadyStarted);
        }

        let directory = &self.settings.directory;
        match tokio::fs::metadata(directory).await {
            Ok(metadata) if metadata.is_dir() => {}
            _ => {
                return Err(TransferError::Configuration(format!(
                    "import directory {} does not exist",
                    directory.display()
                )))
            }
        }

        let first = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(TransferError::StartupFailed(
                    "interrupted during initial listing".to_string(),
                ));
            }
            listed = self.context.list() => listed,
        };
        let first = first.map_err(|e| match e {
            TransferError::Auth(e) => TransferError::Auth(e),
            other => TransferError::StartupFailed(format!("initial listing failed: {}", other)),
        })?;

        let mut poller = self.poller.lock();
        if poller.is_some() {
            return Err(TransferError::AlreadyStarted);
        }
        *poller = Some(tokio::spawn(poll(
            Arc::clone(&self.context),
            first,
            self.settings.poll_interval,
            self.cancel.clone(),
        )));
        drop(poller);

        if let Some(bus) = &self.context.event_bus {
            let _ = bus.emit(CoreEvent::Transfer(TransferEvent::ServiceStarted {
                pipeline: "import".to_string(),
            }));
        }
        info!(
            workers = self.settings.max_workers,
            interval_ms = self.settings.poll_interval.as_millis() as u64,
            "Import service started"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
            && self
                .poller
                .lock()
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop polling and abort downloads in flight.
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();

        let handle = self.poller.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!("Import poller did not stop in time, aborting it");
                handle.abort();
            }
        }
        self.context.set_state(PollerState::Stopped);

        if let Some(bus) = &self.context.event_bus {
            let _ = bus.emit(CoreEvent::Transfer(TransferEvent::ServiceStopped {
                pipeline: "import".to_string(),
            }));
        }
        info!("Import service stopped");
    }
}

impl Drop for ImportService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll(
    context: Arc<ImportContext>,
    first: Vec<RemoteObjectRef>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut workers = JoinSet::new();
    context.dispatch(first, &mut workers);

    loop {
        while let Some(result) = workers.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("Download worker panicked");
                }
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let listed = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            listed = context.list() => listed,
        };

        match listed {
            Ok(refs) => context.dispatch(refs, &mut workers),
            Err(e) => {
                warn!(error = %e, "Listing failed, retrying next cycle");
                context.set_state(PollerState::Idle);
            }
        }
    }

    context.set_state(PollerState::Stopped);
    workers.shutdown().await;
    debug!("Import poller exited");
}

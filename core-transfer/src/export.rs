//! # Export Pipeline
//!
//! Local files go in through [`ExportService::submit`] and are uploaded to the
//! DICOM store by a fixed number of concurrent workers.
//!
//! ## Flow
//!
//! ```text
//! submit(path) ──► unbounded queue ──► dispatcher ──► worker (≤ max_workers)
//!                                                       │
//!                                   size check ─► token ─► STOW-RS POST
//!                                                       │
//!                                     200: delete file, record OK
//!                                   else: keep file, record FAIL
//! ```
//!
//! The dispatcher takes a worker permit before it takes a task, so tasks
//! start in submission order. Shutdown cancels the dispatcher and aborts
//! uploads still in flight; an aborted file stays on disk.

use crate::error::{Result, TransferError};
use crate::multipart::MultipartEncoder;
use crate::status::{Direction, OutcomeStatus, TransferStatusSink};
use chrono::{DateTime, Utc};
use core_auth::AccessTokenProvider;
use core_runtime::config::{StoreDescriptor, TransferConfig, DEFAULT_MAX_EXPORT_WORKERS};
use core_runtime::events::{CoreEvent, EventBus, TransferEvent};
use provider_google_healthcare::HealthcareClient;
use core_runtime::logging::strip_path;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// How long [`ExportService::shutdown`] waits for the dispatcher to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Longest response excerpt kept in a failure detail.
const DETAIL_LIMIT: usize = 256;

/// Lifecycle of one export task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    InFlight,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::InFlight => "in_flight",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    fn can_transition_to(&self, to: TaskState) -> bool {
        matches!(
            (self, to),
            (TaskState::Queued, TaskState::InFlight)
                | (TaskState::InFlight, TaskState::Succeeded)
                | (TaskState::InFlight, TaskState::Failed)
        )
    }
}

/// A file waiting for, or going through, upload.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub id: Uuid,
    pub local_path: PathBuf,
    /// Set by the worker from the file's metadata before upload.
    pub size_bytes: Option<u64>,
    pub submitted_at: DateTime<Utc>,
    state: TaskState,
}

impl TransferTask {
    pub fn new(local_path: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_path: local_path.into(),
            size_bytes: None,
            submitted_at: Utc::now(),
            state: TaskState::Queued,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn start(self) -> Result<Self> {
        self.transition(TaskState::InFlight)
    }

    pub fn succeed(self) -> Result<Self> {
        self.transition(TaskState::Succeeded)
    }

    pub fn fail(self) -> Result<Self> {
        self.transition(TaskState::Failed)
    }

    fn transition(mut self, to: TaskState) -> Result<Self> {
        if !self.state.can_transition_to(to) {
            return Err(TransferError::InvalidStateTransition {
                from: self.state.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        self.state = to;
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSettings {
    pub max_workers: usize,
    /// Send each file's name in a Content-Disposition part header.
    pub include_content_disposition: bool,
    /// Check (and create) the DICOM store before accepting work.
    pub ensure_store: bool,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_EXPORT_WORKERS,
            include_content_disposition: false,
            ensure_store: true,
        }
    }
}

impl ExportSettings {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            max_workers: config.max_export_workers,
            include_content_disposition: config.include_content_disposition,
            ensure_store: true,
        }
    }
}

/// Tracks whether the store is currently refusing our credentials.
///
/// Only the change into the denied state is reported at warn level; repeats
/// are logged at debug until the store answers with any other status.
#[derive(Debug, Default)]
pub(crate) struct DenialTracker {
    denied: AtomicBool,
}

impl DenialTracker {
    /// Returns `true` when this denial is a state change.
    pub(crate) fn record_denial(&self) -> bool {
        !self.denied.swap(true, Ordering::AcqRel)
    }

    /// Any answer other than 401/403. Returns `true` when access was
    /// previously denied.
    pub(crate) fn record_accepted(&self) -> bool {
        self.denied.swap(false, Ordering::AcqRel)
    }
}

struct ExportContext {
    tokens: Arc<dyn AccessTokenProvider>,
    client: HealthcareClient,
    store: StoreDescriptor,
    sink: Arc<TransferStatusSink>,
    include_content_disposition: bool,
    denials: DenialTracker,
    event_bus: Option<EventBus>,
}

impl ExportContext {
    #[instrument(skip(self, task), fields(task_id = %task.id, file = %strip_path(&task.local_path.to_string_lossy())))]
    async fn run_task(&self, task: TransferTask) {
        let mut task = match task.start() {
            Ok(task) => task,
            Err(e) => {
                error!(error = %e, "Task dispatched in wrong state");
                return;
            }
        };
        let path = task.local_path.clone();

        let (task, status, detail) = match self.upload(&mut task).await {
            Ok(size) => {
                info!(bytes = size, "Uploaded");
                let detail = match tokio::fs::remove_file(&path).await {
                    Ok(()) => format!("{} bytes", size),
                    Err(e) => {
                        warn!(error = %e, "Uploaded file could not be removed");
                        format!("{} bytes uploaded, but not removed: {}", size, e)
                    }
                };
                (task.succeed(), OutcomeStatus::Ok, Some(detail))
            }
            Err(e) => {
                match &e {
                    TransferError::AuthorizationDenied { .. } => {}
                    TransferError::EmptyFile(_) => warn!("Skipping empty file"),
                    _ => warn!(error = %e, "Upload failed"),
                }
                (task.fail(), OutcomeStatus::Fail, Some(e.to_string()))
            }
        };

        if let Err(e) = task {
            error!(error = %e, "Task state out of sync");
        }

        self.sink
            .record_outcome(Direction::Upload, path.display().to_string(), status, detail);
    }

    /// Upload one file. Returns its size.
    async fn upload(&self, task: &mut TransferTask) -> Result<u64> {
        let size = tokio::fs::metadata(&task.local_path).await?.len();
        task.size_bytes = Some(size);
        let path = task.local_path.as_path();
        if size == 0 {
            return Err(TransferError::EmptyFile(path.to_path_buf()));
        }

        let token = self.tokens.access_token().await?;
        let file = tokio::fs::File::open(path).await?;

        let filename = if self.include_content_disposition {
            path.file_name().map(|name| name.to_string_lossy().into_owned())
        } else {
            None
        };

        let encoder = MultipartEncoder::new();
        let body = encoder.encode_reader(file, filename.as_deref());
        let response = self
            .client
            .store_instances(&token, &self.store, &encoder.content_type(), body)
            .await?;

        if !matches!(response.status, 401 | 403) && self.denials.record_accepted() {
            info!(status = response.status, "Store is accepting credentials again");
        }

        match response.status {
            200 => Ok(size),
            status @ (401 | 403) => {
                if self.denials.record_denial() {
                    warn!(status, "Store denied upload; further denials logged at debug");
                    if let Some(bus) = &self.event_bus {
                        let _ = bus.emit(CoreEvent::Transfer(TransferEvent::AuthorizationDenied {
                            status,
                        }));
                    }
                } else {
                    debug!(status, "Store denied upload");
                }
                Err(TransferError::AuthorizationDenied { status })
            }
            status => {
                let mut message = String::from_utf8_lossy(&response.body).into_owned();
                if message.len() > DETAIL_LIMIT {
                    let mut end = DETAIL_LIMIT;
                    while !message.is_char_boundary(end) {
                        end -= 1;
                    }
                    message.truncate(end);
                }
                Err(TransferError::UnexpectedStatus { status, message })
            }
        }
    }
}

/// Upload queue and worker pool for one DICOM store.
pub struct ExportService {
    context: Arc<ExportContext>,
    settings: ExportSettings,
    sender: mpsc::UnboundedSender<TransferTask>,
    receiver: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<TransferTask>>>,
    queued: Arc<AtomicUsize>,
    cancel: CancellationToken,
    dispatcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ExportService {
    pub fn new(
        tokens: Arc<dyn AccessTokenProvider>,
        client: HealthcareClient,
        store: StoreDescriptor,
        sink: Arc<TransferStatusSink>,
        settings: ExportSettings,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            context: Arc::new(ExportContext {
                tokens,
                client,
                store,
                sink,
                include_content_disposition: settings.include_content_disposition,
                denials: DenialTracker::default(),
                event_bus: None,
            }),
            settings,
            sender,
            receiver: parking_lot::Mutex::new(Some(receiver)),
            queued: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
            dispatcher: parking_lot::Mutex::new(None),
        }
    }

    /// Must be called before [`start`](Self::start).
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        if let Some(context) = Arc::get_mut(&mut self.context) {
            context.event_bus = Some(event_bus);
        }
        self
    }

    pub fn settings(&self) -> &ExportSettings {
        &self.settings
    }

    /// Verify the store and start the dispatcher.
    ///
    /// Tasks submitted earlier are dispatched as soon as this returns.
    #[instrument(skip(self), fields(store = %self.context.store))]
    pub async fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::ShutDown);
        }
        if self.receiver.lock().is_none() {
            return Err(TransferError::AlreadyStarted);
        }

        if self.settings.ensure_store {
            let token = self.context.tokens.access_token().await?;
            let created = self
                .context
                .client
                .ensure_dicom_store(&token, &self.context.store)
                .await
                .map_err(|e| {
                    TransferError::StartupFailed(format!(
                        "could not verify DICOM store {}: {}",
                        self.context.store, e
                    ))
                })?;
            if created {
                info!("Created missing DICOM store");
            }
        }

        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or(TransferError::AlreadyStarted)?;

        let handle = tokio::spawn(dispatch(
            Arc::clone(&self.context),
            receiver,
            Arc::new(Semaphore::new(self.settings.max_workers)),
            Arc::clone(&self.queued),
            self.cancel.clone(),
        ));
        *self.dispatcher.lock() = Some(handle);

        if let Some(bus) = &self.context.event_bus {
            let _ = bus.emit(CoreEvent::Transfer(TransferEvent::ServiceStarted {
                pipeline: "export".to_string(),
            }));
        }
        info!(workers = self.settings.max_workers, "Export service started");
        Ok(())
    }

    /// Queue a file for upload. Never blocks.
    pub fn submit(&self, local_path: impl Into<PathBuf>) -> Result<Uuid> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::ShutDown);
        }

        let task = TransferTask::new(local_path);
        let id = task.id;
        debug!(task_id = %id, path = %task.local_path.display(), "Queued for export");

        self.queued.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(task).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(TransferError::ShutDown);
        }
        Ok(id)
    }

    /// Tasks accepted but not yet handed to a worker.
    pub fn queue_size(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
            && self
                .dispatcher
                .lock()
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop dispatching and abort in-flight uploads.
    ///
    /// Returns within a bounded time. Queued tasks are dropped.
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.receiver.lock().take();

        let handle = self.dispatcher.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!("Export dispatcher did not stop in time, aborting it");
                handle.abort();
            }
        }
        self.queued.store(0, Ordering::Release);

        if let Some(bus) = &self.context.event_bus {
            let _ = bus.emit(CoreEvent::Transfer(TransferEvent::ServiceStopped {
                pipeline: "export".to_string(),
            }));
        }
        info!("Export service stopped");
    }
}

impl Drop for ExportService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Hand queued tasks to workers, one permit per task.
async fn dispatch(
    context: Arc<ExportContext>,
    mut receiver: mpsc::UnboundedReceiver<TransferTask>,
    permits: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let mut workers = JoinSet::new();

    loop {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let task = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            task = receiver.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };
        queued.fetch_sub(1, Ordering::AcqRel);

        let context = Arc::clone(&context);
        workers.spawn(async move {
            context.run_task(task).await;
            drop(permit);
        });

        while let Some(result) = workers.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("Export worker panicked");
                }
            }
        }
    }

    if cancel.is_cancelled() {
        let in_flight = workers.len();
        if in_flight > 0 {
            info!(in_flight, "Aborting in-flight uploads");
        }
        workers.shutdown().await;
    } else {
        while workers.join_next().await.is_some() {}
    }
    debug!("Export dispatcher exited");
}

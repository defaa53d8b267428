//! Transfer service façade and bootstrap.
//!
//! [`TransferService`] wires one [`TransferConfig`] into a single signed-in
//! session, a Cloud Healthcare client, a shared status sink, and the export
//! and import pipelines. Hosts on desktop enable the `desktop-shims` feature so
//! the config builder supplies `reqwest` and on-disk credential adapters.

pub mod error;

pub use error::{Result, ServiceError};

pub use core_auth::{Session, SessionListener};
pub use core_runtime::config::{StoreDescriptor, TransferConfig, TransferConfigBuilder};
pub use core_runtime::events::{CoreEvent, EventBus};
pub use core_transfer::{
    Direction, FileReceiver, OutcomeCounts, OutcomeStatus, StatusReport, TransferOutcome,
    TransferStatusSink,
};

use core_auth::{
    AccessTokenProvider, CredentialStore, GoogleTokenInfoValidator, RefreshTokenExchange,
    SessionManager, SignInPolicy, StoredCredential,
};
use core_transfer::{ExportService, ExportSettings, ImportService, ImportSettings};
use provider_google_healthcare::HealthcareClient;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Entry point for hosts: one store, one identity, both pipelines.
pub struct TransferService {
    config: TransferConfig,
    session: Arc<SessionManager>,
    credentials: CredentialStore,
    client: HealthcareClient,
    sink: Arc<TransferStatusSink>,
    events: EventBus,
    export: ExportService,
    import: tokio::sync::Mutex<Option<Arc<ImportService>>>,
}

impl TransferService {
    /// Wire every component. Makes no network calls.
    pub fn new(config: TransferConfig) -> Result<Self> {
        config.validate()?;

        let events = EventBus::new(EVENT_CAPACITY);
        let http = Arc::clone(&config.http_client);

        let exchange = RefreshTokenExchange::new(
            Arc::clone(&http),
            CredentialStore::new(Arc::clone(&config.secure_store)),
            config.auth.token_url.clone(),
        )
        .with_client(
            config.auth.client_id.clone(),
            config.auth.client_secret.clone(),
        );

        let mut session = SessionManager::new(
            Arc::new(exchange),
            SignInPolicy::from_settings(&config.auth),
        )
        .with_event_bus(events.clone());
        if config.auth.client_id.is_some() {
            session = session.with_validator(Arc::new(GoogleTokenInfoValidator::new(
                Arc::clone(&http),
                config.auth.token_info_url.clone(),
            )));
        }
        let session = Arc::new(session);

        let client = HealthcareClient::new(http, config.healthcare_base_url.clone());
        let sink = Arc::new(TransferStatusSink::new().with_event_bus(events.clone()));

        let export = ExportService::new(
            Arc::clone(&session) as Arc<dyn AccessTokenProvider>,
            client.clone(),
            config.store.clone(),
            Arc::clone(&sink),
            ExportSettings::from_config(&config),
        )
        .with_event_bus(events.clone());

        Ok(Self {
            credentials: CredentialStore::new(Arc::clone(&config.secure_store)),
            config,
            session,
            client,
            sink,
            events,
            export,
            import: tokio::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn status(&self) -> &Arc<TransferStatusSink> {
        &self.sink
    }

    pub fn report(&self, include_outcomes: bool) -> StatusReport {
        self.sink.report(include_outcomes)
    }

    /// Cache the refresh credential used by later sign-ins.
    pub async fn save_refresh_token(&self, refresh_token: impl Into<String>) -> Result<()> {
        let mut credential = StoredCredential::new(refresh_token);
        if let Some(client_id) = &self.config.auth.client_id {
            credential = credential.with_client_id(client_id.clone());
        }
        self.credentials.store(&credential).await?;
        Ok(())
    }

    pub async fn sign_in(&self) -> Result<Session> {
        Ok(self.session.ensure_signed_in().await?)
    }

    pub async fn sign_out(&self) {
        self.session.sign_out().await;
    }

    pub fn add_session_listener(&self, listener: SessionListener) -> core_auth::ListenerId {
        self.session.add_listener(listener)
    }

    /// Sign in, make sure the store exists, and start uploading.
    pub async fn start_export(&self) -> Result<()> {
        self.export.start().await?;
        Ok(())
    }

    /// Queue a local file for upload. Never blocks.
    pub fn submit_for_export(&self, local_path: impl Into<PathBuf>) -> Result<Uuid> {
        Ok(self.export.submit(local_path)?)
    }

    pub fn queue_size(&self) -> usize {
        self.export.queue_size()
    }

    /// Run the first listing and start polling the store.
    ///
    /// Requires an import directory in the config.
    pub async fn start_import(&self, receiver: Arc<dyn FileReceiver>) -> Result<()> {
        let import = {
            let mut slot = self.import.lock().await;
            if slot.is_some() {
                return Err(core_transfer::TransferError::AlreadyStarted.into());
            }

            let import = ImportService::new(
                Arc::clone(&self.session) as Arc<dyn AccessTokenProvider>,
                self.client.clone(),
                self.config.store.clone(),
                Arc::clone(&self.sink),
                receiver,
                ImportSettings::from_config(&self.config)?,
            )
            .with_event_bus(self.events.clone());
            let import = Arc::new(import);
            *slot = Some(Arc::clone(&import));
            import
        };

        // Not holding the slot here, so `shutdown` can cancel sign-in and
        // the first listing.
        if let Err(e) = import.start().await {
            let mut slot = self.import.lock().await;
            if slot
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &import))
            {
                *slot = None;
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn is_importing(&self) -> bool {
        self.import
            .lock()
            .await
            .as_ref()
            .is_some_and(|import| import.is_running())
    }

    pub fn is_exporting(&self) -> bool {
        self.export.is_running()
    }

    /// Stop both pipelines. In-flight transfers are aborted.
    pub async fn shutdown(&self) {
        self.export.shutdown().await;
        let import = self.import.lock().await.take();
        if let Some(import) = import {
            import.shutdown().await;
        }
        info!(store = %self.config.store, "Transfer service stopped");
    }
}

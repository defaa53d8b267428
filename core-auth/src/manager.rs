//! # Session Manager
//!
//! Owns the single authenticated session both transfer pipelines share.
//!
//! ## Behaviour
//!
//! - [`SessionManager::ensure_signed_in`] returns immediately while the
//!   session is usable.
//! - Otherwise it runs the identity exchange, up to
//!   [`SignInPolicy::max_attempts`] times. The credential cache is cleared
//!   once, after the first failed attempt.
//! - Only one sign-in runs at a time. Callers that arrive while one is in
//!   flight wait for it and share its result, success or failure.
//! - Listeners run synchronously, in registration order, once per successful
//!   sign-in, before any waiting caller is released.
//!
//! ## Usage
//!
//! ```ignore
//! use core_auth::{SessionManager, SignInPolicy};
//!
//! let manager = SessionManager::new(exchange, SignInPolicy::default())
//!     .with_validator(validator)
//!     .with_event_bus(event_bus);
//!
//! manager.add_listener(Arc::new(|session| {
//!     tracing::info!(retries = session.retry_count(), "Authorized");
//! }));
//!
//! let session = manager.ensure_signed_in().await?;
//! ```

use crate::error::{AuthError, Result};
use crate::exchange::{AccessTokenProvider, IdentityExchange, TokenValidator};
use crate::types::{AuthorizedToken, Session};
use async_trait::async_trait;
use bridge_traits::time::{Clock, SystemClock};
use core_runtime::config::AuthSettings;
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

/// Sessions this close to expiry are treated as signed out.
pub const DEFAULT_EXPIRY_BUFFER: Duration = Duration::from_secs(60);

/// Callback invoked after each successful sign-in.
pub type SessionListener = Arc<dyn Fn(&Session) + Send + Sync>;

/// Handle returned by [`SessionManager::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Retry and validation rules for sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignInPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each later attempt.
    pub backoff: Option<Duration>,
    /// Client id the token audience is compared against.
    pub expected_audience: Option<String>,
    pub expiry_buffer: Duration,
}

impl Default for SignInPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff: None,
            expected_audience: None,
            expiry_buffer: DEFAULT_EXPIRY_BUFFER,
        }
    }
}

impl SignInPolicy {
    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self {
            max_attempts: settings.sign_in_attempts.max(1),
            backoff: settings.sign_in_backoff,
            expected_audience: settings.client_id.clone(),
            expiry_buffer: DEFAULT_EXPIRY_BUFFER,
        }
    }

    fn delay_before(&self, attempt: u32) -> Option<Duration> {
        let base = self.backoff?;
        if attempt < 2 {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        Some(base.saturating_mul(factor))
    }
}

/// Serializes sign-in and hands out the shared [`Session`].
pub struct SessionManager {
    exchange: Arc<dyn IdentityExchange>,
    validator: Option<Arc<dyn TokenValidator>>,
    policy: SignInPolicy,
    session: RwLock<Session>,
    sign_in_lock: Mutex<()>,
    /// Bumped each time a sign-in run finishes, successful or not.
    completed_runs: AtomicU64,
    last_failure: parking_lot::Mutex<Option<String>>,
    listeners: parking_lot::Mutex<Vec<(ListenerId, SessionListener)>>,
    next_listener_id: AtomicU64,
    clock: Arc<dyn Clock>,
    event_bus: Option<EventBus>,
}

impl SessionManager {
    pub fn new(exchange: Arc<dyn IdentityExchange>, policy: SignInPolicy) -> Self {
        Self {
            exchange,
            validator: None,
            policy,
            session: RwLock::new(Session::signed_out()),
            sign_in_lock: Mutex::new(()),
            completed_runs: AtomicU64::new(0),
            last_failure: parking_lot::Mutex::new(None),
            listeners: parking_lot::Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            clock: Arc::new(SystemClock),
            event_bus: None,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn policy(&self) -> &SignInPolicy {
        &self.policy
    }

    /// Register a callback for successful sign-ins.
    pub fn add_listener(&self, listener: SessionListener) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    /// Returns `false` if the listener was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Current session, whether or not it is still usable.
    pub async fn session(&self) -> Session {
        self.session.read().await.clone()
    }

    pub async fn is_signed_in(&self) -> bool {
        self.usable_session().await.is_some()
    }

    /// Make sure a usable session exists, signing in if necessary.
    ///
    /// # Errors
    ///
    /// [`AuthError::SignInExhausted`] wrapping the last failure once every
    /// attempt has failed. Callers that waited on someone else's failed run
    /// get the same error kind.
    #[instrument(skip(self))]
    pub async fn ensure_signed_in(&self) -> Result<Session> {
        if let Some(session) = self.usable_session().await {
            return Ok(session);
        }

        let observed_runs = self.completed_runs.load(Ordering::Acquire);
        let _guard = self.sign_in_lock.lock().await;

        if let Some(session) = self.usable_session().await {
            debug!("Session established while waiting");
            return Ok(session);
        }

        if self.completed_runs.load(Ordering::Acquire) != observed_runs {
            let message = self
                .last_failure
                .lock()
                .clone()
                .unwrap_or_else(|| "sign-in failed".to_string());
            debug!("Concurrent sign-in failed while waiting");
            return Err(AuthError::SignInExhausted {
                attempts: self.policy.max_attempts,
                last: Box::new(AuthError::ExchangeFailed(message)),
            });
        }

        self.run_sign_in().await
    }

    /// Drop the current session. The credential cache is left alone.
    #[instrument(skip(self))]
    pub async fn sign_out(&self) {
        let _guard = self.sign_in_lock.lock().await;
        *self.session.write().await = Session::signed_out();
        info!("Signed out");
        self.emit(AuthEvent::SignedOut);
    }

    async fn usable_session(&self) -> Option<Session> {
        let session = self.session.read().await;
        let buffer = chrono::Duration::from_std(self.policy.expiry_buffer)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        session
            .is_usable(self.clock.now(), buffer)
            .then(|| session.clone())
    }

    /// Caller holds `sign_in_lock`.
    async fn run_sign_in(&self) -> Result<Session> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if let Some(delay) = self.policy.delay_before(attempt) {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off");
                tokio::time::sleep(delay).await;
            }

            self.emit(AuthEvent::SigningIn {
                attempt,
                max_attempts,
            });

            let established = self
                .attempt_sign_in()
                .await
                .and_then(|token| {
                    Session::established(token, attempt - 1).ok_or_else(|| {
                        AuthError::ExchangeFailed("identity exchange returned an empty token".to_string())
                    })
                });

            match established {
                Ok(session) => {
                    *self.session.write().await = session.clone();
                    *self.last_failure.lock() = None;

                    info!(attempt, "Signed in");
                    self.emit(AuthEvent::SignedIn {
                        expires_at: session.expires_at().map(|at| at.timestamp()),
                    });
                    self.notify_listeners(&session);
                    self.completed_runs.fetch_add(1, Ordering::Release);

                    return Ok(session);
                }
                Err(err) => {
                    warn!(attempt, max_attempts, error = %err, "Sign-in attempt failed");
                    self.emit(AuthEvent::AuthError {
                        attempt,
                        message: err.to_string(),
                    });

                    if attempt == 1 {
                        if let Err(clear_err) = self.exchange.clear_cache().await {
                            warn!(error = %clear_err, "Failed to clear credential cache");
                        }
                    }

                    last_error = Some(err);
                }
            }
        }

        let last = last_error.unwrap_or(AuthError::NotAuthenticated);
        error!(attempts = max_attempts, error = %last, "Sign-in exhausted");

        *self.session.write().await = Session::signed_out();
        *self.last_failure.lock() = Some(last.to_string());
        self.completed_runs.fetch_add(1, Ordering::Release);

        Err(AuthError::SignInExhausted {
            attempts: max_attempts,
            last: Box::new(last),
        })
    }

    async fn attempt_sign_in(&self) -> Result<AuthorizedToken> {
        let token = self.exchange.authorize().await?;

        if let Some(validator) = &self.validator {
            let audience = validator.audience(&token.access_token).await?;

            match (&self.policy.expected_audience, audience) {
                (Some(expected), Some(actual)) if *expected != actual => {
                    warn!(
                        expected = %expected,
                        actual = %actual,
                        "Token audience does not match the configured client"
                    );
                }
                (Some(_), None) => debug!("Token info did not report an audience"),
                _ => {}
            }
        }

        Ok(token)
    }

    fn notify_listeners(&self, session: &Session) {
        let listeners: Vec<SessionListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(session);
        }
    }

    fn emit(&self, event: AuthEvent) {
        if let Some(bus) = &self.event_bus {
            let _ = bus.emit(CoreEvent::Auth(event));
        }
    }
}

#[async_trait]
impl AccessTokenProvider for SessionManager {
    async fn access_token(&self) -> Result<String> {
        let session = self.ensure_signed_in().await?;
        session
            .access_token()
            .map(str::to_string)
            .ok_or(AuthError::NotAuthenticated)
    }
}

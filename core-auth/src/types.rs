use chrono::{DateTime, Duration, Utc};
use std::fmt;

/// Result of a successful identity exchange.
///
/// # Examples
///
/// ```
/// use core_auth::AuthorizedToken;
/// use chrono::{Duration, Utc};
///
/// let token = AuthorizedToken::new("ya29.a0...")
///     .with_expiry(Utc::now() + Duration::hours(1));
/// assert!(token.expires_at.is_some());
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct AuthorizedToken {
    /// Bearer token presented to the store
    pub access_token: String,
    /// When the token stops being accepted, if the provider says so
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthorizedToken {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

impl fmt::Debug for AuthorizedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizedToken")
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Authentication state shared by both pipelines.
///
/// A signed-in session always carries a non-empty access token; a signed-out
/// session never carries one. Only [`SessionManager`](crate::SessionManager)
/// creates signed-in sessions.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    signed_in: bool,
    access_token: Option<String>,
    retry_count: u32,
    expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn signed_out() -> Self {
        Self {
            signed_in: false,
            access_token: None,
            retry_count: 0,
            expires_at: None,
        }
    }

    /// Returns `None` for an empty token.
    pub(crate) fn established(token: AuthorizedToken, retry_count: u32) -> Option<Self> {
        if token.access_token.is_empty() {
            return None;
        }

        Some(Self {
            signed_in: true,
            access_token: Some(token.access_token),
            retry_count,
            expires_at: token.expires_at,
        })
    }

    pub fn is_signed_in(&self) -> bool {
        self.signed_in
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    /// Failed attempts before the current session was established.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Signed in and not within `buffer` of expiry.
    ///
    /// Tokens without an expiry stay usable until sign-out.
    pub fn is_usable(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        if !self.signed_in {
            return false;
        }

        match self.expires_at {
            Some(expires_at) => now < expires_at - buffer,
            None => true,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::signed_out()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("signed_in", &self.signed_in)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("retry_count", &self.retry_count)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

//! # Google OAuth Endpoints
//!
//! Production implementations of the identity seams:
//!
//! - [`RefreshTokenExchange`] exchanges the cached refresh credential at the
//!   OAuth token endpoint for a short-lived access token.
//! - [`GoogleTokenInfoValidator`] asks the token-info endpoint which client an
//!   access token was issued to.
//!
//! Interactive consent flows are not handled here; the refresh credential is
//! provisioned out of band and cached through [`CredentialStore`].

use crate::error::{AuthError, Result};
use crate::exchange::{IdentityExchange, TokenValidator};
use crate::token_store::{CredentialStore, StoredCredential};
use crate::types::AuthorizedToken;
use async_trait::async_trait;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest};
use bridge_traits::time::{Clock, SystemClock};
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Exchanges the cached refresh credential for an access token.
pub struct RefreshTokenExchange {
    http_client: Arc<dyn HttpClient>,
    credentials: CredentialStore,
    token_url: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    clock: Arc<dyn Clock>,
}

impl RefreshTokenExchange {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        credentials: CredentialStore,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            credentials,
            token_url: token_url.into(),
            client_id: None,
            client_secret: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_client(mut self, client_id: Option<String>, client_secret: Option<String>) -> Self {
        self.client_id = client_id;
        self.client_secret = client_secret;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn encode_request(&self, credential: &StoredCredential) -> Result<Bytes> {
        let mut params: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", credential.refresh_token.as_str()),
        ];

        if let Some(client_id) = credential.client_id.as_deref().or(self.client_id.as_deref()) {
            params.push(("client_id", client_id));
        }

        if let Some(secret) = self.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }

        let encoded = serde_urlencoded::to_string(&params)
            .map_err(|e| AuthError::SerializationFailed(format!("token request: {}", e)))?;

        Ok(Bytes::from(encoded))
    }
}

#[async_trait]
impl IdentityExchange for RefreshTokenExchange {
    #[instrument(skip(self), fields(token_url = %self.token_url))]
    async fn authorize(&self) -> Result<AuthorizedToken> {
        let credential = self.credentials.load().await?.ok_or_else(|| {
            AuthError::MissingCredential("no refresh credential in the credential cache".to_string())
        })?;

        let request = HttpRequest::new(HttpMethod::Post, self.token_url.clone())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(self.encode_request(&credential)?);

        // One request per call; the session manager owns sign-in retries.
        let response = self
            .http_client
            .execute(request)
            .await
            .map_err(|e| AuthError::TokenRefreshFailed(e.to_string()))?;

        if !response.is_success() {
            let status = response.status;
            let error_body = response
                .text()
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            warn!(status, "Token endpoint did not issue a token");
            return Err(AuthError::TokenRefreshFailed(format!(
                "Token endpoint returned {}: {}",
                status, error_body
            )));
        }

        let token: TokenResponse = response.json().map_err(|e| {
            AuthError::TokenRefreshFailed(format!("unreadable token response: {}", e))
        })?;

        let expires_at = chrono::TimeDelta::try_seconds(token.expires_in)
            .and_then(|lifetime| self.clock.now().checked_add_signed(lifetime))
            .ok_or_else(|| {
                AuthError::TokenRefreshFailed(format!(
                    "token lifetime out of range: {} s",
                    token.expires_in
                ))
            })?;

        if let Some(rotated) = token.refresh_token.as_deref() {
            if rotated != credential.refresh_token {
                debug!("Token endpoint rotated the refresh credential");
                let mut updated = credential.clone();
                updated.refresh_token = rotated.to_string();
                self.credentials.store(&updated).await?;
            }
        }

        info!(expires_in = token.expires_in, "Access token issued");
        Ok(AuthorizedToken::new(token.access_token).with_expiry(expires_at))
    }

    async fn clear_cache(&self) -> Result<()> {
        self.credentials.clear().await
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

/// Reads the audience of an access token from Google's token-info endpoint.
pub struct GoogleTokenInfoValidator {
    http_client: Arc<dyn HttpClient>,
    token_info_url: String,
}

impl GoogleTokenInfoValidator {
    pub fn new(http_client: Arc<dyn HttpClient>, token_info_url: impl Into<String>) -> Self {
        Self {
            http_client,
            token_info_url: token_info_url.into(),
        }
    }
}

#[async_trait]
impl TokenValidator for GoogleTokenInfoValidator {
    #[instrument(skip(self, access_token))]
    async fn audience(&self, access_token: &str) -> Result<Option<String>> {
        let url = url::Url::parse(&self.token_info_url)
            .map_err(|e| AuthError::TokenValidationFailed(format!("bad token info URL: {}", e)))?;

        // Form body, so the token never lands in a URL that gets logged.
        let body = serde_urlencoded::to_string(vec![("access_token", access_token)])
            .map_err(|e| AuthError::SerializationFailed(format!("token info request: {}", e)))?;
        let request = HttpRequest::new(HttpMethod::Post, url.to_string())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(Bytes::from(body));

        let response = self
            .http_client
            .execute(request)
            .await
            .map_err(|e| AuthError::TokenValidationFailed(e.to_string()))?;

        if !response.is_success() {
            return Err(AuthError::TokenValidationFailed(format!(
                "token info endpoint returned {}",
                response.status
            )));
        }

        let info: TokenInfo = response
            .json()
            .map_err(|e| AuthError::TokenValidationFailed(e.to_string()))?;

        Ok(info.aud.or(info.azp))
    }
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    #[serde(default, alias = "audience")]
    aud: Option<String>,
    #[serde(default)]
    azp: Option<String>,
}

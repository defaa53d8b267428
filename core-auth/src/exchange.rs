//! Seams between the session layer and the identity provider.

use crate::error::Result;
use crate::types::AuthorizedToken;
use async_trait::async_trait;

/// Turns whatever credential the host has into an access token.
#[async_trait]
pub trait IdentityExchange: Send + Sync {
    async fn authorize(&self) -> Result<AuthorizedToken>;

    /// Drop any cached credential so the next [`authorize`](Self::authorize)
    /// starts from scratch.
    async fn clear_cache(&self) -> Result<()> {
        Ok(())
    }
}

/// Looks up the audience an access token was issued for.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// `Ok(None)` when the provider does not report an audience.
    async fn audience(&self, access_token: &str) -> Result<Option<String>>;
}

/// Supplies a bearer token for store requests, signing in first if needed.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

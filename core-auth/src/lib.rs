//! # Session Management
//!
//! Keeps one authenticated session for the transfer pipelines.
//!
//! - [`SessionManager`] serializes sign-in, retries failed exchanges, clears the
//!   credential cache after the first failure and notifies listeners.
//! - [`IdentityExchange`] and [`TokenValidator`] are the seams to the identity
//!   provider. [`RefreshTokenExchange`] and [`GoogleTokenInfoValidator`] are the
//!   production implementations.
//! - [`AccessTokenProvider`] is what the pipelines depend on.

pub mod error;
pub mod exchange;
pub mod manager;
pub mod oauth;
pub mod token_store;
pub mod types;

pub use error::{AuthError, Result};
pub use exchange::{AccessTokenProvider, IdentityExchange, TokenValidator};
pub use manager::{ListenerId, SessionListener, SessionManager, SignInPolicy};
pub use oauth::{GoogleTokenInfoValidator, RefreshTokenExchange};
pub use token_store::{CredentialStore, StoredCredential};
pub use types::{AuthorizedToken, Session};

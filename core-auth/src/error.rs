use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Authorization exchange failed: {0}")]
    ExchangeFailed(String),

    #[error("Token refresh failed: {0}")]
    TokenRefreshFailed(String),

    #[error("No stored credential available: {0}")]
    MissingCredential(String),

    #[error("Token validation failed: {0}")]
    TokenValidationFailed(String),

    #[error("Secure storage unavailable: {0}")]
    SecureStorageUnavailable(String),

    #[error("Credential serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Sign-in failed after {attempts} attempts: {last}")]
    SignInExhausted { attempts: u32, last: Box<AuthError> },

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),
}

pub type Result<T> = std::result::Result<T, AuthError>;

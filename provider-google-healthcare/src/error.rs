//! Error types for the Healthcare provider

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HealthcareError {
    /// The store rejected the bearer token
    #[error("Authentication failed (status {status_code})")]
    AuthenticationFailed { status_code: u16 },

    /// API request returned an error
    #[error("Healthcare API error (status {status_code}): {message}")]
    ApiError { status_code: u16, message: String },

    /// Failed to parse API response
    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    /// Request never produced a response
    #[error(transparent)]
    BridgeError(#[from] bridge_traits::error::BridgeError),
}

impl HealthcareError {
    pub(crate) fn from_status(status_code: u16, body: &[u8]) -> Self {
        match status_code {
            401 | 403 => HealthcareError::AuthenticationFailed { status_code },
            _ => HealthcareError::ApiError {
                status_code,
                message: String::from_utf8_lossy(body).trim().to_string(),
            },
        }
    }

    /// HTTP status the store answered with, if it answered.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            HealthcareError::AuthenticationFailed { status_code }
            | HealthcareError::ApiError { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, HealthcareError>;

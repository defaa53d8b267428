use core_auth::AuthError;
use provider_google_healthcare::HealthcareError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    /// Malformed multipart framing or a stream that ended early
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No response from the store
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Store denied access (HTTP {status})")]
    AuthorizationDenied { status: u16 },

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File is empty: {}", .0.display())]
    EmptyFile(PathBuf),

    #[error("Unexpected HTTP status {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },

    #[error("Startup failed: {0}")]
    StartupFailed(String),

    #[error("Service already started")]
    AlreadyStarted,

    #[error("Service has been shut down")]
    ShutDown,

    #[error("Invalid task transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },
}

impl From<HealthcareError> for TransferError {
    fn from(error: HealthcareError) -> Self {
        match error {
            HealthcareError::AuthenticationFailed { status_code } => {
                TransferError::AuthorizationDenied {
                    status: status_code,
                }
            }
            HealthcareError::ApiError {
                status_code,
                message,
            } => TransferError::UnexpectedStatus {
                status: status_code,
                message,
            },
            HealthcareError::ParseError(message) => TransferError::Protocol(message),
            HealthcareError::BridgeError(e) => TransferError::Transport(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DtnError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage depletion: {0}")]
    StorageDepletion(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Queue over quota: {0}")]
    QuotaExceeded(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Link error: {0}")]
    Link(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Naming error: {0}")]
    Naming(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DtnError>;

// Error conversions for common error types

impl From<bincode::error::EncodeError> for DtnError {
    fn from(e: bincode::error::EncodeError) -> Self {
        DtnError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for DtnError {
    fn from(e: bincode::error::DecodeError) -> Self {
        DtnError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for DtnError {
    fn from(e: serde_json::Error) -> Self {
        DtnError::Serialization(e.to_string())
    }
}

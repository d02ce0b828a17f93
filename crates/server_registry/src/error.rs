//! Error types for the server registry.

use std::path::PathBuf;
use thiserror::Error;

/// Failure of a registry operation.
///
/// Each variant maps to a stable [`code`](RegistryError::code) and an
/// HTTP-equivalent [`status_code`](RegistryError::status_code). Messages are
/// safe to show to callers; they never include internal state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Server {0} is not registered")]
    NotRegistered(String),

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Server {0} not found")]
    NotFound(String),

    #[error("Server {id} is not accepting players (status: {status})")]
    ServerUnavailable { id: String, status: String },

    #[error("Server {id} is full ({current}/{max})")]
    ServerFull { id: String, current: u32, max: u32 },

    #[error("Internal registry fault: {0}")]
    InternalFault(String),
}

impl RegistryError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        RegistryError::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::MissingField(_) => "MISSING_FIELD",
            RegistryError::InvalidField { .. } => "INVALID_FIELD",
            RegistryError::NotRegistered(_) => "NOT_REGISTERED",
            RegistryError::UnknownServer(_) => "UNKNOWN_SERVER",
            RegistryError::NotFound(_) => "NOT_FOUND",
            RegistryError::ServerUnavailable { .. } => "SERVER_UNAVAILABLE",
            RegistryError::ServerFull { .. } => "SERVER_FULL",
            RegistryError::InternalFault(_) => "INTERNAL_FAULT",
        }
    }

    /// HTTP-equivalent status code.
    pub fn status_code(&self) -> u16 {
        match self {
            RegistryError::MissingField(_) | RegistryError::InvalidField { .. } => 400,
            RegistryError::NotRegistered(_)
            | RegistryError::UnknownServer(_)
            | RegistryError::NotFound(_) => 404,
            RegistryError::ServerUnavailable { .. } => 503,
            RegistryError::ServerFull { .. } => 409,
            RegistryError::InternalFault(_) => 500,
        }
    }
}

/// Persistence backend errors.
///
/// These carry filesystem paths and are only logged; request handlers never
/// turn them into caller-visible errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create directory {0}: {1}")]
    DirectoryCreate(PathBuf, std::io::Error),

    #[error("Failed to read directory {0}: {1}")]
    DirectoryRead(PathBuf, std::io::Error),

    #[error("Failed to read file {0}: {1}")]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to write file {0}: {1}")]
    FileWrite(PathBuf, std::io::Error),

    #[error("Failed to rename file from {0} to {1}: {2}")]
    FileRename(PathBuf, PathBuf, std::io::Error),

    #[error("Failed to delete file {0}: {1}")]
    FileDelete(PathBuf, std::io::Error),

    #[error("Failed to serialize entry {0}: {1}")]
    Serialization(String, serde_json::Error),

    #[error("Failed to deserialize file {0}: {1}")]
    Deserialization(PathBuf, serde_json::Error),

    #[error("Invalid entry id for storage: {0}")]
    InvalidId(String),
}

/// Failures while bringing the registry service up or running it.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to bind {0}: {1}")]
    Bind(std::net::SocketAddr, std::io::Error),

    #[error("HTTP server error: {0}")]
    Serve(std::io::Error),

    #[error("Persistence error: {0}")]
    Storage(#[from] StorageError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(RegistryError::MissingField("id").status_code(), 400);
        assert_eq!(RegistryError::invalid("port", "not a number").status_code(), 400);
        assert_eq!(RegistryError::NotRegistered("a".into()).status_code(), 404);
        assert_eq!(RegistryError::UnknownServer("a".into()).status_code(), 404);
        assert_eq!(RegistryError::NotFound("a".into()).status_code(), 404);
        assert_eq!(
            RegistryError::ServerUnavailable {
                id: "a".into(),
                status: "offline".into()
            }
            .status_code(),
            503
        );
        assert_eq!(
            RegistryError::ServerFull {
                id: "a".into(),
                current: 2,
                max: 2
            }
            .status_code(),
            409
        );
        assert_eq!(RegistryError::InternalFault("x".into()).status_code(), 500);
    }

    #[test]
    fn test_messages_and_codes() {
        let err = RegistryError::ServerFull {
            id: "srv-1".into(),
            current: 10,
            max: 10,
        };
        assert_eq!(err.code(), "SERVER_FULL");
        assert_eq!(err.to_string(), "Server srv-1 is full (10/10)");

        let err = RegistryError::MissingField("address");
        assert_eq!(err.to_string(), "Missing required field: address");
    }
}

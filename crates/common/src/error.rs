//! Error types for wgwarden

use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the wgwarden Error
pub type Result<T> = std::result::Result<T, Error>;

/// wgwarden error types
///
/// Peer-scoped variants carry the operation name and the peer ID so callers
/// can surface them without extra context.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{op}: peer {id} not found")]
    NotFound { op: &'static str, id: String },

    #[error("{op}: address space exhausted after {last}")]
    AddressSpaceExhausted { op: &'static str, last: Ipv4Addr },

    #[error("{op}: key generation failed: {reason}")]
    KeyGeneration { op: &'static str, reason: String },

    #[error("{op}: command `{command}` failed for peer {id} ({status}): {stderr}")]
    ExternalCommand {
        op: &'static str,
        id: String,
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Store file {path:?} is corrupt: {reason}")]
    StoreCorrupt { path: PathBuf, reason: String },

    #[error("Invalid date: {0}")]
    InvalidDate(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl Error {
    pub fn not_found(op: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound { op, id: id.into() }
    }

    pub fn key_generation(op: &'static str, reason: impl std::fmt::Display) -> Self {
        Error::KeyGeneration {
            op,
            reason: reason.to_string(),
        }
    }

    /// Short machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::NotFound { .. } => "not_found",
            Error::AddressSpaceExhausted { .. } => "address_space_exhausted",
            Error::KeyGeneration { .. } => "key_generation_failed",
            Error::ExternalCommand { .. } => "external_command_failed",
            Error::StoreCorrupt { .. } => "store_corrupt",
            Error::InvalidDate(_) => "invalid_date",
            Error::InvalidAddress(_) => "invalid_address",
            Error::InvalidConfig(_) => "invalid_config",
            Error::Template(_) => "template",
            Error::PermissionDenied(_) => "permission_denied",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

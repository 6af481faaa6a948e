//! Remote synchronization for the kiln cache.
//!
//! Remotes are reached through the [`Transport`] collaborator, a plain
//! `{method, path, body} -> {status, body}` exchange that already carries
//! authentication. [`RemoteClient`] maps the kiln protocol routes onto it,
//! [`Registry`] records the configured remotes and where each recipe came
//! from, and [`SyncEngine`] uploads, downloads, and checks for updates
//! while verifying every transfer against its manifest.

pub mod client;
pub mod http;
pub mod memory;
pub mod registry;
pub mod retry;
pub mod sync;
pub mod transport;

pub use client::RemoteClient;
pub use http::{HttpConnector, HttpTransport};
pub use memory::{MemoryConnector, MemoryRemote};
pub use registry::{Registry, RegistryFile, Remote};
pub use retry::RetryPolicy;
pub use sync::{
    PackageOutcome, RecipeOutcome, SyncEngine, UpdateStatus, UploadOptions, UploadReport,
};
pub use transport::{Connector, Method, Request, Response, Transport};

/// Protocol version sent as `X-Kiln-Protocol` header on all HTTP requests.
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_HEADER: &str = "X-Kiln-Protocol";

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot reach remote '{remote}': {reason}")]
    Transport { remote: String, reason: String },
    #[error("remote '{remote}' answered HTTP {status} to {method} {path}")]
    Http {
        remote: String,
        method: Method,
        path: String,
        status: u16,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("integrity check failed for {subject}: {reason}")]
    Integrity { subject: String, reason: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("remote config error: {0}")]
    Config(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error(transparent)]
    Store(#[from] kiln_store::StoreError),
    #[error(transparent)]
    Schema(#[from] kiln_schema::SchemaError),
}

impl RemoteError {
    /// Connection failures and server-side errors may succeed on a retry.
    /// Everything else describes a definite answer.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Store(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub(crate) fn integrity(subject: impl ToString, reason: impl Into<String>) -> Self {
        Self::Integrity {
            subject: subject.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> RemoteError {
        RemoteError::Http {
            remote: "default".to_owned(),
            method: Method::Get,
            path: "/v1/recipes".to_owned(),
            status,
        }
    }

    #[test]
    fn only_connection_and_server_errors_are_transient() {
        assert!(RemoteError::Transport {
            remote: "default".to_owned(),
            reason: "connection refused".to_owned(),
        }
        .is_transient());
        assert!(http(503).is_transient());
        assert!(!http(403).is_transient());
        assert!(!RemoteError::NotFound("x".to_owned()).is_transient());
        assert!(!RemoteError::integrity("x", "mismatch").is_transient());
        assert!(!RemoteError::Conflict("x".to_owned()).is_transient());
    }

    #[test]
    fn http_error_names_the_request() {
        let msg = http(500).to_string();
        assert!(msg.contains("default"));
        assert!(msg.contains("GET /v1/recipes"));
        assert!(msg.contains("500"));
    }
}

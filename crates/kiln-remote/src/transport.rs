use crate::registry::Remote;
use crate::RemoteError;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Path relative to the remote URL, starting with `/`.
    pub path: String,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            body: None,
        }
    }

    pub fn put(path: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: Method::Put,
            path: path.into(),
            body: Some(body),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            method: Method::Delete,
            path: path.into(),
            body: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// An authenticated request/response channel to one remote.
///
/// Any HTTP status is an `Ok` response; `Err` means the exchange itself
/// failed (connection refused, reset, TLS failure).
pub trait Transport: Send + Sync {
    fn request(&self, request: &Request) -> Result<Response, RemoteError>;
}

/// Opens a transport for a configured remote.
pub trait Connector: Send + Sync {
    fn connect(&self, remote: &Remote) -> Result<Arc<dyn Transport>, RemoteError>;
}

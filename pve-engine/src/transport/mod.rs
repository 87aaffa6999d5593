//! JSON-over-HTTPS transport to the hypervisor API.
//!
//! The [`Transport`] trait is the seam between the engine and the network:
//! [`HttpTransport`] talks to a real cluster, [`crate::mock::MockTransport`]
//! replays scripted responses in tests.

mod http;

pub use http::HttpTransport;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ErrorKind, PveError, Result};

/// HTTP verb of an API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied translation of HTTP status codes into error kinds.
pub type StatusMap = &'static [(u16, ErrorKind)];

/// Mapping used by most endpoints.
pub const DEFAULT_STATUS_MAP: StatusMap = &[
    (400, ErrorKind::InvalidParameters),
    (401, ErrorKind::AuthenticationFailed),
    (500, ErrorKind::OperationFailed),
];

/// Mapping for guest-agent calls, where a 500 means the agent is not up.
pub const AGENT_STATUS_MAP: StatusMap = &[
    (400, ErrorKind::InvalidParameters),
    (401, ErrorKind::AuthenticationFailed),
    (500, ErrorKind::InstanceNotRunning),
];

/// A single call against the API root (`/api2/json`).
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API root, optionally with a query string
    pub path: String,
    pub body: Option<Value>,
    pub status_map: StatusMap,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            status_map: DEFAULT_STATUS_MAP,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_status_map(mut self, status_map: StatusMap) -> Self {
        self.status_map = status_map;
        self
    }

    /// Path with any query string removed.
    pub fn route(&self) -> &str {
        self.path.split('?').next().unwrap_or(&self.path)
    }
}

/// Issues API calls and returns the unwrapped `data` payload.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, request: ApiRequest) -> Result<Value>;
}

/// Translate a non-2xx response into a domain error.
///
/// Codes absent from `status_map` become [`PveError::Api`]. A mapped 500
/// whose message reports a held lock becomes [`PveError::InstanceLocked`]
/// so lock-retry policies can recognise it.
pub fn map_status(status: u16, message: &str, status_map: StatusMap) -> PveError {
    let kind = status_map
        .iter()
        .find(|(code, _)| *code == status)
        .map(|(_, kind)| *kind);

    match kind {
        Some(_) if status == 500 && is_lock_message(message) => {
            PveError::InstanceLocked(message.to_string())
        }
        Some(kind) => kind.into_error(status, message.to_string()),
        None => PveError::Api {
            status,
            message: message.to_string(),
        },
    }
}

fn is_lock_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("is locked") || lower.contains("can't lock file")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_status_uses_caller_table() {
        let err = map_status(401, "no ticket", DEFAULT_STATUS_MAP);
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);

        let err = map_status(500, "QEMU guest agent is not running", AGENT_STATUS_MAP);
        assert_eq!(err.kind(), ErrorKind::InstanceNotRunning);
    }

    #[test]
    fn test_unmapped_status_is_generic() {
        let err = map_status(403, "Permission check failed", DEFAULT_STATUS_MAP);
        assert_eq!(
            err,
            PveError::Api { status: 403, message: "Permission check failed".into() }
        );
    }

    #[test]
    fn test_locked_500_is_distinct() {
        let err = map_status(500, "VM is locked (clone)", DEFAULT_STATUS_MAP);
        assert_eq!(err.kind(), ErrorKind::InstanceLocked);

        let err = map_status(
            500,
            "can't lock file '/var/lock/qemu-server/lock-105.conf' - got timeout",
            DEFAULT_STATUS_MAP,
        );
        assert_eq!(err.kind(), ErrorKind::InstanceLocked);

        // Only when the caller mapped 500 at all.
        let err = map_status(500, "VM is locked (clone)", &[]);
        assert_eq!(err.kind(), ErrorKind::Api);
    }

    #[test]
    fn test_route_strips_query() {
        let req = ApiRequest::delete("nodes/pve1/qemu/105?purge=1&destroy-unreferenced-disks=1");
        assert_eq!(req.route(), "nodes/pve1/qemu/105");
        assert_eq!(req.method, Method::Delete);
    }
}

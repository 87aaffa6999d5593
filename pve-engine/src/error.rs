//! Error types for the orchestration engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fieldless classification of [`PveError`].
///
/// Used by status-code maps and by retry policies to decide which failures
/// are worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthenticationFailed,
    InvalidParameters,
    InstanceNotFound,
    InstanceNotRunning,
    InstanceLocked,
    OperationFailed,
    Timeout,
    InvalidOrchestrationType,
    InvalidCommandParam,
    InvalidConfig,
    Cancelled,
    ConnectionFailed,
    Api,
    UnexpectedResponse,
    CustomizationFailed,
    IpNotFound,
    InstanceNotPowered,
}

/// Errors that can occur while driving the hypervisor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PveError {
    /// Bad credentials or an expired ticket.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The hypervisor rejected the request body or query.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// No instance with this ID exists in the cluster.
    #[error("Instance {0} does not exist")]
    InstanceNotFound(u32),

    /// The guest (or its agent) is not running.
    #[error("Instance is not running: {0}")]
    InstanceNotRunning(String),

    /// A previous task still holds the instance lock.
    #[error("Instance is locked: {0}")]
    InstanceLocked(String),

    /// A task finished with a non-OK exit status or exhausted its poll budget.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// The instance never converged to the requested power state.
    #[error(
        "Instance {instance_id} did not {operation} after {attempts} attempts ({budget_secs}s budget)"
    )]
    Timeout {
        instance_id: u32,
        operation: String,
        attempts: u32,
        budget_secs: u64,
    },

    #[error("Invalid orchestration type '{found}', expected '{expected}'")]
    InvalidOrchestrationType { found: String, expected: String },

    #[error("Param '{name}' is invalid. It should be one of {expected:?} but the value is '{value}'")]
    InvalidCommandParam {
        name: String,
        value: String,
        expected: Vec<String>,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The caller cancelled the operation between polling iterations.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Failed to connect to hypervisor API: {0}")]
    ConnectionFailed(String),

    /// Non-2xx status that the caller's status map did not cover.
    #[error("Hypervisor API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Unexpected API response: {0}")]
    UnexpectedResponse(String),

    #[error("Post-clone customization of instance {instance_id} failed: {reason}")]
    CustomizationFailed { instance_id: u32, reason: String },

    #[error("IP address not found for instance {instance_id}{}", filter_suffix(.filter))]
    IpNotFound {
        instance_id: u32,
        filter: Option<String>,
    },

    #[error("Instance {0} is not powered on")]
    InstanceNotPowered(u32),
}

fn filter_suffix(filter: &Option<String>) -> String {
    match filter {
        Some(f) => format!(" matching '{}'", f),
        None => String::new(),
    }
}

impl PveError {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PveError::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            PveError::InvalidParameters(_) => ErrorKind::InvalidParameters,
            PveError::InstanceNotFound(_) => ErrorKind::InstanceNotFound,
            PveError::InstanceNotRunning(_) => ErrorKind::InstanceNotRunning,
            PveError::InstanceLocked(_) => ErrorKind::InstanceLocked,
            PveError::OperationFailed(_) => ErrorKind::OperationFailed,
            PveError::Timeout { .. } => ErrorKind::Timeout,
            PveError::InvalidOrchestrationType { .. } => ErrorKind::InvalidOrchestrationType,
            PveError::InvalidCommandParam { .. } => ErrorKind::InvalidCommandParam,
            PveError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            PveError::Cancelled(_) => ErrorKind::Cancelled,
            PveError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            PveError::Api { .. } => ErrorKind::Api,
            PveError::UnexpectedResponse(_) => ErrorKind::UnexpectedResponse,
            PveError::CustomizationFailed { .. } => ErrorKind::CustomizationFailed,
            PveError::IpNotFound { .. } => ErrorKind::IpNotFound,
            PveError::InstanceNotPowered(_) => ErrorKind::InstanceNotPowered,
        }
    }

    /// True for the "already gone" condition that delete/detach swallow.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PveError::InstanceNotFound(_))
    }

    /// False for bad credentials, bad input and explicit cancellation.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::AuthenticationFailed
                | ErrorKind::InvalidParameters
                | ErrorKind::InvalidOrchestrationType
                | ErrorKind::InvalidCommandParam
                | ErrorKind::InvalidConfig
                | ErrorKind::Cancelled
        )
    }
}

impl ErrorKind {
    /// Build an error of this kind from a transport-level message.
    ///
    /// Kinds that carry structured fields fall back to [`PveError::Api`].
    pub fn into_error(self, status: u16, message: String) -> PveError {
        match self {
            ErrorKind::AuthenticationFailed => PveError::AuthenticationFailed(message),
            ErrorKind::InvalidParameters => PveError::InvalidParameters(message),
            ErrorKind::InstanceNotRunning => PveError::InstanceNotRunning(message),
            ErrorKind::InstanceLocked => PveError::InstanceLocked(message),
            ErrorKind::OperationFailed => PveError::OperationFailed(message),
            ErrorKind::ConnectionFailed => PveError::ConnectionFailed(message),
            ErrorKind::UnexpectedResponse => PveError::UnexpectedResponse(message),
            _ => PveError::Api { status, message },
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, PveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip_through_status_mapping() {
        let err = ErrorKind::AuthenticationFailed.into_error(401, "bad ticket".into());
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert!(!err.is_retryable());

        let err = ErrorKind::InstanceNotFound.into_error(404, "gone".into());
        assert_eq!(err, PveError::Api { status: 404, message: "gone".into() });
    }

    #[test]
    fn test_messages_name_the_instance() {
        let err = PveError::Timeout {
            instance_id: 105,
            operation: "stop".into(),
            attempts: 5,
            budget_secs: 150,
        };
        let msg = err.to_string();
        assert!(msg.contains("105"));
        assert!(msg.contains("150s"));

        let err = PveError::IpNotFound { instance_id: 7, filter: Some("10.".into()) };
        assert_eq!(err.to_string(), "IP address not found for instance 7 matching '10.'");
    }

    #[test]
    fn test_invalid_command_param_lists_allowed_values() {
        let err = PveError::InvalidCommandParam {
            name: "save_memory".into(),
            value: "maybe".into(),
            expected: vec!["Yes".into(), "No".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("maybe"));
        assert!(msg.contains("\"Yes\""));
        assert!(!err.is_retryable());
    }
}

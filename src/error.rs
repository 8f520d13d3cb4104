//! Error taxonomy for every remote sandbox operation.
//!
//! Transport and validation failures are returned as [`SandboxError`]. Failures
//! of the code or process that ran *inside* the sandbox are not errors: they are
//! carried as data in [`crate::code::Execution`] and [`crate::commands::ProcessResult`].

use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for sandbox client operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors surfaced by the sandbox client.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Malformed options or configuration (unsupported language, bad depth, missing credential).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Unknown sandbox, process, context or path.
    #[error("not found: {0}")]
    NotFound(String),

    /// The in-sandbox user lacks rights on the resource.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The path is invalid for the operation (e.g. parent directory missing).
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Sandbox creation was rejected (quota, validation, capacity).
    #[error("sandbox provisioning failed: {0}")]
    Provisioning(String),

    /// Authentication or connectivity failure talking to the service.
    #[error("transport error: {0}")]
    Transport(String),

    /// Network-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Any other status reported by the service.
    #[error("service error {code}: {message}")]
    Rpc {
        /// Service status code (`unknown`, `resource_exhausted`, ...)
        code: String,
        /// Human readable message from the service
        message: String,
    },

    /// The service answered with something this client cannot decode.
    #[error("malformed response: {0}")]
    Protocol(String),

    /// The caller-supplied deadline elapsed before the operation finished.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the operation. Remote work may still be running.
    #[error("operation cancelled")]
    Cancelled,

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error body returned by the in-sandbox daemon and the gateway.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl SandboxError {
    /// True when the remote resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True for network and authentication failures.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Http(_))
    }

    /// Service status code carried by this error, if any.
    pub(crate) fn rpc_code(&self) -> Option<&str> {
        match self {
            Self::Rpc { code, .. } => Some(code),
            Self::NotFound(_) => Some("not_found"),
            Self::PermissionDenied(_) => Some("permission_denied"),
            _ => None,
        }
    }

    /// A copy of this error for callers that observe it again later.
    ///
    /// Wrapped library errors keep their class: HTTP failures stay transport
    /// errors and JSON failures become protocol errors.
    pub(crate) fn replay(&self) -> Self {
        match self {
            Self::Config(m) => Self::Config(m.clone()),
            Self::NotFound(m) => Self::NotFound(m.clone()),
            Self::PermissionDenied(m) => Self::PermissionDenied(m.clone()),
            Self::InvalidPath(m) => Self::InvalidPath(m.clone()),
            Self::Provisioning(m) => Self::Provisioning(m.clone()),
            Self::Transport(m) => Self::Transport(m.clone()),
            Self::Http(e) => Self::Transport(e.to_string()),
            Self::Rpc { code, message } => Self::Rpc {
                code: code.clone(),
                message: message.clone(),
            },
            Self::Protocol(m) => Self::Protocol(m.clone()),
            Self::Timeout(d) => Self::Timeout(*d),
            Self::Cancelled => Self::Cancelled,
            Self::Json(e) => Self::Protocol(e.to_string()),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }

    /// Map a service status code and message onto the taxonomy.
    pub(crate) fn from_rpc(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            "not_found" => Self::NotFound(message),
            "permission_denied" => Self::PermissionDenied(message),
            "unauthenticated" => Self::Transport(format!("unauthenticated: {message}")),
            _ => Self::Rpc {
                code: code.to_string(),
                message,
            },
        }
    }

    /// Map a non-success HTTP response onto the taxonomy.
    ///
    /// A JSON body with a `code` field wins over the status line.
    pub(crate) fn from_status(status: StatusCode, body: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        let message = parsed
            .message
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    status.to_string()
                } else {
                    trimmed.to_string()
                }
            });
        let code = parsed
            .code
            .unwrap_or_else(|| code_for_status(status).to_string());
        Self::from_rpc(&code, message)
    }

    /// Re-label a generic failure as a provisioning failure.
    ///
    /// Transport and HTTP failures keep their identity so callers can tell
    /// "the service refused" from "the service was unreachable".
    pub(crate) fn into_provisioning(self) -> Self {
        match self {
            Self::Rpc { code, message } => Self::Provisioning(format!("{code}: {message}")),
            Self::NotFound(m) => Self::Provisioning(format!("template not found: {m}")),
            other => other,
        }
    }

    /// Re-label argument failures as path failures for filesystem calls.
    pub(crate) fn into_path_error(self) -> Self {
        match self {
            Self::Rpc { code, message }
                if code == "invalid_argument" || code == "failed_precondition" =>
            {
                Self::InvalidPath(message)
            }
            other => other,
        }
    }

    /// Re-label argument failures as configuration failures.
    pub(crate) fn into_config_error(self) -> Self {
        match self {
            Self::Rpc { code, message } if code == "invalid_argument" => Self::Config(message),
            other => other,
        }
    }
}

/// HTTP status to service status code, as the daemon's Connect protocol does.
pub(crate) fn code_for_status(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "invalid_argument",
        401 => "unauthenticated",
        403 => "permission_denied",
        404 => "not_found",
        409 => "already_exists",
        412 => "failed_precondition",
        429 => "resource_exhausted",
        502 | 503 => "unavailable",
        504 => "deadline_exceeded",
        _ => "unknown",
    }
}

//! Error types for the transfer engine.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for transfer-engine operations.
pub type Result<T> = std::result::Result<T, DumpError>;

/// Main error type for the transfer engine.
///
/// Each variant corresponds to one error kind surfaced to the caller; the CLI
/// maps them to exit codes and human messages.
#[derive(Error, Debug)]
pub enum DumpError {
    // Configuration errors, detected before any I/O
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    // Remote authentication failure
    #[error("Authentication failed: {reason}")]
    Auth { reason: String },

    // Transient remote errors, retried internally
    #[error("Transient remote error: {reason}")]
    RemoteTransient { reason: String },

    // Permanent remote errors (4xx other than 413)
    #[error("Remote request failed: {reason}")]
    RemotePermanent { reason: String },

    #[error(
        "Request entity too large: {reason}. Consider the \"--vm-content-limit\" option, \
         or decrease \"--chunk-time-range\"/\"--chunk-rows\". If a proxy such as nginx or \
         Apache sits in front of the server, consider raising its maximum request body size"
    )]
    PayloadTooLarge { reason: String },

    // Archive corruption, unknown entries, missing meta
    #[error("Corrupted dump: {reason}")]
    Format { reason: String },

    #[error("Export aborted: server load is critical ({metric} at {value:.1}%, threshold {threshold:.1}%)")]
    LoadCritical { metric: String, value: f64, threshold: f64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DumpError {
    /// Classify an HTTP response status the way the adapters need it:
    /// 401/403 are auth failures, 413 is the dedicated payload kind,
    /// other 4xx are permanent, 5xx are transient.
    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        match status.as_u16() {
            401 | 403 => Self::Auth { reason: format!("{context}: HTTP {status}") },
            413 => Self::PayloadTooLarge { reason: format!("{context}: HTTP {status}") },
            400..=499 => Self::RemotePermanent { reason: format!("{context}: HTTP {status}") },
            _ => Self::RemoteTransient { reason: format!("{context}: HTTP {status}") },
        }
    }

    /// Wrap a reqwest transport error. Connection failures and timeouts are
    /// transient; everything else (builder misuse, redirect loops) is permanent.
    pub fn from_transport(err: reqwest::Error, context: &str) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            Self::RemoteTransient { reason: format!("{context}: {err}") }
        } else {
            Self::RemotePermanent { reason: format!("{context}: {err}") }
        }
    }

    /// Whether the retry loop may attempt this error again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RemoteTransient { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            DumpError::from_status(StatusCode::UNAUTHORIZED, "x"),
            DumpError::Auth { .. }
        ));
        assert!(matches!(
            DumpError::from_status(StatusCode::PAYLOAD_TOO_LARGE, "x"),
            DumpError::PayloadTooLarge { .. }
        ));
        assert!(matches!(
            DumpError::from_status(StatusCode::NOT_FOUND, "x"),
            DumpError::RemotePermanent { .. }
        ));
        assert!(matches!(
            DumpError::from_status(StatusCode::BAD_GATEWAY, "x"),
            DumpError::RemoteTransient { .. }
        ));
    }

    #[test]
    fn test_transient_flag() {
        assert!(DumpError::RemoteTransient { reason: "r".into() }.is_transient());
        assert!(!DumpError::RemotePermanent { reason: "r".into() }.is_transient());
        assert!(!DumpError::Cancelled.is_transient());
    }

    #[test]
    fn test_payload_too_large_guidance() {
        let msg = DumpError::PayloadTooLarge { reason: "import: HTTP 413".into() }.to_string();
        assert!(msg.contains("--vm-content-limit"));
        assert!(msg.contains("request body size"));
    }
}

//! Error types for portico
//!
//! Every failure the broker can hit is one `PorticoError` variant. Handlers
//! propagate them with `?`; the socket entry point turns them into an
//! [`ErrorReport`] and from there into an `Exception` frame.

use hyper::StatusCode;
use std::backtrace::Backtrace;

/// Main error type for portico operations
#[derive(Debug, thiserror::Error)]
pub enum PorticoError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PorticoError {
    /// HTTP-style status class for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Nats(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::WebSocket(_) => StatusCode::BAD_GATEWAY,
            Self::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short human title, shown by clients above the detail text
    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "Invalid argument",
            Self::Unauthorized(_) => "Unauthorized",
            Self::PermissionDenied(_) => "Permission denied",
            Self::NotFound(_) => "Not found",
            Self::Unavailable(_) => "Unavailable",
            Self::Database(_) => "Database error",
            Self::Nats(_) => "Messaging error",
            Self::WebSocket(_) => "Connection error",
            Self::Serialization(_) => "Serialization error",
            Self::Config(_) => "Configuration error",
            Self::Internal(_) => "Internal error",
        }
    }

    /// Detail text without the title prefix
    pub fn detail(&self) -> &str {
        match self {
            Self::InvalidArgument(d)
            | Self::Unauthorized(d)
            | Self::PermissionDenied(d)
            | Self::NotFound(d)
            | Self::Unavailable(d)
            | Self::Database(d)
            | Self::Nats(d)
            | Self::WebSocket(d)
            | Self::Serialization(d)
            | Self::Config(d)
            | Self::Internal(d) => d,
        }
    }

    /// Server-side faults page the operator; everything else is the caller's
    pub fn is_server_fault(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Convert to status code and body tuple for HTTP response
    pub fn into_status_code_and_body(self) -> (StatusCode, String) {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.title(),
            "message": self.detail(),
        });
        (status, body.to_string())
    }
}

/// Structured view of an error as it leaves the broker
///
/// Built where the error is reported, so `stack` is the call stack of the
/// reporting site (the handler that turns it into an Exception frame), not
/// of the code that first raised the error. The origin is carried by
/// `detail`. `Backtrace::capture` honours `RUST_BACKTRACE`.
#[derive(Debug)]
pub struct ErrorReport {
    pub title: &'static str,
    pub status: StatusCode,
    pub detail: String,
    pub stack: Backtrace,
}

impl ErrorReport {
    pub fn new(err: &PorticoError) -> Self {
        Self {
            title: err.title(),
            status: err.status_code(),
            detail: err.detail().to_string(),
            stack: Backtrace::capture(),
        }
    }

    /// Stack text to ship to the peer, if policy allows it
    pub fn exposed_stack(&self, expose_stacks: bool) -> Option<String> {
        if expose_stacks && self.status.is_server_error() {
            Some(self.stack.to_string())
        } else {
            None
        }
    }
}

impl From<std::io::Error> for PorticoError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for PorticoError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArgument(format!("JSON error: {}", err))
    }
}

impl From<rmp_serde::encode::Error> for PorticoError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for PorticoError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::InvalidArgument(format!("Malformed frame: {}", err))
    }
}

impl From<hyper::Error> for PorticoError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PorticoError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

impl From<async_nats::Error> for PorticoError {
    fn from(err: async_nats::Error) -> Self {
        Self::Nats(err.to_string())
    }
}

impl From<mongodb::error::Error> for PorticoError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<bson::ser::Error> for PorticoError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bson::de::Error> for PorticoError {
    fn from(err: bson::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for PorticoError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Unauthorized(format!("JWT error: {}", err))
    }
}

/// Result type alias for portico operations
pub type Result<T> = std::result::Result<T, PorticoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert_eq!(
            PorticoError::NotFound("session".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            PorticoError::PermissionDenied("org".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert!(PorticoError::Unavailable("no host".into()).is_server_fault());
        assert!(!PorticoError::InvalidArgument("id".into()).is_server_fault());
    }

    #[test]
    fn test_stack_only_exposed_for_server_faults() {
        let user = ErrorReport::new(&PorticoError::NotFound("page".into()));
        assert!(user.exposed_stack(true).is_none());

        let server = ErrorReport::new(&PorticoError::Database("down".into()));
        assert!(server.exposed_stack(true).is_some());
        assert!(server.exposed_stack(false).is_none());
        assert_eq!(server.detail, "down");
        assert_eq!(server.title, "Database error");
    }
}

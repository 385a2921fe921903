//! Error types and JSON error responses for workers and the supervisor

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::net::SocketAddr;

use crate::supervisor::WorkerId;

/// Failure to acquire the listening socket. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("invalid bind address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("address {addr} is already in use")]
    AddressInUse { addr: SocketAddr },

    #[error("failed to bind {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("no inherited listener: {0}")]
    NotInherited(String),
}

/// Failure to create a worker process.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker {worker_id} ({program}): {source}")]
    Io {
        worker_id: WorkerId,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {0} was spawned without control pipes")]
    MissingPipes(WorkerId),

    #[error("failed to encode worker settings: {0}")]
    Settings(#[from] serde_json::Error),
}

/// Per-request failure inside an application handler.
///
/// Always contained to the request that produced it.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("handler timed out")]
    Timeout,

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn code(&self) -> WorkerErrorCode {
        match self {
            HandlerError::Failed(_) => WorkerErrorCode::HandlerFailed,
            HandlerError::Upstream(_) => WorkerErrorCode::UpstreamFailed,
            HandlerError::Timeout => WorkerErrorCode::HandlerTimeout,
            HandlerError::Panicked(_) => WorkerErrorCode::HandlerPanicked,
        }
    }
}

/// Errors on the supervisor/worker control channel.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control channel closed")]
    Closed,

    #[error("malformed control message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("control pipe I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("supervisor is shutting down")]
    ShuttingDown,

    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    #[error("restart budget exhausted with no workers left")]
    RestartBudgetExhausted,

    #[error("supervisor control loop has exited")]
    Gone,
}

/// Error codes for responses generated by the worker itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerErrorCode {
    /// The application handler returned an error
    HandlerFailed,
    /// The application handler panicked
    HandlerPanicked,
    /// The application handler exceeded the handler timeout
    HandlerTimeout,
    /// The upstream application could not be reached
    UpstreamFailed,
    /// Request body exceeded the configured limit
    PayloadTooLarge,
    /// Request body could not be read
    BadRequest,
}

impl WorkerErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            WorkerErrorCode::HandlerFailed => StatusCode::INTERNAL_SERVER_ERROR,
            WorkerErrorCode::HandlerPanicked => StatusCode::INTERNAL_SERVER_ERROR,
            WorkerErrorCode::HandlerTimeout => StatusCode::GATEWAY_TIMEOUT,
            WorkerErrorCode::UpstreamFailed => StatusCode::BAD_GATEWAY,
            WorkerErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            WorkerErrorCode::BadRequest => StatusCode::BAD_REQUEST,
        }
    }

    /// Get the error code as a string for the X-Prefork-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            WorkerErrorCode::HandlerFailed => "HANDLER_FAILED",
            WorkerErrorCode::HandlerPanicked => "HANDLER_PANICKED",
            WorkerErrorCode::HandlerTimeout => "HANDLER_TIMEOUT",
            WorkerErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            WorkerErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            WorkerErrorCode::BadRequest => "BAD_REQUEST",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: WorkerErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: WorkerErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Prefork-Error header
pub fn json_error_response(code: WorkerErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);
    let mut response = Response::new(Full::new(Bytes::from(error.to_json())));
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        "x-prefork-error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            WorkerErrorCode::HandlerFailed.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            WorkerErrorCode::HandlerTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            WorkerErrorCode::UpstreamFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            WorkerErrorCode::PayloadTooLarge.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(WorkerErrorCode::HandlerFailed, "boom");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"HANDLER_FAILED\""));
        assert!(json.contains("\"message\":\"boom\""));
        assert!(json.contains("\"status\":500"));
    }

    #[test]
    fn test_json_error_response_headers() {
        let response = json_error_response(WorkerErrorCode::HandlerTimeout, "too slow");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("x-prefork-error").unwrap(),
            "HANDLER_TIMEOUT"
        );
    }

    #[test]
    fn test_handler_error_codes() {
        assert_eq!(
            HandlerError::Upstream("refused".into()).code(),
            WorkerErrorCode::UpstreamFailed
        );
        assert_eq!(
            HandlerError::Panicked("oops".into()).code(),
            WorkerErrorCode::HandlerPanicked
        );
        assert!(HandlerError::Timeout.to_string().contains("timed out"));
    }
}

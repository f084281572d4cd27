//! Error types and JSON error responses for the launch service

use crate::name::{InvalidName, Role};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Prefix the provisioning API uses for resource-exhaustion failures
pub const CAPACITY_REASON_PREFIX: &str = "RESOURCE:";

/// Failure reported by the provisioning API
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionError {
    /// The pool has no CPU/memory left for the unit
    #[error("insufficient capacity: {0}")]
    Capacity(String),
    /// The request was understood and refused
    #[error("provisioning request rejected: {0}")]
    Rejected(String),
    /// The API could not be reached or answered garbage
    #[error("provisioning API unavailable: {0}")]
    Transport(String),
}

impl ProvisionError {
    /// Classify a failure reason string reported by the provisioning API
    pub fn from_reason(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        if reason.starts_with(CAPACITY_REASON_PREFIX) {
            ProvisionError::Capacity(reason)
        } else {
            ProvisionError::Rejected(reason)
        }
    }

    pub fn is_capacity(&self) -> bool {
        matches!(self, ProvisionError::Capacity(_))
    }
}

/// Failure of a bounded wait
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("timed out after {}s waiting for {what}", .waited.as_secs())]
    Timeout { what: String, waited: Duration },
    #[error("no success after {attempts} attempts waiting for {what}")]
    Exhausted { what: String, attempts: u32 },
    #[error("check failed while waiting: {0}")]
    Check(anyhow::Error),
}

/// Failure of a launch request
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("invalid workload name: {0}")]
    InvalidName(#[from] InvalidName),
    #[error("timed out after {}s waiting for {what}", .waited.as_secs())]
    Timeout { what: String, waited: Duration },
    #[error("insufficient capacity after {attempts} attempts: {reason}")]
    CapacityExhausted { attempts: u32, reason: String },
    #[error("{role} unit {unit} stopped before it was running")]
    UnitStopped { role: Role, unit: String },
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error("lease store error: {0}")]
    Lease(anyhow::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<PollError> for LaunchError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::Timeout { what, waited } => LaunchError::Timeout { what, waited },
            PollError::Exhausted { what, attempts } => LaunchError::Other(anyhow::anyhow!(
                "no success after {} attempts waiting for {}",
                attempts,
                what
            )),
            PollError::Check(e) => match e.downcast::<ProvisionError>() {
                Ok(provision) => LaunchError::Provision(provision),
                Err(other) => LaunchError::Other(other),
            },
        }
    }
}

/// Error codes for responses of the launch service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Workload name is not a valid DNS label
    InvalidWorkloadName,
    /// Launch failed; details are only in the service log
    LaunchFailed,
    /// State-change event body could not be parsed
    InvalidEvent,
    /// No route for this path
    NotFound,
    /// Route exists but not for this method
    MethodNotAllowed,
    /// Internal service error
    InternalError,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidWorkloadName => StatusCode::BAD_REQUEST,
            ErrorCode::LaunchFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InvalidEvent => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value of the X-Wakegate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::InvalidWorkloadName => "INVALID_WORKLOAD_NAME",
            ErrorCode::LaunchFailed => "LAUNCH_FAILED",
            ErrorCode::InvalidEvent => "INVALID_EVENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Always "error"
    pub status: &'static str,
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: "error",
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"status":"error","code":"{}","message":"{}"}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

/// Create a JSON error response with X-Wakegate-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Wakegate-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

//! Failure taxonomy of the forwarding pipeline and its HTTP mapping.
//!
//! "No rule matched" is not an error: the pipeline hands the request back to the
//! fallback instead. Everything else ends the request with the status from
//! [`ForwardError::status`] and the body from [`ForwardError::client_body`], which never
//! carries script or transport detail. That detail goes to the log and the trace.

use std::time::Duration;

use hyper::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;

use crate::routing::RouteError;
use crate::rules::StoreError;
use crate::scripting::{ScriptError, ScriptRole};

#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("upstream did not respond within {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("upstream request failed: {0}")]
    Request(String),
    /// The status line arrived but the body could not be read.
    #[error("failed to read upstream response body: {message}")]
    Body {
        status: Option<StatusCode>,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("rule store failure: {0}")]
    Store(#[from] StoreError),
    #[error("method {actual} not allowed, rule expects {expected}")]
    MethodMismatch { expected: String, actual: String },
    #[error("request blocked by {role} script")]
    Blocked { role: ScriptRole },
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("invalid forward target: {0}")]
    InvalidTarget(#[from] RouteError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl ForwardError {
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ForwardError::MethodMismatch { .. } => StatusCode::METHOD_NOT_ALLOWED,
            ForwardError::Blocked { .. } => StatusCode::BAD_REQUEST,
            ForwardError::Script(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ForwardError::InvalidTarget(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ForwardError::Upstream(UpstreamError::Body {
                status: Some(status),
                ..
            }) => *status,
            ForwardError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Short machine-readable label used in the trace and in metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::Store(_) => "store",
            ForwardError::MethodMismatch { .. } => "method_mismatch",
            ForwardError::Blocked { .. } => "blocked",
            ForwardError::Script(e) => e.kind(),
            ForwardError::InvalidTarget(_) => "invalid_target",
            ForwardError::Upstream(UpstreamError::Timeout(_)) => "upstream_timeout",
            ForwardError::Upstream(UpstreamError::Request(_)) => "upstream_request",
            ForwardError::Upstream(UpstreamError::Body { .. }) => "upstream_body",
        }
    }

    /// `{ "error": ..., "details"?: ... }` safe to show the caller.
    pub fn client_body(&self) -> Value {
        match self {
            ForwardError::Store(_) => json!({
                "error": "Failed to load forward configuration"
            }),
            ForwardError::MethodMismatch { expected, .. } => json!({
                "error": "Method not allowed",
                "details": format!("This endpoint only accepts {expected} requests")
            }),
            ForwardError::Blocked { role } => json!({
                "error": "Request rejected",
                "details": match role {
                    ScriptRole::Param => "Parameter validation failed",
                    _ => "Header validation failed",
                }
            }),
            ForwardError::Script(e) if e.is_timeout() => json!({
                "error": "Script execution failed",
                "details": "script timed out"
            }),
            ForwardError::Script(_) => json!({
                "error": "Script execution failed"
            }),
            ForwardError::InvalidTarget(_) => json!({
                "error": "Invalid forward target"
            }),
            ForwardError::Upstream(e) => json!({
                "error": "Upstream request failed",
                "details": match e {
                    UpstreamError::Timeout(_) => "The upstream did not respond in time",
                    UpstreamError::Request(_) => "The upstream could not be reached",
                    UpstreamError::Body { .. } => "The upstream response could not be read",
                }
            }),
        }
    }
}

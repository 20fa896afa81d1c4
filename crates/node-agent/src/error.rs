//! HTTP-facing errors of the node agent.

use crate::identity::IdentityError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ipam_core::IpamError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that stop the agent process
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),
    
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),
    
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error body returned by every failing endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable message
    pub error: String,
    /// One of the `ApiError::code` values
    pub code: String,
}

/// Errors surfaced to callers of the node agent
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed identity, path or body; not retried by the caller
    #[error("bad request: {0}")]
    BadRequest(String),
    
    #[error("not found: {0}")]
    NotFound(String),
    
    #[error("method not allowed")]
    MethodNotAllowed,
    
    /// No block or address capacity is left in the pool
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),
    
    /// Grant wait timed out or the cluster API is unreachable
    #[error("unavailable: {0}")]
    Unavailable(String),
    
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status the error is answered with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::PoolExhausted(_) | Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
    
    /// Stable machine-readable code carried in `ErrorResponse::code`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            Self::PoolExhausted(_) => "POOL_EXHAUSTED",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<IpamError> for ApiError {
    fn from(err: IpamError) -> Self {
        match err {
            IpamError::PoolExhausted(msg) => Self::PoolExhausted(msg),
            IpamError::NotFound(msg) => Self::NotFound(msg),
            IpamError::Conflict(msg) | IpamError::Transient(msg) | IpamError::Timeout(msg) => {
                Self::Unavailable(msg)
            }
            e @ (IpamError::PoolNotFound(_) | IpamError::InvalidPool(_) | IpamError::Internal(_)) => {
                Self::Internal(e.to_string())
            }
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self);
        }
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

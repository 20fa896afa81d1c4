//! IPAM errors

use thiserror::Error;

/// Errors that can occur while allocating blocks or talking to the cluster store
#[derive(Debug, Error)]
pub enum IpamError {
    /// The named AddressPool does not exist
    #[error("Address pool not found: {0}")]
    PoolNotFound(String),
    
    /// The AddressPool spec cannot be laid out (bad subnet, block too large)
    #[error("Invalid address pool: {0}")]
    InvalidPool(String),
    
    /// A named object (block, request, node) does not exist
    #[error("Not found: {0}")]
    NotFound(String),
    
    /// No free block or address capacity is left
    #[error("Pool exhausted: {0}")]
    PoolExhausted(String),
    
    /// Lost an optimistic-concurrency race (stale resource version or name taken)
    #[error("Conflict: {0}")]
    Conflict(String),
    
    /// The cluster API could not be reached or answered with a server error
    #[error("Transient cluster error: {0}")]
    Transient(String),
    
    /// Waiting for an asynchronous grant exceeded its bound
    #[error("Timed out: {0}")]
    Timeout(String),
    
    /// An invariant was violated
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IpamError {
    /// Whether the operation may succeed if simply tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Transient(_) | Self::Timeout(_))
    }
}

impl From<kube::Error> for IpamError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(response) if response.code == 409 => Self::Conflict(err.to_string()),
            kube::Error::Api(response) if response.code == 404 => Self::NotFound(err.to_string()),
            _ => Self::Transient(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for IpamError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failed: {err}"))
    }
}

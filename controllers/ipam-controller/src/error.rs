//! Controller-specific error types.

use ipam_core::IpamError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the IPAM Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Allocation layer error (includes classified cluster API failures)
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),
    
    /// Kubernetes client error outside the allocation layer
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),
    
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    
    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),
    
    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

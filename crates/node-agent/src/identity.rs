//! Pod identity: the key of the node-local allocation table.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a pod identity was rejected
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity must have exactly 3 path segments, got {0}")]
    SegmentCount(usize),
    
    #[error("identity field '{0}' must not be empty")]
    EmptyField(&'static str),
}

/// One address consumer: a container (or one of its interfaces) of a pod
///
/// Multi-interface pods fold the interface into `container_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodIdentity {
    pub pod_namespace: String,
    pub pod_name: String,
    pub container_id: String,
}

impl PodIdentity {
    pub fn new(
        pod_namespace: impl Into<String>,
        pod_name: impl Into<String>,
        container_id: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let identity = Self {
            pod_namespace: pod_namespace.into(),
            pod_name: pod_name.into(),
            container_id: container_id.into(),
        };
        identity.validate()?;
        Ok(identity)
    }
    
    /// Parses `{namespace}/{pod}/{containerId}`, the part of a request path after `/ip/`.
    pub fn from_path(key: &str) -> Result<Self, IdentityError> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [namespace, pod, container] => Self::new(*namespace, *pod, *container),
            _ => Err(IdentityError::SegmentCount(parts.len())),
        }
    }
    
    /// Rejects empty fields; deserialized identities are not validated otherwise.
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.pod_namespace.is_empty() {
            return Err(IdentityError::EmptyField("podNamespace"));
        }
        if self.pod_name.is_empty() {
            return Err(IdentityError::EmptyField("podName"));
        }
        if self.container_id.is_empty() {
            return Err(IdentityError::EmptyField("containerId"));
        }
        Ok(())
    }
    
    /// Request path of this identity on the node agent surface.
    pub fn path(&self) -> String {
        format!("/ip/{self}")
    }
}

impl fmt::Display for PodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.pod_namespace, self.pod_name, self.container_id)
    }
}

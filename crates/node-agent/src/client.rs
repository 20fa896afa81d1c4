//! Typed client for the node agent's HTTP surface
//!
//! Used on the container-runtime plugin side: `allocate` on pod creation,
//! `release` on pod teardown.

use crate::allocator::Allocation;
use crate::error::ErrorResponse;
use crate::identity::PodIdentity;
use crate::server::StatusResponse;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors returned by `AgentClient`
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    
    /// The agent answered with an error status
    #[error("agent returned {status}: {} ({})", .body.error, .body.code)]
    Api {
        /// HTTP status code
        status: u16,
        /// Decoded error body
        body: ErrorResponse,
    },
}

impl ClientError {
    /// Error code of an agent-side failure (`POOL_EXHAUSTED`, `UNAVAILABLE`, ...).
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { body, .. } => Some(&body.code),
            Self::Http(_) => None,
        }
    }
}

/// Client of one node agent
#[derive(Debug, Clone)]
pub struct AgentClient {
    client: Client,
    base_url: String,
}

impl AgentClient {
    /// Create a client for the agent listening at `base_url` (e.g. "http://127.0.0.1:9384").
    ///
    /// `timeout` should exceed the agent's block request timeout, or slow
    /// allocations will be cut off client-side.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
    
    /// Agent URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
    
    /// Health and capacity of the agent.
    pub async fn status(&self) -> Result<StatusResponse, ClientError> {
        let response = self.client.get(format!("{}/status", self.base_url)).send().await?;
        parse(response).await
    }
    
    /// Allocates (or returns the existing) address of `identity`.
    pub async fn allocate(&self, identity: &PodIdentity) -> Result<Allocation, ClientError> {
        debug!("Requesting address for {}", identity);
        let response = self
            .client
            .post(format!("{}/ip", self.base_url))
            .json(identity)
            .send()
            .await?;
        parse(response).await
    }
    
    /// Address bound to `identity`, if any.
    pub async fn lookup(&self, identity: &PodIdentity) -> Result<Option<Allocation>, ClientError> {
        let response = self.client.get(self.identity_url(identity)).send().await?;
        parse_optional(response).await
    }
    
    /// Releases the address bound to `identity`; `None` if nothing was bound.
    pub async fn release(&self, identity: &PodIdentity) -> Result<Option<Allocation>, ClientError> {
        debug!("Releasing address of {}", identity);
        let response = self.client.delete(self.identity_url(identity)).send().await?;
        parse_optional(response).await
    }
    
    fn identity_url(&self, identity: &PodIdentity) -> String {
        format!("{}{}", self.base_url, identity.path())
    }
}

async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let text = response.text().await.unwrap_or_default();
    let body = serde_json::from_str(&text).unwrap_or_else(|_| ErrorResponse {
        error: text,
        code: status.canonical_reason().unwrap_or("UNKNOWN").to_string(),
    });
    Err(ClientError::Api {
        status: status.as_u16(),
        body,
    })
}

async fn parse_optional<T: DeserializeOwned>(response: Response) -> Result<Option<T>, ClientError> {
    if response.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    parse(response).await.map(Some)
}

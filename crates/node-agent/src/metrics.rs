//! Prometheus metrics of the node agent, served on their own listener.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Counters and gauges of one agent, in their own registry
#[derive(Clone)]
pub struct AgentMetrics {
    registry: Registry,
    /// `ipamd_allocations_total`
    pub allocations: IntCounter,
    /// `ipamd_releases_total`
    pub releases: IntCounter,
    /// `ipamd_allocation_failures_total`
    pub allocation_failures: IntCounter,
    /// `ipamd_block_requests_total`
    pub block_requests: IntCounter,
    /// `ipamd_owned_blocks`
    pub owned_blocks: IntGauge,
    /// `ipamd_allocated_addresses`
    pub allocated_addresses: IntGauge,
}

impl std::fmt::Debug for AgentMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentMetrics")
            .field("allocations", &self.allocations.get())
            .field("releases", &self.releases.get())
            .field("owned_blocks", &self.owned_blocks.get())
            .field("allocated_addresses", &self.allocated_addresses.get())
            .finish_non_exhaustive()
    }
}

impl AgentMetrics {
    /// Creates the metrics and registers them in a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let metrics = Self {
            allocations: IntCounter::new("ipamd_allocations_total", "Addresses handed out to pods")?,
            releases: IntCounter::new("ipamd_releases_total", "Addresses returned by pods")?,
            allocation_failures: IntCounter::new(
                "ipamd_allocation_failures_total",
                "Allocation requests that failed",
            )?,
            block_requests: IntCounter::new(
                "ipamd_block_requests_total",
                "BlockRequests created by this node",
            )?,
            owned_blocks: IntGauge::new("ipamd_owned_blocks", "AddressBlocks currently owned by this node")?,
            allocated_addresses: IntGauge::new(
                "ipamd_allocated_addresses",
                "Addresses currently allocated on this node",
            )?,
            registry,
        };
        
        metrics.registry.register(Box::new(metrics.allocations.clone()))?;
        metrics.registry.register(Box::new(metrics.releases.clone()))?;
        metrics.registry.register(Box::new(metrics.allocation_failures.clone()))?;
        metrics.registry.register(Box::new(metrics.block_requests.clone()))?;
        metrics.registry.register(Box::new(metrics.owned_blocks.clone()))?;
        metrics.registry.register(Box::new(metrics.allocated_addresses.clone()))?;
        
        Ok(metrics)
    }
    
    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

async fn metrics_handler(State(metrics): State<Arc<AgentMetrics>>) -> impl IntoResponse {
    match metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Router exposing `GET /metrics`.
pub fn metrics_router(metrics: Arc<AgentMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

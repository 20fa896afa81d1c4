//! ipamd: per-node address allocation daemon
//!
//! Serves the allocation API for the container-runtime plugin, exports
//! metrics and periodically hands idle blocks back to the pool.

use ipam_core::KubeStore;
use node_agent::{metrics_router, router, AgentConfig, AgentError, AgentMetrics, LocalAddressAllocator, StateFile};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AgentError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    
    // kube's rustls client needs a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();
    
    info!("Starting ipamd");
    
    let config = AgentConfig::from_env()?;
    
    info!("Configuration:");
    info!("  Node: {}", config.node_name);
    info!("  Pool: {}", config.pool_name);
    info!("  Listen address: {}", config.listen_addr);
    info!("  Metrics address: {}", config.metrics_addr);
    info!("  Block request timeout: {}s", config.request_timeout.as_secs());
    info!("  State file: {}", config.state_path.display());
    info!("  Idle block sweep: {}s", config.idle_block_sweep.as_secs());
    
    let client = kube::Client::try_default().await?;
    let store = Arc::new(KubeStore::new(client));
    let metrics = Arc::new(AgentMetrics::new()?);
    
    let allocator = Arc::new(
        LocalAddressAllocator::new(config.allocator_settings(), store, metrics.clone())
            .with_state_file(StateFile::new(&config.state_path)),
    );
    allocator.recover().await?;
    
    let api_listener = TcpListener::bind(config.listen_addr).await?;
    let metrics_listener = TcpListener::bind(config.metrics_addr).await?;
    info!("Serving allocation API on {}", config.listen_addr);
    info!("Serving metrics on {}", config.metrics_addr);
    
    let app = router(allocator.clone());
    let api_server: JoinHandle<std::io::Result<()>> = tokio::spawn(async move {
        axum::serve(api_listener, app).await
    });
    let metrics_server: JoinHandle<std::io::Result<()>> = tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_router(metrics)).await
    });
    let idle_sweep = tokio::spawn(sweep_idle_blocks(allocator, config.idle_block_sweep));
    
    tokio::select! {
        result = api_server => {
            error!("Allocation API server exited: {:?}", result);
        }
        result = metrics_server => {
            error!("Metrics server exited: {:?}", result);
        }
        _ = idle_sweep => {
            error!("Idle block sweep exited");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down ipamd");
        }
    }
    
    Ok(())
}

/// Hands owned blocks without allocations back to the pool every `period`.
async fn sweep_idle_blocks(allocator: Arc<LocalAddressAllocator>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately; recovery just ran
    interval.tick().await;
    
    loop {
        interval.tick().await;
        match allocator.relinquish_idle_blocks().await {
            Ok(released) if released.is_empty() => {}
            Ok(released) => info!("Relinquished {} idle blocks: {:?}", released.len(), released),
            Err(e) => warn!("Idle block sweep failed: {}", e),
        }
    }
}

//! IPAM Controller
//!
//! Cluster tier of the block IPAM:
//! - BlockRequest: grants each node request exactly one AddressBlock
//! - AddressPool: publishes capacity and guards deletion
//! - Node: releases blocks of nodes that left the cluster

mod backoff;
mod config;
mod controller;
mod error;
mod reclaimer;
mod reconciler;
mod watcher;

use crate::config::ControllerSettings;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    
    // kube's rustls client needs a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();
    
    info!("Starting IPAM Controller");
    
    let settings = ControllerSettings::from_env()?;
    
    info!("Configuration:");
    info!("  Reconcile concurrency: {}", settings.reconcile_concurrency);
    info!("  Startup sweep: {}", settings.startup_sweep);
    info!("  Reclaim sweep: {}s", settings.reclaim_sweep_interval.as_secs());
    
    let controller = Controller::new(settings).await?;
    controller.run().await?;
    
    Ok(())
}

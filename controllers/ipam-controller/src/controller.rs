//! Main controller implementation.
//!
//! Wires the reconcilers and the reclaimer to the cluster and runs one
//! watcher task per resource kind, plus the periodic reclaim sweep.

use crate::config::ControllerSettings;
use crate::error::ControllerError;
use crate::reclaimer::NodeBlockReclaimer;
use crate::reconciler::{AddressPoolReconciler, BlockRequestReconciler};
use crate::watcher::{watch_nodes, watch_resource};
use crds::{AddressPool, BlockRequest};
use ipam_core::{IpamStore, KubeStore};
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Main controller for block IPAM.
pub struct Controller {
    block_request_watcher: JoinHandle<Result<(), ControllerError>>,
    address_pool_watcher: JoinHandle<Result<(), ControllerError>>,
    node_watcher: JoinHandle<Result<(), ControllerError>>,
    reclaim_sweeper: JoinHandle<()>,
}

impl Controller {
    /// Creates a new controller instance and starts its watchers.
    pub async fn new(settings: ControllerSettings) -> Result<Self, ControllerError> {
        info!("Initializing IPAM Controller");
        
        let kube_client = Client::try_default().await?;
        let store: Arc<dyn IpamStore> = Arc::new(KubeStore::new(kube_client.clone()));
        
        let reclaimer = Arc::new(NodeBlockReclaimer::new(store.clone()));
        if settings.startup_sweep {
            info!("Performing startup sweep for blocks of removed nodes...");
            match reclaimer.sweep().await {
                Ok(report) => info!(
                    "Startup sweep completed: {} released, {} failed",
                    report.released.len(),
                    report.failed.len()
                ),
                Err(e) => warn!("Startup sweep failed (will continue): {}", e),
            }
        }
        
        let block_request_api: Api<BlockRequest> = Api::all(kube_client.clone());
        let address_pool_api: Api<AddressPool> = Api::all(kube_client.clone());
        let node_api: Api<Node> = Api::all(kube_client);
        
        let block_requests = Arc::new(BlockRequestReconciler::new(store.clone()));
        let address_pools = Arc::new(AddressPoolReconciler::new(store));
        let concurrency = settings.reconcile_concurrency;
        
        let block_request_watcher = tokio::spawn(async move {
            watch_resource(block_request_api, block_requests, concurrency).await
        });
        
        let address_pool_watcher = tokio::spawn(async move {
            watch_resource(address_pool_api, address_pools, concurrency).await
        });
        
        let reclaim_sweeper = tokio::spawn(reclaimer.clone().sweep_periodically(settings.reclaim_sweep_interval));
        
        let node_watcher = tokio::spawn(async move {
            watch_nodes(node_api, reclaimer).await
        });
        
        Ok(Self {
            block_request_watcher,
            address_pool_watcher,
            node_watcher,
            reclaim_sweeper,
        })
    }
    
    /// Runs the controller until a watcher exits.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("IPAM Controller running");
        
        // Watchers run forever; any exit ends the process
        tokio::select! {
            result = &mut self.block_request_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("BlockRequest watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("BlockRequest watcher error: {}", e)))?;
            }
            result = &mut self.address_pool_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("AddressPool watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("AddressPool watcher error: {}", e)))?;
            }
            result = &mut self.node_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Node watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("Node watcher error: {}", e)))?;
            }
            result = &mut self.reclaim_sweeper => {
                result.map_err(|e| ControllerError::Watch(format!("Reclaim sweep panicked: {}", e)))?;
                return Err(ControllerError::Watch("Reclaim sweep exited".to_string()));
            }
        }
        
        Ok(())
    }
}

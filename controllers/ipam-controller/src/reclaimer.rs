//! Node block reclaimer
//!
//! Releases AddressBlocks whose owner node has left the cluster. Runs on
//! node-delete events and as a sweep that compares every block's owner
//! with the current node set. The sweep repeats on a fixed period, which
//! is also how releases that failed earlier get retried. Every path goes
//! through the same conditional release, so they are safe to run
//! concurrently with each other and with block allocation.

use crate::error::ControllerError;
use ipam_core::{BlockAllocator, IpamStore};
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Result of one reclaim pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Blocks whose owner was cleared by this pass
    pub released: Vec<String>,
    /// Blocks that could not be released, with the error; retried on the next pass
    pub failed: Vec<(String, String)>,
}

/// Returns blocks of nodes that left the cluster to their pool
pub struct NodeBlockReclaimer {
    store: Arc<dyn IpamStore>,
    allocator: BlockAllocator,
}

impl NodeBlockReclaimer {
    /// Creates a reclaimer releasing blocks through `store`.
    pub fn new(store: Arc<dyn IpamStore>) -> Self {
        let allocator = BlockAllocator::new(store.clone());
        Self { store, allocator }
    }
    
    /// Releases every block owned by `node`, which was just removed from the cluster.
    pub async fn on_node_removed(&self, node: &str) -> Result<ReclaimReport, ControllerError> {
        let blocks = self.store.list_blocks_by_node(node).await?;
        if blocks.is_empty() {
            debug!("Removed node {} owned no blocks", node);
            return Ok(ReclaimReport::default());
        }
        
        // A node that re-registered under the same name keeps its blocks
        let nodes = self.store.list_nodes().await?;
        if nodes.iter().any(|n| n == node) {
            info!("Node {} is present again, not reclaiming its blocks", node);
            return Ok(ReclaimReport::default());
        }
        
        info!("Reclaiming {} blocks of removed node {}", blocks.len(), node);
        let candidates = blocks.iter().map(|b| (b.name_any(), node.to_string())).collect();
        Ok(self.release_all(candidates).await)
    }
    
    /// Releases every block whose owner is not a current cluster node.
    pub async fn sweep(&self) -> Result<ReclaimReport, ControllerError> {
        // Blocks before nodes: a node that joins in between cannot have its
        // fresh blocks mistaken for orphans
        let blocks = self.store.list_blocks(None).await?;
        let nodes: HashSet<String> = self.store.list_nodes().await?.into_iter().collect();
        
        let candidates: Vec<(String, String)> = blocks
            .iter()
            .filter_map(|b| {
                let owner = b.spec.owner_node.as_ref()?;
                (!nodes.contains(owner)).then(|| (b.name_any(), owner.clone()))
            })
            .collect();
        
        info!(
            "Reclaim sweep: {} blocks, {} nodes, {} orphaned",
            blocks.len(),
            nodes.len(),
            candidates.len()
        );
        Ok(self.release_all(candidates).await)
    }
    
    /// Sweeps every `period`, forever. The first sweep runs one period from now.
    pub async fn sweep_periodically(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        
        loop {
            interval.tick().await;
            match self.sweep().await {
                Ok(report) if !report.failed.is_empty() => warn!(
                    "Periodic reclaim sweep released {} blocks, {} failed",
                    report.released.len(),
                    report.failed.len()
                ),
                Ok(report) if !report.released.is_empty() => {
                    info!("Periodic reclaim sweep released {} blocks", report.released.len());
                }
                Ok(_) => {}
                Err(e) => error!("Periodic reclaim sweep failed: {}", e),
            }
        }
    }
    
    async fn release_all(&self, candidates: Vec<(String, String)>) -> ReclaimReport {
        let mut report = ReclaimReport::default();
        for (block, owner) in candidates {
            match self.allocator.release_block_owned_by(&block, &owner).await {
                Ok(true) => report.released.push(block),
                Ok(false) => debug!("Block {} no longer owned by {}", block, owner),
                Err(e) => {
                    warn!("Failed to release block {} of node {}: {}", block, owner, e);
                    report.failed.push((block, e.to_string()));
                }
            }
        }
        report
    }
}

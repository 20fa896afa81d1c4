//! BlockRequest reconciler
//!
//! Turns a node's BlockRequest into exactly one AddressBlock assignment.
//! The AddressBlock whose request token equals the request UID is the
//! idempotency record: if it exists, the request was already serviced
//! (possibly by an attempt that crashed before writing status) and the
//! allocator is not called again.

use super::Reconcile;
use crate::error::ControllerError;
use chrono::Utc;
use crds::{BlockRequest, BlockRequestStatus};
use ipam_core::{BlockAllocator, IpamError, IpamStore};
use kube::ResourceExt;
use kube_runtime::controller::Action;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Grants one AddressBlock per BlockRequest and records the outcome in its status
pub struct BlockRequestReconciler {
    store: Arc<dyn IpamStore>,
    allocator: BlockAllocator,
}

impl BlockRequestReconciler {
    /// Creates a reconciler that allocates blocks through `store`.
    pub fn new(store: Arc<dyn IpamStore>) -> Self {
        let allocator = BlockAllocator::new(store.clone());
        Self { store, allocator }
    }
    
    async fn write_status(
        &self,
        request: &BlockRequest,
        status: BlockRequestStatus,
    ) -> Result<(), ControllerError> {
        self.store.update_block_request_status(request, &status).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Reconcile for BlockRequestReconciler {
    type Resource = BlockRequest;
    
    fn kind(&self) -> &'static str {
        "BlockRequest"
    }
    
    /// New requests are processed; updates only while no condition is recorded.
    fn should_process(&self, old: Option<&BlockRequest>, new: &BlockRequest) -> bool {
        old.is_none() || !new.has_conditions()
    }
    
    async fn reconcile(&self, request: &BlockRequest) -> Result<Action, ControllerError> {
        let name = request.name_any();
        let token = request.uid().ok_or_else(|| {
            ControllerError::Reconciliation(format!("BlockRequest {} has no uid", name))
        })?;
        let completed = request.status.as_ref().is_some_and(BlockRequestStatus::is_complete);
        
        let serviced = self.store.list_blocks_by_request(&token).await?;
        if let Some(block) = serviced.first() {
            if completed {
                debug!("BlockRequest {} already completed with block {}", name, block.name_any());
                return Ok(Action::await_change());
            }
            info!("BlockRequest {} was already serviced by block {}", name, block.name_any());
            self.write_status(request, BlockRequestStatus::allocated(&block.name_any(), Utc::now()))
                .await?;
            return Ok(Action::await_change());
        }
        
        if completed {
            debug!("BlockRequest {} is terminal, nothing to do", name);
            return Ok(Action::await_change());
        }
        
        let pool = &request.spec.pool_name;
        let node = &request.spec.node_name;
        info!("Reconciling BlockRequest {} (pool {}, node {})", name, pool, node);
        
        match self.allocator.allocate_block(pool, node, &token).await {
            Ok(block) => {
                let block_name = block.name_any();
                self.write_status(request, BlockRequestStatus::allocated(&block_name, Utc::now()))
                    .await?;
                info!("BlockRequest {} granted block {} ({})", name, block_name, block.spec.cidr);
            }
            Err(IpamError::PoolExhausted(msg)) => {
                warn!("BlockRequest {} failed: {}", name, msg);
                self.write_status(request, BlockRequestStatus::out_of_blocks(pool, Utc::now()))
                    .await?;
            }
            Err(e) => return Err(e.into()),
        }
        
        Ok(Action::await_change())
    }
}

#[cfg(test)]
#[path = "block_request_test.rs"]
mod block_request_test;

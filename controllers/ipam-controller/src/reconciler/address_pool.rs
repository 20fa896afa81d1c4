//! AddressPool reconciler
//!
//! Publishes block capacity in the pool status and guards pool deletion
//! with a finalizer while any block of the pool is still owned by a node.

use super::Reconcile;
use crate::error::ControllerError;
use crds::{AddressPool, AddressPoolStatus, POOL_FINALIZER};
use ipam_core::{IpamError, IpamStore, PoolLayout};
use kube::ResourceExt;
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often capacity is refreshed without a pool event
const STATUS_REFRESH: Duration = Duration::from_secs(60);

/// How often a deleted pool with owned blocks is re-checked
const DELETION_RECHECK: Duration = Duration::from_secs(30);

/// Keeps pool status current and holds the deletion finalizer while blocks are owned
pub struct AddressPoolReconciler {
    store: Arc<dyn IpamStore>,
}

impl AddressPoolReconciler {
    /// Creates a reconciler reading pools and blocks through `store`.
    pub fn new(store: Arc<dyn IpamStore>) -> Self {
        Self { store }
    }
    
    fn desired_status(pool: &AddressPool, owned_blocks: u64) -> AddressPoolStatus {
        match PoolLayout::from_pool(pool) {
            Ok(layout) => {
                let total_blocks = layout.block_count();
                AddressPoolStatus {
                    total_blocks,
                    allocated_blocks: owned_blocks,
                    available_blocks: total_blocks.saturating_sub(owned_blocks),
                    error: None,
                }
            }
            Err(IpamError::InvalidPool(msg)) => AddressPoolStatus {
                allocated_blocks: owned_blocks,
                error: Some(msg),
                ..Default::default()
            },
            Err(e) => AddressPoolStatus {
                allocated_blocks: owned_blocks,
                error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }
}

#[async_trait::async_trait]
impl Reconcile for AddressPoolReconciler {
    type Resource = AddressPool;
    
    fn kind(&self) -> &'static str {
        "AddressPool"
    }
    
    async fn reconcile(&self, pool: &AddressPool) -> Result<Action, ControllerError> {
        let name = pool.name_any();
        let blocks = self.store.list_blocks(Some(&name)).await?;
        let owned = blocks.iter().filter(|b| !b.spec.is_free()).count() as u64;
        let has_finalizer = pool.finalizers().iter().any(|f| f == POOL_FINALIZER);
        
        if pool.metadata.deletion_timestamp.is_some() {
            if owned > 0 {
                info!("AddressPool {} is being deleted but {} blocks are still owned", name, owned);
                return Ok(Action::requeue(DELETION_RECHECK));
            }
            if has_finalizer {
                info!("AddressPool {} has no owned blocks, allowing deletion", name);
                self.store.set_pool_finalizer(pool, false).await?;
            }
            return Ok(Action::await_change());
        }
        
        if !has_finalizer {
            debug!("Adding finalizer to AddressPool {}", name);
            self.store.set_pool_finalizer(pool, true).await?;
        }
        
        let status = Self::desired_status(pool, owned);
        if let Some(error) = &status.error {
            warn!("AddressPool {} is invalid: {}", name, error);
        }
        if pool.status.as_ref() != Some(&status) {
            info!(
                "AddressPool {}: {}/{} blocks allocated",
                name, status.allocated_blocks, status.total_blocks
            );
            self.store.update_pool_status(&name, &status).await?;
        }
        
        Ok(Action::requeue(STATUS_REFRESH))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipam_core::{BlockAllocator, MemoryStore};

    fn setup() -> (MemoryStore, BlockAllocator, AddressPoolReconciler) {
        let store = MemoryStore::new();
        let allocator = BlockAllocator::new(Arc::new(store.clone()));
        let reconciler = AddressPoolReconciler::new(Arc::new(store.clone()));
        (store, allocator, reconciler)
    }

    #[tokio::test]
    async fn test_publishes_capacity_and_adds_finalizer() {
        let (store, allocator, reconciler) = setup();
        let pool = store.add_pool("default", "10.1.0.0/16", 8);
        allocator.allocate_block("default", "node1", "req-1").await.unwrap();
        allocator.allocate_block("default", "node2", "req-2").await.unwrap();
        allocator.release_block("default-1").await.unwrap();
        
        reconciler.reconcile(&pool).await.unwrap();
        
        let pool = store.pool("default").unwrap();
        assert!(pool.finalizers().iter().any(|f| f == POOL_FINALIZER));
        assert_eq!(pool.status, Some(AddressPoolStatus {
            total_blocks: 256,
            allocated_blocks: 1,
            available_blocks: 255,
            error: None,
        }));
    }

    #[tokio::test]
    async fn test_reports_invalid_pool() {
        let (store, _allocator, reconciler) = setup();
        let pool = store.add_pool("broken", "10.1.0.0/24", 9);
        
        reconciler.reconcile(&pool).await.unwrap();
        
        let status = store.pool("broken").unwrap().status.unwrap();
        assert_eq!(status.total_blocks, 0);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn test_deletion_waits_for_owned_blocks() {
        let (store, allocator, reconciler) = setup();
        store.add_pool("default", "10.1.0.0/24", 7);
        reconciler.reconcile(&store.pool("default").unwrap()).await.unwrap();
        allocator.allocate_block("default", "node1", "req-1").await.unwrap();
        
        store.delete_pool("default");
        let deleting = store.pool("default").unwrap();
        let action = reconciler.reconcile(&deleting).await.unwrap();
        assert_eq!(action, Action::requeue(DELETION_RECHECK));
        assert!(store.pool("default").is_some());
        
        allocator.release_block("default-0").await.unwrap();
        let deleting = store.pool("default").unwrap();
        reconciler.reconcile(&deleting).await.unwrap();
        assert!(store.pool("default").is_none());
    }
}

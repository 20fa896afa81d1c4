//! In-memory `IpamStore` for unit testing
//!
//! Stores resources in memory and enforces resource versions on conditional
//! writes the way the API server does, so lost races surface as
//! `IpamError::Conflict` in tests.

use crate::allocator::BlockAllocator;
use crate::error::IpamError;
use crate::store::IpamStore;
use chrono::Utc;
use crds::{
    AddressBlock, AddressPool, AddressPoolSpec, AddressPoolStatus, BlockRequest, BlockRequestSpec,
    BlockRequestStatus, POOL_FINALIZER,
};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct Inner {
    pools: BTreeMap<String, AddressPool>,
    blocks: BTreeMap<String, AddressBlock>,
    requests: BTreeMap<String, BlockRequest>,
    nodes: BTreeSet<String>,
    next_version: u64,
    failing_blocks: HashSet<String>,
    injected_conflicts: usize,
    block_owner_writes: usize,
    request_status_writes: usize,
}

impl Inner {
    fn bump(&mut self, meta: &mut ObjectMeta) {
        self.next_version += 1;
        meta.resource_version = Some(self.next_version.to_string());
    }
}

/// Mock `IpamStore` for testing
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

fn check_version(current: &ObjectMeta, given: &ObjectMeta, kind: &str) -> Result<(), IpamError> {
    if current.resource_version != given.resource_version {
        return Err(IpamError::Conflict(format!(
            "{kind} {} was modified (have {:?}, stored {:?})",
            given.name.as_deref().unwrap_or("<unknown>"),
            given.resource_version,
            current.resource_version
        )));
    }
    Ok(())
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a pool (for test setup)
    pub fn add_pool(&self, name: &str, subnet: &str, block_size_bits: u8) -> AddressPool {
        let mut inner = self.lock();
        let mut pool = AddressPool::new(name, AddressPoolSpec {
            subnet: subnet.to_string(),
            block_size_bits,
        });
        pool.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        inner.bump(&mut pool.metadata);
        inner.pools.insert(name.to_string(), pool.clone());
        pool
    }

    /// Delete a pool; it lingers with a deletion timestamp while finalizers remain
    pub fn delete_pool(&self, name: &str) {
        let mut inner = self.lock();
        if let Some(mut pool) = inner.pools.remove(name) {
            if pool.finalizers().is_empty() {
                return;
            }
            pool.metadata.deletion_timestamp =
                serde_json::from_value(serde_json::json!("2025-01-01T00:00:00Z")).ok();
            inner.bump(&mut pool.metadata);
            inner.pools.insert(name.to_string(), pool);
        }
    }

    /// Add a node to the cluster membership (for test setup)
    pub fn add_node(&self, name: &str) {
        self.lock().nodes.insert(name.to_string());
    }

    /// Remove a node from the cluster membership
    pub fn remove_node(&self, name: &str) {
        self.lock().nodes.remove(name);
    }

    /// Make every owner write to `block` fail with a transient error
    pub fn fail_block_writes(&self, block: &str) {
        self.lock().failing_blocks.insert(block.to_string());
    }

    /// Let owner writes to `block` succeed again
    pub fn heal_block_writes(&self, block: &str) {
        self.lock().failing_blocks.remove(block);
    }

    /// Make the next `n` block owner writes lose their race
    pub fn inject_conflicts(&self, n: usize) {
        self.lock().injected_conflicts = n;
    }

    /// Number of successful owner writes to blocks so far
    pub fn block_owner_writes(&self) -> usize {
        self.lock().block_owner_writes
    }

    /// Number of successful BlockRequest status writes so far
    pub fn request_status_writes(&self) -> usize {
        self.lock().request_status_writes
    }

    /// All blocks, ordered by name
    pub fn blocks(&self) -> Vec<AddressBlock> {
        self.lock().blocks.values().cloned().collect()
    }

    /// All requests without a terminal condition
    pub fn pending_requests(&self) -> Vec<BlockRequest> {
        self.lock()
            .requests
            .values()
            .filter(|r| !r.status.as_ref().is_some_and(BlockRequestStatus::is_complete))
            .cloned()
            .collect()
    }

    /// Delete a BlockRequest behind the requester's back
    pub fn delete_block_request(&self, name: &str) -> bool {
        self.lock().requests.remove(name).is_some()
    }

    /// Stored pool (for assertions)
    pub fn pool(&self, name: &str) -> Option<AddressPool> {
        self.lock().pools.get(name).cloned()
    }

    /// Grants or fails pending BlockRequests in the background, standing in for the controller.
    ///
    /// Abort the returned handle to stop granting.
    pub fn spawn_request_processor(&self) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let blocks = BlockAllocator::new(Arc::new(store.clone()));
            loop {
                for request in store.pending_requests() {
                    let token = request.metadata.uid.clone().unwrap_or_default();
                    let status = match blocks
                        .allocate_block(&request.spec.pool_name, &request.spec.node_name, &token)
                        .await
                    {
                        Ok(block) => BlockRequestStatus::allocated(&block.name_any(), Utc::now()),
                        Err(IpamError::PoolExhausted(_)) => {
                            BlockRequestStatus::out_of_blocks(&request.spec.pool_name, Utc::now())
                        }
                        Err(_) => continue,
                    };
                    let _ = store.update_block_request_status(&request, &status).await;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    }
}

#[async_trait::async_trait]
impl IpamStore for MemoryStore {
    async fn get_pool(&self, name: &str) -> Result<AddressPool, IpamError> {
        self.lock()
            .pools
            .get(name)
            .cloned()
            .ok_or_else(|| IpamError::PoolNotFound(name.to_string()))
    }

    async fn list_pools(&self) -> Result<Vec<AddressPool>, IpamError> {
        Ok(self.lock().pools.values().cloned().collect())
    }

    async fn update_pool_status(&self, name: &str, status: &AddressPoolStatus) -> Result<(), IpamError> {
        let mut inner = self.lock();
        let mut pool = inner
            .pools
            .get(name)
            .cloned()
            .ok_or_else(|| IpamError::PoolNotFound(name.to_string()))?;
        pool.status = Some(status.clone());
        inner.bump(&mut pool.metadata);
        inner.pools.insert(name.to_string(), pool);
        Ok(())
    }

    async fn set_pool_finalizer(&self, pool: &AddressPool, present: bool) -> Result<(), IpamError> {
        let mut inner = self.lock();
        let name = pool.name_any();
        let mut stored = inner
            .pools
            .get(&name)
            .cloned()
            .ok_or_else(|| IpamError::PoolNotFound(name.clone()))?;
        check_version(&stored.metadata, &pool.metadata, "AddressPool")?;
        
        let finalizers = stored.metadata.finalizers.get_or_insert_with(Vec::new);
        finalizers.retain(|f| f != POOL_FINALIZER);
        if present {
            finalizers.push(POOL_FINALIZER.to_string());
        }
        
        // Like the API server: a deleted object goes away once its last finalizer does
        if stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty() {
            inner.pools.remove(&name);
            return Ok(());
        }
        inner.bump(&mut stored.metadata);
        inner.pools.insert(name, stored);
        Ok(())
    }

    async fn get_block(&self, name: &str) -> Result<AddressBlock, IpamError> {
        self.lock()
            .blocks
            .get(name)
            .cloned()
            .ok_or_else(|| IpamError::NotFound(format!("AddressBlock {name}")))
    }

    async fn list_blocks(&self, pool_name: Option<&str>) -> Result<Vec<AddressBlock>, IpamError> {
        Ok(self
            .lock()
            .blocks
            .values()
            .filter(|b| pool_name.is_none_or(|p| b.spec.pool_name == p))
            .cloned()
            .collect())
    }

    async fn list_blocks_by_request(&self, token: &str) -> Result<Vec<AddressBlock>, IpamError> {
        Ok(self
            .lock()
            .blocks
            .values()
            .filter(|b| b.spec.request_token.as_deref() == Some(token))
            .cloned()
            .collect())
    }

    async fn list_blocks_by_node(&self, node: &str) -> Result<Vec<AddressBlock>, IpamError> {
        Ok(self
            .lock()
            .blocks
            .values()
            .filter(|b| b.spec.is_owned_by(node))
            .cloned()
            .collect())
    }

    async fn create_block(&self, block: &AddressBlock) -> Result<AddressBlock, IpamError> {
        let mut inner = self.lock();
        let name = block.name_any();
        if inner.blocks.contains_key(&name) {
            return Err(IpamError::Conflict(format!("AddressBlock {name} already exists")));
        }
        let mut created = block.clone();
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        inner.bump(&mut created.metadata);
        inner.blocks.insert(name, created.clone());
        Ok(created)
    }

    async fn update_block_owner(&self, block: &AddressBlock) -> Result<AddressBlock, IpamError> {
        let mut inner = self.lock();
        let name = block.name_any();
        if inner.failing_blocks.contains(&name) {
            return Err(IpamError::Transient(format!("injected failure writing AddressBlock {name}")));
        }
        let mut stored = inner
            .blocks
            .get(&name)
            .cloned()
            .ok_or_else(|| IpamError::NotFound(format!("AddressBlock {name}")))?;
        if inner.injected_conflicts > 0 {
            // Simulate another writer winning the race
            inner.injected_conflicts -= 1;
            inner.bump(&mut stored.metadata);
            inner.blocks.insert(name.clone(), stored);
            return Err(IpamError::Conflict(format!("AddressBlock {name} was modified")));
        }
        check_version(&stored.metadata, &block.metadata, "AddressBlock")?;
        
        stored.spec.owner_node = block.spec.owner_node.clone();
        stored.spec.request_token = block.spec.request_token.clone();
        inner.bump(&mut stored.metadata);
        inner.block_owner_writes += 1;
        inner.blocks.insert(name, stored.clone());
        Ok(stored)
    }

    async fn get_block_request(&self, name: &str) -> Result<BlockRequest, IpamError> {
        self.lock()
            .requests
            .get(name)
            .cloned()
            .ok_or_else(|| IpamError::NotFound(format!("BlockRequest {name}")))
    }

    async fn create_block_request(&self, pool_name: &str, node_name: &str) -> Result<BlockRequest, IpamError> {
        let mut inner = self.lock();
        let uid = uuid::Uuid::new_v4().to_string();
        let name = format!("{node_name}-{}", &uid[..8]);
        let mut request = BlockRequest::new(&name, BlockRequestSpec {
            pool_name: pool_name.to_string(),
            node_name: node_name.to_string(),
        });
        request.metadata.uid = Some(uid);
        inner.bump(&mut request.metadata);
        inner.requests.insert(name, request.clone());
        Ok(request)
    }

    async fn update_block_request_status(
        &self,
        request: &BlockRequest,
        status: &BlockRequestStatus,
    ) -> Result<BlockRequest, IpamError> {
        let mut inner = self.lock();
        let name = request.name_any();
        let mut stored = inner
            .requests
            .get(&name)
            .cloned()
            .ok_or_else(|| IpamError::NotFound(format!("BlockRequest {name}")))?;
        check_version(&stored.metadata, &request.metadata, "BlockRequest")?;
        
        stored.status = Some(status.clone());
        inner.bump(&mut stored.metadata);
        inner.request_status_writes += 1;
        inner.requests.insert(name, stored.clone());
        Ok(stored)
    }

    async fn list_nodes(&self) -> Result<Vec<String>, IpamError> {
        Ok(self.lock().nodes.iter().cloned().collect())
    }
}

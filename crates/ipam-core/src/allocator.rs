//! Cluster-tier block allocation.
//!
//! `BlockAllocator` grants whole AddressBlocks to nodes. Contention is
//! resolved per block: every ownership change is a conditional write, and a
//! writer that loses re-reads the pool and tries another candidate. There is
//! no pool-wide lock.

use crate::error::IpamError;
use crate::layout::PoolLayout;
use crate::store::IpamStore;
use crds::{block_name, AddressBlock, AddressBlockSpec, AddressPool};
use kube::{Resource, ResourceExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attempts before a contended allocation gives up with `IpamError::Conflict`
const DEFAULT_MAX_ATTEMPTS: usize = 32;

/// Grants and releases AddressBlocks
#[derive(Clone)]
pub struct BlockAllocator {
    store: Arc<dyn IpamStore>,
    max_attempts: usize,
}

impl std::fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

enum Candidate {
    Reuse(AddressBlock),
    Create(u64),
}

impl BlockAllocator {
    /// Creates an allocator over `store`.
    pub fn new(store: Arc<dyn IpamStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
    
    /// Overrides how many lost races are tolerated per call.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
    
    /// Assigns a block of `pool_name` to `node_name` on behalf of the request `request_token`.
    ///
    /// Prefers the lowest-index released block, then creates a block at the
    /// lowest never-used index. Fails with `IpamError::PoolExhausted` when
    /// neither exists. A block already carrying `request_token` is returned
    /// as-is, so a retried request never receives a second block.
    #[tracing::instrument(skip(self), fields(pool = pool_name, node = node_name))]
    pub async fn allocate_block(
        &self,
        pool_name: &str,
        node_name: &str,
        request_token: &str,
    ) -> Result<AddressBlock, IpamError> {
        for attempt in 1..=self.max_attempts {
            let pool = self.store.get_pool(pool_name).await?;
            if pool.metadata.deletion_timestamp.is_some() {
                return Err(IpamError::PoolExhausted(format!("pool {pool_name} is being deleted")));
            }
            let layout = PoolLayout::from_pool(&pool)?;
            let blocks = self.store.list_blocks(Some(pool_name)).await?;
            
            if let Some(existing) = blocks
                .iter()
                .find(|b| b.spec.request_token.as_deref() == Some(request_token))
            {
                debug!("Request {} already holds block {}", request_token, existing.name_any());
                return Ok(existing.clone());
            }
            
            let result = match Self::pick_candidate(&layout, blocks) {
                Some(Candidate::Reuse(mut block)) => {
                    block.spec.owner_node = Some(node_name.to_string());
                    block.spec.request_token = Some(request_token.to_string());
                    self.store.update_block_owner(&block).await
                }
                Some(Candidate::Create(index)) => {
                    let block = Self::new_block(&pool, &layout, index, node_name, request_token)?;
                    self.store.create_block(&block).await
                }
                None => {
                    return Err(IpamError::PoolExhausted(format!(
                        "pool {pool_name} does not have free blocks"
                    )));
                }
            };
            
            match result {
                Ok(block) => {
                    info!(
                        block = %block.name_any(),
                        index = block.spec.index,
                        cidr = %block.spec.cidr,
                        "Assigned block to node {}", node_name
                    );
                    return Ok(block);
                }
                Err(IpamError::Conflict(msg)) => {
                    debug!("Lost block race (attempt {}/{}): {}", attempt, self.max_attempts, msg);
                }
                Err(e) => return Err(e),
            }
        }
        
        warn!("Giving up on pool {} after {} conflicting attempts", pool_name, self.max_attempts);
        Err(IpamError::Conflict(format!(
            "could not assign a block of pool {pool_name} after {} attempts",
            self.max_attempts
        )))
    }
    
    /// Clears the owner of `block_name`. Releasing a free or missing block is a no-op.
    pub async fn release_block(&self, block_name: &str) -> Result<(), IpamError> {
        self.release(block_name, None).await.map(|_| ())
    }
    
    /// Clears the owner of `block_name` only while `node_name` still owns it.
    ///
    /// Returns whether this call released the block. A block that changed
    /// hands since the caller looked is left alone.
    pub async fn release_block_owned_by(&self, block_name: &str, node_name: &str) -> Result<bool, IpamError> {
        self.release(block_name, Some(node_name)).await
    }
    
    async fn release(&self, block_name: &str, expected_owner: Option<&str>) -> Result<bool, IpamError> {
        for _ in 0..self.max_attempts {
            let mut block = match self.store.get_block(block_name).await {
                Ok(block) => block,
                Err(IpamError::NotFound(_)) => {
                    debug!("AddressBlock {} does not exist, nothing to release", block_name);
                    return Ok(false);
                }
                Err(e) => return Err(e),
            };
            
            if block.spec.is_free() {
                return Ok(false);
            }
            if let Some(expected) = expected_owner {
                if !block.spec.is_owned_by(expected) {
                    debug!(
                        "AddressBlock {} is now owned by {:?}, not {}; leaving it",
                        block_name, block.spec.owner_node, expected
                    );
                    return Ok(false);
                }
            }
            
            let previous = block.spec.owner_node.take();
            block.spec.request_token = None;
            match self.store.update_block_owner(&block).await {
                Ok(_) => {
                    info!("Released block {} from node {:?}", block_name, previous);
                    return Ok(true);
                }
                Err(IpamError::Conflict(msg)) => {
                    debug!("Conflict releasing {}: {}", block_name, msg);
                }
                Err(e) => return Err(e),
            }
        }
        
        Err(IpamError::Conflict(format!(
            "could not release block {block_name} after {} attempts",
            self.max_attempts
        )))
    }
    
    fn pick_candidate(layout: &PoolLayout, blocks: Vec<AddressBlock>) -> Option<Candidate> {
        let mut used = BTreeSet::new();
        let mut free: Option<AddressBlock> = None;
        for block in blocks {
            used.insert(block.spec.index);
            if block.spec.is_free() && free.as_ref().is_none_or(|f| block.spec.index < f.spec.index) {
                free = Some(block);
            }
        }
        if let Some(block) = free {
            return Some(Candidate::Reuse(block));
        }
        
        // Lowest index never handed out
        let mut next = 0u64;
        for index in &used {
            if *index != next {
                break;
            }
            next += 1;
        }
        (next < layout.block_count()).then_some(Candidate::Create(next))
    }
    
    fn new_block(
        pool: &AddressPool,
        layout: &PoolLayout,
        index: u64,
        node_name: &str,
        request_token: &str,
    ) -> Result<AddressBlock, IpamError> {
        let pool_name = pool.name_any();
        let cidr = layout.block_cidr(index)?;
        let mut block = AddressBlock::new(&block_name(&pool_name, index), AddressBlockSpec {
            pool_name,
            index,
            cidr: cidr.to_string(),
            owner_node: Some(node_name.to_string()),
            request_token: Some(request_token.to_string()),
        });
        // Blocks are garbage collected with their pool
        block.metadata.owner_references = pool.controller_owner_ref(&()).map(|r| vec![r]);
        Ok(block)
    }
}

#[cfg(test)]
#[path = "allocator_test.rs"]
mod allocator_test;

//! Node-tier address allocator.
//!
//! `LocalAddressAllocator` hands out single addresses from the AddressBlocks
//! this node owns. It is the only writer of those blocks' per-address state,
//! so allocation and release never touch the cluster API. Only when every
//! owned block is full does it create a BlockRequest and wait, bounded by
//! the request timeout, for the controller to grant another block.
//!
//! Each block has its own lock; unrelated pods only contend on the block
//! they land in. At most one BlockRequest is outstanding at a time. A wait
//! that is abandoned (timeout or caller cancellation) leaves the request
//! pending, and the next allocation resumes waiting on it instead of
//! issuing another one.

use crate::identity::PodIdentity;
use crate::metrics::AgentMetrics;
use crate::state::{AllocationRecord, StateFile};
use crds::{AddressBlock, BlockRequestOutcome};
use ipam_core::layout::{address_at, offset_of, MAX_BLOCK_SIZE_BITS};
use ipam_core::{BlockAllocator, BlockBitmap, IpamError, IpamStore};
use ipnet::IpNet;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Static configuration of a node's allocator
#[derive(Debug, Clone)]
pub struct AllocatorSettings {
    /// Value written to `ownerNode` / `nodeName`
    pub node_name: String,
    /// Pool new blocks are requested from
    pub pool_name: String,
    /// Upper bound on waiting for block grants during one allocation
    pub request_timeout: Duration,
    /// Period between BlockRequest status reads while waiting
    pub poll_interval: Duration,
}

/// Address bound to a pod identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    /// Address handed to the pod
    pub address: IpAddr,
    /// AddressBlock the address belongs to
    pub block_name: String,
}

/// Capacity snapshot of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    /// Node this agent allocates for
    pub node: String,
    /// Pool blocks are requested from
    pub pool: String,
    /// Blocks currently owned
    pub owned_blocks: usize,
    /// Addresses bound to pods
    pub allocated: u64,
    /// Addresses across all owned blocks
    pub capacity: u64,
}

#[derive(Debug)]
struct BlockState {
    bitmap: BlockBitmap,
    /// Being handed back to the pool; takes no new allocations
    retired: bool,
}

#[derive(Debug)]
struct OwnedBlock {
    name: String,
    index: u64,
    cidr: IpNet,
    state: Mutex<BlockState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn gauge_value(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Per-node allocator of individual addresses
pub struct LocalAddressAllocator {
    settings: AllocatorSettings,
    store: Arc<dyn IpamStore>,
    block_allocator: BlockAllocator,
    owned: RwLock<Vec<Arc<OwnedBlock>>>,
    table: Mutex<HashMap<PodIdentity, Allocation>>,
    /// Name of the outstanding BlockRequest; the lock also serializes grant waits
    pending_request: tokio::sync::Mutex<Option<String>>,
    state_file: Option<StateFile>,
    metrics: Arc<AgentMetrics>,
}

impl std::fmt::Debug for LocalAddressAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAddressAllocator")
            .field("settings", &self.settings)
            .field("state_file", &self.state_file)
            .finish_non_exhaustive()
    }
}

impl LocalAddressAllocator {
    /// Creates an allocator that owns no blocks yet; call `recover` before serving.
    pub fn new(settings: AllocatorSettings, store: Arc<dyn IpamStore>, metrics: Arc<AgentMetrics>) -> Self {
        Self {
            settings,
            block_allocator: BlockAllocator::new(store.clone()),
            store,
            owned: RwLock::new(Vec::new()),
            table: Mutex::new(HashMap::new()),
            pending_request: tokio::sync::Mutex::new(None),
            state_file: None,
            metrics,
        }
    }
    
    /// Persists the allocation table to `file` after every change.
    #[must_use]
    pub fn with_state_file(mut self, file: StateFile) -> Self {
        self.state_file = Some(file);
        self
    }
    
    /// Settings this allocator was built with.
    pub fn settings(&self) -> &AllocatorSettings {
        &self.settings
    }
    
    /// Rebuilds local state after a restart.
    ///
    /// Adopts every block the cluster says this node owns, then replays the
    /// persisted allocation table. Rows pointing at blocks this node no
    /// longer owns are dropped. Returns the number of restored allocations.
    pub async fn recover(&self) -> Result<usize, IpamError> {
        let adopted = self.refresh_owned_blocks().await?;
        let Some(file) = &self.state_file else {
            info!("Recovered {} owned blocks, no state file configured", adopted);
            return Ok(0);
        };
        
        let records = file.load().await?;
        let total = records.len();
        let mut restored = 0;
        for record in records {
            match self.restore(&record) {
                Ok(()) => restored += 1,
                Err(e) => warn!("Dropping allocation {} -> {}: {}", record.identity, record.address, e),
            }
        }
        if restored != total {
            self.persist().await;
        }
        self.update_gauges();
        
        info!(
            "Recovered {} owned blocks and {}/{} allocations from {}",
            adopted,
            restored,
            total,
            file.path().display()
        );
        Ok(restored)
    }
    
    fn restore(&self, record: &AllocationRecord) -> Result<(), IpamError> {
        let block = self.find_block(&record.block_name).ok_or_else(|| {
            IpamError::NotFound(format!("block {} is not owned by this node", record.block_name))
        })?;
        let offset = offset_of(&block.cidr, record.address).ok_or_else(|| {
            IpamError::Internal(format!("{} is not inside block {}", record.address, block.name))
        })?;
        if !lock(&block.state).bitmap.set(offset) {
            return Err(IpamError::Internal(format!("{} is recorded twice", record.address)));
        }
        lock(&self.table).insert(record.identity.clone(), Allocation {
            address: record.address,
            block_name: block.name.clone(),
        });
        Ok(())
    }
    
    /// Returns the address bound to `identity`, allocating one if needed.
    ///
    /// Requests a new block when every owned block is full. Fails with
    /// `PoolExhausted` when the pool has no block left, and with `Timeout`
    /// when grants do not arrive within the request timeout.
    pub async fn allocate(&self, identity: &PodIdentity) -> Result<Allocation, IpamError> {
        let result = self.allocate_inner(identity).await;
        if let Err(e) = &result {
            self.metrics.allocation_failures.inc();
            warn!("Allocation for {} failed: {}", identity, e);
        }
        result
    }
    
    async fn allocate_inner(&self, identity: &PodIdentity) -> Result<Allocation, IpamError> {
        if let Some(existing) = self.binding(identity) {
            debug!("{} is already bound to {}", identity, existing.address);
            return Ok(existing);
        }
        
        let deadline = Instant::now() + self.settings.request_timeout;
        loop {
            if let Some(allocation) = self.allocate_local(identity)? {
                self.persist().await;
                self.metrics.allocations.inc();
                self.update_gauges();
                info!(
                    identity = %identity,
                    block = %allocation.block_name,
                    "Allocated address {}", allocation.address
                );
                return Ok(allocation);
            }
        
            tokio::time::timeout_at(deadline, self.acquire_block())
                .await
                .map_err(|_| IpamError::Timeout(format!(
                    "no block was granted to node {} within {}s",
                    self.settings.node_name,
                    self.settings.request_timeout.as_secs_f64()
                )))??;
        }
    }
    
    /// Takes the first free address of the first owned block that has one.
    fn allocate_local(&self, identity: &PodIdentity) -> Result<Option<Allocation>, IpamError> {
        for block in self.owned_blocks() {
            let offset = {
                let mut state = lock(&block.state);
                if state.retired {
                    continue;
                }
                match state.bitmap.allocate_first() {
                    Some(offset) => offset,
                    None => continue,
                }
            };
        
            let address = match address_at(&block.cidr, offset) {
                Ok(address) => address,
                Err(e) => {
                    lock(&block.state).bitmap.clear(offset);
                    return Err(e);
                }
            };
            let allocation = Allocation {
                address,
                block_name: block.name.clone(),
            };
        
            let mut table = lock(&self.table);
            if let Some(existing) = table.get(identity).cloned() {
                // A concurrent allocate for the same identity got there first
                drop(table);
                lock(&block.state).bitmap.clear(offset);
                return Ok(Some(existing));
            }
            table.insert(identity.clone(), allocation.clone());
            return Ok(Some(allocation));
        }
        Ok(None)
    }
    
    /// Makes sure this node owns a block with free capacity.
    ///
    /// Cancel-safe: dropping the future leaves any created BlockRequest
    /// recorded as pending for the next caller. A request that disappears,
    /// or whose block is no longer ours by the time it is read, is replaced
    /// by a fresh one; the caller's deadline bounds the retries.
    async fn acquire_block(&self) -> Result<(), IpamError> {
        let mut pending = self.pending_request.lock().await;
        loop {
            if self.has_free_capacity() {
                // Capacity arrived while waiting for the lock
                return Ok(());
            }
        
            let request_name = match pending.clone() {
                Some(name) => {
                    info!("Resuming wait on BlockRequest {}", name);
                    name
                }
                None => {
                    let request = self
                        .store
                        .create_block_request(&self.settings.pool_name, &self.settings.node_name)
                        .await?;
                    self.metrics.block_requests.inc();
                    let name = request.name_any();
                    info!("Created BlockRequest {} for pool {}", name, self.settings.pool_name);
                    *pending = Some(name.clone());
                    name
                }
            };
        
            let block_name = match self.wait_for_grant(&request_name).await {
                Ok(block_name) => block_name,
                Err(e @ IpamError::PoolExhausted(_)) => {
                    *pending = None;
                    return Err(e);
                }
                Err(IpamError::NotFound(_)) => {
                    warn!("BlockRequest {} was deleted before it was granted, requesting again", request_name);
                    *pending = None;
                    continue;
                }
                Err(e) => return Err(e),
            };
        
            let block = match self.store.get_block(&block_name).await {
                Ok(block) => block,
                Err(IpamError::NotFound(_)) => {
                    warn!("Granted block {} no longer exists, requesting again", block_name);
                    *pending = None;
                    continue;
                }
                Err(e) => return Err(e),
            };
            *pending = None;
        
            if !block.spec.is_owned_by(&self.settings.node_name) {
                warn!(
                    "Granted block {} is now owned by {:?}, requesting again",
                    block_name, block.spec.owner_node
                );
                continue;
            }
            self.adopt(&block)?;
            self.update_gauges();
            return Ok(());
        }
    }
    
    /// Polls `request_name` until it reaches a terminal state.
    async fn wait_for_grant(&self, request_name: &str) -> Result<String, IpamError> {
        loop {
            match self.store.get_block_request(request_name).await {
                Ok(request) => match request.outcome() {
                    BlockRequestOutcome::Granted(block_name) => {
                        info!("BlockRequest {} granted block {}", request_name, block_name);
                        return Ok(block_name);
                    }
                    BlockRequestOutcome::Failed(message) => {
                        warn!("BlockRequest {} failed: {}", request_name, message);
                        return Err(IpamError::PoolExhausted(message));
                    }
                    BlockRequestOutcome::Pending => {}
                },
                Err(e) if e.is_retryable() => debug!("Reading BlockRequest {} failed: {}", request_name, e),
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
    
    /// Starts tracking `block` locally. Returns false if it was already tracked.
    fn adopt(&self, block: &AddressBlock) -> Result<bool, IpamError> {
        let name = block.name_any();
        let cidr: IpNet = block.spec.cidr.parse().map_err(|e| {
            IpamError::Internal(format!("block {} has invalid cidr {}: {}", name, block.spec.cidr, e))
        })?;
        let host_bits = cidr.max_prefix_len() - cidr.prefix_len();
        if host_bits > MAX_BLOCK_SIZE_BITS {
            return Err(IpamError::Internal(format!("block {name} ({cidr}) is too large")));
        }
        
        let mut owned = self.owned.write().unwrap_or_else(PoisonError::into_inner);
        if owned.iter().any(|b| b.name == name) {
            return Ok(false);
        }
        info!("Adopting block {} ({})", name, cidr);
        owned.push(Arc::new(OwnedBlock {
            name,
            index: block.spec.index,
            cidr,
            state: Mutex::new(BlockState {
                bitmap: BlockBitmap::new(1u32 << host_bits),
                retired: false,
            }),
        }));
        owned.sort_by_key(|b| b.index);
        Ok(true)
    }
    
    /// Adopts blocks the cluster records as owned by this node but that are not tracked yet.
    async fn refresh_owned_blocks(&self) -> Result<usize, IpamError> {
        let blocks = self.store.list_blocks_by_node(&self.settings.node_name).await?;
        let mut adopted = 0;
        for block in &blocks {
            match self.adopt(block) {
                Ok(true) => adopted += 1,
                Ok(false) => {}
                Err(e) => warn!("Skipping block {}: {}", block.name_any(), e),
            }
        }
        
        let listed: Vec<String> = blocks.iter().map(ResourceExt::name_any).collect();
        for block in self.owned_blocks() {
            if !listed.contains(&block.name) {
                warn!("Block {} is tracked locally but not owned by this node in the cluster", block.name);
            }
        }
        
        self.update_gauges();
        Ok(adopted)
    }
    
    /// Releases the address bound to `identity`.
    ///
    /// Returns the released binding, or `None` if the identity was not bound
    /// (double release is a no-op).
    pub async fn release(&self, identity: &PodIdentity) -> Result<Option<Allocation>, IpamError> {
        // Unbinding decides the winner of concurrent releases; only it frees the address
        let Some(allocation) = lock(&self.table).remove(identity) else {
            debug!("Release of unbound identity {} is a no-op", identity);
            return Ok(None);
        };
        let located = self
            .find_block(&allocation.block_name)
            .and_then(|block| offset_of(&block.cidr, allocation.address).map(|offset| (block, offset)));
        let Some((block, offset)) = located else {
            lock(&self.table)
                .entry(identity.clone())
                .or_insert_with(|| allocation.clone());
            return Err(IpamError::Internal(format!(
                "{} is bound to {}, which no block owned by this node contains",
                identity, allocation.address
            )));
        };
        lock(&block.state).bitmap.clear(offset);
        
        self.persist().await;
        self.metrics.releases.inc();
        self.update_gauges();
        info!(identity = %identity, block = %block.name, "Released address {}", allocation.address);
        Ok(Some(allocation))
    }
    
    /// Current binding of `identity`.
    pub fn lookup(&self, identity: &PodIdentity) -> Result<Allocation, IpamError> {
        self.binding(identity)
            .ok_or_else(|| IpamError::NotFound(format!("no address is bound to {identity}")))
    }
    
    /// Current capacity of this node.
    pub fn status(&self) -> AgentStatus {
        let blocks = self.owned_blocks();
        let mut allocated = 0u64;
        let mut capacity = 0u64;
        for block in &blocks {
            let state = lock(&block.state);
            allocated += u64::from(state.bitmap.used());
            capacity += u64::from(state.bitmap.size());
        }
        AgentStatus {
            node: self.settings.node_name.clone(),
            pool: self.settings.pool_name.clone(),
            owned_blocks: blocks.len(),
            allocated,
            capacity,
        }
    }
    
    /// Copy of the allocation table.
    pub fn snapshot(&self) -> Vec<AllocationRecord> {
        lock(&self.table)
            .iter()
            .map(|(identity, allocation)| AllocationRecord {
                identity: identity.clone(),
                block_name: allocation.block_name.clone(),
                address: allocation.address,
            })
            .collect()
    }
    
    /// Hands owned blocks without allocations back to the pool, keeping at least one block.
    ///
    /// Also adopts blocks granted to waits that were abandoned before they
    /// could adopt them. Returns the names of the released blocks.
    pub async fn relinquish_idle_blocks(&self) -> Result<Vec<String>, IpamError> {
        // No grant may be adopted while blocks are being given back
        let mut pending = self.pending_request.lock().await;
        self.refresh_owned_blocks().await?;
        self.settle_pending_request(&mut pending).await;
        
        let mut released = Vec::new();
        for block in self.owned_blocks().into_iter().rev() {
            let active = self
                .owned_blocks()
                .iter()
                .filter(|b| !lock(&b.state).retired)
                .count();
            if active <= 1 {
                break;
            }
            {
                let mut state = lock(&block.state);
                if state.retired || !state.bitmap.is_empty() {
                    continue;
                }
                state.retired = true;
            }
        
            match self
                .block_allocator
                .release_block_owned_by(&block.name, &self.settings.node_name)
                .await
            {
                Ok(_) => {
                    self.owned
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .retain(|b| b.name != block.name);
                    info!("Relinquished idle block {}", block.name);
                    released.push(block.name.clone());
                }
                Err(e) => {
                    warn!("Failed to relinquish block {}: {}", block.name, e);
                    lock(&block.state).retired = false;
                }
            }
        }
        
        self.update_gauges();
        Ok(released)
    }
    
    /// Forgets the pending BlockRequest once its grant has been adopted or the request is gone.
    async fn settle_pending_request(&self, pending: &mut Option<String>) {
        let Some(request_name) = pending.clone() else {
            return;
        };
        match self.store.get_block_request(&request_name).await {
            Ok(request) => match request.outcome() {
                BlockRequestOutcome::Granted(block_name) if self.find_block(&block_name).is_some() => {
                    debug!("BlockRequest {} was granted {}, already adopted", request_name, block_name);
                    *pending = None;
                }
                BlockRequestOutcome::Failed(_) => *pending = None,
                _ => {}
            },
            Err(IpamError::NotFound(_)) => *pending = None,
            Err(e) => debug!("Reading BlockRequest {} failed: {}", request_name, e),
        }
    }
    
    fn binding(&self, identity: &PodIdentity) -> Option<Allocation> {
        lock(&self.table).get(identity).cloned()
    }
    
    fn owned_blocks(&self) -> Vec<Arc<OwnedBlock>> {
        self.owned.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
    
    fn find_block(&self, name: &str) -> Option<Arc<OwnedBlock>> {
        self.owned_blocks().into_iter().find(|b| b.name == name)
    }
    
    fn has_free_capacity(&self) -> bool {
        self.owned_blocks().iter().any(|b| {
            let state = lock(&b.state);
            !state.retired && !state.bitmap.is_full()
        })
    }
    
    async fn persist(&self) {
        let Some(file) = &self.state_file else {
            return;
        };
        if let Err(e) = file.save_with(|| self.snapshot()).await {
            error!("Failed to persist allocation table: {}", e);
        }
    }
    
    fn update_gauges(&self) {
        self.metrics.owned_blocks.set(gauge_value(self.owned_blocks().len()));
        self.metrics.allocated_addresses.set(gauge_value(lock(&self.table).len()));
    }
}

#[cfg(test)]
#[path = "allocator_test.rs"]
mod allocator_test;

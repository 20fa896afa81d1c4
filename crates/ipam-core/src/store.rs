//! Cluster store trait
//!
//! Abstracts every read and write the IPAM tiers perform against the cluster
//! API so reconcilers and allocators can run against `KubeStore` in production
//! and `MemoryStore` in unit tests.
//!
//! Writes that change ownership or status are conditional: they carry the
//! resource version of the object passed in and fail with
//! `IpamError::Conflict` when the stored object has moved on.

use crate::error::IpamError;
use crds::{AddressBlock, AddressPool, AddressPoolStatus, BlockRequest, BlockRequestStatus};

/// Trait for cluster API operations used by the IPAM tiers
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait IpamStore: Send + Sync {
    // AddressPool Operations
    /// Reads one pool; `PoolNotFound` when it does not exist.
    async fn get_pool(&self, name: &str) -> Result<AddressPool, IpamError>;
    /// Lists every pool.
    async fn list_pools(&self) -> Result<Vec<AddressPool>, IpamError>;
    /// Writes pool status (unconditional; the status is derived data).
    async fn update_pool_status(&self, name: &str, status: &AddressPoolStatus) -> Result<(), IpamError>;
    /// Adds or removes the pool-protection finalizer, conditional on `pool`'s version.
    async fn set_pool_finalizer(&self, pool: &AddressPool, present: bool) -> Result<(), IpamError>;

    // AddressBlock Operations
    /// Reads one block; `NotFound` when it does not exist.
    async fn get_block(&self, name: &str) -> Result<AddressBlock, IpamError>;
    /// Lists blocks, optionally restricted to one pool.
    async fn list_blocks(&self, pool_name: Option<&str>) -> Result<Vec<AddressBlock>, IpamError>;
    /// Lists blocks whose `requestToken` equals `token`.
    async fn list_blocks_by_request(&self, token: &str) -> Result<Vec<AddressBlock>, IpamError>;
    /// Lists blocks owned by `node`.
    async fn list_blocks_by_node(&self, node: &str) -> Result<Vec<AddressBlock>, IpamError>;
    /// Creates a block; fails with `Conflict` when the name is taken.
    async fn create_block(&self, block: &AddressBlock) -> Result<AddressBlock, IpamError>;
    /// Writes `ownerNode` and `requestToken` of `block`, conditional on its version.
    async fn update_block_owner(&self, block: &AddressBlock) -> Result<AddressBlock, IpamError>;

    // BlockRequest Operations
    /// Reads one request; `NotFound` when it does not exist.
    async fn get_block_request(&self, name: &str) -> Result<BlockRequest, IpamError>;
    /// Creates a request with a server-generated name and UID.
    async fn create_block_request(&self, pool_name: &str, node_name: &str) -> Result<BlockRequest, IpamError>;
    /// Writes the status of `request`, conditional on its version.
    async fn update_block_request_status(
        &self,
        request: &BlockRequest,
        status: &BlockRequestStatus,
    ) -> Result<BlockRequest, IpamError>;

    // Cluster membership
    /// Names of the nodes currently in the cluster.
    async fn list_nodes(&self) -> Result<Vec<String>, IpamError>;
}

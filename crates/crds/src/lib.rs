//! IPAM CRD Definitions
//!
//! Kubernetes Custom Resource Definitions shared by the IPAM controller
//! and the per-node allocation agent.
//!
//! All resources are cluster-scoped and live in the `ipam.microscaler.io`
//! API group.

pub mod address_pool;
pub mod address_block;
pub mod block_request;

pub use address_pool::*;
pub use address_block::*;
pub use block_request::*;

/// API group for every IPAM resource
pub const API_GROUP: &str = "ipam.microscaler.io";

/// Label carrying the owning pool name of an AddressBlock
pub const POOL_LABEL: &str = "ipam.microscaler.io/pool";

/// Label carrying the owner node of an AddressBlock (absent when released)
pub const NODE_LABEL: &str = "ipam.microscaler.io/node";

/// Label carrying the BlockRequest UID that caused the current assignment
pub const REQUEST_LABEL: &str = "ipam.microscaler.io/request";

/// Finalizer keeping an AddressPool alive while blocks still reference it
pub const POOL_FINALIZER: &str = "ipam.microscaler.io/pool-protection";

//! Block-based IPAM core
//!
//! Shared building blocks for both allocation tiers:
//!
//! - **Pool layout**: maps an AddressPool's subnet and block size onto block
//!   indices, block CIDRs and per-address offsets
//! - **Block bitmap**: fixed-size free/used accounting for one block
//! - **Store**: the `IpamStore` trait over the cluster API, with per-object
//!   optimistic concurrency; `KubeStore` is the Kubernetes implementation
//! - **Block allocator**: grants unowned blocks to nodes and releases them
//!
//! # Example
//!
//! ```no_run
//! use ipam_core::{BlockAllocator, KubeStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let allocator = BlockAllocator::new(Arc::new(KubeStore::new(client)));
//!
//! let block = allocator.allocate_block("default", "node-1", "7f0c3c9e").await?;
//! println!("granted {}", block.spec.cidr);
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod bitmap;
pub mod error;
pub mod kube_store;
pub mod layout;
pub mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use allocator::BlockAllocator;
pub use bitmap::BlockBitmap;
pub use error::IpamError;
pub use kube_store::KubeStore;
pub use layout::PoolLayout;
pub use store::IpamStore;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MemoryStore;

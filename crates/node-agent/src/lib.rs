//! Node agent of the block IPAM
//!
//! Runs on every node and hands out single addresses from the AddressBlocks
//! the node owns:
//!
//! - **Allocator**: per-block bitmaps, on-demand BlockRequests, recovery
//!   from the local state file and release of idle blocks
//! - **HTTP surface**: allocate, look up and release by pod identity
//! - **Client**: typed `reqwest` client for that surface
//! - **Metrics**: Prometheus counters and gauges on a separate listener
//!
//! # Example
//!
//! ```no_run
//! use node_agent::{AgentClient, PodIdentity};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = AgentClient::new("http://127.0.0.1:9384", Duration::from_secs(60))?;
//! let identity = PodIdentity::new("default", "web-0", "3f2a9c")?;
//!
//! let allocation = client.allocate(&identity).await?;
//! println!("{} from {}", allocation.address, allocation.block_name);
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod server;
pub mod state;

pub use allocator::{AgentStatus, Allocation, AllocatorSettings, LocalAddressAllocator};
pub use client::{AgentClient, ClientError};
pub use config::AgentConfig;
pub use error::{AgentError, ApiError, ErrorResponse};
pub use identity::{IdentityError, PodIdentity};
pub use metrics::{metrics_router, AgentMetrics};
pub use server::{router, StatusResponse};
pub use state::{AllocationRecord, StateFile};

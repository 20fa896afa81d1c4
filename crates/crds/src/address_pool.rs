//! AddressPool CRD
//!
//! Defines a cluster-wide address range carved into fixed-size blocks.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "ipam.microscaler.io",
    version = "v1alpha1",
    kind = "AddressPool",
    status = "AddressPoolStatus",
    printcolumn = r#"{"name":"SUBNET", "type":"string", "jsonPath":".spec.subnet"}"#,
    printcolumn = r#"{"name":"BLOCK BITS", "type":"integer", "jsonPath":".spec.blockSizeBits"}"#,
    printcolumn = r#"{"name":"AVAILABLE", "type":"integer", "jsonPath":".status.availableBlocks"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AddressPoolSpec {
    /// Subnet CIDR (e.g., "10.1.0.0/16")
    /// Immutable after creation
    pub subnet: String,
    
    /// Host bits per block: each block holds `2^blockSizeBits` addresses.
    /// Must not exceed the subnet's host-bit count.
    pub block_size_bits: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddressPoolStatus {
    /// Number of blocks the subnet can be divided into
    pub total_blocks: u64,
    
    /// Blocks currently owned by a node
    pub allocated_blocks: u64,
    
    /// Blocks that can still be granted (released or never created)
    pub available_blocks: u64,
    
    /// Validation error for the pool spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

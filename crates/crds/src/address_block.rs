//! AddressBlock CRD
//!
//! One fixed-size subdivision of an AddressPool, owned by at most one node.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "ipam.microscaler.io",
    version = "v1alpha1",
    kind = "AddressBlock",
    printcolumn = r#"{"name":"POOL", "type":"string", "jsonPath":".spec.poolName"}"#,
    printcolumn = r#"{"name":"CIDR", "type":"string", "jsonPath":".spec.cidr"}"#,
    printcolumn = r#"{"name":"NODE", "type":"string", "jsonPath":".spec.ownerNode"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AddressBlockSpec {
    /// Name of the AddressPool this block belongs to
    pub pool_name: String,
    
    /// 0-based position of the block within the pool subnet.
    /// Never reused for another block while the pool exists.
    pub index: u64,
    
    /// Block CIDR, derived from the pool subnet and `index`
    pub cidr: String,
    
    /// Node currently owning the block (None when released)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_node: Option<String>,
    
    /// UID of the BlockRequest that produced the current assignment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_token: Option<String>,
}

impl AddressBlockSpec {
    /// True when no node owns the block.
    pub fn is_free(&self) -> bool {
        self.owner_node.is_none()
    }
    
    /// True when `node` currently owns the block.
    pub fn is_owned_by(&self, node: &str) -> bool {
        self.owner_node.as_deref() == Some(node)
    }
}

/// Name of the AddressBlock at `index` in `pool`.
pub fn block_name(pool: &str, index: u64) -> String {
    format!("{pool}-{index}")
}

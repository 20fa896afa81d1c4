//! Kubernetes-backed `IpamStore`.
//!
//! Conditional writes are JSON merge patches that carry
//! `metadata.resourceVersion`; the API server answers 409 when the object
//! changed since it was read.
//!
//! Blocks carry pool, owner and request labels so lookups are server-side
//! selections. Label values are bounded by [`label_value`]; every lookup
//! re-checks the spec, so two values sharing a label only widen a query.

use crate::error::IpamError;
use crate::store::IpamStore;
use crds::{
    AddressBlock, AddressPool, AddressPoolStatus, BlockRequest, BlockRequestSpec,
    BlockRequestStatus, NODE_LABEL, POOL_FINALIZER, POOL_LABEL, REQUEST_LABEL,
};
use k8s_openapi::api::core::v1::Node;
use kube::api::{ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Longest value the API server accepts for a label
const MAX_LABEL_VALUE_LEN: usize = 63;

/// Hex digits of the digest kept in shortened label values
const LABEL_DIGEST_LEN: usize = 16;

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

fn is_valid_label_value(value: &str) -> bool {
    value.len() <= MAX_LABEL_VALUE_LEN
        && value.chars().all(is_label_char)
        && value.chars().next().is_none_or(|c| c.is_ascii_alphanumeric())
        && value.chars().last().is_none_or(|c| c.is_ascii_alphanumeric())
}

/// Label value standing for `value`.
///
/// Valid values are used as is. Anything else becomes a readable prefix
/// followed by a digest of the full value, which always fits.
pub fn label_value(value: &str) -> String {
    if is_valid_label_value(value) {
        return value.to_string();
    }
    let digest = hex::encode(Sha256::digest(value.as_bytes()));
    let digest = &digest[..LABEL_DIGEST_LEN];
    
    let prefix: String = value
        .chars()
        .map(|c| if is_label_char(c) { c } else { '-' })
        .take(MAX_LABEL_VALUE_LEN - LABEL_DIGEST_LEN - 1)
        .collect();
    let prefix = prefix.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    if prefix.is_empty() {
        digest.to_string()
    } else {
        format!("{prefix}-{digest}")
    }
}

/// `IpamStore` implementation over the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    pools: Api<AddressPool>,
    blocks: Api<AddressBlock>,
    requests: Api<BlockRequest>,
    nodes: Api<Node>,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    /// Creates a store using `client` for all cluster-scoped resources.
    pub fn new(client: Client) -> Self {
        Self {
            pools: Api::all(client.clone()),
            blocks: Api::all(client.clone()),
            requests: Api::all(client.clone()),
            nodes: Api::all(client),
        }
    }
    
    fn resource_version(meta: &ObjectMeta, kind: &str) -> Result<String, IpamError> {
        meta.resource_version.clone().ok_or_else(|| {
            IpamError::Internal(format!(
                "{kind} {} has no resourceVersion; conditional write impossible",
                meta.name.as_deref().unwrap_or("<unknown>")
            ))
        })
    }
    
    async fn list_blocks_with(&self, selector: Option<String>) -> Result<Vec<AddressBlock>, IpamError> {
        let lp = match selector {
            Some(labels) => ListParams::default().labels(&labels),
            None => ListParams::default(),
        };
        Ok(self.blocks.list(&lp).await?.items)
    }
}

#[async_trait::async_trait]
impl IpamStore for KubeStore {
    async fn get_pool(&self, name: &str) -> Result<AddressPool, IpamError> {
        self.pools.get(name).await.map_err(|e| match IpamError::from(e) {
            IpamError::NotFound(_) => IpamError::PoolNotFound(name.to_string()),
            other => other,
        })
    }

    async fn list_pools(&self) -> Result<Vec<AddressPool>, IpamError> {
        Ok(self.pools.list(&ListParams::default()).await?.items)
    }

    async fn update_pool_status(&self, name: &str, status: &AddressPoolStatus) -> Result<(), IpamError> {
        let patch = json!({ "status": status });
        self.pools
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_pool_finalizer(&self, pool: &AddressPool, present: bool) -> Result<(), IpamError> {
        let rv = Self::resource_version(&pool.metadata, "AddressPool")?;
        let mut finalizers: Vec<String> = pool
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != POOL_FINALIZER)
            .cloned()
            .collect();
        if present {
            finalizers.push(POOL_FINALIZER.to_string());
        }
        let patch = json!({
            "metadata": {
                "resourceVersion": rv,
                "finalizers": finalizers,
            }
        });
        self.pools
            .patch(&pool.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_block(&self, name: &str) -> Result<AddressBlock, IpamError> {
        Ok(self.blocks.get(name).await?)
    }

    async fn list_blocks(&self, pool_name: Option<&str>) -> Result<Vec<AddressBlock>, IpamError> {
        let selector = pool_name.map(|p| format!("{POOL_LABEL}={}", label_value(p)));
        let blocks = self.list_blocks_with(selector).await?;
        Ok(blocks
            .into_iter()
            .filter(|b| pool_name.is_none_or(|p| b.spec.pool_name == p))
            .collect())
    }

    async fn list_blocks_by_request(&self, token: &str) -> Result<Vec<AddressBlock>, IpamError> {
        let blocks = self.list_blocks_with(Some(format!("{REQUEST_LABEL}={}", label_value(token)))).await?;
        // Labels only narrow the query; `spec.requestToken` decides
        Ok(blocks
            .into_iter()
            .filter(|b| b.spec.request_token.as_deref() == Some(token))
            .collect())
    }

    async fn list_blocks_by_node(&self, node: &str) -> Result<Vec<AddressBlock>, IpamError> {
        let blocks = self.list_blocks_with(Some(format!("{NODE_LABEL}={}", label_value(node)))).await?;
        Ok(blocks.into_iter().filter(|b| b.spec.is_owned_by(node)).collect())
    }

    async fn create_block(&self, block: &AddressBlock) -> Result<AddressBlock, IpamError> {
        let mut block = block.clone();
        let labels = block.metadata.labels.get_or_insert_with(Default::default);
        labels.insert(POOL_LABEL.to_string(), label_value(&block.spec.pool_name));
        if let Some(owner) = &block.spec.owner_node {
            labels.insert(NODE_LABEL.to_string(), label_value(owner));
        }
        if let Some(token) = &block.spec.request_token {
            labels.insert(REQUEST_LABEL.to_string(), label_value(token));
        }
        Ok(self.blocks.create(&PostParams::default(), &block).await?)
    }

    async fn update_block_owner(&self, block: &AddressBlock) -> Result<AddressBlock, IpamError> {
        let rv = Self::resource_version(&block.metadata, "AddressBlock")?;
        let name = block.name_any();
        // null removes the key in a merge patch
        let patch = json!({
            "metadata": {
                "resourceVersion": rv,
                "labels": {
                    NODE_LABEL: block.spec.owner_node.as_deref().map(label_value),
                    REQUEST_LABEL: block.spec.request_token.as_deref().map(label_value),
                }
            },
            "spec": {
                "ownerNode": block.spec.owner_node,
                "requestToken": block.spec.request_token,
            }
        });
        debug!("Patching AddressBlock {} owner to {:?}", name, block.spec.owner_node);
        Ok(self
            .blocks
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn get_block_request(&self, name: &str) -> Result<BlockRequest, IpamError> {
        Ok(self.requests.get(name).await?)
    }

    async fn create_block_request(&self, pool_name: &str, node_name: &str) -> Result<BlockRequest, IpamError> {
        let request = BlockRequest {
            metadata: ObjectMeta {
                generate_name: Some(format!("{node_name}-")),
                ..Default::default()
            },
            spec: BlockRequestSpec {
                pool_name: pool_name.to_string(),
                node_name: node_name.to_string(),
            },
            status: None,
        };
        Ok(self.requests.create(&PostParams::default(), &request).await?)
    }

    async fn update_block_request_status(
        &self,
        request: &BlockRequest,
        status: &BlockRequestStatus,
    ) -> Result<BlockRequest, IpamError> {
        let rv = Self::resource_version(&request.metadata, "BlockRequest")?;
        let patch = json!({
            "metadata": { "resourceVersion": rv },
            "status": status,
        });
        Ok(self
            .requests
            .patch_status(&request.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn list_nodes(&self) -> Result<Vec<String>, IpamError> {
        let nodes = self.nodes.list_metadata(&ListParams::default()).await?;
        Ok(nodes.items.iter().map(ResourceExt::name_any).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_value_keeps_valid_values() {
        assert_eq!(label_value("worker-7.example.com"), "worker-7.example.com");
        assert_eq!(label_value("7f0c3c9e-2a41-4c6e-9d8e-0b1c2d3e4f50"), "7f0c3c9e-2a41-4c6e-9d8e-0b1c2d3e4f50");
        assert_eq!(label_value(&"a".repeat(63)), "a".repeat(63));
    }

    #[test]
    fn test_label_value_bounds_long_node_names() {
        let long = format!("{}.compute.internal", "ip-10-0-0-1-".repeat(8));
        let other = format!("{}.compute.internal", "ip-10-0-0-2-".repeat(8));
        
        let value = label_value(&long);
        assert!(value.len() <= MAX_LABEL_VALUE_LEN, "{value}");
        assert!(is_valid_label_value(&value), "{value}");
        assert!(value.starts_with("ip-10-0-0-1-"));
        assert_eq!(value, label_value(&long));
        assert_ne!(value, label_value(&other));
    }

    #[test]
    fn test_label_value_replaces_invalid_characters() {
        let value = label_value("-pool/with spaces-");
        assert!(is_valid_label_value(&value), "{value}");
        assert!(value.starts_with("pool-with-spaces-"));
        
        let digest_only = label_value("///");
        assert_eq!(digest_only.len(), LABEL_DIGEST_LEN);
        assert!(is_valid_label_value(&digest_only));
    }
}

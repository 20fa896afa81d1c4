//! BlockRequest CRD
//!
//! A node's durable request for one more AddressBlock. Created by the
//! node agent, mutated only by the controller (status subresource).

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "ipam.microscaler.io",
    version = "v1alpha1",
    kind = "BlockRequest",
    status = "BlockRequestStatus",
    printcolumn = r#"{"name":"POOL", "type":"string", "jsonPath":".spec.poolName"}"#,
    printcolumn = r#"{"name":"NODE", "type":"string", "jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"BLOCK", "type":"string", "jsonPath":".status.addressBlockName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BlockRequestSpec {
    /// Pool to take the block from
    pub pool_name: String,
    
    /// Node that will own the block
    pub node_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockRequestStatus {
    /// Ordered condition records; a `Complete` condition makes the request terminal
    #[serde(default)]
    pub conditions: Vec<BlockRequestCondition>,
    
    /// Name of the granted AddressBlock (set on success only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_block_name: Option<String>,
}

/// Condition type of a BlockRequest
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum BlockRequestConditionType {
    /// Processing finished, successfully or not
    Complete,
    
    /// Processing finished without a block
    Failed,
}

/// Kubernetes-style tri-state condition status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockRequestCondition {
    #[serde(rename = "type")]
    pub type_: BlockRequestConditionType,
    
    pub status: ConditionStatus,
    
    /// One-word machine-readable reason
    pub reason: String,
    
    /// Human-readable detail
    pub message: String,
    
    pub last_probe_time: DateTime<Utc>,
    
    pub last_transition_time: DateTime<Utc>,
}

impl BlockRequestCondition {
    fn new(type_: BlockRequestConditionType, reason: &str, message: String, now: DateTime<Utc>) -> Self {
        Self {
            type_,
            status: ConditionStatus::True,
            reason: reason.to_string(),
            message,
            last_probe_time: now,
            last_transition_time: now,
        }
    }
}

impl BlockRequestStatus {
    /// Terminal status for a request granted `block_name`.
    pub fn allocated(block_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            conditions: vec![BlockRequestCondition::new(
                BlockRequestConditionType::Complete,
                "allocated",
                format!("allocated a block {block_name}"),
                now,
            )],
            address_block_name: Some(block_name.to_string()),
        }
    }
    
    /// Terminal status for a request whose pool has no free block.
    pub fn out_of_blocks(pool_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            conditions: vec![
                BlockRequestCondition::new(
                    BlockRequestConditionType::Complete,
                    "completed with failure",
                    "completed with failure".to_string(),
                    now,
                ),
                BlockRequestCondition::new(
                    BlockRequestConditionType::Failed,
                    "out of blocks",
                    format!("pool {pool_name} does not have free blocks"),
                    now,
                ),
            ],
            address_block_name: None,
        }
    }
    
    fn has_condition(&self, type_: BlockRequestConditionType) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == type_ && c.status == ConditionStatus::True)
    }
    
    /// True once the request reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.has_condition(BlockRequestConditionType::Complete)
    }
    
    /// True when the request finished without a block.
    pub fn is_failed(&self) -> bool {
        self.has_condition(BlockRequestConditionType::Failed)
    }
}

/// Outcome of a BlockRequest as seen by the requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRequestOutcome {
    /// Not processed yet
    Pending,
    /// Granted the named block
    Granted(String),
    /// Terminated with failure; carries the failure message
    Failed(String),
}

impl BlockRequest {
    /// Current outcome derived from status conditions.
    pub fn outcome(&self) -> BlockRequestOutcome {
        let Some(status) = self.status.as_ref() else {
            return BlockRequestOutcome::Pending;
        };
        if !status.is_complete() {
            return BlockRequestOutcome::Pending;
        }
        if status.is_failed() {
            let message = status
                .conditions
                .iter()
                .find(|c| c.type_ == BlockRequestConditionType::Failed)
                .map(|c| c.message.clone())
                .unwrap_or_default();
            return BlockRequestOutcome::Failed(message);
        }
        match &status.address_block_name {
            Some(name) => BlockRequestOutcome::Granted(name.clone()),
            None => BlockRequestOutcome::Failed("completed without a block name".to_string()),
        }
    }
    
    /// True when any condition has been recorded.
    pub fn has_conditions(&self) -> bool {
        self.status.as_ref().is_some_and(|s| !s.conditions.is_empty())
    }
}

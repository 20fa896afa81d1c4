//! Unit tests for the BlockRequest reconciler

use super::*;
use crds::BlockRequestOutcome;
use ipam_core::MemoryStore;
use std::collections::BTreeSet;

fn setup() -> (MemoryStore, BlockRequestReconciler) {
    let store = MemoryStore::new();
    store.add_pool("default", "10.1.0.0/24", 7);
    let reconciler = BlockRequestReconciler::new(Arc::new(store.clone()));
    (store, reconciler)
}

async fn fresh(store: &MemoryStore, request: &BlockRequest) -> BlockRequest {
    store.get_block_request(&request.name_any()).await.unwrap()
}

#[tokio::test]
async fn test_reconcile_grants_block() {
    let (store, reconciler) = setup();
    let request = store.create_block_request("default", "node1").await.unwrap();
    
    reconciler.reconcile(&request).await.unwrap();
    
    let request = fresh(&store, &request).await;
    assert_eq!(request.outcome(), BlockRequestOutcome::Granted("default-0".to_string()));
    let status = request.status.unwrap();
    assert_eq!(status.conditions.len(), 1);
    assert_eq!(status.conditions[0].reason, "allocated");
    assert_eq!(status.conditions[0].message, "allocated a block default-0");
    
    let block = store.get_block("default-0").await.unwrap();
    assert_eq!(block.spec.owner_node.as_deref(), Some("node1"));
    assert_eq!(block.spec.request_token, request.metadata.uid);
}

#[tokio::test]
async fn test_redelivery_after_terminal_state_changes_nothing() {
    let (store, reconciler) = setup();
    let request = store.create_block_request("default", "node1").await.unwrap();
    reconciler.reconcile(&request).await.unwrap();
    
    let completed = fresh(&store, &request).await;
    let writes = store.request_status_writes();
    for _ in 0..5 {
        reconciler.reconcile(&completed).await.unwrap();
        // A stale copy loses the conditional status write
        let stale = reconciler.reconcile(&request).await;
        assert!(matches!(stale, Err(ControllerError::Ipam(IpamError::Conflict(_)))));
    }
    
    let after = fresh(&store, &request).await;
    assert_eq!(store.blocks().len(), 1);
    assert_eq!(store.request_status_writes(), writes);
    assert_eq!(after.metadata.resource_version, completed.metadata.resource_version);
    assert_eq!(after.status, completed.status);
}

#[tokio::test]
async fn test_exhaustion_fails_third_request() {
    let (store, reconciler) = setup();
    let requests = vec![
        store.create_block_request("default", "node1").await.unwrap(),
        store.create_block_request("default", "node2").await.unwrap(),
        store.create_block_request("default", "node3").await.unwrap(),
    ];
    
    let results = futures::future::join_all(requests.iter().map(|r| reconciler.reconcile(r))).await;
    assert!(results.iter().all(Result::is_ok));
    
    let mut granted = BTreeSet::new();
    let mut failed = Vec::new();
    for request in &requests {
        match fresh(&store, request).await.outcome() {
            BlockRequestOutcome::Granted(block) => {
                granted.insert(block);
            }
            BlockRequestOutcome::Failed(message) => failed.push(message),
            BlockRequestOutcome::Pending => panic!("request left pending"),
        }
    }
    
    assert_eq!(granted, BTreeSet::from(["default-0".to_string(), "default-1".to_string()]));
    assert_eq!(failed, vec!["pool default does not have free blocks".to_string()]);
    
    let indices: BTreeSet<u64> = store.blocks().iter().map(|b| b.spec.index).collect();
    assert_eq!(indices, BTreeSet::from([0, 1]));
}

#[tokio::test]
async fn test_failure_conditions() {
    let store = MemoryStore::new();
    store.add_pool("tiny", "10.2.0.0/25", 7);
    let reconciler = BlockRequestReconciler::new(Arc::new(store.clone()));
    let first = store.create_block_request("tiny", "node1").await.unwrap();
    let second = store.create_block_request("tiny", "node2").await.unwrap();
    
    reconciler.reconcile(&first).await.unwrap();
    reconciler.reconcile(&second).await.unwrap();
    
    let status = fresh(&store, &second).await.status.unwrap();
    assert!(status.is_complete());
    assert!(status.is_failed());
    assert!(status.address_block_name.is_none());
    let reasons: Vec<_> = status.conditions.iter().map(|c| c.reason.as_str()).collect();
    assert_eq!(reasons, vec!["completed with failure", "out of blocks"]);
}

#[tokio::test]
async fn test_serviced_request_is_completed_without_allocating() {
    let (store, reconciler) = setup();
    let request = store.create_block_request("default", "node1").await.unwrap();
    let token = request.uid().unwrap();
    
    // An earlier attempt assigned the block but died before writing status
    let allocator = BlockAllocator::new(Arc::new(store.clone()));
    allocator.allocate_block("default", "node1", &token).await.unwrap();
    let owner_writes = store.block_owner_writes();
    
    reconciler.reconcile(&request).await.unwrap();
    
    assert_eq!(store.blocks().len(), 1);
    assert_eq!(store.block_owner_writes(), owner_writes);
    assert_eq!(
        fresh(&store, &request).await.outcome(),
        BlockRequestOutcome::Granted("default-0".to_string())
    );
}

#[tokio::test]
async fn test_transient_error_leaves_request_untouched() {
    let (store, reconciler) = setup();
    let allocator = BlockAllocator::new(Arc::new(store.clone()));
    allocator.allocate_block("default", "node0", "earlier").await.unwrap();
    allocator.release_block("default-0").await.unwrap();
    store.fail_block_writes("default-0");
    
    let request = store.create_block_request("default", "node1").await.unwrap();
    let result = reconciler.reconcile(&request).await;
    
    assert!(matches!(result, Err(ControllerError::Ipam(IpamError::Transient(_)))));
    assert_eq!(store.request_status_writes(), 0);
    assert!(fresh(&store, &request).await.status.is_none());
}

#[tokio::test]
async fn test_unknown_pool_is_retried() {
    let (store, reconciler) = setup();
    let request = store.create_block_request("missing", "node1").await.unwrap();
    
    let result = reconciler.reconcile(&request).await;
    
    assert!(matches!(result, Err(ControllerError::Ipam(IpamError::PoolNotFound(_)))));
    assert!(fresh(&store, &request).await.status.is_none());
}

#[tokio::test]
async fn test_event_filter() {
    let (store, reconciler) = setup();
    let request = store.create_block_request("default", "node1").await.unwrap();
    
    assert!(reconciler.should_process(None, &request));
    assert!(reconciler.should_process(Some(&request), &request));
    
    reconciler.reconcile(&request).await.unwrap();
    let completed = fresh(&store, &request).await;
    assert!(!reconciler.should_process(Some(&request), &completed));
    assert!(!reconciler.should_process(Some(&completed), &completed));
    // First sight after a restart still goes through the idempotency guard
    assert!(reconciler.should_process(None, &completed));
}

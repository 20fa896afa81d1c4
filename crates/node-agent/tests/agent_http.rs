//! Drives a bound agent listener through `AgentClient`, with an in-memory
//! cluster whose request processor stands in for the controller.

use ipam_core::MemoryStore;
use node_agent::{
    router, AgentClient, AgentMetrics, AllocatorSettings, LocalAddressAllocator, PodIdentity,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

async fn start_agent(store: &MemoryStore, node: &str) -> (AgentClient, JoinHandle<()>) {
    let allocator = LocalAddressAllocator::new(
        AllocatorSettings {
            node_name: node.to_string(),
            pool_name: "default".to_string(),
            request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
        },
        Arc::new(store.clone()),
        Arc::new(AgentMetrics::new().unwrap()),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(Arc::new(allocator));
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = AgentClient::new(format!("http://{addr}"), Duration::from_secs(10)).unwrap();
    (client, server)
}

fn pod(n: usize) -> PodIdentity {
    PodIdentity::new("default", format!("web-{n}"), format!("{n:08x}")).unwrap()
}

#[tokio::test]
async fn test_pod_lifecycle_over_http() {
    let store = MemoryStore::new();
    store.add_pool("default", "10.20.0.0/24", 6);
    let cluster = store.spawn_request_processor();
    let (client, server) = start_agent(&store, "node-a").await;

    let status = client.status().await.unwrap();
    assert_eq!(status.status, "ok");
    assert_eq!(status.agent.owned_blocks, 0);

    let allocation = client.allocate(&pod(1)).await.unwrap();
    assert_eq!(allocation.address.to_string(), "10.20.0.0");
    assert_eq!(client.allocate(&pod(1)).await.unwrap(), allocation);
    assert_eq!(client.lookup(&pod(1)).await.unwrap(), Some(allocation.clone()));

    assert_eq!(client.release(&pod(1)).await.unwrap(), Some(allocation));
    assert_eq!(client.release(&pod(1)).await.unwrap(), None);
    assert_eq!(client.lookup(&pod(1)).await.unwrap(), None);

    let status = client.status().await.unwrap();
    assert_eq!(status.agent.owned_blocks, 1);
    assert_eq!(status.agent.allocated, 0);
    assert_eq!(status.agent.capacity, 64);

    server.abort();
    cluster.abort();
}

#[tokio::test]
async fn test_two_nodes_never_share_addresses() {
    let store = MemoryStore::new();
    store.add_pool("default", "10.20.0.0/24", 4);
    let cluster = store.spawn_request_processor();
    let (node_a, server_a) = start_agent(&store, "node-a").await;
    let (node_b, server_b) = start_agent(&store, "node-b").await;

    let requests = (0..40).map(|n| {
        let client = if n % 2 == 0 { node_a.clone() } else { node_b.clone() };
        async move { client.allocate(&pod(n)).await }
    });
    let allocations = futures::future::join_all(requests).await;

    let mut seen = HashSet::new();
    for allocation in allocations {
        let allocation = allocation.unwrap();
        assert!(seen.insert(allocation.address), "{} handed out twice", allocation.address);
    }

    // Every block is owned by exactly one of the two nodes
    for block in store.blocks() {
        let owner = block.spec.owner_node.as_deref();
        assert!(owner == Some("node-a") || owner == Some("node-b"), "{:?}", owner);
    }

    server_a.abort();
    server_b.abort();
    cluster.abort();
}

#[tokio::test]
async fn test_exhaustion_surfaces_error_code() {
    let store = MemoryStore::new();
    store.add_pool("default", "10.20.0.0/30", 2);
    let cluster = store.spawn_request_processor();
    let (client, server) = start_agent(&store, "node-a").await;

    for n in 0..4 {
        client.allocate(&pod(n)).await.unwrap();
    }
    let err = client.allocate(&pod(4)).await.unwrap_err();
    assert_eq!(err.code(), Some("POOL_EXHAUSTED"));

    server.abort();
    cluster.abort();
}

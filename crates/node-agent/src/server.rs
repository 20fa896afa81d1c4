//! HTTP surface consumed by the container-runtime plugin.
//!
//! | Path                         | Method | Action   |
//! |------------------------------|--------|----------|
//! | `/status`                    | GET    | capacity |
//! | `/ip`                        | POST   | allocate |
//! | `/ip/{ns}/{pod}/{container}` | GET    | lookup   |
//! | `/ip/{ns}/{pod}/{container}` | DELETE | release  |
//!
//! Identity paths are matched by hand rather than with a route pattern so
//! that a wrong segment count or an empty segment is answered with 400
//! instead of the router's 404, and an unsupported method on a valid
//! identity with 405.

use crate::allocator::{AgentStatus, Allocation, LocalAddressAllocator};
use crate::error::ApiError;
use crate::identity::PodIdentity;
use axum::{
    body::Bytes,
    extract::State,
    http::{Method, Uri},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const IDENTITY_PREFIX: &str = "/ip/";

#[derive(Debug, Clone)]
pub struct AppState {
    pub allocator: Arc<LocalAddressAllocator>,
}

/// Body of `GET /status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(flatten)]
    pub agent: AgentStatus,
}

/// Router of the allocation API.
pub fn router(allocator: Arc<LocalAddressAllocator>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/ip", post(allocate))
        .fallback(identity_route)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { allocator })
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
        agent: state.allocator.status(),
    })
}

async fn allocate(State(state): State<AppState>, body: Bytes) -> Result<Json<Allocation>, ApiError> {
    let identity: PodIdentity = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid allocation request: {e}")))?;
    identity.validate()?;

    let allocation = state.allocator.allocate(&identity).await?;
    Ok(Json(allocation))
}

async fn identity_route(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
) -> Result<Json<Allocation>, ApiError> {
    let Some(key) = uri.path().strip_prefix(IDENTITY_PREFIX) else {
        return Err(ApiError::NotFound(format!("no route for {}", uri.path())));
    };
    let identity = PodIdentity::from_path(key)?;

    match method {
        Method::GET => Ok(Json(state.allocator.lookup(&identity)?)),
        Method::DELETE => state
            .allocator
            .release(&identity)
            .await?
            .map(Json)
            .ok_or_else(|| ApiError::NotFound(format!("no address is bound to {identity}"))),
        _ => Err(ApiError::MethodNotAllowed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorResponse;
    use crate::allocator::AllocatorSettings;
    use crate::metrics::AgentMetrics;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use ipam_core::{BlockAllocator, MemoryStore};
    use std::time::Duration;
    use tower::ServiceExt;

    /// Router over a node that already owns block `default-0` (10.1.0.0/25).
    async fn test_app() -> Router {
        let store = MemoryStore::new();
        store.add_pool("default", "10.1.0.0/24", 7);
        BlockAllocator::new(Arc::new(store.clone()))
            .allocate_block("default", "node1", "preassigned")
            .await
            .unwrap();

        let allocator = LocalAddressAllocator::new(
            AllocatorSettings {
                node_name: "node1".to_string(),
                pool_name: "default".to_string(),
                request_timeout: Duration::from_millis(100),
                poll_interval: Duration::from_millis(5),
            },
            Arc::new(store),
            Arc::new(AgentMetrics::new().unwrap()),
        );
        allocator.recover().await.unwrap();
        router(Arc::new(allocator))
    }

    fn request(method: &str, uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_allocate_lookup_release() {
        let app = test_app().await;
        let body = r#"{"podNamespace":"ns1","podName":"pod1","containerId":"c1"}"#;

        let response = app.clone().oneshot(request("POST", "/ip", Body::from(body))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let allocated: Allocation = body_json(response).await;
        assert_eq!(allocated.address.to_string(), "10.1.0.0");
        assert_eq!(allocated.block_name, "default-0");

        let response = app.clone().oneshot(request("GET", "/ip/ns1/pod1/c1", Body::empty())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json::<Allocation>(response).await, allocated);

        let response = app.clone().oneshot(request("DELETE", "/ip/ns1/pod1/c1", Body::empty())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json::<Allocation>(response).await, allocated);

        let response = app.clone().oneshot(request("GET", "/ip/ns1/pod1/c1", Body::empty())).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.oneshot(request("DELETE", "/ip/ns1/pod1/c1", Body::empty())).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let error: ErrorResponse = body_json(response).await;
        assert_eq!(error.code, "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_path_validation() {
        let app = test_app().await;
        let cases = [
            ("GET", "/ip/ns1/pod1", StatusCode::BAD_REQUEST),
            ("GET", "/ip//pod1/c1", StatusCode::BAD_REQUEST),
            ("GET", "/ip/ns1/pod1/c1/eth0", StatusCode::BAD_REQUEST),
            ("DELETE", "/ip/ns1/pod1/", StatusCode::BAD_REQUEST),
            ("PATCH", "/ip/ns1/pod1/c1", StatusCode::METHOD_NOT_ALLOWED),
            ("PUT", "/ip/ns1/pod1/c1", StatusCode::METHOD_NOT_ALLOWED),
            ("GET", "/unknown", StatusCode::NOT_FOUND),
            ("GET", "/metrics", StatusCode::NOT_FOUND),
        ];
        for (method, uri, expected) in cases {
            let response = app.clone().oneshot(request(method, uri, Body::empty())).await.unwrap();
            assert_eq!(response.status(), expected, "{method} {uri}");
        }
    }

    #[tokio::test]
    async fn test_malformed_allocation_body() {
        let app = test_app().await;
        let bodies = [
            "not json",
            r#"{"podNamespace":"ns1","podName":"pod1"}"#,
            r#"{"podNamespace":"ns1","podName":"","containerId":"c1"}"#,
        ];
        for body in bodies {
            let response = app.clone().oneshot(request("POST", "/ip", Body::from(body))).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
            let error: ErrorResponse = body_json(response).await;
            assert_eq!(error.code, "BAD_REQUEST");
        }
    }

    #[tokio::test]
    async fn test_status_reports_capacity() {
        let app = test_app().await;
        let response = app.oneshot(request("GET", "/status", Body::empty())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let value: serde_json::Value = body_json(response).await;
        assert_eq!(value["status"], "ok");
        assert_eq!(value["node"], "node1");
        assert_eq!(value["ownedBlocks"], 1);
        assert_eq!(value["allocated"], 0);
        assert_eq!(value["capacity"], 128);
    }

    #[tokio::test]
    async fn test_grant_timeout_is_unavailable() {
        let store = MemoryStore::new();
        store.add_pool("default", "10.9.0.0/24", 7);
        let allocator = LocalAddressAllocator::new(
            AllocatorSettings {
                node_name: "node1".to_string(),
                pool_name: "default".to_string(),
                request_timeout: Duration::from_millis(50),
                poll_interval: Duration::from_millis(5),
            },
            Arc::new(store),
            Arc::new(AgentMetrics::new().unwrap()),
        );
        let app = router(Arc::new(allocator));

        // Nothing processes the BlockRequest, so the wait times out
        let body = r#"{"podNamespace":"ns1","podName":"pod1","containerId":"c1"}"#;
        let response = app.oneshot(request("POST", "/ip", Body::from(body))).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let error: ErrorResponse = body_json(response).await;
        assert_eq!(error.code, "UNAVAILABLE");
    }
}

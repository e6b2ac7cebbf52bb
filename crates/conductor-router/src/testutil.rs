use std::net::SocketAddr;
use std::sync::Arc;

use conductor_common::{ModelRunnerEndpoint, VirtualModelRunner};
use conductor_meta::{DirectoryEvent, DirectorySnapshot, MemoryDirectory};
use serde_json::json;

use crate::Router;

/// Endpoint with probing disabled, so it is healthy as soon as it is tracked.
pub(crate) fn make_endpoint(id: &str, weight: u32, max_parallel: u32) -> ModelRunnerEndpoint {
    let mut ep: ModelRunnerEndpoint = serde_json::from_value(json!({
        "id": id,
        "tenant_id": "t1",
        "name": format!("endpoint {id}"),
        "hostname": "127.0.0.1",
        "port": 9,
    }))
    .unwrap();
    ep.weight = weight;
    ep.max_parallel_requests = max_parallel;
    ep.health_check.enabled = false;
    ep
}

/// Ollama runner served under `/{id}`.
pub(crate) fn make_vmr(id: &str, endpoint_ids: &[&str]) -> VirtualModelRunner {
    let mut vmr: VirtualModelRunner = serde_json::from_value(json!({
        "id": id,
        "tenant_id": "t1",
        "name": format!("runner {id}"),
        "base_path": format!("/{id}"),
    }))
    .unwrap();
    vmr.model_runner_endpoint_ids = endpoint_ids.iter().map(|s| s.to_string()).collect();
    vmr
}

pub(crate) async fn router_with(
    vmrs: Vec<VirtualModelRunner>,
    endpoints: Vec<ModelRunnerEndpoint>,
) -> (Arc<Router>, Arc<MemoryDirectory>) {
    let dir = Arc::new(MemoryDirectory::from_snapshot(DirectorySnapshot {
        vmrs,
        endpoints: endpoints.clone(),
        ..DirectorySnapshot::default()
    }));
    let router = Router::with_seed(dir.clone(), reqwest::Client::new(), 7);
    for ep in endpoints {
        router.on_directory_event(&DirectoryEvent::EndpointCreated(ep));
    }
    (router, dir)
}

pub(crate) async fn spawn_upstream(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

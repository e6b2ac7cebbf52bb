use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use conductor_meta::Directory;
use conductor_router::Router;

/// Keep the router's health tracking and session pins in step with the
/// directory: subscribe, reconcile against a full listing, then apply events.
pub async fn directory_sync_loop(
    directory: Arc<dyn Directory>,
    router: Arc<Router>,
) -> anyhow::Result<()> {
    loop {
        let mut stream = match directory.watch().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error=%e, "failed to watch directory, will retry");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let listing = async {
            let endpoints = directory.list_endpoints(None).await?;
            let vmrs = directory.list_vmrs(None).await?;
            anyhow::Ok((endpoints, vmrs))
        };
        match listing.await {
            Ok((endpoints, vmrs)) => {
                let (endpoint_count, vmr_count) = (endpoints.len(), vmrs.len());
                router.reconcile(endpoints, &vmrs);
                tracing::info!(endpoints = endpoint_count, vmrs = vmr_count, "directory synchronized");
            }
            Err(e) => {
                tracing::warn!(error=%e, "failed to list directory, will retry");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        }

        while let Some(ev) = stream.next().await {
            router.on_directory_event(&ev);
        }

        tracing::warn!("directory watch stream ended, reconnecting");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Periodically sweep expired session pins.
pub async fn session_cleanup_loop(router: Arc<Router>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let purged = router.sessions().cleanup();
        if purged > 0 {
            tracing::debug!(purged, "expired sessions removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use conductor_common::ModelRunnerEndpoint;
    use conductor_meta::MemoryDirectory;
    use serde_json::json;

    use super::*;

    fn endpoint(id: &str) -> ModelRunnerEndpoint {
        serde_json::from_value(json!({
            "id": id,
            "tenant_id": "t1",
            "hostname": "127.0.0.1",
            "port": 9,
            "health_check": {"enabled": false},
        }))
        .unwrap()
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(tokio::time::Instant::now() < deadline, "condition not reached");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_sync_tracks_listing_and_events() {
        let dir = Arc::new(MemoryDirectory::new());
        dir.put_endpoint(endpoint("a")).await;
        let router = Router::new(dir.clone(), reqwest::Client::new());

        let task = tokio::spawn(directory_sync_loop(dir.clone(), router.clone()));
        wait_for(|| router.health().is_healthy("a")).await;

        dir.put_endpoint(endpoint("b")).await;
        wait_for(|| router.health().is_healthy("b")).await;

        dir.delete_endpoint("t1", "a").await;
        wait_for(|| router.health().get_health_state("a").is_none()).await;
        assert_eq!(router.health().tracked_count(), 1);

        task.abort();
    }

    #[tokio::test]
    async fn test_lagged_watch_is_reconciled_by_relisting() {
        let dir = Arc::new(MemoryDirectory::with_event_capacity(2));
        dir.put_endpoint(endpoint("a")).await;
        let router = Router::new(dir.clone(), reqwest::Client::new());
        router.sessions().set_pinned_endpoint("v", "client", "a", 60_000, 0);

        let task = tokio::spawn(directory_sync_loop(dir.clone(), router.clone()));
        wait_for(|| router.health().is_healthy("a")).await;

        // no await point yields to the sync task, so its watcher overflows
        dir.delete_endpoint("t1", "a").await;
        for id in ["c", "d", "e"] {
            dir.put_endpoint(endpoint(id)).await;
        }

        wait_for(|| router.health().is_healthy("e")).await;
        wait_for(|| router.health().get_health_state("a").is_none()).await;
        assert_eq!(router.health().tracked_count(), 3);
        assert_eq!(router.sessions().try_get_pinned_endpoint("v", "client"), None);

        task.abort();
    }

    #[tokio::test]
    async fn test_cleanup_loop_sweeps_expired_pins() {
        let router = Router::new(Arc::new(MemoryDirectory::new()), reqwest::Client::new());
        router.sessions().set_pinned_endpoint("v", "c", "e", 10, 0);
        let task = tokio::spawn(session_cleanup_loop(router.clone(), Duration::from_millis(100)));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(router.sessions().get_session_count("v"), 0);
        assert_eq!(router.sessions().cleanup(), 0);
        task.abort();
    }
}

mod args;
mod handlers;
mod metrics;
mod state;
mod sync;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use conductor_meta::{Directory, MemoryDirectory};
use conductor_router::proxy::ProxyOptions;
use conductor_router::Router;

use crate::args::Args;
use crate::state::AppState;
use crate::sync::{directory_sync_loop, session_cleanup_loop};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error=%e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let otel_provider = conductor_common::telemetry::init_tracing(
        "conductor-router",
        args.otlp_url.as_deref(),
        args.otlp_token.as_deref(),
        &args.log_format,
    );

    let directory = match &args.directory_file {
        Some(path) => MemoryDirectory::load_file(path).await?,
        None => {
            tracing::warn!("no directory file given, starting with an empty directory");
            MemoryDirectory::new()
        }
    };
    let directory: Arc<dyn Directory> = Arc::new(directory);

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(args.connect_timeout_ms))
        .build()?;

    let router = match args.random_seed {
        Some(seed) => Router::with_seed(directory.clone(), http.clone(), seed),
        None => Router::new(directory.clone(), http.clone()),
    };

    let router_for_sync = router.clone();
    tokio::spawn(async move {
        if let Err(e) = directory_sync_loop(directory, router_for_sync).await {
            tracing::error!(error=%e, "directory sync loop exited");
        }
    });

    tokio::spawn(session_cleanup_loop(
        router.clone(),
        Duration::from_millis(args.session_cleanup_interval_ms),
    ));

    let st = AppState {
        router,
        http,
        metrics: Arc::new(metrics::Metrics::default()),
        proxy: ProxyOptions {
            max_body_bytes: args.max_request_body_bytes,
            forwarded_proto: args.forwarded_proto.clone(),
        },
    };
    let app = handlers::build_router(st);

    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    tracing::info!(addr=%args.listen_addr, "conductor-router listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(provider) = otel_provider {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error=%e, "failed to flush spans on shutdown");
        }
    }
    tracing::info!("conductor-router stopped");
    Ok(())
}

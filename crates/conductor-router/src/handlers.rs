use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Query, State},
    http::{Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json,
};
use futures_util::FutureExt;
use serde::Deserialize;

use conductor_router::error::RouteError;
use conductor_router::proxy;

use crate::metrics::{metrics_handler, track_requests};
use crate::state::AppState;

pub fn build_router(st: AppState) -> axum::Router {
    axum::Router::new()
        .route("/_conductor/healthz", get(healthz))
        .route("/_conductor/metrics", get(metrics_handler))
        .route("/_conductor/endpoints/health", get(endpoints_health))
        .route("/_conductor/endpoints/:id/health", get(endpoint_health))
        .route("/_conductor/vmrs/:id/sessions", get(vmr_sessions))
        .fallback(proxy_request)
        .layer(middleware::from_fn_with_state(st.clone(), track_requests))
        .with_state(st)
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn proxy_request(
    State(st): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    req: Request<Body>,
) -> Response {
    let peer = peer.map(|ConnectInfo(addr)| addr);
    let path = req.uri().path().to_string();
    let fut = proxy::handle(&st.router, &st.http, req, peer, &st.proxy);
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(resp) => resp,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(path=%path, panic=%msg, "request pipeline panicked");
            RouteError::BadGateway("internal routing error".into()).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    pub tenant_id: Option<String>,
}

pub async fn endpoints_health(
    State(st): State<AppState>,
    Query(q): Query<HealthQuery>,
) -> impl IntoResponse {
    Json(
        st.router
            .health()
            .get_all_health_states(q.tenant_id.as_deref()),
    )
}

pub async fn endpoint_health(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, RouteError> {
    st.router
        .health()
        .get_health_state(&id)
        .map(|state| Json(state).into_response())
        .ok_or_else(|| RouteError::NotFound(format!("endpoint '{id}' is not tracked")))
}

pub async fn vmr_sessions(State(st): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let sessions = st.router.sessions().get_session_count(&id);
    Json(serde_json::json!({ "vmr_id": id, "sessions": sessions }))
}

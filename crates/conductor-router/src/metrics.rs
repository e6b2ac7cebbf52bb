use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use conductor_router::Router;

use crate::state::AppState;

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
}

impl Metrics {
    pub fn render(&self, router: &Router) -> String {
        let states = router.health().get_all_health_states(None);
        let healthy = states.iter().filter(|s| s.is_healthy).count();
        let upstream_inflight: u64 = states.iter().map(|s| u64::from(s.in_flight_requests)).sum();

        let mut out = String::new();
        let mut line = |name: &str, value: u64| {
            out.push_str(name);
            out.push(' ');
            out.push_str(&value.to_string());
            out.push('\n');
        };
        line("conductor_router_requests_total", self.requests_total.load(Ordering::Relaxed));
        line("conductor_router_requests_inflight", self.requests_inflight.load(Ordering::Relaxed));
        line("conductor_router_responses_2xx", self.status_2xx.load(Ordering::Relaxed));
        line("conductor_router_responses_4xx", self.status_4xx.load(Ordering::Relaxed));
        line("conductor_router_responses_5xx", self.status_5xx.load(Ordering::Relaxed));
        line("conductor_router_session_pins_reused_total", router.pins_reused_total());
        line("conductor_router_stale_pins_evicted_total", router.stale_pins_evicted_total());
        line("conductor_router_upstream_errors_total", router.upstream_errors_total());
        line("conductor_router_endpoints_tracked", states.len() as u64);
        line("conductor_router_endpoints_healthy", healthy as u64);
        line("conductor_router_upstream_inflight", upstream_inflight);
        for state in &states {
            out.push_str(&format!(
                "conductor_router_endpoint_uptime_percent{{endpoint_id=\"{}\",tenant_id=\"{}\"}} {:.2}\n",
                state.endpoint_id,
                state.tenant_id,
                state.uptime_percentage()
            ));
        }
        out
    }
}

pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.metrics.render(&st.router),
    )
}

pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    st.metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
    let resp = next.run(req).await;
    st.metrics.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    st.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let status = resp.status().as_u16();
    if status >= 500 {
        st.metrics.status_5xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 400 {
        st.metrics.status_4xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 200 {
        st.metrics.status_2xx.fetch_add(1, Ordering::Relaxed);
    }

    Ok(resp)
}

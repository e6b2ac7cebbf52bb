use std::sync::Arc;

use conductor_router::proxy::ProxyOptions;
use conductor_router::Router;

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router>,
    pub http: reqwest::Client,
    pub metrics: Arc<Metrics>,
    pub proxy: ProxyOptions,
}

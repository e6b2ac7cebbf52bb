use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::http::HeaderMap;

use conductor_common::{
    ModelConfiguration, ModelDefinition, ModelRunnerEndpoint, VirtualModelRunner,
};
use conductor_meta::{Directory, DirectoryEvent};

pub mod affinity;
pub mod error;
pub mod health;
pub mod proxy;
pub mod request;
pub mod rewrite;
pub mod strategy;

#[cfg(test)]
mod testutil;

use affinity::SessionAffinityTable;
use error::RouteError;
use health::{HealthMonitor, InFlightGuard};
use request::RequestKind;
use strategy::{Balancer, Candidate};

/// The parts of an inbound request the routing decision looks at.
#[derive(Debug, Clone, Copy)]
pub struct RouteRequest<'a> {
    pub path: &'a str,
    pub host: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub peer: Option<IpAddr>,
}

/// Outcome of routing: the target endpoint with its in-flight slot reserved.
#[derive(Debug)]
pub struct RouteDecision {
    pub vmr: VirtualModelRunner,
    pub endpoint: ModelRunnerEndpoint,
    pub kind: RequestKind,
    pub relative_path: String,
    /// True when an existing, still valid session pin chose the endpoint.
    pub session_pinned: bool,
    pub guard: InFlightGuard,
}

/// Models attached to a runner that body rewriting consults.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    pub definitions: Vec<ModelDefinition>,
    pub configurations: Vec<ModelConfiguration>,
}

pub struct Router {
    directory: Arc<dyn Directory>,
    health: Arc<HealthMonitor>,
    sessions: SessionAffinityTable,
    balancer: Balancer,
    pins_reused_total: AtomicU64,
    stale_pins_evicted_total: AtomicU64,
    upstream_errors_total: AtomicU64,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("tracked_endpoints", &self.health.tracked_count())
            .finish()
    }
}

impl Router {
    pub fn new(directory: Arc<dyn Directory>, http: reqwest::Client) -> Arc<Self> {
        Self::with_balancer(directory, http, Balancer::new())
    }

    /// Router whose random balancer is seeded, for reproducible selection.
    pub fn with_seed(directory: Arc<dyn Directory>, http: reqwest::Client, seed: u64) -> Arc<Self> {
        Self::with_balancer(directory, http, Balancer::with_seed(seed))
    }

    fn with_balancer(
        directory: Arc<dyn Directory>,
        http: reqwest::Client,
        balancer: Balancer,
    ) -> Arc<Self> {
        tracing::info!("router initialized");
        Arc::new(Self {
            directory,
            health: HealthMonitor::new(http),
            sessions: SessionAffinityTable::new(),
            balancer,
            pins_reused_total: AtomicU64::new(0),
            stale_pins_evicted_total: AtomicU64::new(0),
            upstream_errors_total: AtomicU64::new(0),
        })
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn sessions(&self) -> &SessionAffinityTable {
        &self.sessions
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn pins_reused_total(&self) -> u64 {
        self.pins_reused_total.load(Ordering::Relaxed)
    }

    pub fn stale_pins_evicted_total(&self) -> u64 {
        self.stale_pins_evicted_total.load(Ordering::Relaxed)
    }

    pub fn upstream_errors_total(&self) -> u64 {
        self.upstream_errors_total.load(Ordering::Relaxed)
    }

    pub fn inc_upstream_errors(&self) {
        self.upstream_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Take an in-flight slot on the selected endpoint. Another request may
    /// have filled it since candidates were filtered; that is not retried.
    fn reserve(&self, endpoint: &ModelRunnerEndpoint) -> Result<InFlightGuard, RouteError> {
        self.health
            .try_acquire(&endpoint.id, endpoint.max_parallel_requests)
            .ok_or_else(|| RouteError::TooManyRequests("endpoint reached capacity".into()))
    }

    /// Apply a configuration change to health tracking and session pins.
    pub fn on_directory_event(&self, event: &DirectoryEvent) {
        match event {
            DirectoryEvent::EndpointCreated(ep) => {
                self.health.on_endpoint_created(ep);
            }
            DirectoryEvent::EndpointUpdated(ep) => {
                self.health.on_endpoint_updated(ep);
                self.sessions.remove_all_for_endpoint(&ep.id);
            }
            DirectoryEvent::EndpointDeleted(ep) => {
                self.health.on_endpoint_deleted(&ep.id);
                self.sessions.remove_all_for_endpoint(&ep.id);
            }
            DirectoryEvent::VmrUpdated(vmr) | DirectoryEvent::VmrDeleted(vmr) => {
                let dropped = self.sessions.remove_all_for_vmr(&vmr.id);
                self.balancer.forget(&vmr.id);
                tracing::debug!(vmr_id=%vmr.id, dropped, "vmr changed, sessions cleared");
            }
        }
    }

    /// Bring health tracking and session pins in line with a full directory
    /// listing, covering changes whose events were never delivered.
    pub fn reconcile(&self, endpoints: Vec<ModelRunnerEndpoint>, vmrs: &[VirtualModelRunner]) {
        let listed: HashSet<String> = endpoints.iter().map(|ep| ep.id.clone()).collect();
        for state in self.health.get_all_health_states(None) {
            if !listed.contains(&state.endpoint_id) {
                self.health.on_endpoint_deleted(&state.endpoint_id);
                self.sessions.remove_all_for_endpoint(&state.endpoint_id);
            }
        }
        for ep in endpoints {
            self.health.on_endpoint_created(&ep);
        }

        let listed: HashSet<&str> = vmrs.iter().map(|vmr| vmr.id.as_str()).collect();
        for vmr_id in self.sessions.vmr_ids() {
            if !listed.contains(vmr_id.as_str()) {
                let dropped = self.sessions.remove_all_for_vmr(&vmr_id);
                self.balancer.forget(&vmr_id);
                tracing::debug!(vmr_id=%vmr_id, dropped, "vmr gone, sessions cleared");
            }
        }
    }

    /// Active runner matching the path and host, else NotFound.
    pub async fn resolve_vmr(
        &self,
        path: &str,
        host: Option<&str>,
    ) -> Result<VirtualModelRunner, RouteError> {
        let found = self
            .directory
            .read_vmr_by_routing_key(path, host)
            .await
            .map_err(|e| {
                tracing::error!(error=%e, path, "directory lookup failed");
                RouteError::BadGateway("configuration is unavailable".into())
            })?;
        match found {
            Some(vmr) if vmr.active => Ok(vmr),
            _ => Err(RouteError::NotFound(format!("no virtual model runner serves '{path}'"))),
        }
    }

    async fn load_endpoints(&self, vmr: &VirtualModelRunner) -> Vec<ModelRunnerEndpoint> {
        let mut out = Vec::with_capacity(vmr.model_runner_endpoint_ids.len());
        for id in &vmr.model_runner_endpoint_ids {
            match self.directory.read_endpoint(&vmr.tenant_id, id).await {
                Ok(Some(ep)) => out.push(ep),
                Ok(None) => {
                    tracing::debug!(vmr_id=%vmr.id, endpoint_id=%id, "attached endpoint not found");
                }
                Err(e) => {
                    tracing::warn!(vmr_id=%vmr.id, endpoint_id=%id, error=%e, "failed to read endpoint");
                }
            }
        }
        out
    }

    /// Active definitions and configurations attached to the runner, in order.
    pub async fn model_catalog(&self, vmr: &VirtualModelRunner) -> ModelCatalog {
        let mut catalog = ModelCatalog::default();
        for id in &vmr.model_definition_ids {
            match self.directory.read_model_definition(&vmr.tenant_id, id).await {
                Ok(Some(def)) if def.active => catalog.definitions.push(def),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(vmr_id=%vmr.id, definition_id=%id, error=%e, "failed to read model definition");
                }
            }
        }
        for id in &vmr.model_configuration_ids {
            match self.directory.read_model_configuration(&vmr.tenant_id, id).await {
                Ok(Some(cfg)) if cfg.active => catalog.configurations.push(cfg),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(vmr_id=%vmr.id, configuration_id=%id, error=%e, "failed to read model configuration");
                }
            }
        }
        catalog
    }

    fn admissible(&self, ep: &ModelRunnerEndpoint) -> bool {
        ep.active
            && self.health.is_healthy(&ep.id)
            && self.health.has_capacity(&ep.id, ep.max_parallel_requests)
    }

    /// Pick an endpoint for the request and reserve one in-flight slot on it.
    pub async fn route(&self, req: &RouteRequest<'_>) -> Result<RouteDecision, RouteError> {
        let vmr = self.resolve_vmr(req.path, req.host).await?;
        let relative_path = vmr.relative_path(req.path);
        let kind = RequestKind::classify(vmr.api_type, &relative_path);
        kind.check_allowed(&vmr).map_err(|capability| {
            RouteError::Forbidden(format!("{capability} requests are not allowed on this runner"))
        })?;

        let client_key = request::derive_client_key(&vmr, req.headers, req.peer);
        let endpoints = self.load_endpoints(&vmr).await;
        if endpoints.is_empty() {
            return Err(RouteError::BadGateway(
                "no endpoints are configured for this runner".into(),
            ));
        }

        if let Some(key) = client_key.as_deref() {
            if let Some(pinned_id) = self.sessions.try_get_pinned_endpoint(&vmr.id, key) {
                let guard = endpoints
                    .iter()
                    .find(|ep| ep.id == pinned_id)
                    .filter(|ep| self.admissible(ep))
                    .and_then(|ep| {
                        self.health
                            .try_acquire(&ep.id, ep.max_parallel_requests)
                            .map(|guard| (ep.clone(), guard))
                    });
                match guard {
                    Some((endpoint, guard)) => {
                        self.pins_reused_total.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(vmr_id=%vmr.id, endpoint_id=%endpoint.id, "session pin reused");
                        return Ok(RouteDecision {
                            vmr,
                            endpoint,
                            kind,
                            relative_path,
                            session_pinned: true,
                            guard,
                        });
                    }
                    None => {
                        self.sessions.remove_pinned_endpoint(&vmr.id, key);
                        self.stale_pins_evicted_total.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(vmr_id=%vmr.id, endpoint_id=%pinned_id, "stale session pin evicted");
                    }
                }
            }
        }

        let healthy: Vec<&ModelRunnerEndpoint> = endpoints
            .iter()
            .filter(|ep| ep.active && self.health.is_healthy(&ep.id))
            .collect();
        if healthy.is_empty() {
            return Err(RouteError::BadGateway(
                "no healthy endpoints are available for this runner".into(),
            ));
        }

        let candidates: Vec<Candidate> = healthy
            .into_iter()
            .map(|endpoint| Candidate {
                endpoint,
                in_flight: self.health.in_flight(&endpoint.id),
            })
            .filter(|c| {
                let max = c.endpoint.max_parallel_requests;
                max == 0 || c.in_flight < max
            })
            .collect();
        if candidates.is_empty() {
            return Err(RouteError::TooManyRequests(
                "all endpoints of this runner are at capacity".into(),
            ));
        }

        let strategy = self.balancer.for_mode(vmr.load_balancing_mode);
        let endpoint = strategy
            .select(&vmr.id, &candidates)
            .and_then(|i| candidates.get(i))
            .map(|c| c.endpoint.clone())
            .ok_or_else(|| RouteError::BadGateway("no endpoint could be selected".into()))?;

        let guard = self.reserve(&endpoint)?;

        if let Some(key) = client_key.as_deref() {
            self.sessions.set_pinned_endpoint(
                &vmr.id,
                key,
                &endpoint.id,
                vmr.session_timeout_ms,
                vmr.session_max_entries,
            );
        }

        tracing::debug!(
            vmr_id=%vmr.id,
            endpoint_id=%endpoint.id,
            strategy=strategy.name(),
            kind=kind.as_str(),
            "request routed"
        );
        Ok(RouteDecision {
            vmr,
            endpoint,
            kind,
            relative_path,
            session_pinned: false,
            guard,
        })
    }
}

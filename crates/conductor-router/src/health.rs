use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;

use conductor_common::{
    EndpointHealthState, HealthCheckConfig, HealthCheckMethod, ModelRunnerEndpoint,
};

/// Floor for probe intervals so a misconfigured endpoint cannot spin.
const MIN_PROBE_INTERVAL_MS: u64 = 100;

#[derive(Debug)]
struct Tracked {
    state: EndpointHealthState,
    check: HealthCheckConfig,
}

/// Per-endpoint record. The state mutex is never held across an await.
#[derive(Debug)]
struct EndpointSlot {
    inner: Mutex<Tracked>,
    in_flight: AtomicU32,
    probe_task: Mutex<Option<JoinHandle<()>>>,
}

impl EndpointSlot {
    fn new(endpoint: &ModelRunnerEndpoint) -> Self {
        Self {
            inner: Mutex::new(Tracked {
                state: EndpointHealthState::for_endpoint(endpoint),
                check: endpoint.health_check.clone(),
            }),
            in_flight: AtomicU32::new(0),
            probe_task: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self) -> EndpointHealthState {
        let mut state = self.lock().state.clone();
        state.in_flight_requests = self.in_flight.load(Ordering::Acquire);
        state
    }

    fn is_healthy(&self) -> bool {
        self.lock().state.is_healthy
    }

    fn record(&self, outcome: Result<(), String>) -> Option<bool> {
        let mut tracked = self.lock();
        let Tracked { state, check } = &mut *tracked;
        apply_outcome(state, check, outcome, Utc::now())
    }

    fn try_increment(&self, max_parallel: u32) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if max_parallel > 0 && current >= max_parallel {
                    None
                } else {
                    Some(current.saturating_add(1))
                }
            })
            .is_ok()
    }

    fn decrement(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
    }

    fn replace_probe(&self, handle: Option<JoinHandle<()>>) {
        let mut task = self
            .probe_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(old) = task.take() {
            old.abort();
        }
        *task = handle;
    }
}

/// Apply one probe outcome to a health record.
///
/// Returns `Some(new_flag)` when `is_healthy` flipped, `None` otherwise.
pub fn apply_outcome(
    state: &mut EndpointHealthState,
    check: &HealthCheckConfig,
    outcome: Result<(), String>,
    now: DateTime<Utc>,
) -> Option<bool> {
    if let Some(last) = state.last_check_utc {
        let elapsed = u64::try_from((now - last).num_milliseconds()).unwrap_or(0);
        if state.is_healthy {
            state.total_uptime_ms = state.total_uptime_ms.saturating_add(elapsed);
        } else {
            state.total_downtime_ms = state.total_downtime_ms.saturating_add(elapsed);
        }
    }
    if state.first_check_utc.is_none() {
        state.first_check_utc = Some(now);
    }
    state.last_check_utc = Some(now);

    match outcome {
        Ok(()) => {
            state.consecutive_successes = state.consecutive_successes.saturating_add(1);
            state.consecutive_failures = 0;
            state.last_healthy_utc = Some(now);
            if !state.is_healthy && state.consecutive_successes >= check.healthy_threshold.max(1) {
                state.is_healthy = true;
                state.last_state_change_utc = Some(now);
                return Some(true);
            }
        }
        Err(error) => {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.consecutive_successes = 0;
            state.last_unhealthy_utc = Some(now);
            state.last_error = Some(error);
            if state.is_healthy && state.consecutive_failures >= check.unhealthy_threshold.max(1) {
                state.is_healthy = false;
                state.last_state_change_utc = Some(now);
                return Some(false);
            }
        }
    }
    None
}

/// Issue one health probe. `Err` carries the failure text.
pub async fn probe(http: &reqwest::Client, endpoint: &ModelRunnerEndpoint) -> Result<(), String> {
    let check = &endpoint.health_check;
    let method = match check.method {
        HealthCheckMethod::Get => reqwest::Method::GET,
        HealthCheckMethod::Head => reqwest::Method::HEAD,
        HealthCheckMethod::Post => reqwest::Method::POST,
    };
    let timeout = Duration::from_millis(check.timeout_ms.max(1));

    let mut req = http
        .request(method, endpoint.health_check_url())
        .timeout(timeout);
    if check.use_auth {
        if let Some(key) = endpoint.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.bearer_auth(key);
        }
    }

    match req.send().await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            if status == check.expected_status_code {
                Ok(())
            } else {
                Err(format!(
                    "unexpected status {status}, expected {}",
                    check.expected_status_code
                ))
            }
        }
        Err(e) if e.is_timeout() => Err(format!("timed out after {}ms", timeout.as_millis())),
        Err(e) => Err(e.to_string()),
    }
}

async fn probe_loop(http: reqwest::Client, slot: Arc<EndpointSlot>, endpoint: ModelRunnerEndpoint) {
    let interval = Duration::from_millis(
        endpoint
            .health_check
            .interval_ms
            .max(MIN_PROBE_INTERVAL_MS),
    );
    loop {
        let outcome = probe(&http, &endpoint).await;
        if let Err(error) = &outcome {
            tracing::debug!(endpoint_id=%endpoint.id, error=%error, "health probe failed");
        }
        match slot.record(outcome) {
            Some(true) => {
                tracing::info!(endpoint_id=%endpoint.id, endpoint=%endpoint.name, "endpoint marked healthy");
            }
            Some(false) => {
                tracing::warn!(endpoint_id=%endpoint.id, endpoint=%endpoint.name, "endpoint marked unhealthy");
            }
            None => {}
        }
        tokio::time::sleep(interval).await;
    }
}

/// Live health and capacity picture of every tracked endpoint.
#[derive(Debug)]
pub struct HealthMonitor {
    http: reqwest::Client,
    endpoints: DashMap<String, Arc<EndpointSlot>>,
}

impl HealthMonitor {
    pub fn new(http: reqwest::Client) -> Arc<Self> {
        Arc::new(Self {
            http,
            endpoints: DashMap::new(),
        })
    }

    pub fn on_endpoint_created(&self, endpoint: &ModelRunnerEndpoint) {
        if self.endpoints.contains_key(&endpoint.id) {
            self.on_endpoint_updated(endpoint);
            return;
        }
        let slot = Arc::new(EndpointSlot::new(endpoint));
        self.endpoints.insert(endpoint.id.clone(), slot.clone());
        tracing::debug!(endpoint_id=%endpoint.id, "endpoint tracked");
        self.configure(&slot, endpoint);
    }

    /// Reconfigure an endpoint. Counters and history are kept; the probe
    /// schedule restarts with the new settings.
    pub fn on_endpoint_updated(&self, endpoint: &ModelRunnerEndpoint) {
        let slot = self
            .endpoints
            .entry(endpoint.id.clone())
            .or_insert_with(|| Arc::new(EndpointSlot::new(endpoint)))
            .value()
            .clone();
        {
            let mut tracked = slot.lock();
            tracked.check = endpoint.health_check.clone();
            tracked.state.endpoint_name = endpoint.name.clone();
            tracked.state.tenant_id = endpoint.tenant_id.clone();
        }
        tracing::debug!(endpoint_id=%endpoint.id, "endpoint reconfigured");
        self.configure(&slot, endpoint);
    }

    pub fn on_endpoint_deleted(&self, endpoint_id: &str) {
        if let Some((_, slot)) = self.endpoints.remove(endpoint_id) {
            slot.replace_probe(None);
            tracing::debug!(endpoint_id=%endpoint_id, "endpoint untracked");
        }
    }

    fn configure(&self, slot: &Arc<EndpointSlot>, endpoint: &ModelRunnerEndpoint) {
        slot.replace_probe(None);

        if !endpoint.health_check.enabled {
            let mut tracked = slot.lock();
            if !tracked.state.is_healthy {
                tracked.state.is_healthy = true;
                tracked.state.last_state_change_utc = Some(Utc::now());
            }
            return;
        }
        if !endpoint.active {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(endpoint_id=%endpoint.id, "no async runtime, health probes not scheduled");
            return;
        };
        let handle = runtime.spawn(probe_loop(
            self.http.clone(),
            slot.clone(),
            endpoint.clone(),
        ));
        slot.replace_probe(Some(handle));
    }

    /// Apply one probe outcome to an endpoint's state.
    pub fn record_result(&self, endpoint_id: &str, outcome: Result<(), String>) -> Option<bool> {
        let slot = self.endpoints.get(endpoint_id)?.value().clone();
        slot.record(outcome)
    }

    pub fn get_health_state(&self, endpoint_id: &str) -> Option<EndpointHealthState> {
        let slot = self.endpoints.get(endpoint_id)?.value().clone();
        Some(slot.snapshot())
    }

    pub fn get_all_health_states(&self, tenant_id: Option<&str>) -> Vec<EndpointHealthState> {
        let slots: Vec<Arc<EndpointSlot>> = self
            .endpoints
            .iter()
            .map(|e| e.value().clone())
            .collect();
        let mut states: Vec<EndpointHealthState> = slots
            .iter()
            .map(|slot| slot.snapshot())
            .filter(|st| tenant_id.map_or(true, |t| st.tenant_id == t))
            .collect();
        states.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        states
    }

    pub fn is_healthy(&self, endpoint_id: &str) -> bool {
        self.endpoints
            .get(endpoint_id)
            .map(|slot| slot.is_healthy())
            .unwrap_or(false)
    }

    pub fn in_flight(&self, endpoint_id: &str) -> u32 {
        self.endpoints
            .get(endpoint_id)
            .map(|slot| slot.in_flight.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn has_capacity(&self, endpoint_id: &str, max_parallel: u32) -> bool {
        max_parallel == 0 || self.in_flight(endpoint_id) < max_parallel
    }

    /// Reserve one slot. Fails without mutation when the endpoint is unknown
    /// or already at `max_parallel` (0 = unlimited).
    pub fn try_increment_in_flight(&self, endpoint_id: &str, max_parallel: u32) -> bool {
        self.endpoints
            .get(endpoint_id)
            .map(|slot| slot.try_increment(max_parallel))
            .unwrap_or(false)
    }

    /// Release a slot taken by [`Self::try_increment_in_flight`].
    pub fn decrement_in_flight(&self, endpoint_id: &str) {
        if let Some(slot) = self.endpoints.get(endpoint_id) {
            slot.decrement();
        }
    }

    /// Reserve one slot, released when the returned guard is dropped.
    pub fn try_acquire(&self, endpoint_id: &str, max_parallel: u32) -> Option<InFlightGuard> {
        let slot = self.endpoints.get(endpoint_id)?.value().clone();
        if !slot.try_increment(max_parallel) {
            return None;
        }
        Some(InFlightGuard {
            slot,
            endpoint_id: endpoint_id.to_string(),
        })
    }

    pub fn tracked_count(&self) -> usize {
        self.endpoints.len()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        for slot in self.endpoints.iter() {
            slot.replace_probe(None);
        }
    }
}

/// Holds one in-flight slot on an endpoint.
///
/// The slot stays attached to the record it was taken from, so a release
/// after the endpoint was deleted never touches a newer record.
#[must_use = "dropping the guard releases the in-flight slot"]
pub struct InFlightGuard {
    slot: Arc<EndpointSlot>,
    endpoint_id: String,
}

impl InFlightGuard {
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }
}

impl std::fmt::Debug for InFlightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightGuard")
            .field("endpoint_id", &self.endpoint_id)
            .finish()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.slot.decrement();
    }
}

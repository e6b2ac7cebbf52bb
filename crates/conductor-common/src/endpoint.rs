use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wire dialect spoken by a backend (and by the virtual runner fronting it).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApiType {
    #[default]
    Ollama,
    #[serde(alias = "open_ai")]
    Openai,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthCheckMethod {
    #[default]
    Get,
    Head,
    Post,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckConfig {
    /// When false the endpoint is assumed healthy and never probed.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Relative path on the endpoint, or an absolute URL.
    #[serde(default = "default_health_check_url")]
    pub url: String,
    #[serde(default)]
    pub method: HealthCheckMethod,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_expected_status")]
    pub expected_status_code: u16,
    #[serde(default = "default_threshold")]
    pub healthy_threshold: u32,
    #[serde(default = "default_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default)]
    pub use_auth: bool,
}

fn default_true() -> bool {
    true
}

fn default_health_check_url() -> String {
    "/".to_string()
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_health_timeout_ms() -> u64 {
    5_000
}

fn default_expected_status() -> u16 {
    200
}

fn default_threshold() -> u32 {
    2
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_health_check_url(),
            method: HealthCheckMethod::default(),
            interval_ms: default_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
            expected_status_code: default_expected_status(),
            healthy_threshold: default_threshold(),
            unhealthy_threshold: default_threshold(),
            use_auth: false,
        }
    }
}

/// One physical backend replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelRunnerEndpoint {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub name: String,

    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_type: ApiType,

    #[serde(default = "default_weight")]
    pub weight: u32,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_parallel_requests: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_timeout_ms() -> u64 {
    60_000
}

impl ModelRunnerEndpoint {
    pub fn base_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.hostname, self.port)
    }

    /// Weight used by the balancers; zero is treated as one.
    pub fn effective_weight(&self) -> u64 {
        u64::from(self.weight.max(1))
    }

    pub fn health_check_url(&self) -> String {
        let url = self.health_check.url.trim();
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        if url.starts_with('/') {
            format!("{}{url}", self.base_url())
        } else {
            format!("{}/{url}", self.base_url())
        }
    }
}

/// Health and capacity picture of one endpoint. Always handed out by value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EndpointHealthState {
    pub endpoint_id: String,
    pub endpoint_name: String,
    pub tenant_id: String,

    pub is_healthy: bool,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub in_flight_requests: u32,

    pub total_uptime_ms: u64,
    pub total_downtime_ms: u64,

    pub first_check_utc: Option<DateTime<Utc>>,
    pub last_check_utc: Option<DateTime<Utc>>,
    pub last_healthy_utc: Option<DateTime<Utc>>,
    pub last_unhealthy_utc: Option<DateTime<Utc>>,
    pub last_state_change_utc: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl EndpointHealthState {
    pub fn for_endpoint(endpoint: &ModelRunnerEndpoint) -> Self {
        Self {
            endpoint_id: endpoint.id.clone(),
            endpoint_name: endpoint.name.clone(),
            tenant_id: endpoint.tenant_id.clone(),
            ..Self::default()
        }
    }

    pub fn uptime_percentage(&self) -> f64 {
        let total = self.total_uptime_ms.saturating_add(self.total_downtime_ms);
        if total == 0 {
            return 0.0;
        }
        self.total_uptime_ms as f64 * 100.0 / total as f64
    }
}

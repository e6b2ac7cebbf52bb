use serde::{Deserialize, Serialize};

use crate::endpoint::ApiType;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingMode {
    #[default]
    RoundRobin,
    Random,
    FirstAvailable,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionAffinityMode {
    #[default]
    None,
    SourceIp,
    ApiKey,
    Header,
}

/// A tenant-scoped virtual endpoint backed by one or more model runner endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VirtualModelRunner {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub name: String,

    /// Path prefix clients call, e.g. `/v1.0/api/demo/`.
    #[serde(default)]
    pub base_path: Option<String>,
    /// Host header value this runner answers to.
    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub api_type: ApiType,
    #[serde(default)]
    pub load_balancing_mode: LoadBalancingMode,

    #[serde(default)]
    pub model_runner_endpoint_ids: Vec<String>,
    #[serde(default)]
    pub model_configuration_ids: Vec<String>,
    #[serde(default)]
    pub model_definition_ids: Vec<String>,

    #[serde(default = "default_true")]
    pub allow_embeddings: bool,
    #[serde(default = "default_true")]
    pub allow_completions: bool,
    #[serde(default)]
    pub allow_model_management: bool,
    #[serde(default)]
    pub strict_mode: bool,

    #[serde(default)]
    pub session_affinity_mode: SessionAffinityMode,
    #[serde(default)]
    pub session_affinity_header: Option<String>,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// 0 means unbounded.
    #[serde(default = "default_session_max_entries")]
    pub session_max_entries: usize,

    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

fn default_session_timeout_ms() -> u64 {
    600_000
}

fn default_session_max_entries() -> usize {
    10_000
}

impl VirtualModelRunner {
    /// Score how specifically this runner matches a request, or `None` when it
    /// does not match. Longer base paths win; a hostname match adds one.
    pub fn match_score(&self, path: &str, host: Option<&str>) -> Option<usize> {
        let base = self
            .base_path
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty());
        let hostname = self
            .hostname
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty());

        if base.is_none() && hostname.is_none() {
            return None;
        }

        let mut score = 0usize;
        if let Some(base) = base {
            if !path_has_prefix(path, base) {
                return None;
            }
            score += base.trim_end_matches('/').len() + 1;
        }
        if let Some(hostname) = hostname {
            let req_host = host.map(strip_port)?;
            if !req_host.eq_ignore_ascii_case(hostname) {
                return None;
            }
            score += 1;
        }
        Some(score)
    }

    /// Path remaining after the base path, always starting with `/`.
    pub fn relative_path(&self, path: &str) -> String {
        let base = self
            .base_path
            .as_deref()
            .map(|b| b.trim().trim_end_matches('/'))
            .unwrap_or("");
        let rest = if !base.is_empty() && path_has_prefix(path, base) {
            &path[base.len()..]
        } else {
            path
        };
        if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{rest}")
        }
    }
}

fn path_has_prefix(path: &str, base: &str) -> bool {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        return true;
    }
    let matched = path
        .as_bytes()
        .get(..base.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(base.as_bytes()));
    if !matched {
        return false;
    }
    // `/api/demo` must not match `/api/demonstration`.
    matches!(path.as_bytes().get(base.len()), None | Some(b'/'))
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.split_once(']').map(|(h, _)| &h[1..]).unwrap_or(host);
    }
    host.split_once(':').map(|(h, _)| h).unwrap_or(host)
}

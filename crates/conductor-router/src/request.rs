use std::net::IpAddr;

use axum::http::{header, HeaderMap};

use conductor_common::{ApiType, SessionAffinityMode, VirtualModelRunner};

/// Capability class of an inbound request, derived from its relative path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Completions,
    Embeddings,
    ModelManagement,
    Other,
}

impl RequestKind {
    pub fn classify(api_type: ApiType, relative_path: &str) -> Self {
        let path = relative_path.trim_end_matches('/');
        match api_type {
            ApiType::Openai => match path {
                "/v1/chat/completions" | "/v1/completions" => RequestKind::Completions,
                "/v1/embeddings" => RequestKind::Embeddings,
                _ => RequestKind::Other,
            },
            ApiType::Ollama => match path {
                "/api/generate" | "/api/chat" => RequestKind::Completions,
                "/api/embed" | "/api/embeddings" => RequestKind::Embeddings,
                "/api/pull" | "/api/push" | "/api/create" | "/api/copy" | "/api/delete" => {
                    RequestKind::ModelManagement
                }
                _ => RequestKind::Other,
            },
        }
    }

    /// Whether the body is subject to model resolution and parameter rewriting.
    pub fn is_inference(self) -> bool {
        matches!(self, RequestKind::Completions | RequestKind::Embeddings)
    }

    /// Capability check against the runner's flags. `Err` names the capability.
    pub fn check_allowed(self, vmr: &VirtualModelRunner) -> Result<(), &'static str> {
        let allowed = match self {
            RequestKind::Completions => vmr.allow_completions,
            RequestKind::Embeddings => vmr.allow_embeddings,
            RequestKind::ModelManagement => vmr.allow_model_management,
            RequestKind::Other => true,
        };
        if allowed {
            Ok(())
        } else {
            Err(self.as_str())
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Completions => "completions",
            RequestKind::Embeddings => "embeddings",
            RequestKind::ModelManagement => "model management",
            RequestKind::Other => "other",
        }
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Identity used for session affinity, or `None` when affinity does not apply.
pub fn derive_client_key(
    vmr: &VirtualModelRunner,
    headers: &HeaderMap,
    peer: Option<IpAddr>,
) -> Option<String> {
    match vmr.session_affinity_mode {
        SessionAffinityMode::None => None,
        SessionAffinityMode::SourceIp => headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(|| peer.map(|ip| ip.to_string())),
        SessionAffinityMode::ApiKey => bearer_token(headers).map(str::to_string),
        SessionAffinityMode::Header => {
            let name = vmr
                .session_affinity_header
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())?;
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;
    use crate::testutil::make_vmr;

    #[test]
    fn test_classify_openai() {
        let c = |p| RequestKind::classify(ApiType::Openai, p);
        assert_eq!(c("/v1/chat/completions"), RequestKind::Completions);
        assert_eq!(c("/v1/completions/"), RequestKind::Completions);
        assert_eq!(c("/v1/embeddings"), RequestKind::Embeddings);
        assert_eq!(c("/v1/models"), RequestKind::Other);
        assert_eq!(c("/api/generate"), RequestKind::Other);
    }

    #[test]
    fn test_classify_ollama() {
        let c = |p| RequestKind::classify(ApiType::Ollama, p);
        assert_eq!(c("/api/generate"), RequestKind::Completions);
        assert_eq!(c("/api/chat"), RequestKind::Completions);
        assert_eq!(c("/api/embed"), RequestKind::Embeddings);
        assert_eq!(c("/api/embeddings"), RequestKind::Embeddings);
        for p in ["/api/pull", "/api/push", "/api/create", "/api/copy", "/api/delete"] {
            assert_eq!(c(p), RequestKind::ModelManagement, "{p}");
        }
        assert_eq!(c("/api/tags"), RequestKind::Other);
        assert_eq!(c("/"), RequestKind::Other);
    }

    #[test]
    fn test_capability_flags() {
        let mut vmr = make_vmr("v", &[]);
        assert!(RequestKind::Completions.check_allowed(&vmr).is_ok());
        assert!(RequestKind::Embeddings.check_allowed(&vmr).is_ok());
        assert_eq!(
            RequestKind::ModelManagement.check_allowed(&vmr),
            Err("model management")
        );
        vmr.allow_completions = false;
        vmr.allow_embeddings = false;
        assert!(RequestKind::Completions.check_allowed(&vmr).is_err());
        assert!(RequestKind::Embeddings.check_allowed(&vmr).is_err());
        assert!(RequestKind::Other.check_allowed(&vmr).is_ok());
    }

    #[test]
    fn test_bearer_token() {
        let mut h = HeaderMap::new();
        assert_eq!(bearer_token(&h), None);
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&h), Some("abc"));
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer  xyz "));
        assert_eq!(bearer_token(&h), Some("xyz"));
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&h), None);
    }

    #[test]
    fn test_client_key_source_ip() {
        let mut vmr = make_vmr("v", &[]);
        vmr.session_affinity_mode = SessionAffinityMode::SourceIp;
        let peer: IpAddr = "10.0.0.9".parse().unwrap();

        let mut h = HeaderMap::new();
        assert_eq!(derive_client_key(&vmr, &h, Some(peer)).as_deref(), Some("10.0.0.9"));
        h.insert("x-forwarded-for", HeaderValue::from_static(" 1.2.3.4 , 5.6.7.8"));
        assert_eq!(derive_client_key(&vmr, &h, Some(peer)).as_deref(), Some("1.2.3.4"));
        assert_eq!(derive_client_key(&vmr, &HeaderMap::new(), None), None);
    }

    #[test]
    fn test_client_key_api_key_and_header() {
        let mut vmr = make_vmr("v", &[]);
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer k1"));
        h.insert("x-session", HeaderValue::from_static("s-42"));
        assert_eq!(derive_client_key(&vmr, &h, None), None);

        vmr.session_affinity_mode = SessionAffinityMode::ApiKey;
        assert_eq!(derive_client_key(&vmr, &h, None).as_deref(), Some("k1"));

        vmr.session_affinity_mode = SessionAffinityMode::Header;
        assert_eq!(derive_client_key(&vmr, &h, None), None);
        vmr.session_affinity_header = Some("X-Session".to_string());
        assert_eq!(derive_client_key(&vmr, &h, None).as_deref(), Some("s-42"));
        vmr.session_affinity_header = Some("x-missing".to_string());
        assert_eq!(derive_client_key(&vmr, &h, None), None);
    }
}

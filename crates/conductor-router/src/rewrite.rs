use bytes::Bytes;
use serde_json::{Map, Value};

use conductor_common::{ApiType, ModelConfiguration, ModelDefinition, VirtualModelRunner};

use crate::error::RouteError;
use crate::request::RequestKind;

/// What the body rewrite needs to know about the routed request.
#[derive(Debug, Clone, Copy)]
pub struct RewriteContext<'a> {
    pub vmr: &'a VirtualModelRunner,
    pub kind: RequestKind,
    /// Active definitions attached to the runner, in attachment order.
    pub definitions: &'a [ModelDefinition],
    /// Active configurations attached to the runner, in attachment order.
    pub configurations: &'a [ModelConfiguration],
}

#[derive(Debug, Clone, PartialEq)]
pub struct RewrittenBody {
    pub body: Bytes,
    /// Model named by the forwarded body, if any.
    pub model: Option<String>,
}

/// Decide which model name the request is sent upstream with.
///
/// `Ok(None)` leaves the body's model untouched.
pub fn resolve_model(
    strict: bool,
    definitions: &[ModelDefinition],
    requested: Option<&str>,
) -> Result<Option<String>, RouteError> {
    let requested = requested.map(str::trim).filter(|m| !m.is_empty());
    let find = |name: &str| {
        definitions
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
            .map(|d| d.name.clone())
    };

    match definitions {
        [] if strict => Err(RouteError::Unauthorized(
            "strict mode is enabled and no models are defined for this runner".into(),
        )),
        [] => Ok(requested.map(str::to_string)),
        [only] => match requested {
            None => Ok(Some(only.name.clone())),
            Some(name) if only.name.eq_ignore_ascii_case(name) => Ok(Some(only.name.clone())),
            Some(name) if strict => Err(RouteError::Unauthorized(format!(
                "model '{name}' is not allowed on this runner"
            ))),
            Some(_) => Ok(Some(only.name.clone())),
        },
        _ => match requested {
            None => Err(RouteError::Unauthorized(
                "a model must be specified for this runner".into(),
            )),
            Some(name) => find(name).map(Some).ok_or_else(|| {
                RouteError::Unauthorized(format!("model '{name}' is not allowed on this runner"))
            }),
        },
    }
}

/// Write a configuration's scalar overrides into a completions body.
pub fn apply_overrides(body: &mut Map<String, Value>, cfg: &ModelConfiguration, api_type: ApiType) {
    if !cfg.has_overrides() {
        return;
    }
    match api_type {
        ApiType::Ollama => {
            let options = body
                .entry("options")
                .or_insert_with(|| Value::Object(Map::new()));
            if !options.is_object() {
                *options = Value::Object(Map::new());
            }
            let Some(options) = options.as_object_mut() else {
                return;
            };
            set_opt(options, "temperature", cfg.temperature);
            set_opt(options, "top_p", cfg.top_p);
            set_opt(options, "top_k", cfg.top_k);
            set_opt(options, "num_predict", cfg.max_tokens);
            set_opt(options, "repeat_penalty", cfg.repeat_penalty);
            set_opt(options, "num_ctx", cfg.context_window_size);
        }
        ApiType::Openai => {
            set_opt(body, "temperature", cfg.temperature);
            set_opt(body, "top_p", cfg.top_p);
            set_opt(body, "top_k", cfg.top_k);
            set_opt(body, "max_tokens", cfg.max_tokens);
            set_opt(body, "repeat_penalty", cfg.repeat_penalty);
        }
    }
}

fn set_opt<T: Into<Value>>(map: &mut Map<String, Value>, key: &str, value: Option<T>) {
    if let Some(v) = value {
        map.insert(key.to_string(), v.into());
    }
}

/// Merge `pinned` into `target`. Objects merge recursively; any other pinned
/// value (scalar, array, null) replaces the target's.
pub fn deep_merge(target: &mut Map<String, Value>, pinned: &Map<String, Value>) {
    for (key, value) in pinned {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Apply model resolution, overrides and pinned properties to a request body.
///
/// Bodies that are not JSON objects are forwarded unchanged, but model
/// authorisation still runs against an absent model.
pub fn rewrite_body(body: Bytes, ctx: &RewriteContext<'_>) -> Result<RewrittenBody, RouteError> {
    if !ctx.kind.is_inference() {
        return Ok(RewrittenBody { body, model: None });
    }

    let mut doc = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(map)) => map,
        _ => {
            resolve_model(ctx.vmr.strict_mode, ctx.definitions, None)?;
            tracing::debug!(vmr_id=%ctx.vmr.id, "request body is not a JSON object, forwarding unmodified");
            return Ok(RewrittenBody { body, model: None });
        }
    };

    let requested = doc.get("model").and_then(Value::as_str).map(str::to_string);
    let resolved = resolve_model(ctx.vmr.strict_mode, ctx.definitions, requested.as_deref())?;

    let mut changed = false;
    if let Some(name) = &resolved {
        if requested.as_deref() != Some(name.as_str()) {
            doc.insert("model".to_string(), Value::String(name.clone()));
            changed = true;
        }
    }

    let effective = resolved.as_deref().or(requested.as_deref());
    if let Some(cfg) = ctx.configurations.iter().find(|c| c.applies_to(effective)) {
        let pinned = match ctx.kind {
            RequestKind::Completions => {
                if cfg.has_overrides() {
                    apply_overrides(&mut doc, cfg, ctx.vmr.api_type);
                    changed = true;
                }
                cfg.pinned_completions_properties.as_ref()
            }
            RequestKind::Embeddings => cfg.pinned_embeddings_properties.as_ref(),
            RequestKind::ModelManagement | RequestKind::Other => None,
        };
        if let Some(pinned) = pinned.filter(|p| !p.is_empty()) {
            deep_merge(&mut doc, pinned);
            changed = true;
        }
    }

    let model = doc.get("model").and_then(Value::as_str).map(str::to_string);
    if !changed {
        return Ok(RewrittenBody { body, model });
    }
    match serde_json::to_vec(&doc) {
        Ok(bytes) => Ok(RewrittenBody {
            body: Bytes::from(bytes),
            model,
        }),
        Err(e) => {
            tracing::warn!(vmr_id=%ctx.vmr.id, error=%e, "failed to serialize rewritten body, forwarding original");
            Ok(RewrittenBody { body, model: None })
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testutil::make_vmr;

    fn def(name: &str) -> ModelDefinition {
        ModelDefinition {
            id: format!("def-{name}"),
            tenant_id: "t1".to_string(),
            name: name.to_string(),
            family: None,
            context_window_size: None,
            active: true,
        }
    }

    fn object(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            other => panic!("not an object: {other}"),
        }
    }

    fn run(
        vmr: &VirtualModelRunner,
        kind: RequestKind,
        defs: &[ModelDefinition],
        cfgs: &[ModelConfiguration],
        body: Value,
    ) -> Result<Value, RouteError> {
        let ctx = RewriteContext {
            vmr,
            kind,
            definitions: defs,
            configurations: cfgs,
        };
        let out = rewrite_body(Bytes::from(body.to_string()), &ctx)?;
        Ok(serde_json::from_slice(&out.body).unwrap())
    }

    #[test]
    fn test_strict_without_definitions_rejects_everything() {
        assert!(matches!(
            resolve_model(true, &[], Some("llama3")),
            Err(RouteError::Unauthorized(_))
        ));
        assert!(matches!(resolve_model(true, &[], None), Err(RouteError::Unauthorized(_))));

        let mut vmr = make_vmr("v", &[]);
        vmr.strict_mode = true;
        for kind in [RequestKind::Completions, RequestKind::Embeddings] {
            let err = run(&vmr, kind, &[], &[], json!({"model": "llama3"})).unwrap_err();
            assert!(matches!(err, RouteError::Unauthorized(_)));
        }
    }

    #[test]
    fn test_strict_single_definition() {
        let defs = vec![def("llama3")];
        assert!(matches!(
            resolve_model(true, &defs, Some("mistral")),
            Err(RouteError::Unauthorized(_))
        ));
        assert_eq!(resolve_model(true, &defs, None).unwrap().as_deref(), Some("llama3"));
        assert_eq!(resolve_model(true, &defs, Some("")).unwrap().as_deref(), Some("llama3"));
        assert_eq!(
            resolve_model(true, &defs, Some("LLAMA3")).unwrap().as_deref(),
            Some("llama3")
        );

        let mut vmr = make_vmr("v", &[]);
        vmr.strict_mode = true;
        let body = run(&vmr, RequestKind::Completions, &defs, &[], json!({"prompt": "hi"})).unwrap();
        assert_eq!(body["model"], "llama3");
        assert_eq!(body["prompt"], "hi");
    }

    #[test]
    fn test_non_strict_single_definition_forces_name() {
        let defs = vec![def("llama3")];
        assert_eq!(
            resolve_model(false, &defs, Some("mistral")).unwrap().as_deref(),
            Some("llama3")
        );
    }

    #[test]
    fn test_multiple_definitions_require_a_match() {
        let defs = vec![def("llama3"), def("Mistral")];
        for strict in [true, false] {
            assert_eq!(
                resolve_model(strict, &defs, Some("mistral")).unwrap().as_deref(),
                Some("Mistral")
            );
            assert!(resolve_model(strict, &defs, Some("phi3")).is_err());
            assert!(resolve_model(strict, &defs, None).is_err());
        }
    }

    #[test]
    fn test_no_definitions_passes_model_through() {
        assert_eq!(resolve_model(false, &[], Some("anything")).unwrap().as_deref(), Some("anything"));
        assert_eq!(resolve_model(false, &[], None).unwrap(), None);
    }

    #[test]
    fn test_ollama_overrides_go_into_options() {
        let vmr = make_vmr("v", &[]);
        let cfg = ModelConfiguration {
            id: "c1".to_string(),
            temperature: Some(0.5),
            max_tokens: Some(128),
            context_window_size: Some(8192),
            active: true,
            ..ModelConfiguration::default()
        };
        let body = run(
            &vmr,
            RequestKind::Completions,
            &[],
            &[cfg],
            json!({"model": "llama3", "options": {"temperature": 0.9, "seed": 7}}),
        )
        .unwrap();
        assert_eq!(body["options"]["temperature"], 0.5);
        assert_eq!(body["options"]["num_predict"], 128);
        assert_eq!(body["options"]["num_ctx"], 8192);
        assert_eq!(body["options"]["seed"], 7);
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_openai_overrides_are_top_level() {
        let mut vmr = make_vmr("v", &[]);
        vmr.api_type = ApiType::Openai;
        let cfg = ModelConfiguration {
            id: "c1".to_string(),
            top_p: Some(0.8),
            max_tokens: Some(64),
            context_window_size: Some(4096),
            active: true,
            ..ModelConfiguration::default()
        };
        let body = run(
            &vmr,
            RequestKind::Completions,
            &[],
            &[cfg],
            json!({"model": "gpt", "messages": []}),
        )
        .unwrap();
        assert_eq!(body["top_p"], 0.8);
        assert_eq!(body["max_tokens"], 64);
        assert!(body.get("num_ctx").is_none());
        assert!(body.get("options").is_none());
    }

    #[test]
    fn test_embeddings_get_pinned_properties_only() {
        let vmr = make_vmr("v", &[]);
        let cfg = ModelConfiguration {
            id: "c1".to_string(),
            temperature: Some(0.1),
            pinned_embeddings_properties: Some(object(json!({"truncate": true}))),
            pinned_completions_properties: Some(object(json!({"stream": false}))),
            active: true,
            ..ModelConfiguration::default()
        };
        let body = run(
            &vmr,
            RequestKind::Embeddings,
            &[],
            &[cfg],
            json!({"model": "nomic", "input": "x"}),
        )
        .unwrap();
        assert_eq!(body["truncate"], true);
        assert!(body.get("stream").is_none());
        assert!(body.get("options").is_none());
    }

    #[test]
    fn test_first_matching_configuration_wins() {
        let vmr = make_vmr("v", &[]);
        let for_other = ModelConfiguration {
            id: "c0".to_string(),
            model: Some("mistral".to_string()),
            temperature: Some(0.0),
            active: true,
            ..ModelConfiguration::default()
        };
        let first = ModelConfiguration {
            id: "c1".to_string(),
            model: Some("LLAMA3".to_string()),
            temperature: Some(0.3),
            active: true,
            ..ModelConfiguration::default()
        };
        let second = ModelConfiguration {
            id: "c2".to_string(),
            temperature: Some(0.7),
            active: true,
            ..ModelConfiguration::default()
        };
        let body = run(
            &vmr,
            RequestKind::Completions,
            &[],
            &[for_other, first, second],
            json!({"model": "llama3"}),
        )
        .unwrap();
        assert_eq!(body["options"]["temperature"], 0.3);
    }

    #[test]
    fn test_deep_merge_rules() {
        let mut target = object(json!({
            "keep": 1,
            "options": {"a": 1, "nested": {"x": 1, "y": 2}},
            "stop": ["a", "b"],
            "format": "json",
        }));
        let pinned = object(json!({
            "options": {"b": 2, "nested": {"y": 3}},
            "stop": ["z"],
            "format": null,
            "new": {"k": "v"},
        }));
        deep_merge(&mut target, &pinned);
        assert_eq!(
            Value::Object(target),
            json!({
                "keep": 1,
                "options": {"a": 1, "b": 2, "nested": {"x": 1, "y": 3}},
                "stop": ["z"],
                "format": null,
                "new": {"k": "v"},
            })
        );
    }

    #[test]
    fn test_pinned_object_replaces_scalar() {
        let mut target = object(json!({"options": 5}));
        deep_merge(&mut target, &object(json!({"options": {"a": 1}})));
        assert_eq!(target["options"], json!({"a": 1}));
    }

    #[test]
    fn test_malformed_body_fails_open() {
        let vmr = make_vmr("v", &[]);
        let ctx = RewriteContext {
            vmr: &vmr,
            kind: RequestKind::Completions,
            definitions: &[],
            configurations: &[],
        };
        let raw = Bytes::from_static(b"{not json");
        let out = rewrite_body(raw.clone(), &ctx).unwrap();
        assert_eq!(out.body, raw);
        assert_eq!(out.model, None);
    }

    #[test]
    fn test_malformed_body_still_fails_authorisation() {
        let mut vmr = make_vmr("v", &[]);
        vmr.strict_mode = true;
        let ctx = RewriteContext {
            vmr: &vmr,
            kind: RequestKind::Completions,
            definitions: &[],
            configurations: &[],
        };
        assert!(matches!(
            rewrite_body(Bytes::from_static(b"[1,2]"), &ctx),
            Err(RouteError::Unauthorized(_))
        ));

        let lenient = make_vmr("v", &[]);
        let defs = vec![def("a"), def("b")];
        let ctx = RewriteContext {
            vmr: &lenient,
            kind: RequestKind::Completions,
            definitions: &defs,
            configurations: &[],
        };
        assert!(rewrite_body(Bytes::from_static(b"garbage"), &ctx).is_err());
    }

    #[test]
    fn test_untouched_body_keeps_original_bytes() {
        let vmr = make_vmr("v", &[]);
        let ctx = RewriteContext {
            vmr: &vmr,
            kind: RequestKind::Completions,
            definitions: &[],
            configurations: &[],
        };
        let raw = Bytes::from_static(b"{ \"model\" : \"llama3\",  \"prompt\": \"hi\" }");
        let out = rewrite_body(raw.clone(), &ctx).unwrap();
        assert_eq!(out.body, raw);
        assert_eq!(out.model.as_deref(), Some("llama3"));
    }

    #[test]
    fn test_other_requests_are_not_inspected() {
        let mut vmr = make_vmr("v", &[]);
        vmr.strict_mode = true;
        let ctx = RewriteContext {
            vmr: &vmr,
            kind: RequestKind::Other,
            definitions: &[],
            configurations: &[],
        };
        let raw = Bytes::from_static(b"{}");
        assert_eq!(rewrite_body(raw.clone(), &ctx).unwrap().body, raw);
    }
}

use serde::{Deserialize, Serialize};

/// A model name a virtual runner is allowed to serve.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelDefinition {
    pub id: String,
    pub tenant_id: String,
    /// The name sent upstream, e.g. "llama3:8b".
    pub name: String,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub context_window_size: Option<u32>,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Parameter overrides and pinned request properties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModelConfiguration {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub name: String,

    /// Model this configuration applies to; blank applies to every model.
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub repeat_penalty: Option<f64>,
    #[serde(default)]
    pub context_window_size: Option<u32>,

    #[serde(default)]
    pub pinned_embeddings_properties: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub pinned_completions_properties: Option<serde_json::Map<String, serde_json::Value>>,

    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl ModelConfiguration {
    /// Whether this configuration applies to requests for `model`.
    pub fn applies_to(&self, model: Option<&str>) -> bool {
        match self.model.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(target) => model.is_some_and(|m| m.trim().eq_ignore_ascii_case(target)),
        }
    }

    pub fn has_overrides(&self) -> bool {
        self.temperature.is_some()
            || self.top_p.is_some()
            || self.top_k.is_some()
            || self.max_tokens.is_some()
            || self.repeat_penalty.is_some()
            || self.context_window_size.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_applies_to() {
        let mut cfg = ModelConfiguration::default();
        assert!(cfg.applies_to(Some("llama3")));
        assert!(cfg.applies_to(None));

        cfg.model = Some("  ".to_string());
        assert!(cfg.applies_to(Some("mistral")));

        cfg.model = Some("llama3".to_string());
        assert!(cfg.applies_to(Some("LLAMA3")));
        assert!(!cfg.applies_to(Some("mistral")));
        assert!(!cfg.applies_to(None));
    }

    #[test]
    fn test_pinned_properties_deserialize() {
        let cfg: ModelConfiguration = serde_json::from_value(serde_json::json!({
            "id": "cfg1",
            "tenant_id": "t1",
            "temperature": 0.2,
            "pinned_completions_properties": {"options": {"seed": 7}}
        }))
        .unwrap();
        assert!(cfg.has_overrides());
        assert!(cfg.active);
        let pinned = cfg.pinned_completions_properties.unwrap();
        assert_eq!(pinned["options"]["seed"], 7);
    }
}

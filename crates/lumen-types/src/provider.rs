use serde::{Deserialize, Serialize};

/// The model a user picked for a turn, addressed as `provider/model`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    #[serde(alias = "providerID", alias = "providerId")]
    pub provider_id: String,
    #[serde(alias = "modelID", alias = "modelId")]
    pub model_id: String,
}

impl ModelSpec {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }

    /// Parses `provider/model`. A bare model id yields `None` because the
    /// provider cannot be inferred from it.
    pub fn parse(raw: &str) -> Option<Self> {
        let (provider, model) = raw.trim().split_once('/')?;
        let provider = provider.trim();
        let model = model.trim();
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(provider, model))
    }

    pub fn qualified(&self) -> String {
        format!("{}/{}", self.provider_id, self.model_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider_id: String,
    pub display_name: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_qualified_model_spec() {
        let spec = ModelSpec::parse(" openai/gpt-4o ").expect("spec");
        assert_eq!(spec.provider_id, "openai");
        assert_eq!(spec.model_id, "gpt-4o");
        assert_eq!(spec.qualified(), "openai/gpt-4o");
    }

    #[test]
    fn rejects_bare_model_id() {
        assert!(ModelSpec::parse("gpt-4o").is_none());
        assert!(ModelSpec::parse("openai/").is_none());
    }

    #[test]
    fn accepts_camel_case_aliases() {
        let spec: ModelSpec =
            serde_json::from_str(r#"{"providerID":"local","modelID":"echo-1"}"#).expect("json");
        assert_eq!(spec, ModelSpec::new("local", "echo-1"));
    }
}

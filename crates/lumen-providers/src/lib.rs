use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;

use lumen_types::{ChatMessage, ModelInfo, ModelSpec, ProviderInfo};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
    #[serde(default)]
    pub inactive_models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
}

/// One inference call: the new prompt plus the conversation it continues.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub prompt_text: String,
    pub context: Vec<ChatMessage>,
    pub session_id: String,
    pub model: Option<ModelSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceResponse {
    pub message: String,
    pub provider_name: String,
    pub provider_id: String,
    pub tokens_used: Option<u64>,
}

/// Opaque gateway failure. Only the message and an optional HTTP status are
/// meaningful to callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
    pub status: Option<u16>,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        let message = if err.is_timeout() {
            format!("provider request timed out: {err}")
        } else if err.is_connect() {
            format!("network connection to provider failed: {err}")
        } else if err.is_decode() {
            format!("provider returned an unreadable response: {err}")
        } else {
            format!("network request to provider failed: {err}")
        };
        Self { message, status }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;
    async fn complete(
        &self,
        request: &InferenceRequest,
        model_override: Option<&str>,
    ) -> Result<InferenceResponse, ProviderError>;
}

/// The single remote call the orchestrator depends on.
#[async_trait]
pub trait InferenceGateway: Send + Sync {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, ProviderError>;
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn Provider>>>>,
    default_provider: Arc<RwLock<Option<String>>>,
    inactive_models: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl ProviderRegistry {
    pub fn new(config: ProvidersConfig) -> Self {
        let providers = build_providers(&config);
        Self {
            providers: Arc::new(RwLock::new(providers)),
            default_provider: Arc::new(RwLock::new(config.default_provider.clone())),
            inactive_models: Arc::new(RwLock::new(inactive_models_by_provider(&config))),
        }
    }

    pub async fn list(&self) -> Vec<ProviderInfo> {
        self.providers
            .read()
            .await
            .iter()
            .map(|p| p.info())
            .collect()
    }

    async fn select_provider(
        &self,
        provider_id: Option<&str>,
    ) -> Result<Arc<dyn Provider>, ProviderError> {
        let providers = self.providers.read().await;
        let available = providers.iter().map(|p| p.info().id).collect::<Vec<_>>();

        if let Some(id) = provider_id {
            if let Some(provider) = providers.iter().find(|p| p.info().id == id) {
                return Ok(provider.clone());
            }
            return Err(ProviderError::new(format!(
                "provider `{}` not found. configured providers: {}",
                id,
                available.join(", ")
            )));
        };

        let configured_default = self.default_provider.read().await.clone();
        if let Some(default_id) = configured_default {
            if let Some(provider) = providers.iter().find(|p| p.info().id == default_id) {
                return Ok(provider.clone());
            }
        };

        let Some(provider) = providers.first() else {
            return Err(ProviderError::new("no provider configured"));
        };
        Ok(provider.clone())
    }

    async fn ensure_model_active(&self, spec: &ModelSpec) -> Result<(), ProviderError> {
        let inactive = self.inactive_models.read().await;
        let is_inactive = inactive
            .get(&spec.provider_id)
            .is_some_and(|models| models.iter().any(|m| m == &spec.model_id));
        if is_inactive {
            return Err(ProviderError::new(format!(
                "model `{}` is inactive for provider `{}`",
                spec.model_id, spec.provider_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl InferenceGateway for ProviderRegistry {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, ProviderError> {
        let provider_id = request.model.as_ref().map(|m| m.provider_id.clone());
        let provider = self.select_provider(provider_id.as_deref()).await?;
        if let Some(spec) = request.model.as_ref() {
            self.ensure_model_active(spec).await?;
        }
        let model_override = request.model.as_ref().map(|m| m.model_id.clone());
        tracing::debug!(
            provider = %provider.info().id,
            model = model_override.as_deref().unwrap_or("default"),
            context_len = request.context.len(),
            "dispatching inference request"
        );
        provider.complete(&request, model_override.as_deref()).await
    }
}

fn inactive_models_by_provider(config: &ProvidersConfig) -> HashMap<String, Vec<String>> {
    config
        .providers
        .iter()
        .filter(|(_, entry)| !entry.inactive_models.is_empty())
        .map(|(id, entry)| (id.clone(), entry.inactive_models.clone()))
        .collect()
}

fn build_providers(config: &ProvidersConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    add_openai_provider(
        config,
        &mut providers,
        "openai",
        "OpenAI",
        "https://api.openai.com/v1",
        "gpt-4o-mini",
        true,
    );
    add_openai_provider(
        config,
        &mut providers,
        "openrouter",
        "OpenRouter",
        "https://openrouter.ai/api/v1",
        "openai/gpt-4o-mini",
        true,
    );
    add_openai_provider(
        config,
        &mut providers,
        "groq",
        "Groq",
        "https://api.groq.com/openai/v1",
        "llama-3.1-8b-instant",
        true,
    );
    add_openai_provider(
        config,
        &mut providers,
        "ollama",
        "Ollama",
        "http://127.0.0.1:11434/v1",
        "llama3.1:8b",
        false,
    );

    if config.providers.contains_key("local") || providers.is_empty() {
        providers.push(Arc::new(LocalEchoProvider));
    }

    providers
}

fn add_openai_provider(
    config: &ProvidersConfig,
    providers: &mut Vec<Arc<dyn Provider>>,
    id: &str,
    name: &str,
    default_url: &str,
    default_model: &str,
    use_api_key: bool,
) {
    let Some(entry) = config.providers.get(id) else {
        return;
    };
    providers.push(Arc::new(OpenAICompatibleProvider {
        id: id.to_string(),
        name: name.to_string(),
        base_url: normalize_base(entry.url.as_deref().unwrap_or(default_url)),
        api_key: if use_api_key {
            entry
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(|key| key.to_string())
                .or_else(|| env_api_key_for_provider(id))
        } else {
            None
        },
        default_model: entry
            .default_model
            .clone()
            .unwrap_or_else(|| default_model.to_string()),
        client: Client::new(),
    }));
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

fn env_api_key_for_provider(id: &str) -> Option<String> {
    let env_name = match id {
        "openai" => Some("OPENAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        _ => None,
    }?;
    std::env::var(env_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

/// Offline provider that answers by restating the prompt.
pub struct LocalEchoProvider;

#[async_trait]
impl Provider for LocalEchoProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "local".to_string(),
            name: "Local Echo".to_string(),
            models: vec![ModelInfo {
                id: "echo-1".to_string(),
                provider_id: "local".to_string(),
                display_name: "Echo Model".to_string(),
                active: true,
            }],
        }
    }

    async fn complete(
        &self,
        request: &InferenceRequest,
        _model_override: Option<&str>,
    ) -> Result<InferenceResponse, ProviderError> {
        let message = format!(
            "Echo ({} earlier messages): {}",
            request.context.len(),
            request.prompt_text
        );
        let tokens_used = message.split_whitespace().count() as u64;
        Ok(InferenceResponse {
            message,
            provider_name: "Local Echo".to_string(),
            provider_id: "local".to_string(),
            tokens_used: Some(tokens_used),
        })
    }
}

struct OpenAICompatibleProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                provider_id: self.id.clone(),
                display_name: self.default_model.clone(),
                active: true,
            }],
        }
    }

    async fn complete(
        &self,
        request: &InferenceRequest,
        model_override: Option<&str>,
    ) -> Result<InferenceResponse, ProviderError> {
        let model = model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str());
        let url = format!("{}/chat/completions", self.base_url);
        let mut wire_messages = request
            .context
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect::<Vec<_>>();
        wire_messages.push(json!({"role": "user", "content": request.prompt_text}));

        let mut req = self.client.post(url).json(&json!({
            "model": model,
            "messages": wire_messages,
            "stream": false,
        }));
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_failure(status.as_u16(), &text));
        }
        let value: serde_json::Value = response.json().await?;

        if let Some(detail) = extract_openai_error(&value) {
            return Err(ProviderError::new(detail));
        }

        let Some(message) = extract_openai_text(&value) else {
            let body_preview = truncate_for_error(&value.to_string(), 500);
            return Err(ProviderError::new(format!(
                "provider returned no completion content for model `{}` (response: {})",
                model, body_preview
            )));
        };

        Ok(InferenceResponse {
            message,
            provider_name: format!("{} {}", self.name, model),
            provider_id: self.id.clone(),
            tokens_used: extract_total_tokens(&value),
        })
    }
}

/// Non-2xx responses keep their status even when the body is not JSON.
fn status_failure(status: u16, body: &str) -> ProviderError {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| extract_openai_error(&value))
        .unwrap_or_else(|| {
            format!(
                "provider request failed with status {}: {}",
                status,
                truncate_for_error(body.trim(), 500)
            )
        });
    ProviderError::with_status(detail, status)
}

fn normalize_base(input: &str) -> String {
    if input.trim_end_matches('/').ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut cut = max_len;
    while !input.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &input[..cut])
}

fn extract_total_tokens(value: &serde_json::Value) -> Option<u64> {
    let usage = value.get("usage")?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    Some(
        usage
            .get("total_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(prompt_tokens.saturating_add(completion_tokens)),
    )
}

fn extract_openai_text(value: &serde_json::Value) -> Option<String> {
    let choice = value.get("choices").and_then(|v| v.get(0))?;
    if let Some(content) = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
    {
        return Some(content.to_string());
    }
    choice
        .get("text")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn extract_openai_error(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            value
                .get("error")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(provider_ids: &[&str], default_provider: Option<&str>) -> ProvidersConfig {
        let mut providers = HashMap::new();
        for id in provider_ids {
            providers.insert(
                (*id).to_string(),
                ProviderConfig {
                    api_key: Some("sk-test".to_string()),
                    url: None,
                    default_model: Some(format!("{id}-model")),
                    inactive_models: Vec::new(),
                },
            );
        }
        ProvidersConfig {
            providers,
            default_provider: default_provider.map(|s| s.to_string()),
        }
    }

    fn request(model: Option<ModelSpec>) -> InferenceRequest {
        InferenceRequest {
            prompt_text: "hello".to_string(),
            context: Vec::new(),
            session_id: "ses-1".to_string(),
            model,
        }
    }

    #[tokio::test]
    async fn explicit_provider_wins_over_default_provider() {
        let registry = ProviderRegistry::new(cfg(&["openai", "openrouter"], Some("openai")));
        let provider = registry
            .select_provider(Some("openrouter"))
            .await
            .expect("provider");
        assert_eq!(provider.info().id, "openrouter");
    }

    #[tokio::test]
    async fn falls_back_to_first_provider_when_default_provider_missing() {
        let registry = ProviderRegistry::new(cfg(&["openai"], Some("anthropic")));
        let provider = registry.select_provider(None).await.expect("provider");
        assert_eq!(provider.info().id, "openai");
    }

    #[tokio::test]
    async fn empty_config_falls_back_to_local_echo() {
        let registry = ProviderRegistry::new(ProvidersConfig::default());
        let response = registry.infer(request(None)).await.expect("response");
        assert_eq!(response.provider_id, "local");
        assert!(response.message.ends_with("hello"));
        assert!(response.tokens_used.is_some());
    }

    #[tokio::test]
    async fn unknown_provider_reports_not_found() {
        let registry = ProviderRegistry::new(cfg(&["openai"], None));
        let err = registry
            .infer(request(Some(ModelSpec::new("openruter", "x"))))
            .await
            .expect_err("expected error");
        assert!(err.message.contains("provider `openruter` not found"));
        assert_eq!(err.status, None);
    }

    #[tokio::test]
    async fn inactive_model_is_rejected_before_dispatch() {
        let mut config = cfg(&["local"], None);
        if let Some(entry) = config.providers.get_mut("local") {
            entry.inactive_models = vec!["echo-0".to_string()];
        }
        let registry = ProviderRegistry::new(config);
        let err = registry
            .infer(request(Some(ModelSpec::new("local", "echo-0"))))
            .await
            .expect_err("expected error");
        assert!(err.message.contains("model `echo-0` is inactive"));
    }

    #[test]
    fn extracts_usage_and_text_from_completion() {
        let value = json!({
            "choices": [{"message": {"role": "assistant", "content": "BloodHound"}}],
            "usage": {"prompt_tokens": 100, "completion_tokens": 20}
        });
        assert_eq!(extract_openai_text(&value).as_deref(), Some("BloodHound"));
        assert_eq!(extract_total_tokens(&value), Some(120));
    }

    #[test]
    fn error_statuses_survive_non_json_bodies() {
        let html = status_failure(503, "<html><body>Service Unavailable</body></html>");
        assert_eq!(html.status, Some(503));
        assert!(html.message.contains("status 503"));

        let plain = status_failure(429, "Too Many Requests");
        assert_eq!(plain.status, Some(429));
        assert!(plain.message.contains("Too Many Requests"));

        let structured = status_failure(401, r#"{"error":{"message":"invalid api key"}}"#);
        assert_eq!(structured.status, Some(401));
        assert_eq!(structured.message, "invalid api key");
    }

    #[test]
    fn truncate_for_error_respects_char_boundaries() {
        let text = "ééééé";
        let cut = truncate_for_error(text, 3);
        assert!(cut.ends_with("..."));
        assert!(cut.starts_with('é'));
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use lumen_providers::{ProviderConfig, ProvidersConfig};
use lumen_types::ModelSpec;

use crate::quota::QuotaPlanConfig;
use crate::recovery::RetryPolicy;
use crate::timeout::{SoftClockStart, TimeoutPolicy};

pub const MAX_CONTEXT_MESSAGES: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub hard_timeout_secs: u64,
    pub soft_timeout_secs: u64,
    pub soft_clock_start: SoftClockStart,
    pub delivery_delay_ms: u64,
    pub context_limit: usize,
    pub retry: RetryPolicy,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            hard_timeout_secs: 60,
            soft_timeout_secs: 45,
            soft_clock_start: SoftClockStart::Submission,
            delivery_delay_ms: 30,
            context_limit: MAX_CONTEXT_MESSAGES,
            retry: RetryPolicy::default(),
        }
    }
}

impl ChatConfig {
    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            soft: Duration::from_secs(self.soft_timeout_secs),
            hard: Duration::from_secs(self.hard_timeout_secs.max(1)),
            soft_clock_start: self.soft_clock_start,
        }
    }

    pub fn delivery_delay(&self) -> Duration {
        Duration::from_millis(self.delivery_delay_ms)
    }

    pub fn context_window(&self) -> usize {
        self.context_limit.min(MAX_CONTEXT_MESSAGES)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    /// `provider/model`.
    pub default_model: Option<String>,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub quota: QuotaPlanConfig,
}

impl AppConfig {
    pub fn default_model_spec(&self) -> Option<ModelSpec> {
        self.default_model.as_deref().and_then(ModelSpec::parse)
    }
}

impl From<AppConfig> for ProvidersConfig {
    fn from(value: AppConfig) -> Self {
        Self {
            providers: value.providers,
            default_provider: value.default_provider,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// Layered JSON configuration: global, project, environment, CLI. Later
/// layers win key by key.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path().await?;
        Self::open(path.as_ref(), global_path, env_layer(), cli_overrides).await
    }

    async fn open(
        project_path: &Path,
        global_path: PathBuf,
        env: Value,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let project_path = project_path.to_path_buf();
        if let Some(parent) = project_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut global = read_json_file(&global_path)
            .await
            .unwrap_or_else(|_| empty_object());
        let mut project = read_json_file(&project_path)
            .await
            .unwrap_or_else(|_| empty_object());

        scrub_persisted_secrets(&mut global, &global_path).await?;
        scrub_persisted_secrets(&mut project, &project_path).await?;

        let layers = ConfigLayers {
            global,
            project,
            env,
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        Ok(Self {
            project_path,
            global_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "invalid configuration; using defaults");
                AppConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": layers.env,
            "cli": layers.cli
        })
    }

    pub fn global_path(&self) -> &Path {
        &self.global_path
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut to_write = value.clone();
    strip_persisted_secrets(&mut to_write);
    let raw = serde_json::to_string_pretty(&to_write)?;
    fs::write(path, raw).await?;
    Ok(())
}

/// Drops on-disk API keys for providers whose key is supplied by the
/// environment.
fn strip_persisted_secrets(value: &mut Value) {
    let Some(providers) = value
        .as_object_mut()
        .and_then(|root| root.get_mut("providers"))
        .and_then(|v| v.as_object_mut())
    else {
        return;
    };
    for (provider_id, provider_cfg) in providers.iter_mut() {
        let Value::Object(cfg) = provider_cfg else {
            continue;
        };
        if !cfg.contains_key("api_key") && !cfg.contains_key("apiKey") {
            continue;
        }
        if provider_has_runtime_secret(provider_id) {
            cfg.remove("api_key");
            cfg.remove("apiKey");
        }
    }
}

async fn scrub_persisted_secrets(value: &mut Value, path: &Path) -> anyhow::Result<()> {
    let before = value.clone();
    strip_persisted_secrets(value);
    if *value != before {
        write_json_file(path, value).await?;
    }
    Ok(())
}

fn provider_has_runtime_secret(provider_id: &str) -> bool {
    provider_env_candidates(provider_id).into_iter().any(|key| {
        std::env::var(&key)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    })
}

fn provider_env_candidates(provider_id: &str) -> Vec<String> {
    let normalized = provider_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .to_ascii_uppercase();
    let mut out = vec![format!("{}_API_KEY", normalized)];
    match provider_id.to_ascii_lowercase().as_str() {
        "openai" => out.push("OPENAI_API_KEY".to_string()),
        "openrouter" => out.push("OPENROUTER_API_KEY".to_string()),
        "groq" => out.push("GROQ_API_KEY".to_string()),
        _ => {}
    }
    out.sort();
    out.dedup();
    out
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

async fn resolve_global_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("LUMEN_GLOBAL_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    if let Some(config_dir) = dirs::config_dir() {
        return Ok(config_dir.join("lumen").join("config.json"));
    }
    Ok(PathBuf::from(".lumen/global_config.json"))
}

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let mut root = empty_object();

    if let Some(provider) = var("LUMEN_PROVIDER") {
        deep_merge(&mut root, &json!({ "default_provider": provider.trim() }));
    }
    if let Some(model) = var("LUMEN_MODEL") {
        deep_merge(&mut root, &json!({ "default_model": model.trim() }));
    }
    for (key, field) in [
        ("LUMEN_HARD_TIMEOUT_SECS", "hard_timeout_secs"),
        ("LUMEN_SOFT_TIMEOUT_SECS", "soft_timeout_secs"),
        ("LUMEN_DELIVERY_DELAY_MS", "delivery_delay_ms"),
    ] {
        if let Some(value) = var(key).and_then(|v| v.trim().parse::<u64>().ok()) {
            deep_merge(&mut root, &json!({ "chat": { field: value } }));
        }
    }
    if let Some(start) = var("LUMEN_SOFT_CLOCK_START")
        .and_then(|v| v.parse::<SoftClockStart>().ok())
    {
        deep_merge(&mut root, &json!({ "chat": { "soft_clock_start": start } }));
    }

    for (provider, key_env) in [("openai", "OPENAI_API_KEY"), ("openrouter", "OPENROUTER_API_KEY")]
    {
        if let Some(api_key) = var(key_env) {
            deep_merge(
                &mut root,
                &json!({ "providers": { provider: { "api_key": api_key } } }),
            );
        }
    }
    if let Some(url) = var("OLLAMA_URL") {
        deep_merge(&mut root, &json!({ "providers": { "ollama": { "url": url } } }));
    }

    root
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_merge_prefers_overlay_and_skips_nulls() {
        let mut base = json!({"chat": {"hard_timeout_secs": 60, "soft_timeout_secs": 45}});
        deep_merge(
            &mut base,
            &json!({"chat": {"soft_timeout_secs": 30, "hard_timeout_secs": null}}),
        );
        assert_eq!(base["chat"]["hard_timeout_secs"], 60);
        assert_eq!(base["chat"]["soft_timeout_secs"], 30);
    }

    #[test]
    fn env_layer_maps_known_variables() {
        let vars = HashMap::from([
            ("LUMEN_PROVIDER", "openai"),
            ("LUMEN_MODEL", "openai/gpt-4o"),
            ("LUMEN_HARD_TIMEOUT_SECS", "90"),
            ("LUMEN_SOFT_CLOCK_START", "inference-start"),
            ("LUMEN_DELIVERY_DELAY_MS", "not-a-number"),
            ("OLLAMA_URL", "http://gpu-box:11434"),
        ]);
        let layer = env_layer_from(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(layer["default_provider"], "openai");
        assert_eq!(layer["chat"]["hard_timeout_secs"], 90);
        assert_eq!(layer["chat"]["soft_clock_start"], "inference_start");
        assert!(layer["chat"].get("delivery_delay_ms").is_none());
        assert_eq!(layer["providers"]["ollama"]["url"], "http://gpu-box:11434");
    }

    #[test]
    fn chat_defaults_match_turn_timing() {
        let chat = ChatConfig::default();
        let policy = chat.timeout_policy();
        assert_eq!(policy.soft, Duration::from_secs(45));
        assert_eq!(policy.hard, Duration::from_secs(60));
        assert_eq!(policy.soft_clock_start, SoftClockStart::Submission);
        assert_eq!(chat.context_window(), 20);
        assert_eq!(
            ChatConfig {
                context_limit: 100,
                ..ChatConfig::default()
            }
            .context_window(),
            20
        );
    }

    #[tokio::test]
    async fn layers_merge_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let global_path = dir.path().join("global.json");
        let project_path = dir.path().join("state").join("config.json");
        std::fs::write(
            &global_path,
            r#"{"default_provider":"openrouter","chat":{"soft_timeout_secs":40}}"#,
        )
        .expect("global");
        let store = ConfigStore::open(
            &project_path,
            global_path,
            json!({"chat": {"hard_timeout_secs": 70}}),
            Some(json!({"default_provider": "local"})),
        )
        .await
        .expect("store");
        store
            .patch_project(json!({"default_model": "local/echo-1"}))
            .await
            .expect("patch");

        let config = store.get().await;
        assert_eq!(config.default_provider.as_deref(), Some("local"));
        assert_eq!(config.chat.soft_timeout_secs, 40);
        assert_eq!(config.chat.hard_timeout_secs, 70);
        assert_eq!(config.chat.delivery_delay_ms, 30);
        assert_eq!(
            config.default_model_spec(),
            Some(ModelSpec::new("local", "echo-1"))
        );
        assert!(project_path.exists());

        let providers: ProvidersConfig = config.into();
        assert_eq!(providers.default_provider.as_deref(), Some("local"));
    }

    #[test]
    fn env_candidates_include_vendor_names() {
        let candidates = provider_env_candidates("openai");
        assert!(candidates.contains(&"OPENAI_API_KEY".to_string()));
        let custom = provider_env_candidates("my-proxy");
        assert_eq!(custom, vec!["MY_PROXY_API_KEY".to_string()]);
    }
}

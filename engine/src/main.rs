use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use lumen_core::{
    resolve_lumen_paths, ChatConfig, ConfigStore, EventBus, IgnoreReason, LumenPaths, MessageStore,
    Notice, OrchestratorDeps, QuotaGuard, QuotaSource, StaticQuotaSource, Storage,
    StorageQuotaSource, SubmitOutcome, TracingMetricsSink, TurnOrchestrator, EVENT_NOTICE,
    EVENT_TURN_ESCALATED, EVENT_TURN_PARTIAL, EVENT_TURN_PHASE,
};
use lumen_observability::{emit_event, init_process_logging, ObservabilityEvent, ProcessKind};
use lumen_providers::ProviderRegistry;
use lumen_types::{EngineEvent, MessageRole, ModelSpec};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

const SUPPORTED_PROVIDER_IDS: [&str; 5] = ["openai", "openrouter", "groq", "ollama", "local"];
const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "lumen-engine")]
#[command(about = "Lumen chat assistant engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct RuntimeArgs {
    #[arg(long, env = "LUMEN_STATE_DIR")]
    state_dir: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    model: Option<String>,
    /// Fixed quota as `USED/LIMIT` instead of counting stored replies.
    #[arg(long)]
    quota: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sends one prompt in a fresh session and prints the reply.
    Run {
        prompt: String,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    /// Interactive chat. `/stop`, `/retry`, `/new`, `/sessions` and `/quit`
    /// are understood.
    Chat {
        #[arg(long)]
        session: Option<String>,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    Sessions {
        #[arg(long, env = "LUMEN_STATE_DIR")]
        state_dir: Option<PathBuf>,
    },
    /// Lists configured providers and their default models.
    Providers {
        #[arg(long, env = "LUMEN_STATE_DIR")]
        state_dir: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

struct Runtime {
    storage: Arc<Storage>,
    deps: OrchestratorDeps,
    _log_guard: WorkerGuard,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { prompt, runtime } => {
            let runtime = build_runtime(&runtime, ProcessKind::Cli).await?;
            let session = runtime.storage.create_session(None).await?;
            let orchestrator =
                TurnOrchestrator::spawn(runtime.deps.clone(), Some(session.id.clone()));
            let outcome = orchestrator
                .submit_with_model(prompt, runtime.deps.default_model.clone())
                .await?;
            if !matches!(outcome, SubmitOutcome::Admitted { .. }) {
                anyhow::bail!(describe_rejection(&outcome));
            }
            let done = orchestrator.wait_idle().await?;
            if let Some(notice) = done.last_notice {
                anyhow::bail!(notice.text());
            }
            let reply = runtime
                .storage
                .recent_messages(&session.id, 1)
                .await?
                .into_iter()
                .find(|m| m.role == MessageRole::Assistant)
                .map(|m| m.content)
                .unwrap_or_default();
            println!("{reply}");
        }
        Command::Chat { session, runtime } => {
            let runtime = build_runtime(&runtime, ProcessKind::Engine).await?;
            let session = match session {
                Some(id) => runtime
                    .storage
                    .get_session(&id)
                    .await
                    .ok_or_else(|| anyhow::anyhow!("session `{id}` not found"))?,
                None => runtime.storage.create_session(None).await?,
            };
            let orchestrator =
                TurnOrchestrator::spawn(runtime.deps.clone(), Some(session.id.clone()));
            println!("session {} ({})", session.id, session.title);
            run_chat(&orchestrator, &runtime).await?;
        }
        Command::Sessions { state_dir } => {
            let paths = resolve_lumen_paths(state_dir.as_deref())?;
            let storage = Storage::new(&paths.state_dir).await?;
            for session in storage.list_sessions().await {
                println!(
                    "{}  {}  {}",
                    session.id,
                    session.updated_at.format("%Y-%m-%d %H:%M"),
                    session.title
                );
            }
        }
        Command::Providers { state_dir, config } => {
            let paths = resolve_lumen_paths(state_dir.as_deref())?;
            let config_path = config.unwrap_or_else(|| paths.project_config_path.clone());
            let config = ConfigStore::new(config_path, None).await?.get().await;
            let registry = ProviderRegistry::new(config.into());
            for provider in registry.list().await {
                let models = provider
                    .models
                    .iter()
                    .filter(|m| m.active)
                    .map(|m| m.id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                println!("{}  {}  [{}]", provider.id, provider.name, models);
            }
        }
    }

    Ok(())
}

async fn run_chat(orchestrator: &TurnOrchestrator, runtime: &Runtime) -> anyhow::Result<()> {
    let printer = tokio::spawn(print_transcript(orchestrator.events()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/stop" => {
                if !orchestrator.cancel().await? {
                    eprintln!("[nothing to stop]");
                }
            }
            "/new" => match orchestrator.new_session(None).await {
                Ok(session) => println!("session {} ({})", session.id, session.title),
                Err(err) => eprintln!("[{err}]"),
            },
            "/sessions" => {
                for session in runtime.storage.list_sessions().await {
                    println!("{}  {}", session.id, session.title);
                }
            }
            "/retry" => {
                let snapshot = orchestrator.snapshot();
                let text = snapshot.restored_input.or(match snapshot.last_notice {
                    Some(Notice::Error { retry_text, .. }) => retry_text,
                    _ => None,
                });
                match text {
                    Some(text) => submit_line(orchestrator, runtime, text).await?,
                    None => eprintln!("[nothing to retry]"),
                }
            }
            text => submit_line(orchestrator, runtime, text.to_string()).await?,
        }
    }

    orchestrator.cancel().await?;
    printer.abort();
    Ok(())
}

async fn submit_line(
    orchestrator: &TurnOrchestrator,
    runtime: &Runtime,
    text: String,
) -> anyhow::Result<()> {
    let outcome = orchestrator
        .submit_with_model(text, runtime.deps.default_model.clone())
        .await?;
    if !matches!(outcome, SubmitOutcome::Admitted { .. }) {
        eprintln!("[{}]", describe_rejection(&outcome));
    }
    Ok(())
}

fn describe_rejection(outcome: &SubmitOutcome) -> String {
    match outcome {
        SubmitOutcome::Admitted { request_id } => format!("admitted as {request_id}"),
        SubmitOutcome::Ignored(IgnoreReason::EmptyInput) => "nothing to send".to_string(),
        SubmitOutcome::Ignored(IgnoreReason::TurnActive) => {
            "a reply is still in progress; /stop cancels it".to_string()
        }
        SubmitOutcome::Ignored(IgnoreReason::NoSession) => "no session selected".to_string(),
        SubmitOutcome::QuotaRejected(quota) => Notice::quota_blocked(quota).text(),
        SubmitOutcome::AdmissionFailed(error) => error.user_message.clone(),
    }
}

async fn print_transcript(mut events: broadcast::Receiver<EngineEvent>) {
    let mut printer = TranscriptPrinter::default();
    loop {
        match events.recv().await {
            Ok(event) => match printer.render(&event) {
                Some(Rendered::Reply(text)) => {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
                Some(Rendered::Status(text)) => eprintln!("{text}"),
                None => {}
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "transcript printer lagged behind engine events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Rendered {
    Reply(String),
    Status(String),
}

/// Turns cumulative partial replies into terminal deltas.
#[derive(Default)]
struct TranscriptPrinter {
    printed: usize,
}

impl TranscriptPrinter {
    fn render(&mut self, event: &EngineEvent) -> Option<Rendered> {
        let props = &event.properties;
        match event.event_type.as_str() {
            EVENT_TURN_PARTIAL => {
                let text = props.get("text").and_then(|v| v.as_str())?;
                let delta = text.get(self.printed..).filter(|d| !d.is_empty())?;
                self.printed = text.len();
                Some(Rendered::Reply(delta.to_string()))
            }
            EVENT_TURN_PHASE => match props.get("phase").and_then(|v| v.as_str()) {
                Some("idle") if self.printed > 0 => {
                    self.printed = 0;
                    Some(Rendered::Reply("\n".to_string()))
                }
                Some("sending") => {
                    self.printed = 0;
                    None
                }
                _ => None,
            },
            EVENT_TURN_ESCALATED => Some(Rendered::Status(
                "[still waiting for the assistant; /stop cancels]".to_string(),
            )),
            EVENT_NOTICE => {
                let text = props.get("text").and_then(|v| v.as_str())?;
                let retry = props
                    .get("notice")
                    .and_then(|n| n.get("retry_text"))
                    .is_some_and(|v| v.is_string());
                Some(Rendered::Status(if retry {
                    format!("[{text} /retry resubmits]")
                } else {
                    format!("[{text}]")
                }))
            }
            _ => None,
        }
    }
}

async fn build_runtime(args: &RuntimeArgs, process: ProcessKind) -> anyhow::Result<Runtime> {
    let startup = Instant::now();
    let paths = resolve_lumen_paths(args.state_dir.as_deref())?;
    paths.ensure()?;
    let log_guard = init_logging(&paths, process)?;

    let provider = normalize_and_validate_provider(args.provider.clone())?;
    let overrides =
        build_cli_overrides(args.api_key.clone(), provider.clone(), args.model.clone())?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| paths.project_config_path.clone());
    let config = ConfigStore::new(config_path, overrides).await?.get().await;

    let storage = Arc::new(Storage::new(&paths.state_dir).await?);
    let quota_source: Arc<dyn QuotaSource> = match args.quota.as_deref() {
        Some(raw) => Arc::new(
            StaticQuotaSource::parse(&config.quota.plan_name, raw)
                .ok_or_else(|| anyhow::anyhow!("invalid --quota `{raw}`, expected USED/LIMIT"))?,
        ),
        None => Arc::new(StorageQuotaSource::new(storage.clone(), config.quota.clone())),
    };
    let default_model = match (provider, args.model.as_deref()) {
        (Some(provider), Some(model)) => Some(ModelSpec::new(provider, model.trim())),
        _ => config.default_model_spec(),
    };
    let chat: ChatConfig = config.chat.clone();
    let gateway = ProviderRegistry::new(config.into());

    info!(
        "engine.startup runtime_build_complete elapsed_ms={} state_dir={}",
        startup.elapsed().as_millis(),
        paths.state_dir.display()
    );
    Ok(Runtime {
        storage: storage.clone(),
        deps: OrchestratorDeps {
            store: storage,
            gateway: Arc::new(gateway),
            quota: QuotaGuard::new(quota_source),
            metrics: Arc::new(TracingMetricsSink::new(process)),
            event_bus: EventBus::new(),
            chat,
            default_model,
            process,
        },
        _log_guard: log_guard,
    })
}

fn init_logging(paths: &LumenPaths, process: ProcessKind) -> anyhow::Result<WorkerGuard> {
    let (guard, log_info) = init_process_logging(process, &paths.logs_dir, LOG_RETENTION_DAYS)?;
    emit_event(
        tracing::Level::INFO,
        process,
        ObservabilityEvent::new("logging.initialized", "engine.main")
            .status("ok")
            .detail("engine jsonl logging initialized"),
    );
    info!("engine logging initialized: {:?}", log_info);
    log_startup_paths(&paths.root);
    Ok(guard)
}

fn log_startup_paths(root: &Path) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!(
        "startup paths: exe={} cwd={} root={}",
        exe.display(),
        cwd.display(),
        root.display()
    );
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
) -> anyhow::Result<Option<serde_json::Value>> {
    let provider = normalize_and_validate_provider(provider)?;

    if api_key.is_none() && provider.is_none() && model.is_none() {
        return Ok(None);
    }
    let mut root = serde_json::Map::new();

    if let Some(p) = &provider {
        root.insert(
            "default_provider".to_string(),
            serde_json::Value::String(p.clone()),
        );
    }

    // Key and model land on the selected provider, else openai.
    let target_provider = provider.as_deref().unwrap_or("openai");

    if api_key.is_some() || model.is_some() {
        let mut provider_config = serde_json::Map::new();
        if let Some(k) = api_key {
            provider_config.insert("api_key".to_string(), serde_json::Value::String(k));
        }
        if let Some(m) = model {
            provider_config.insert("default_model".to_string(), serde_json::Value::String(m));
        }

        let mut providers = serde_json::Map::new();
        providers.insert(
            target_provider.to_string(),
            serde_json::Value::Object(provider_config),
        );
        root.insert(
            "providers".to_string(),
            serde_json::Value::Object(providers),
        );
    }

    Ok(Some(serde_json::Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_cli_overrides_targets_selected_provider() {
        let overrides = build_cli_overrides(
            Some("sk-test".to_string()),
            Some("openrouter".to_string()),
            Some("google/gemini-2.5-flash".to_string()),
        )
        .expect("overrides")
        .expect("some");

        assert_eq!(overrides["default_provider"], "openrouter");
        assert_eq!(
            overrides["providers"]["openrouter"]["api_key"],
            json!("sk-test")
        );
        assert_eq!(
            overrides["providers"]["openrouter"]["default_model"],
            json!("google/gemini-2.5-flash")
        );
    }

    #[test]
    fn build_cli_overrides_is_empty_without_flags() {
        assert!(build_cli_overrides(None, None, None).expect("ok").is_none());
    }

    #[test]
    fn normalize_and_validate_provider_accepts_known_values_case_insensitive() {
        let provider =
            normalize_and_validate_provider(Some(" Local ".to_string())).expect("provider");
        assert_eq!(provider.as_deref(), Some("local"));
    }

    #[test]
    fn normalize_and_validate_provider_rejects_unknown_value() {
        let err = normalize_and_validate_provider(Some("openruter".to_string())).unwrap_err();
        assert!(err.to_string().contains("unsupported provider `openruter`"));
    }

    #[test]
    fn printer_emits_only_new_words() {
        let mut printer = TranscriptPrinter::default();
        let partial = |text: &str| EngineEvent::new(EVENT_TURN_PARTIAL, json!({ "text": text }));

        assert_eq!(
            printer.render(&partial("BloodHound,")),
            Some(Rendered::Reply("BloodHound,".to_string()))
        );
        assert_eq!(
            printer.render(&partial("BloodHound, PowerView")),
            Some(Rendered::Reply(" PowerView".to_string()))
        );
        assert_eq!(printer.render(&partial("BloodHound, PowerView")), None);
        assert_eq!(
            printer.render(&EngineEvent::new(EVENT_TURN_PHASE, json!({ "phase": "idle" }))),
            Some(Rendered::Reply("\n".to_string()))
        );
        assert_eq!(
            printer.render(&partial("Next")),
            Some(Rendered::Reply("Next".to_string()))
        );
    }

    #[test]
    fn printer_marks_retryable_notices() {
        let mut printer = TranscriptPrinter::default();
        let retryable = EngineEvent::new(
            EVENT_NOTICE,
            json!({
                "text": "The AI service took too long to respond.",
                "notice": { "type": "error", "retry_text": "hello" },
            }),
        );
        assert_eq!(
            printer.render(&retryable),
            Some(Rendered::Status(
                "[The AI service took too long to respond. /retry resubmits]".to_string()
            ))
        );
        let stopped = EngineEvent::new(
            EVENT_NOTICE,
            json!({ "text": "Request stopped.", "notice": { "type": "stopped" } }),
        );
        assert_eq!(
            printer.render(&stopped),
            Some(Rendered::Status("[Request stopped.]".to_string()))
        );
    }
}

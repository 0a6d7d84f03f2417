use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::Level;
use uuid::Uuid;

use lumen_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use lumen_providers::{InferenceGateway, InferenceRequest};
use lumen_types::{ChatMessage, ChatSession, EngineEvent, ModelSpec, NewMessage, QuotaState};

use crate::cancellation::{CancellationRegistry, TurnToken};
use crate::config::ChatConfig;
use crate::delivery::{deliver, DeliveryOutcome};
use crate::error_classifier::{
    classified_as, classify, hard_deadline_message, ClassifiedError, ErrorContext, ErrorKind,
    RawFailure,
};
use crate::event_bus::{EventBus, EVENT_NOTICE};
use crate::metrics::MetricsSink;
use crate::quota::{Admission, QuotaGuard};
use crate::recovery::with_recovery;
use crate::storage::MessageStore;
use crate::timeout::{arm_soft_timeout, with_hard_deadline, SoftTimeoutHandle, TimeoutPolicy};
use crate::turn::{ChatSnapshot, TurnCommand, TurnEvent, TurnReducer, TurnState};

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("orchestrator is no longer running")]
    ActorGone,
    #[error("session `{0}` not found")]
    SessionNotFound(String),
    #[error("a turn is still in flight for session `{0}`")]
    TurnInFlight(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    EmptyInput,
    TurnActive,
    NoSession,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Admitted { request_id: String },
    Ignored(IgnoreReason),
    QuotaRejected(QuotaState),
    AdmissionFailed(ClassifiedError),
}

/// Collaborators of a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub store: Arc<dyn MessageStore>,
    pub gateway: Arc<dyn InferenceGateway>,
    pub quota: QuotaGuard,
    pub metrics: Arc<dyn MetricsSink>,
    pub event_bus: EventBus,
    pub chat: ChatConfig,
    pub default_model: Option<ModelSpec>,
    pub process: ProcessKind,
}

enum OrchestratorCommand {
    Submit {
        text: String,
        model: Option<ModelSpec>,
        reply: oneshot::Sender<SubmitOutcome>,
    },
    Cancel {
        reply: oneshot::Sender<bool>,
    },
    SelectSession {
        session_id: String,
        reply: oneshot::Sender<anyhow::Result<ChatSession>>,
    },
    NewSession {
        title: Option<String>,
        reply: oneshot::Sender<anyhow::Result<ChatSession>>,
    },
}

/// Handle to the turn actor. Cheap to clone; the actor stops once every handle
/// is dropped.
#[derive(Clone)]
pub struct TurnOrchestrator {
    commands: mpsc::Sender<OrchestratorCommand>,
    snapshots: watch::Receiver<ChatSnapshot>,
    event_bus: EventBus,
    cancellations: CancellationRegistry,
}

impl TurnOrchestrator {
    pub fn spawn(deps: OrchestratorDeps, session_id: Option<String>) -> Self {
        let initial = match session_id {
            Some(id) => TurnState::for_session(id),
            None => TurnState::default(),
        };
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(initial.snapshot());
        let cancellations = CancellationRegistry::new();
        let actor = TurnActor {
            reducer: TurnReducer::new(deps.chat.soft_clock_start),
            timeouts: deps.chat.timeout_policy(),
            state: initial,
            live: None,
            snapshot_tx,
            event_tx,
            cancellations: cancellations.clone(),
            event_bus: deps.event_bus.clone(),
            deps: deps.clone(),
        };
        tokio::spawn(actor.run(command_rx, event_rx));
        Self {
            commands: command_tx,
            snapshots: snapshot_rx,
            event_bus: deps.event_bus,
            cancellations,
        }
    }

    pub async fn submit(&self, text: impl Into<String>) -> anyhow::Result<SubmitOutcome> {
        self.submit_with_model(text, None).await
    }

    pub async fn submit_with_model(
        &self,
        text: impl Into<String>,
        model: Option<ModelSpec>,
    ) -> anyhow::Result<SubmitOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(OrchestratorCommand::Submit {
            text: text.into(),
            model,
            reply,
        })
        .await?;
        rx.await.map_err(|_| OrchestratorError::ActorGone.into())
    }

    /// Stops the active turn. Returns false when nothing was in flight.
    pub async fn cancel(&self) -> anyhow::Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(OrchestratorCommand::Cancel { reply }).await?;
        rx.await.map_err(|_| OrchestratorError::ActorGone.into())
    }

    pub async fn select_session(
        &self,
        session_id: impl Into<String>,
    ) -> anyhow::Result<ChatSession> {
        let (reply, rx) = oneshot::channel();
        self.send(OrchestratorCommand::SelectSession {
            session_id: session_id.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| anyhow::Error::from(OrchestratorError::ActorGone))?
    }

    pub async fn new_session(&self, title: Option<String>) -> anyhow::Result<ChatSession> {
        let (reply, rx) = oneshot::channel();
        self.send(OrchestratorCommand::NewSession { title, reply }).await?;
        rx.await.map_err(|_| anyhow::Error::from(OrchestratorError::ActorGone))?
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshots.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_bus.subscribe()
    }

    /// Number of turn tokens still registered.
    pub async fn live_turn_count(&self) -> usize {
        self.cancellations.active_count().await
    }

    /// Resolves once no turn is active.
    pub async fn wait_idle(&self) -> anyhow::Result<ChatSnapshot> {
        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(|s| !s.request_active)
            .await
            .map_err(|_| OrchestratorError::ActorGone)?;
        Ok(snapshot.clone())
    }

    async fn send(&self, command: OrchestratorCommand) -> anyhow::Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| OrchestratorError::ActorGone.into())
    }
}

struct LiveTurn {
    session_id: String,
    token: TurnToken,
    soft_timer: Option<SoftTimeoutHandle>,
    started: Instant,
}

struct TurnActor {
    reducer: TurnReducer,
    timeouts: TimeoutPolicy,
    state: TurnState,
    live: Option<LiveTurn>,
    snapshot_tx: watch::Sender<ChatSnapshot>,
    event_tx: mpsc::UnboundedSender<TurnEvent>,
    cancellations: CancellationRegistry,
    event_bus: EventBus,
    deps: OrchestratorDeps,
}

impl TurnActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<OrchestratorCommand>,
        mut events: mpsc::UnboundedReceiver<TurnEvent>,
    ) {
        if let Ok(quota) = self.deps.quota.refresh().await {
            self.apply(TurnEvent::QuotaUpdated { quota }).await;
        }
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command).await;
                }
                Some(event) = events.recv() => {
                    self.apply(event).await;
                }
            }
        }
        if let Some(live) = self.live.take() {
            live.token.revoke();
            live.token.retire();
        }
        tracing::debug!("turn orchestrator stopped");
    }

    async fn handle_command(&mut self, command: OrchestratorCommand) {
        match command {
            OrchestratorCommand::Submit { text, model, reply } => {
                let outcome = self.submit(text, model).await;
                let _ = reply.send(outcome);
            }
            OrchestratorCommand::Cancel { reply } => {
                let _ = reply.send(self.cancel().await);
            }
            OrchestratorCommand::SelectSession { session_id, reply } => {
                let _ = reply.send(self.select_session(session_id).await);
            }
            OrchestratorCommand::NewSession { title, reply } => {
                let _ = reply.send(self.new_session(title).await);
            }
        }
    }

    async fn submit(&mut self, text: String, model: Option<ModelSpec>) -> SubmitOutcome {
        let text = text.trim().to_string();
        if text.is_empty() {
            return SubmitOutcome::Ignored(IgnoreReason::EmptyInput);
        }
        if self.state.request_active {
            return SubmitOutcome::Ignored(IgnoreReason::TurnActive);
        }
        let Some(session_id) = self.state.session_id.clone() else {
            return SubmitOutcome::Ignored(IgnoreReason::NoSession);
        };

        let quota = match self.deps.quota.admit().await {
            Ok(Admission::Admitted(quota)) => quota,
            Ok(Admission::Rejected(quota)) => {
                emit_event(
                    Level::INFO,
                    self.deps.process,
                    ObservabilityEvent::new("turn.quota_rejected", "orchestrator")
                        .session(&session_id)
                        .status("rejected"),
                );
                self.apply(TurnEvent::QuotaRejected {
                    quota: quota.clone(),
                })
                .await;
                return SubmitOutcome::QuotaRejected(quota);
            }
            Err(err) => {
                let error = classify(
                    &RawFailure::from_anyhow(&err),
                    &ErrorContext::for_session(&session_id),
                );
                tracing::warn!(
                    session_id = %session_id,
                    kind = error.kind.as_str(),
                    error = %err,
                    "quota source unavailable; submission not admitted"
                );
                self.apply(TurnEvent::AdmissionFailed {
                    error: error.clone(),
                })
                .await;
                return SubmitOutcome::AdmissionFailed(error);
            }
        };

        let request_id = format!("req-{}", Uuid::new_v4());
        let token = self.cancellations.create(&session_id, &request_id).await;
        self.live = Some(LiveTurn {
            session_id: session_id.clone(),
            token: token.clone(),
            soft_timer: None,
            started: Instant::now(),
        });
        let redacted = redact_text(&text);
        emit_event(
            Level::INFO,
            self.deps.process,
            ObservabilityEvent::new("turn.submitted", "orchestrator")
                .session(&session_id)
                .request(&request_id)
                .detail(&redacted),
        );
        self.apply(TurnEvent::Submitted {
            request_id: request_id.clone(),
            user_text: text.clone(),
            started_at: Utc::now(),
            quota: Some(quota),
        })
        .await;

        let worker = TurnWorker {
            deps: self.deps.clone(),
            events: self.event_tx.clone(),
            session_id,
            request_id: request_id.clone(),
            text,
            model: model.or_else(|| self.deps.default_model.clone()),
            token,
            timeouts: self.timeouts,
        };
        tokio::spawn(worker.run());
        SubmitOutcome::Admitted { request_id }
    }

    async fn cancel(&mut self) -> bool {
        let Some(request_id) = self.state.active_request_id().map(str::to_string) else {
            return false;
        };
        if let Some(live) = self.live_for(&request_id) {
            if !live.token.revoke() {
                tracing::debug!(request_id = %request_id, "stop ignored; reply already committing");
                return false;
            }
        }
        let elapsed_ms = self
            .live
            .as_ref()
            .map(|live| live.started.elapsed().as_millis() as u64)
            .unwrap_or(0);
        emit_event(
            Level::INFO,
            self.deps.process,
            ObservabilityEvent::new("turn.cancelled", "orchestrator")
                .request(&request_id)
                .status("cancelled")
                .duration_ms(elapsed_ms),
        );
        self.apply(TurnEvent::CancelRequested { elapsed_ms }).await;
        true
    }

    async fn select_session(&mut self, session_id: String) -> anyhow::Result<ChatSession> {
        if self.state.request_active {
            let current = self.state.session_id.clone().unwrap_or_default();
            return Err(OrchestratorError::TurnInFlight(current).into());
        }
        let Some(session) = self.deps.store.get_session(&session_id).await else {
            return Err(OrchestratorError::SessionNotFound(session_id).into());
        };
        self.apply(TurnEvent::SessionSelected {
            session_id: session.id.clone(),
        })
        .await;
        Ok(session)
    }

    async fn new_session(&mut self, title: Option<String>) -> anyhow::Result<ChatSession> {
        if self.state.request_active {
            let current = self.state.session_id.clone().unwrap_or_default();
            return Err(OrchestratorError::TurnInFlight(current).into());
        }
        let session = self.deps.store.create_session(title).await?;
        self.apply(TurnEvent::SessionSelected {
            session_id: session.id.clone(),
        })
        .await;
        Ok(session)
    }

    async fn apply(&mut self, event: TurnEvent) {
        let (next, commands) = self.reducer.reduce(&self.state, event);
        let changed = next.revision != self.state.revision;
        self.state = next;
        for command in commands {
            self.execute(command).await;
        }
        if changed {
            self.snapshot_tx.send_replace(self.state.snapshot());
        }
    }

    async fn execute(&mut self, command: TurnCommand) {
        match command {
            TurnCommand::ArmSoftTimeout { request_id } => {
                let events = self.event_tx.clone();
                let delay = self.timeouts.soft;
                let Some(live) = self.live_for(&request_id) else {
                    return;
                };
                if let Some(previous) = live.soft_timer.take() {
                    previous.clear();
                }
                let elapsed_id = request_id.clone();
                live.soft_timer = Some(arm_soft_timeout(
                    delay,
                    live.token.clone(),
                    move || {
                        let _ = events.send(TurnEvent::SoftTimeoutElapsed {
                            request_id: elapsed_id,
                        });
                    },
                ));
            }
            TurnCommand::ClearSoftTimeout { request_id } => {
                if let Some(timer) = self
                    .live_for(&request_id)
                    .and_then(|live| live.soft_timer.take())
                {
                    timer.clear();
                }
            }
            TurnCommand::RevokeToken { request_id } => {
                if let Some(live) = self.live_for(&request_id) {
                    live.token.revoke();
                }
            }
            TurnCommand::RetireToken { request_id } => {
                let owned = self
                    .live
                    .as_ref()
                    .is_some_and(|live| live.token.request_id() == request_id);
                if !owned {
                    return;
                }
                if let Some(live) = self.live.take() {
                    live.token.retire();
                    self.cancellations
                        .remove(&live.session_id, &request_id)
                        .await;
                }
            }
            TurnCommand::Notify(notice) => {
                self.event_bus.emit(
                    EVENT_NOTICE,
                    json!({
                        "sessionID": self.state.session_id,
                        "text": notice.text(),
                        "notice": notice,
                    }),
                );
            }
            TurnCommand::RecordMetrics(metrics) => {
                self.deps.metrics.record(metrics);
            }
            TurnCommand::Publish {
                event_type,
                properties,
            } => {
                self.event_bus.emit(event_type, properties);
            }
        }
    }

    fn live_for(&mut self, request_id: &str) -> Option<&mut LiveTurn> {
        self.live
            .as_mut()
            .filter(|live| live.token.request_id() == request_id)
    }
}

/// Drives one turn outside the actor. Every outcome goes back as a
/// `TurnEvent`; after a stop the worker goes quiet.
struct TurnWorker {
    deps: OrchestratorDeps,
    events: mpsc::UnboundedSender<TurnEvent>,
    session_id: String,
    request_id: String,
    text: String,
    model: Option<ModelSpec>,
    token: TurnToken,
    timeouts: TimeoutPolicy,
}

impl TurnWorker {
    async fn run(self) {
        let started = Instant::now();
        let attempts = Arc::new(AtomicU32::new(0));
        let context = ErrorContext::for_session(&self.session_id)
            .with_model(self.model.as_ref().map(|m| m.model_id.clone()));

        let user_message = match self
            .deps
            .store
            .append_message(&self.session_id, NewMessage::user(self.text.clone()))
            .await
        {
            Ok(message) => message,
            Err(err) => {
                let error = classify(&RawFailure::from_anyhow(&err), &context);
                let restore_input = error.kind == ErrorKind::NetworkError;
                self.fail(error, restore_input, 0, started).await;
                return;
            }
        };
        if self.token.is_revoked() {
            return;
        }
        self.send(TurnEvent::UserMessagePersisted {
            request_id: self.request_id.clone(),
            message: user_message.clone(),
        });

        let history = match self
            .deps
            .store
            .recent_messages(&self.session_id, self.deps.chat.context_window() + 1)
            .await
        {
            Ok(history) => history,
            Err(err) => {
                let error = classify(&RawFailure::from_anyhow(&err), &context);
                self.fail(error, false, 0, started).await;
                return;
            }
        };
        let request = InferenceRequest {
            prompt_text: self.text.clone(),
            context: conversation_context(history, &user_message, self.deps.chat.context_window()),
            session_id: self.session_id.clone(),
            model: self.model.clone(),
        };

        let provider_id = self.model.as_ref().map(|m| m.provider_id.as_str());
        let model_id = self.model.as_ref().map(|m| m.model_id.as_str());
        emit_event(
            Level::INFO,
            self.deps.process,
            ObservabilityEvent::new("provider.call.start", "orchestrator")
                .session(&self.session_id)
                .request(&self.request_id)
                .provider(provider_id, model_id)
                .status("start"),
        );

        let gateway = self.deps.gateway.clone();
        let attempt_counter = attempts.clone();
        let call = with_recovery(self.deps.chat.retry, &context, move |attempt| {
            attempt_counter.store(attempt, Ordering::SeqCst);
            let gateway = gateway.clone();
            let request = request.clone();
            async move { gateway.infer(request).await.map_err(RawFailure::from) }
        });
        let raced = tokio::select! {
            _ = self.token.revoked() => return,
            raced = with_hard_deadline(self.timeouts.hard, call) => raced,
        };
        let retries = attempts.load(Ordering::SeqCst).saturating_sub(1);

        let response = match raced {
            None => {
                let error = classified_as(
                    ErrorKind::TimeoutError,
                    hard_deadline_message(self.timeouts.hard.as_secs()),
                );
                self.fail(error, false, retries, started).await;
                return;
            }
            Some(recovered) => {
                let retries = recovered.retries();
                match recovered.outcome {
                    Ok(response) => response,
                    Err(error) => {
                        self.fail(error, false, retries, started).await;
                        return;
                    }
                }
            }
        };

        if self.token.is_revoked() {
            return;
        }
        self.send(TurnEvent::ResponseReceived {
            request_id: self.request_id.clone(),
        });

        let events = self.events.clone();
        let request_id = self.request_id.clone();
        let outcome = deliver(
            &response.message,
            self.deps.chat.delivery_delay(),
            &self.token,
            |text| {
                let _ = events.send(TurnEvent::PartialDelivered {
                    request_id: request_id.clone(),
                    text,
                });
            },
        )
        .await;
        let full_text = match outcome {
            DeliveryOutcome::Completed(text) => text,
            DeliveryOutcome::Stopped { .. } => return,
        };
        // From here on a stop request is refused and the turn runs to completion.
        if !self.token.commit() {
            return;
        }
        self.send(TurnEvent::Committing {
            request_id: self.request_id.clone(),
        });

        let assistant = match self
            .deps
            .store
            .append_message(
                &self.session_id,
                NewMessage::assistant(
                    full_text,
                    Some(response.provider_name.clone()),
                    response.tokens_used,
                ),
            )
            .await
        {
            Ok(message) => message,
            Err(err) => {
                let error = classify(&RawFailure::from_anyhow(&err), &context);
                self.fail(error, false, retries, started).await;
                return;
            }
        };
        let session = match self.deps.store.touch_session(&self.session_id).await {
            Ok(session) => session,
            Err(err) => {
                let error = classify(&RawFailure::from_anyhow(&err), &context);
                self.fail(error, false, retries, started).await;
                return;
            }
        };
        self.deps.quota.record_success().await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        emit_event(
            Level::INFO,
            self.deps.process,
            ObservabilityEvent::new("turn.completed", "orchestrator")
                .session(&self.session_id)
                .request(&self.request_id)
                .message(&assistant.id)
                .provider(Some(response.provider_id.as_str()), model_id)
                .status("ok")
                .duration_ms(elapsed_ms),
        );
        self.send(TurnEvent::Completed {
            request_id: self.request_id.clone(),
            message: assistant,
            session,
            retry_attempts: retries,
            elapsed_ms,
            quota: self.deps.quota.snapshot().await,
        });
    }

    async fn fail(
        &self,
        error: ClassifiedError,
        restore_input: bool,
        retries: u32,
        started: Instant,
    ) {
        if self.token.is_revoked() {
            return;
        }
        let elapsed_ms = started.elapsed().as_millis() as u64;
        emit_event(
            Level::WARN,
            self.deps.process,
            ObservabilityEvent::new("provider.call.error", "orchestrator")
                .session(&self.session_id)
                .request(&self.request_id)
                .provider(
                    self.model.as_ref().map(|m| m.provider_id.as_str()),
                    self.model.as_ref().map(|m| m.model_id.as_str()),
                )
                .status("failed")
                .error_code(error.kind.as_str())
                .duration_ms(elapsed_ms)
                .detail(&error.raw_message),
        );
        let quota = if error.is_quota() {
            match self.deps.quota.refresh().await {
                Ok(fresh) => Some(fresh),
                Err(err) => {
                    tracing::warn!(error = %err, "quota refresh after quota failure failed");
                    self.deps.quota.snapshot().await
                }
            }
        } else {
            None
        };
        self.send(TurnEvent::Failed {
            request_id: self.request_id.clone(),
            error,
            restore_input,
            retry_attempts: retries,
            elapsed_ms,
            quota,
        });
    }

    fn send(&self, event: TurnEvent) {
        let _ = self.events.send(event);
    }
}

/// The last `limit` messages persisted before the current prompt.
fn conversation_context(
    history: Vec<ChatMessage>,
    current: &ChatMessage,
    limit: usize,
) -> Vec<ChatMessage> {
    let earlier = history
        .into_iter()
        .filter(|m| m.id != current.id)
        .collect::<Vec<_>>();
    let skip = earlier.len().saturating_sub(limit);
    earlier.into_iter().skip(skip).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_types::MessageRole;

    fn message(content: &str) -> ChatMessage {
        NewMessage::user(content).into_message(Utc::now())
    }

    #[test]
    fn context_excludes_current_prompt_and_keeps_newest() {
        let history = (0..22).map(|i| message(&format!("m{i}"))).collect::<Vec<_>>();
        let current = history[21].clone();
        let context = conversation_context(history, &current, 20);
        assert_eq!(context.len(), 20);
        assert_eq!(context[0].content, "m1");
        assert_eq!(context[19].content, "m20");
        assert!(context.iter().all(|m| m.role == MessageRole::User));
    }

    #[test]
    fn context_of_first_message_is_empty() {
        let current = message("hello");
        assert!(conversation_context(vec![current.clone()], &current, 20).is_empty());
    }

    #[test]
    fn orchestrator_errors_render_for_users() {
        assert_eq!(
            OrchestratorError::SessionNotFound("ses-x".to_string()).to_string(),
            "session `ses-x` not found"
        );
        let err = anyhow::Error::from(OrchestratorError::ActorGone);
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::ActorGone)
        ));
    }
}

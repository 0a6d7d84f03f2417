use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use lumen_types::{ChatMessage, ChatSession, QuotaState};

use crate::error_classifier::{ClassifiedError, RetryOffer};
use crate::event_bus::{
    EVENT_MESSAGE_APPENDED, EVENT_TURN_ESCALATED, EVENT_TURN_PARTIAL, EVENT_TURN_PHASE,
    EVENT_SESSION_UPDATED,
};
use crate::metrics::TurnMetrics;
use crate::timeout::SoftClockStart;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    #[default]
    Idle,
    Sending,
    AwaitingResponse,
    Delivering,
}

impl TurnPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnPhase::Idle => "idle",
            TurnPhase::Sending => "sending",
            TurnPhase::AwaitingResponse => "awaiting_response",
            TurnPhase::Delivering => "delivering",
        }
    }

    fn rank(self) -> u8 {
        match self {
            TurnPhase::Idle => 0,
            TurnPhase::Sending => 1,
            TurnPhase::AwaitingResponse => 2,
            TurnPhase::Delivering => 3,
        }
    }
}

/// The in-flight turn. Its token and timer live with the orchestrator and are
/// addressed by `request_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub request_id: String,
    pub user_text: String,
    pub started_at: DateTime<Utc>,
    pub phase: TurnPhase,
    pub escalated: bool,
    pub partial_response: Option<String>,
    /// The reply is being persisted; stopping is no longer possible.
    #[serde(default)]
    pub committing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    Error {
        error: ClassifiedError,
        /// Original text to resubmit when the error offers a retry.
        retry_text: Option<String>,
    },
    Stopped,
    QuotaBlocked {
        plan_name: String,
        current_usage: u64,
        limit: u64,
    },
}

impl Notice {
    pub fn quota_blocked(quota: &QuotaState) -> Self {
        Notice::QuotaBlocked {
            plan_name: quota.plan_name.clone(),
            current_usage: quota.current_usage,
            limit: quota.limit,
        }
    }

    pub fn text(&self) -> String {
        match self {
            Notice::Error { error, .. } => error.user_message.clone(),
            Notice::Stopped => "Request stopped.".to_string(),
            Notice::QuotaBlocked {
                plan_name,
                current_usage,
                limit,
            } => format!(
                "You have used {current_usage} of {limit} AI requests on the {plan_name} plan."
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnState {
    pub session_id: Option<String>,
    pub turn: Option<Turn>,
    /// Cleared on every terminal exit; timer callbacks check it.
    pub request_active: bool,
    pub restored_input: Option<String>,
    pub last_notice: Option<Notice>,
    pub quota: Option<QuotaState>,
    pub revision: u64,
}

impl TurnState {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.turn.as_ref().map(|t| t.phase).unwrap_or_default()
    }

    pub fn active_request_id(&self) -> Option<&str> {
        if !self.request_active {
            return None;
        }
        self.turn.as_ref().map(|t| t.request_id.as_str())
    }

    fn is_active(&self, request_id: &str) -> bool {
        self.active_request_id() == Some(request_id)
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        let turn = self.turn.as_ref().filter(|_| self.request_active);
        let phase = turn.map(|t| t.phase).unwrap_or_default();
        let escalated = turn.is_some_and(|t| t.escalated);
        let committing = turn.is_some_and(|t| t.committing);
        ChatSnapshot {
            session_id: self.session_id.clone(),
            phase,
            request_id: turn.map(|t| t.request_id.clone()),
            request_active: self.request_active,
            escalated,
            stop_visible: self.request_active
                && !committing
                && (escalated || phase == TurnPhase::Delivering),
            submit_enabled: !self.request_active
                && self.session_id.is_some()
                && self.quota.as_ref().map_or(true, QuotaState::can_use_ai),
            partial_response: turn.and_then(|t| t.partial_response.clone()),
            restored_input: self.restored_input.clone(),
            last_notice: self.last_notice.clone(),
            quota: self.quota.clone(),
        }
    }
}

/// What a UI renders. Input emptiness is the caller's concern; `submit_enabled`
/// covers everything else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSnapshot {
    pub session_id: Option<String>,
    pub phase: TurnPhase,
    pub request_id: Option<String>,
    pub request_active: bool,
    pub escalated: bool,
    pub stop_visible: bool,
    pub submit_enabled: bool,
    pub partial_response: Option<String>,
    pub restored_input: Option<String>,
    pub last_notice: Option<Notice>,
    pub quota: Option<QuotaState>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    SessionSelected {
        session_id: String,
    },
    QuotaUpdated {
        quota: QuotaState,
    },
    QuotaRejected {
        quota: QuotaState,
    },
    AdmissionFailed {
        error: ClassifiedError,
    },
    Submitted {
        request_id: String,
        user_text: String,
        started_at: DateTime<Utc>,
        quota: Option<QuotaState>,
    },
    UserMessagePersisted {
        request_id: String,
        message: ChatMessage,
    },
    SoftTimeoutElapsed {
        request_id: String,
    },
    ResponseReceived {
        request_id: String,
    },
    PartialDelivered {
        request_id: String,
        text: String,
    },
    Committing {
        request_id: String,
    },
    Completed {
        request_id: String,
        message: ChatMessage,
        session: ChatSession,
        retry_attempts: u32,
        elapsed_ms: u64,
        quota: Option<QuotaState>,
    },
    Failed {
        request_id: String,
        error: ClassifiedError,
        restore_input: bool,
        retry_attempts: u32,
        elapsed_ms: u64,
        quota: Option<QuotaState>,
    },
    CancelRequested {
        elapsed_ms: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnCommand {
    ArmSoftTimeout { request_id: String },
    ClearSoftTimeout { request_id: String },
    RevokeToken { request_id: String },
    RetireToken { request_id: String },
    Notify(Notice),
    RecordMetrics(TurnMetrics),
    Publish { event_type: &'static str, properties: Value },
}

/// The single entry point for turn transitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct TurnReducer {
    soft_clock_start: SoftClockStart,
}

impl TurnReducer {
    pub fn new(soft_clock_start: SoftClockStart) -> Self {
        Self { soft_clock_start }
    }

    pub fn reduce(&self, state: &TurnState, event: TurnEvent) -> (TurnState, Vec<TurnCommand>) {
        let mut next = state.clone();
        let mut commands = Vec::new();
        let mut changed = false;

        match event {
            TurnEvent::SessionSelected { session_id } if !next.request_active => {
                if next.session_id.as_deref() != Some(session_id.as_str()) {
                    next.session_id = Some(session_id);
                    next.turn = None;
                    next.restored_input = None;
                    next.last_notice = None;
                    changed = true;
                }
            }
            TurnEvent::QuotaUpdated { quota } => {
                if next.quota.as_ref() != Some(&quota) {
                    next.quota = Some(quota);
                    changed = true;
                }
            }
            TurnEvent::QuotaRejected { quota } if !next.request_active => {
                let notice = Notice::quota_blocked(&quota);
                next.quota = Some(quota);
                next.last_notice = Some(notice.clone());
                commands.push(TurnCommand::Notify(notice));
                changed = true;
            }
            TurnEvent::AdmissionFailed { error } if !next.request_active => {
                let notice = error_notice(error, None);
                next.last_notice = Some(notice.clone());
                commands.push(TurnCommand::Notify(notice));
                changed = true;
            }
            TurnEvent::Submitted {
                request_id,
                user_text,
                started_at,
                quota,
            } if !next.request_active && next.session_id.is_some() => {
                next.turn = Some(Turn {
                    request_id: request_id.clone(),
                    user_text,
                    started_at,
                    phase: TurnPhase::Sending,
                    escalated: false,
                    partial_response: None,
                    committing: false,
                });
                next.request_active = true;
                next.restored_input = None;
                next.last_notice = None;
                if quota.is_some() {
                    next.quota = quota;
                }
                commands.push(phase_event(&next, &request_id, TurnPhase::Sending));
                if self.soft_clock_start == SoftClockStart::Submission {
                    commands.push(TurnCommand::ArmSoftTimeout { request_id });
                }
                changed = true;
            }
            TurnEvent::UserMessagePersisted {
                request_id,
                message,
            } if next.is_active(&request_id) => {
                if advance(&mut next, TurnPhase::AwaitingResponse) {
                    commands.push(publish(
                        EVENT_MESSAGE_APPENDED,
                        json!({
                            "sessionID": next.session_id,
                            "requestID": request_id,
                            "message": message,
                        }),
                    ));
                    commands.push(phase_event(&next, &request_id, TurnPhase::AwaitingResponse));
                    if self.soft_clock_start == SoftClockStart::InferenceStart {
                        commands.push(TurnCommand::ArmSoftTimeout { request_id });
                    }
                    changed = true;
                }
            }
            TurnEvent::SoftTimeoutElapsed { request_id } if next.is_active(&request_id) => {
                if let Some(turn) = next.turn.as_mut().filter(|t| !t.escalated) {
                    turn.escalated = true;
                    commands.push(publish(
                        EVENT_TURN_ESCALATED,
                        json!({"sessionID": next.session_id, "requestID": request_id}),
                    ));
                    changed = true;
                }
            }
            TurnEvent::ResponseReceived { request_id } if next.is_active(&request_id) => {
                if advance(&mut next, TurnPhase::Delivering) {
                    if let Some(turn) = next.turn.as_mut() {
                        turn.partial_response = Some(String::new());
                    }
                    commands.push(phase_event(&next, &request_id, TurnPhase::Delivering));
                    changed = true;
                }
            }
            TurnEvent::PartialDelivered { request_id, text } if next.is_active(&request_id) => {
                if let Some(turn) = next
                    .turn
                    .as_mut()
                    .filter(|t| t.phase == TurnPhase::Delivering)
                {
                    turn.partial_response = Some(text.clone());
                    commands.push(publish(
                        EVENT_TURN_PARTIAL,
                        json!({
                            "sessionID": next.session_id,
                            "requestID": request_id,
                            "text": text,
                        }),
                    ));
                    changed = true;
                }
            }
            TurnEvent::Committing { request_id } if next.is_active(&request_id) => {
                if let Some(turn) = next.turn.as_mut().filter(|t| !t.committing) {
                    turn.committing = true;
                    changed = true;
                }
            }
            TurnEvent::Completed {
                request_id,
                message,
                session,
                retry_attempts,
                elapsed_ms,
                quota,
            } if next.is_active(&request_id) => {
                finish(&mut next, &request_id, &mut commands);
                if quota.is_some() {
                    next.quota = quota;
                }
                commands.push(publish(
                    EVENT_MESSAGE_APPENDED,
                    json!({
                        "sessionID": next.session_id,
                        "requestID": request_id,
                        "message": message,
                    }),
                ));
                commands.push(publish(
                    EVENT_SESSION_UPDATED,
                    json!({"session": session}),
                ));
                commands.push(phase_event(&next, &request_id, TurnPhase::Idle));
                commands.push(TurnCommand::RecordMetrics(TurnMetrics {
                    request_id,
                    duration_ms: elapsed_ms,
                    success: true,
                    tokens_used: message.tokens_used,
                    retry_attempts,
                    error_type: None,
                }));
                changed = true;
            }
            TurnEvent::Failed {
                request_id,
                error,
                restore_input,
                retry_attempts,
                elapsed_ms,
                quota,
            } if next.is_active(&request_id) => {
                let user_text = next.turn.as_ref().map(|t| t.user_text.clone());
                finish(&mut next, &request_id, &mut commands);
                if quota.is_some() {
                    next.quota = quota;
                }
                if restore_input {
                    next.restored_input = user_text.clone();
                }
                let error_type = error.kind;
                let notice = error_notice(error, user_text);
                next.last_notice = Some(notice.clone());
                commands.push(TurnCommand::Notify(notice));
                commands.push(phase_event(&next, &request_id, TurnPhase::Idle));
                commands.push(TurnCommand::RecordMetrics(TurnMetrics {
                    request_id,
                    duration_ms: elapsed_ms,
                    success: false,
                    tokens_used: None,
                    retry_attempts,
                    error_type: Some(error_type),
                }));
                changed = true;
            }
            TurnEvent::CancelRequested { elapsed_ms } => {
                let stoppable = next
                    .turn
                    .as_ref()
                    .filter(|t| next.request_active && !t.committing)
                    .map(|t| t.request_id.clone());
                if let Some(request_id) = stoppable {
                    commands.push(TurnCommand::RevokeToken {
                        request_id: request_id.clone(),
                    });
                    finish(&mut next, &request_id, &mut commands);
                    next.last_notice = Some(Notice::Stopped);
                    commands.push(TurnCommand::Notify(Notice::Stopped));
                    commands.push(phase_event(&next, &request_id, TurnPhase::Idle));
                    commands.push(TurnCommand::RecordMetrics(TurnMetrics {
                        request_id,
                        duration_ms: elapsed_ms,
                        success: false,
                        tokens_used: None,
                        retry_attempts: 0,
                        error_type: None,
                    }));
                    changed = true;
                }
            }
            _ => {}
        }

        if changed {
            next.revision = next.revision.saturating_add(1);
        }
        (next, commands)
    }
}

/// Moves the active turn forward. Phases never go backwards.
fn advance(state: &mut TurnState, to: TurnPhase) -> bool {
    match state.turn.as_mut() {
        Some(turn) if turn.phase.rank() < to.rank() => {
            turn.phase = to;
            true
        }
        _ => false,
    }
}

/// Terminal exit: drops the turn, the escalation and the timer.
fn finish(state: &mut TurnState, request_id: &str, commands: &mut Vec<TurnCommand>) {
    state.turn = None;
    state.request_active = false;
    commands.push(TurnCommand::ClearSoftTimeout {
        request_id: request_id.to_string(),
    });
    commands.push(TurnCommand::RetireToken {
        request_id: request_id.to_string(),
    });
}

fn error_notice(error: ClassifiedError, user_text: Option<String>) -> Notice {
    let retry_text = match error.retry_offer() {
        RetryOffer::None => None,
        RetryOffer::Resubmit | RetryOffer::SwitchModel => user_text,
    };
    Notice::Error { error, retry_text }
}

fn publish(event_type: &'static str, properties: Value) -> TurnCommand {
    TurnCommand::Publish {
        event_type,
        properties,
    }
}

fn phase_event(state: &TurnState, request_id: &str, phase: TurnPhase) -> TurnCommand {
    publish(
        EVENT_TURN_PHASE,
        json!({
            "sessionID": state.session_id,
            "requestID": request_id,
            "phase": phase.as_str(),
        }),
    )
}

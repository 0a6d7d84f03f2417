use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use lumen_providers::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    QuotaExceeded,
    AuthError,
    ModelError,
    TimeoutError,
    RateLimitError,
    NetworkError,
    ServerError,
    UnknownError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::ModelError => "model_error",
            ErrorKind::TimeoutError => "timeout_error",
            ErrorKind::RateLimitError => "rate_limit_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::ServerError => "server_error",
            ErrorKind::UnknownError => "unknown_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the notice should offer besides dismissal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOffer {
    Resubmit,
    SwitchModel,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub raw_message: String,
    pub user_message: String,
    pub retryable: bool,
    pub suggested_actions: Vec<String>,
}

impl ClassifiedError {
    pub fn retry_offer(&self) -> RetryOffer {
        match self.kind {
            ErrorKind::QuotaExceeded | ErrorKind::AuthError => RetryOffer::None,
            ErrorKind::ModelError => RetryOffer::SwitchModel,
            _ => RetryOffer::Resubmit,
        }
    }

    pub fn is_quota(&self) -> bool {
        self.kind == ErrorKind::QuotaExceeded
    }
}

/// A failure as the classifier sees it: a message and maybe a status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFailure {
    pub message: String,
    pub status: Option<u16>,
}

impl RawFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    /// Recovers the gateway status code when the error chain carries a
    /// `ProviderError`.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        if let Some(provider) = err.downcast_ref::<ProviderError>() {
            return Self::from(provider.clone());
        }
        Self {
            message: format!("{err:#}"),
            status: None,
        }
    }
}

impl From<ProviderError> for RawFailure {
    fn from(err: ProviderError) -> Self {
        Self {
            message: err.message,
            status: err.status,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub model_id: Option<String>,
    pub session_id: Option<String>,
    pub retry_attempt: Option<u32>,
}

impl ErrorContext {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model_id: Option<String>) -> Self {
        self.model_id = model_id;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.retry_attempt = Some(attempt);
        self
    }
}

pub fn hard_deadline_message(secs: u64) -> String {
    format!("request timeout after {secs} seconds")
}

struct Probe<'a> {
    lower: String,
    status: Option<u16>,
    model_id: Option<&'a str>,
}

impl Probe<'_> {
    fn has(&self, needle: &str) -> bool {
        self.lower.contains(needle)
    }

    fn has_any(&self, needles: &[&str]) -> bool {
        needles.iter().any(|n| self.lower.contains(n))
    }
}

struct Rule {
    kind: ErrorKind,
    matches: fn(&Probe<'_>) -> bool,
    user_message: &'static str,
    retryable: bool,
    actions: &'static [&'static str],
}

static STATUS_IN_TEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\bstatus(?:\s+code)?|\bhttp)[\s:=/]*([1-5]\d{2})\b")
        .expect("valid status regex")
});
static WORD_401: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b401\b").expect("valid 401 regex"));
static WORD_429: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b429\b").expect("valid 429 regex"));
static WORD_RATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\brate").expect("valid rate regex"));

fn status_from_text(lower: &str) -> Option<u16> {
    STATUS_IN_TEXT.captures(lower)?.get(1)?.as_str().parse().ok()
}

fn is_quota(p: &Probe<'_>) -> bool {
    p.has_any(&["quota", "usage", "limit"])
}

fn is_auth(p: &Probe<'_>) -> bool {
    p.status == Some(401)
        || p.has_any(&["authentication", "unauthorized"])
        || WORD_401.is_match(&p.lower)
}

fn is_model(p: &Probe<'_>) -> bool {
    let names_model = p.has_any(&["model", "provider"])
        || p.model_id
            .map(|m| m.trim().to_lowercase())
            .is_some_and(|m| !m.is_empty() && p.has(&m));
    names_model && p.has_any(&["not found", "inactive"])
}

fn is_timeout(p: &Probe<'_>) -> bool {
    p.has_any(&["timeout", "timed out"])
}

fn is_rate_limit(p: &Probe<'_>) -> bool {
    p.status == Some(429) || WORD_RATE.is_match(&p.lower) || WORD_429.is_match(&p.lower)
}

fn is_network(p: &Probe<'_>) -> bool {
    p.has_any(&["network", "fetch", "connection"])
}

fn is_server(p: &Probe<'_>) -> bool {
    p.status.is_some_and(|s| s >= 500) || p.has_any(&["server", "internal"])
}

fn always(_: &Probe<'_>) -> bool {
    true
}

// First match wins. "rate limit exceeded" lands in quota_exceeded because
// "limit" is checked before "rate".
const RULES: &[Rule] = &[
    Rule {
        kind: ErrorKind::QuotaExceeded,
        matches: is_quota,
        user_message: "You have reached the AI usage limit for your plan.",
        retryable: false,
        actions: &["Upgrade your plan", "Wait for your usage to reset"],
    },
    Rule {
        kind: ErrorKind::AuthError,
        matches: is_auth,
        user_message: "Your session is not authorized to use the AI assistant.",
        retryable: true,
        actions: &["Sign in again", "Check your API credentials"],
    },
    Rule {
        kind: ErrorKind::ModelError,
        matches: is_model,
        user_message: "The selected AI model is not available.",
        retryable: true,
        actions: &["Choose a different model", "Retry with the default model"],
    },
    Rule {
        kind: ErrorKind::TimeoutError,
        matches: is_timeout,
        user_message: "The AI service took too long to respond.",
        retryable: true,
        actions: &["Try again", "Ask a shorter question"],
    },
    Rule {
        kind: ErrorKind::RateLimitError,
        matches: is_rate_limit,
        user_message: "Too many requests were sent. Please wait a moment.",
        retryable: true,
        actions: &["Wait a few seconds and try again"],
    },
    Rule {
        kind: ErrorKind::NetworkError,
        matches: is_network,
        user_message: "Could not reach the AI service. Check your connection.",
        retryable: true,
        actions: &["Check your network connection", "Try again"],
    },
    Rule {
        kind: ErrorKind::ServerError,
        matches: is_server,
        user_message: "The AI service is having problems right now.",
        retryable: true,
        actions: &["Try again in a few minutes"],
    },
];

const FALLBACK: Rule = Rule {
    kind: ErrorKind::UnknownError,
    matches: always,
    user_message: "Something went wrong while talking to the AI assistant.",
    retryable: true,
    actions: &["Try again", "Contact support if the problem persists"],
};

fn rule_for(kind: ErrorKind) -> &'static Rule {
    RULES.iter().find(|r| r.kind == kind).unwrap_or(&FALLBACK)
}

/// Maps a raw failure onto a fixed category. Pure: the same failure and
/// context always produce the same result.
pub fn classify(failure: &RawFailure, context: &ErrorContext) -> ClassifiedError {
    let lower = failure.message.to_lowercase();
    let status = failure.status.or_else(|| status_from_text(&lower));
    let probe = Probe {
        lower,
        status,
        model_id: context.model_id.as_deref(),
    };
    let rule = RULES
        .iter()
        .find(|rule| (rule.matches)(&probe))
        .unwrap_or(&FALLBACK);
    build(rule, &failure.message)
}

/// The classification for a failure whose kind is already known, e.g. the
/// hard deadline firing.
pub fn classified_as(kind: ErrorKind, raw_message: impl Into<String>) -> ClassifiedError {
    build(rule_for(kind), &raw_message.into())
}

fn build(rule: &Rule, raw_message: &str) -> ClassifiedError {
    ClassifiedError {
        kind: rule.kind,
        raw_message: raw_message.to_string(),
        user_message: rule.user_message.to_string(),
        retryable: rule.retryable,
        suggested_actions: rule.actions.iter().map(|a| a.to_string()).collect(),
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const LIVE: u8 = 0;
const REVOKED: u8 = 1;
const COMMITTED: u8 = 2;

/// Cancellation handle owned by exactly one turn.
///
/// `revoked` is the user pressing stop; `retired` means the turn reached a
/// terminal state by any path. Timers wait on `settled()` so they stand down in
/// both cases. Stopping and committing the reply exclude each other: whichever
/// happens first wins.
#[derive(Debug, Clone)]
pub struct TurnToken {
    request_id: String,
    outcome: Arc<AtomicU8>,
    revoked: CancellationToken,
    retired: CancellationToken,
}

impl TurnToken {
    pub fn new(request_id: impl Into<String>) -> Self {
        let revoked = CancellationToken::new();
        // Revoking implies retiring, never the other way round.
        let retired = revoked.child_token();
        Self {
            request_id: request_id.into(),
            outcome: Arc::new(AtomicU8::new(LIVE)),
            revoked,
            retired,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Stops the turn. Returns false when it was already stopped or its reply
    /// is being persisted.
    pub fn revoke(&self) -> bool {
        let stopped = self
            .outcome
            .compare_exchange(LIVE, REVOKED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if stopped {
            self.revoked.cancel();
        }
        stopped
    }

    /// Claims the reply for persistence. Fails once the turn was stopped.
    pub fn commit(&self) -> bool {
        self.outcome
            .compare_exchange(LIVE, COMMITTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn retire(&self) {
        self.retired.cancel();
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.is_cancelled()
    }

    pub fn is_settled(&self) -> bool {
        self.retired.is_cancelled()
    }

    pub async fn revoked(&self) {
        self.revoked.cancelled().await
    }

    pub async fn settled(&self) {
        self.retired.cancelled().await
    }
}

/// Live turn tokens keyed by session id.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, TurnToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a fresh token for the session. A token left over from an earlier
    /// turn is retired first; tokens are never handed out twice.
    pub async fn create(&self, session_id: &str, request_id: &str) -> TurnToken {
        let token = TurnToken::new(request_id);
        let previous = self
            .tokens
            .write()
            .await
            .insert(session_id.to_string(), token.clone());
        if let Some(previous) = previous {
            previous.retire();
        }
        token
    }

    /// Retires and drops the token, but only if it still belongs to
    /// `request_id`.
    pub async fn remove(&self, session_id: &str, request_id: &str) {
        let mut tokens = self.tokens.write().await;
        let owned = tokens
            .get(session_id)
            .is_some_and(|t| t.request_id() == request_id);
        if owned {
            if let Some(token) = tokens.remove(session_id) {
                token.retire();
            }
        }
    }

    pub async fn active_count(&self) -> usize {
        self.tokens.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revoking_settles_but_retiring_does_not_revoke() {
        let stopped = TurnToken::new("req-1");
        assert!(stopped.revoke());
        assert!(!stopped.revoke());
        assert!(stopped.is_revoked());
        assert!(stopped.is_settled());

        let finished = TurnToken::new("req-2");
        finished.retire();
        assert!(finished.is_settled());
        assert!(!finished.is_revoked());
    }

    #[tokio::test]
    async fn create_mints_fresh_tokens_and_retires_stale_ones() {
        let registry = CancellationRegistry::new();
        let first = registry.create("ses-1", "req-1").await;
        let second = registry.create("ses-1", "req-2").await;
        assert!(first.is_settled());
        assert!(!first.is_revoked());
        assert!(!second.is_settled());
        assert_eq!(registry.active_count().await, 1);
    }

    #[test]
    fn stop_and_commit_exclude_each_other() {
        let saving = TurnToken::new("req-1");
        assert!(saving.commit());
        assert!(!saving.revoke());
        assert!(!saving.is_revoked());
        assert!(!saving.is_settled());

        let stopped = TurnToken::new("req-2");
        assert!(stopped.revoke());
        assert!(!stopped.commit());
    }

    #[tokio::test]
    async fn remove_ignores_other_requests() {
        let registry = CancellationRegistry::new();
        let token = registry.create("ses-1", "req-2").await;
        registry.remove("ses-1", "req-1").await;
        assert_eq!(registry.active_count().await, 1);
        registry.remove("ses-1", "req-2").await;
        assert_eq!(registry.active_count().await, 0);
        assert!(token.is_settled());
        token.settled().await;
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use lumen_types::{MessageRole, QuotaState};

use crate::storage::MessageStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaPlanConfig {
    pub plan_name: String,
    pub monthly_limit: u64,
}

impl Default for QuotaPlanConfig {
    fn default() -> Self {
        Self {
            plan_name: "Free".to_string(),
            monthly_limit: 50,
        }
    }
}

/// Source of truth for plan usage.
#[async_trait]
pub trait QuotaSource: Send + Sync {
    async fn read(&self) -> anyhow::Result<QuotaState>;

    /// Called once per successful turn.
    async fn record_usage(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fixed plan with an in-memory counter.
pub struct StaticQuotaSource {
    state: RwLock<QuotaState>,
}

impl StaticQuotaSource {
    pub fn new(plan_name: impl Into<String>, current_usage: u64, limit: u64) -> Self {
        Self {
            state: RwLock::new(QuotaState::new(plan_name, current_usage, limit)),
        }
    }

    /// Parses `N/LIMIT` as accepted by the CLI.
    pub fn parse(plan_name: &str, raw: &str) -> Option<Self> {
        let (usage, limit) = raw.split_once('/')?;
        let usage = usage.trim().parse().ok()?;
        let limit = limit.trim().parse().ok()?;
        Some(Self::new(plan_name, usage, limit))
    }

    pub async fn set_usage(&self, current_usage: u64) {
        self.state.write().await.current_usage = current_usage;
    }
}

#[async_trait]
impl QuotaSource for StaticQuotaSource {
    async fn read(&self) -> anyhow::Result<QuotaState> {
        Ok(self.state.read().await.clone())
    }

    async fn record_usage(&self) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        state.current_usage = state.current_usage.saturating_add(1);
        Ok(())
    }
}

/// Counts assistant replies persisted this calendar month (UTC).
pub struct StorageQuotaSource {
    store: Arc<dyn MessageStore>,
    plan: QuotaPlanConfig,
}

impl StorageQuotaSource {
    pub fn new(store: Arc<dyn MessageStore>, plan: QuotaPlanConfig) -> Self {
        Self { store, plan }
    }
}

#[async_trait]
impl QuotaSource for StorageQuotaSource {
    async fn read(&self) -> anyhow::Result<QuotaState> {
        let now = Utc::now();
        let month_start = Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(now);
        let used = self
            .store
            .count_messages_since(MessageRole::Assistant, month_start)
            .await?;
        Ok(QuotaState::new(
            self.plan.plan_name.clone(),
            used as u64,
            self.plan.monthly_limit,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted(QuotaState),
    Rejected(QuotaState),
}

/// Admission control over a cached `QuotaState`.
#[derive(Clone)]
pub struct QuotaGuard {
    source: Arc<dyn QuotaSource>,
    cached: Arc<RwLock<Option<QuotaState>>>,
}

impl QuotaGuard {
    pub fn new(source: Arc<dyn QuotaSource>) -> Self {
        Self {
            source,
            cached: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn snapshot(&self) -> Option<QuotaState> {
        self.cached.read().await.clone()
    }

    /// Re-reads the source and replaces the cache.
    pub async fn refresh(&self) -> anyhow::Result<QuotaState> {
        let fresh = self.source.read().await?;
        *self.cached.write().await = Some(fresh.clone());
        Ok(fresh)
    }

    /// Admits iff `current_usage < limit`. The source is read only when no
    /// state is cached yet.
    pub async fn admit(&self) -> anyhow::Result<Admission> {
        let cached = self.cached.read().await.clone();
        let state = match cached {
            Some(state) => state,
            None => self.refresh().await?,
        };
        if state.can_use_ai() {
            Ok(Admission::Admitted(state))
        } else {
            Ok(Admission::Rejected(state))
        }
    }

    pub async fn record_success(&self) {
        if let Some(state) = self.cached.write().await.as_mut() {
            state.current_usage = state.current_usage.saturating_add(1);
        }
        if let Err(err) = self.source.record_usage().await {
            tracing::warn!(error = %err, "failed to record quota usage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSource;

    #[async_trait]
    impl QuotaSource for FailingSource {
        async fn read(&self) -> anyhow::Result<QuotaState> {
            anyhow::bail!("quota service unreachable: network error")
        }
    }

    #[tokio::test]
    async fn admits_below_limit_and_rejects_at_limit() {
        let source = Arc::new(StaticQuotaSource::new("Pro", 5, 50));
        let guard = QuotaGuard::new(source.clone());
        assert!(matches!(guard.admit().await, Ok(Admission::Admitted(_))));

        source.set_usage(50).await;
        guard.refresh().await.expect("refresh");
        match guard.admit().await.expect("admission") {
            Admission::Rejected(state) => {
                assert_eq!(state.plan_name, "Pro");
                assert_eq!(state.current_usage, 50);
                assert_eq!(state.limit, 50);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn admission_uses_cache_until_refreshed() {
        let source = Arc::new(StaticQuotaSource::new("Free", 49, 50));
        let guard = QuotaGuard::new(source.clone());
        guard.admit().await.expect("admission");
        source.set_usage(50).await;
        assert!(matches!(guard.admit().await, Ok(Admission::Admitted(_))));
        guard.refresh().await.expect("refresh");
        assert!(matches!(guard.admit().await, Ok(Admission::Rejected(_))));
    }

    #[tokio::test]
    async fn success_bumps_cache_and_source() {
        let source = Arc::new(StaticQuotaSource::new("Free", 49, 50));
        let guard = QuotaGuard::new(source.clone());
        guard.admit().await.expect("admission");
        guard.record_success().await;
        assert_eq!(guard.snapshot().await.map(|s| s.current_usage), Some(50));
        assert_eq!(source.read().await.expect("read").current_usage, 50);
        assert!(matches!(guard.admit().await, Ok(Admission::Rejected(_))));
    }

    #[tokio::test]
    async fn unreadable_source_fails_admission() {
        let guard = QuotaGuard::new(Arc::new(FailingSource));
        let err = guard.admit().await.expect_err("expected error");
        assert!(err.to_string().contains("unreachable"));
        assert!(guard.snapshot().await.is_none());
    }

    #[test]
    fn parses_cli_quota_flag() {
        assert!(StaticQuotaSource::parse("Cli", "5/50").is_some());
        assert!(StaticQuotaSource::parse("Cli", "5").is_none());
        assert!(StaticQuotaSource::parse("Cli", "x/50").is_none());
    }
}

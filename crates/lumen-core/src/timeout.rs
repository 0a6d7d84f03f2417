use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::cancellation::TurnToken;

/// When the soft escalation clock starts counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftClockStart {
    #[default]
    Submission,
    InferenceStart,
}

impl std::str::FromStr for SoftClockStart {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "submission" => Ok(Self::Submission),
            "inference_start" | "inference" => Ok(Self::InferenceStart),
            other => Err(format!("unknown soft clock start `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub soft: Duration,
    pub hard: Duration,
    pub soft_clock_start: SoftClockStart,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            soft: Duration::from_secs(45),
            hard: Duration::from_secs(60),
            soft_clock_start: SoftClockStart::Submission,
        }
    }
}

/// A pending soft escalation. Dropping the handle does not cancel the timer;
/// call `clear`.
#[derive(Debug)]
pub struct SoftTimeoutHandle {
    request_id: String,
    task: JoinHandle<()>,
}

impl SoftTimeoutHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn clear(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Arms the escalation timer. `on_elapsed` runs only if the turn is still
/// unsettled when `delay` passes.
pub fn arm_soft_timeout<F>(delay: Duration, token: TurnToken, on_elapsed: F) -> SoftTimeoutHandle
where
    F: FnOnce() + Send + 'static,
{
    let request_id = token.request_id().to_string();
    let task = tokio::spawn(async move {
        tokio::select! {
            _ = token.settled() => {}
            _ = tokio::time::sleep(delay) => {
                if !token.is_settled() {
                    on_elapsed();
                }
            }
        }
    });
    SoftTimeoutHandle { request_id, task }
}

/// Races `fut` against the hard deadline.
pub async fn with_hard_deadline<T, Fut>(deadline: Duration, fut: Fut) -> Option<T>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(deadline, fut).await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn soft_timeout_fires_while_turn_is_live() {
        let token = TurnToken::new("req-1");
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let handle = arm_soft_timeout(Duration::from_secs(45), token.clone(), move || {
            flag.store(true, Ordering::SeqCst)
        });
        tokio::time::sleep(Duration::from_secs(44)).await;
        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn settled_turn_never_escalates() {
        let token = TurnToken::new("req-1");
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let _handle = arm_soft_timeout(Duration::from_secs(45), token.clone(), move || {
            flag.store(true, Ordering::SeqCst)
        });
        tokio::time::sleep(Duration::from_secs(10)).await;
        token.retire();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_timer_never_escalates() {
        let token = TurnToken::new("req-1");
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let handle = arm_soft_timeout(Duration::from_secs(1), token, move || {
            flag.store(true, Ordering::SeqCst)
        });
        assert_eq!(handle.request_id(), "req-1");
        handle.clear();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_deadline_cuts_off_slow_futures() {
        let slow = with_hard_deadline(Duration::from_secs(60), std::future::pending::<()>()).await;
        assert!(slow.is_none());
        let fast = with_hard_deadline(Duration::from_secs(60), async { 7 }).await;
        assert_eq!(fast, Some(7));
    }

    #[test]
    fn soft_clock_start_parses_config_spellings() {
        assert_eq!(
            "inference-start".parse::<SoftClockStart>(),
            Ok(SoftClockStart::InferenceStart)
        );
        assert_eq!("Submission".parse::<SoftClockStart>(), Ok(SoftClockStart::Submission));
        assert!("later".parse::<SoftClockStart>().is_err());
    }
}

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::Level;

use lumen_observability::{emit_event, ObservabilityEvent, ProcessKind};

use crate::error_classifier::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnMetrics {
    pub request_id: String,
    pub duration_ms: u64,
    pub success: bool,
    pub tokens_used: Option<u64>,
    pub retry_attempts: u32,
    pub error_type: Option<ErrorKind>,
}

/// Fire-and-forget recorder. Implementations must not block.
pub trait MetricsSink: Send + Sync {
    fn record(&self, metrics: TurnMetrics);
}

pub struct TracingMetricsSink {
    process: ProcessKind,
}

impl TracingMetricsSink {
    pub fn new(process: ProcessKind) -> Self {
        Self { process }
    }
}

impl MetricsSink for TracingMetricsSink {
    fn record(&self, metrics: TurnMetrics) {
        let detail = format!(
            "tokens={} retries={}",
            metrics
                .tokens_used
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
            metrics.retry_attempts
        );
        let mut event = ObservabilityEvent::new("turn.metrics", "metrics")
            .request(&metrics.request_id)
            .status(if metrics.success { "ok" } else { "failed" })
            .duration_ms(metrics.duration_ms)
            .detail(&detail);
        if let Some(kind) = metrics.error_type {
            event = event.error_code(kind.as_str());
        }
        emit_event(Level::DEBUG, self.process, event);
    }
}

/// Forwards metrics to a channel; a closed receiver drops them silently.
pub struct ChannelMetricsSink {
    tx: mpsc::UnboundedSender<TurnMetrics>,
}

impl ChannelMetricsSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TurnMetrics>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MetricsSink for ChannelMetricsSink {
    fn record(&self, metrics: TurnMetrics) {
        let _ = self.tx.send(metrics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TurnMetrics {
        TurnMetrics {
            request_id: "req-1".to_string(),
            duration_ms: 1200,
            success: false,
            tokens_used: None,
            retry_attempts: 2,
            error_type: Some(ErrorKind::TimeoutError),
        }
    }

    #[tokio::test]
    async fn channel_sink_forwards_records() {
        let (sink, mut rx) = ChannelMetricsSink::new();
        sink.record(sample());
        let got = rx.recv().await.expect("metrics");
        assert_eq!(got.retry_attempts, 2);
        assert_eq!(got.error_type, Some(ErrorKind::TimeoutError));
    }

    #[test]
    fn closed_channel_and_tracing_sink_never_fail() {
        let (sink, rx) = ChannelMetricsSink::new();
        drop(rx);
        sink.record(sample());
        TracingMetricsSink::new(ProcessKind::Engine).record(sample());
    }
}

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Init,
    ProviderInit,
    RuleParsing,
    RuleExecution,
    DependencyAnalysis,
    Complete,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(skip)]
    pub timestamp: SystemTime,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl ProgressEvent {
    pub fn new(stage: Stage) -> Self {
        Self {
            timestamp: SystemTime::now(),
            stage,
            message: None,
            current: None,
            total: None,
            percent: None,
            metadata: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_counts(mut self, current: u64, total: u64) -> Self {
        self.current = Some(current);
        self.total = Some(total);
        if total > 0 {
            self.percent = Some((current as f64 / total as f64) * 100.0);
        }
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Reporters MUST NOT block: analysis latency never couples to reporter
/// throughput.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// Human-readable, timestamped, line-oriented.
#[derive(Default)]
pub struct TextReporter;

impl ProgressReporter for TextReporter {
    fn report(&self, event: &ProgressEvent) {
        let elapsed = event
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let counts = match (event.current, event.total) {
            (Some(current), Some(total)) => format!(" [{current}/{total}]"),
            _ => String::new(),
        };
        let message = event.message.as_deref().unwrap_or("");
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(
            stderr,
            "{}.{:03} {:?}{} {}",
            elapsed.as_secs(),
            elapsed.subsec_millis(),
            event.stage,
            counts,
            message
        );
    }
}

/// Bounded fan-out to a consumer; a full buffer drops the event and bumps
/// the counter instead of stalling the engine.
pub struct ChannelReporter {
    sender: mpsc::Sender<ProgressEvent>,
    dropped: Arc<AtomicU64>,
}

pub const CHANNEL_REPORTER_CAPACITY: usize = 100;

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::channel(CHANNEL_REPORTER_CAPACITY);
        (
            Self {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            receiver,
        )
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }
}

impl ProgressReporter for ChannelReporter {
    fn report(&self, event: &ProgressEvent) {
        if self.sender.try_send(event.clone()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Default)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: &ProgressEvent) {}
}

/// Staged event stream with any number of attached reporters.
#[derive(Clone, Default)]
pub struct ProgressBus {
    reporters: Vec<Arc<dyn ProgressReporter>>,
}

impl ProgressBus {
    pub fn new(reporters: Vec<Arc<dyn ProgressReporter>>) -> Self {
        Self { reporters }
    }

    pub fn emit(&self, event: ProgressEvent) {
        trace!(stage = ?event.stage, message = ?event.message, "progress");
        for reporter in &self.reporters {
            reporter.report(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_reporter_drops_instead_of_blocking() {
        let (reporter, mut receiver) = ChannelReporter::new();
        for _ in 0..(CHANNEL_REPORTER_CAPACITY + 25) {
            reporter.report(&ProgressEvent::new(Stage::RuleExecution));
        }
        assert_eq!(reporter.dropped_events(), 25);

        let mut received = 0;
        while receiver.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, CHANNEL_REPORTER_CAPACITY);
    }

    #[test]
    fn percent_is_derived_from_counts() {
        let event = ProgressEvent::new(Stage::ProviderInit).with_counts(25, 100);
        assert_eq!(event.percent, Some(25.0));
    }
}

//! Recognition / intrusion alert events and where they are published.
//!
//! Publishing is best-effort: a failed publish is logged and the pipeline
//! carries on.

use crate::types::MatchResult;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const WARNING_TYPE_CCTV: &str = "CCTV";

/// Alerts buffered ahead of a slow sink before new ones are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertKind {
    Recognised,
    Intruder,
}

/// Wire shape of an alert, field names fixed by downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    #[serde(rename = "WarningType")]
    pub warning_type: String,
    /// Camera identifier.
    #[serde(rename = "WarningOrigin")]
    pub origin: String,
    #[serde(rename = "WarningValue")]
    pub kind: AlertKind,
    #[serde(rename = "WarningMessage")]
    pub message: String,
}

impl AlertEvent {
    pub fn recognised(origin: &str, label: &str) -> Self {
        Self {
            warning_type: WARNING_TYPE_CCTV.into(),
            origin: origin.into(),
            kind: AlertKind::Recognised,
            message: format!("{label} Detected"),
        }
    }

    pub fn intruder(origin: &str) -> Self {
        Self {
            warning_type: WARNING_TYPE_CCTV.into(),
            origin: origin.into(),
            kind: AlertKind::Intruder,
            message: "INTRUDER".into(),
        }
    }

    /// RECOGNISED with the identity on a match, INTRUDER otherwise.
    pub fn for_match(origin: &str, result: &MatchResult) -> Self {
        match (result.matched, result.identity.as_deref()) {
            (true, Some(label)) => Self::recognised(origin, label),
            _ => Self::intruder(origin),
        }
    }
}

#[derive(Error, Debug)]
pub enum EventPublishError {
    #[error("webhook request failed: {0}")]
    Transport(String),
    #[error("alert queue full; event dropped")]
    QueueFull,
    #[error("alert publisher has stopped")]
    QueueClosed,
}

/// Destination for alert events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &AlertEvent) -> Result<(), EventPublishError>;
}

/// Publish `event`, logging instead of propagating a failure.
/// Returns whether the sink accepted the event.
pub fn publish_best_effort(sink: &dyn EventSink, event: &AlertEvent) -> bool {
    match sink.publish(event) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, kind = ?event.kind, origin = %event.origin, "alert publish failed");
            false
        }
    }
}

/// Writes events to the log only.
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: &AlertEvent) -> Result<(), EventPublishError> {
        tracing::info!(
            kind = ?event.kind,
            origin = %event.origin,
            message = %event.message,
            "alert"
        );
        Ok(())
    }
}

/// POSTs each event as JSON to a URL.
pub struct WebhookSink {
    agent: ureq::Agent,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            url: url.to_string(),
        }
    }
}

impl EventSink for WebhookSink {
    fn publish(&self, event: &AlertEvent) -> Result<(), EventPublishError> {
        self.agent
            .post(&self.url)
            .set("Content-Type", "application/json")
            .send_json(event)
            .map_err(|e| EventPublishError::Transport(e.to_string()))?;
        tracing::debug!(url = %self.url, kind = ?event.kind, "alert delivered");
        Ok(())
    }
}

/// Hands events to a dedicated publisher thread so that a slow sink never
/// blocks the caller. When the queue is full the event is dropped.
pub struct QueuedSink {
    queue: SyncSender<AlertEvent>,
}

impl QueuedSink {
    pub fn spawn(inner: Arc<dyn EventSink>, capacity: usize) -> Self {
        let (queue, rx) = mpsc::sync_channel::<AlertEvent>(capacity);

        std::thread::Builder::new()
            .name("facewatch-alerts".into())
            .spawn(move || {
                for event in rx {
                    publish_best_effort(inner.as_ref(), &event);
                }
                tracing::debug!("alert publisher stopped");
            })
            .expect("failed to spawn alert publisher thread");

        Self { queue }
    }
}

impl EventSink for QueuedSink {
    fn publish(&self, event: &AlertEvent) -> Result<(), EventPublishError> {
        self.queue.try_send(event.clone()).map_err(|e| match e {
            TrySendError::Full(_) => EventPublishError::QueueFull,
            TrySendError::Disconnected(_) => EventPublishError::QueueClosed,
        })
    }
}

/// Webhook sink when a URL is configured, log sink otherwise.
pub fn build_sink(webhook: Option<&str>, timeout: Duration) -> Arc<dyn EventSink> {
    match webhook {
        Some(url) => {
            tracing::info!(url, "alerts will be posted to webhook");
            Arc::new(WebhookSink::new(url, timeout))
        }
        None => {
            tracing::info!("no alert webhook configured; alerts are logged only");
            Arc::new(LogSink)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every event; optionally fails each publish.
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<AlertEvent>>,
        pub fail: bool,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<AlertEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EventSink for RecordingSink {
        fn publish(&self, event: &AlertEvent) -> Result<(), EventPublishError> {
            self.events.lock().unwrap().push(event.clone());
            if self.fail {
                return Err(EventPublishError::Transport("broker down".into()));
            }
            Ok(())
        }
    }
}

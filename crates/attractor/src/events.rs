//! Engine event stream. Emission is synchronous with state transitions, so
//! a consumer observing events in order sees a legal execution trace.

use crate::unix_timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "pipeline.start")]
    PipelineStart,
    #[serde(rename = "pipeline.complete")]
    PipelineComplete,
    #[serde(rename = "pipeline.error")]
    PipelineError,
    #[serde(rename = "pipeline.finalize")]
    PipelineFinalize,
    #[serde(rename = "node.start")]
    NodeStart,
    #[serde(rename = "node.complete")]
    NodeComplete,
    #[serde(rename = "node.retry")]
    NodeRetry,
    #[serde(rename = "goal_gate.retry")]
    GoalGateRetry,
    #[serde(rename = "loop.restart")]
    LoopRestart,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PipelineStart => "pipeline.start",
            Self::PipelineComplete => "pipeline.complete",
            Self::PipelineError => "pipeline.error",
            Self::PipelineFinalize => "pipeline.finalize",
            Self::NodeStart => "node.start",
            Self::NodeComplete => "node.complete",
            Self::NodeRetry => "node.retry",
            Self::GoalGateRetry => "goal_gate.retry",
            Self::LoopRestart => "loop.restart",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub node_id: Option<String>,
    pub data: BTreeMap<String, Value>,
    pub sequence_no: u64,
    pub timestamp: f64,
}

impl Event {
    pub fn new(kind: EventKind, node_id: Option<String>, data: BTreeMap<String, Value>) -> Self {
        Self {
            kind,
            node_id,
            data,
            sequence_no: 0,
            timestamp: unix_timestamp(),
        }
    }
}

pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> EventObserver for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event);
    }
}

pub type SharedEventObserver = Arc<dyn EventObserver>;
pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Fan-out point for engine events: an optional observer callback plus an
/// optional channel sender. The engine keeps its own ordered list either way.
#[derive(Clone, Default)]
pub struct EventSink {
    observer: Option<SharedEventObserver>,
    sender: Option<EventSender>,
}

impl EventSink {
    pub fn with_observer(observer: SharedEventObserver) -> Self {
        Self {
            observer: Some(observer),
            sender: None,
        }
    }

    pub fn with_sender(sender: EventSender) -> Self {
        Self {
            observer: None,
            sender: Some(sender),
        }
    }

    pub fn observer(mut self, observer: SharedEventObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn sender(mut self, sender: EventSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn emit(&self, event: &Event) {
        if let Some(observer) = self.observer.as_ref() {
            observer.on_event(event);
        }
        if let Some(sender) = self.sender.as_ref() {
            let _ = sender.send(event.clone());
        }
    }
}

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

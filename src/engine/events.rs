use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use worker_client::message::{ErrorRecord, LogRecord};

use crate::engine::EngineState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressItem {
    Instance,
    Plugin,
}

/// What the engine tells whoever renders it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    ProgressChanged {
        item: ProgressItem,
        name: String,
        value: f64,
    },
    LogAppended(LogRecord),
    StateChanged(EngineState),
    ErrorRaised {
        instance: String,
        error: ErrorRecord,
    },
    /// One-line status for the user.
    MessageRaised(String),
}

#[derive(Debug, Clone)]
pub struct EventChannel {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Nobody listening is fine.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn message(&self, text: impl Into<String>) {
        self.emit(EngineEvent::MessageRaised(text.into()));
    }

    pub fn progress(&self, item: ProgressItem, name: &str, value: f64) {
        self.emit(EngineEvent::ProgressChanged {
            item,
            name: name.to_string(),
            value,
        });
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(1024)
    }
}

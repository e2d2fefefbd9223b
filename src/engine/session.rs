use chrono::{DateTime, Utc};
use uuid::Uuid;
use worker_client::message::Cursor;

use crate::advance::Position;
use crate::gate::{ErrorsByInstance, RecordedError};

/// Run-scoped state. Exists from `start` until the run ends.
#[derive(Debug, Clone)]
pub struct PublishSession {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    /// The pair that is running, or the one to run on resume.
    pub position: Position,
    pub paused: bool,
    pub stopped: bool,
    pub errors: ErrorsByInstance,
    /// Last log cursor handed out by the host.
    pub cursor: Cursor,
    pub jobs_completed: usize,
}

impl PublishSession {
    pub fn new(first: Position) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            position: first,
            paused: false,
            stopped: false,
            errors: ErrorsByInstance::new(),
            cursor: Cursor::default(),
            jobs_completed: 0,
        }
    }

    pub fn record_error(&mut self, instance: &str, error: RecordedError) {
        self.errors.entry(instance.to_string()).or_default().push(error);
    }

    pub fn has_errors(&self) -> bool {
        self.errors.values().any(|errors| !errors.is_empty())
    }
}

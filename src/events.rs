//! Discrete processing events for metrics and error reporting.
//!
//! The dispatcher and workers receive an explicit `Arc<dyn EventSink>`
//! instead of reaching for a process-wide handle.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    TaskAdmitted {
        file: String,
    },
    UploadAttemptFailed {
        file: String,
        attempt: u32,
        error: String,
        /// Backoff before the next attempt; `None` when retries are exhausted
        retry_in: Option<Duration>,
    },
    UploadSucceeded {
        file: String,
        attempts: u32,
    },
    TaskCompleted {
        file: String,
    },
    TaskFailed {
        file: String,
        error: String,
    },
    FilesInWork {
        count: usize,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: WorkerEvent);
}

/// Forwards events to `tracing` as structured fields
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::TaskAdmitted { file } => {
                info!(target: "filehook::events", %file, "task_admitted");
            }
            WorkerEvent::UploadAttemptFailed {
                file,
                attempt,
                error,
                retry_in,
            } => {
                warn!(
                    target: "filehook::events",
                    %file,
                    attempt,
                    %error,
                    retry_in_secs = retry_in.map(|d| d.as_secs()),
                    "sending_failure"
                );
            }
            WorkerEvent::UploadSucceeded { file, attempts } => {
                info!(target: "filehook::events", %file, attempts, "sent");
            }
            WorkerEvent::TaskCompleted { file } => {
                info!(target: "filehook::events", %file, "task_completed");
            }
            WorkerEvent::TaskFailed { file, error } => {
                error!(target: "filehook::events", %file, %error, "task_failed");
            }
            WorkerEvent::FilesInWork { count } => {
                info!(target: "filehook::events", files_in_work = count, "files_in_work");
            }
        }
    }
}

/// Keeps every event in memory, in emission order
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<WorkerEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<WorkerEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events concerning a single file
    pub fn events_for(&self, name: &str) -> Vec<WorkerEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.file() == Some(name))
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: WorkerEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl WorkerEvent {
    pub fn file(&self) -> Option<&str> {
        match self {
            WorkerEvent::TaskAdmitted { file }
            | WorkerEvent::UploadAttemptFailed { file, .. }
            | WorkerEvent::UploadSucceeded { file, .. }
            | WorkerEvent::TaskCompleted { file }
            | WorkerEvent::TaskFailed { file, .. } => Some(file),
            WorkerEvent::FilesInWork { .. } => None,
        }
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::events::{EventSink, WorkerEvent};
use crate::job::{Job, ProcessingContext};
use crate::scan::DirEntryInfo;
use crate::upload::Uploader;
use crate::worker::{FileWorker, WorkerError, WorkerReport};

/// Result of offering a directory entry to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A worker was started for the file
    Admitted,
    /// A worker already owns this filename
    AlreadyTracked,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Directory,
    /// The name carries none of the accepted suffixes
    Pattern,
}

/// Registry entry for a filename owned by a live worker
#[derive(Debug, Clone)]
pub struct TrackedTask {
    pub id: String,
    pub admitted_at: Instant,
}

/// Snapshot served by the status endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub dir_files: Vec<String>,
    pub working_files: Vec<String>,
}

#[derive(Default)]
struct Registry {
    files: HashMap<String, TrackedTask>,
    listing: Vec<DirEntryInfo>,
}

/// Admits one worker per new file and forgets the file once its worker ends.
///
/// The registry lock is only held to read or mutate the map and the last
/// listing; workers and watchers never hold it across I/O or a sleep.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Mutex<Registry>>,
    ctx: Arc<ProcessingContext>,
    uploader: Arc<Uploader>,
    events: Arc<dyn EventSink>,
}

impl Dispatcher {
    pub fn new(
        ctx: Arc<ProcessingContext>,
        uploader: Arc<Uploader>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            ctx,
            uploader,
            events,
        }
    }

    /// Start a worker for `entry` unless it is filtered out or already owned.
    ///
    /// Must be called from within a Tokio runtime. Never waits on the worker.
    pub fn admit(&self, entry: &DirEntryInfo) -> Admission {
        if entry.is_dir {
            return Admission::Skipped(SkipReason::Directory);
        }
        if !self.ctx.accepts(&entry.name) {
            return Admission::Skipped(SkipReason::Pattern);
        }

        let mut registry = self.registry();
        if registry.files.contains_key(&entry.name) {
            return Admission::AlreadyTracked;
        }

        let job = Job::new(entry.name.clone());
        registry.files.insert(
            job.name.clone(),
            TrackedTask {
                id: job.id.clone(),
                admitted_at: Instant::now(),
            },
        );
        self.events.emit(WorkerEvent::TaskAdmitted {
            file: job.name.clone(),
        });
        // Spawned under the lock so a concurrent admit can never observe
        // the entry without its worker.
        self.spawn(job);
        Admission::Admitted
    }

    fn spawn(&self, job: Job) {
        let (done_tx, done_rx) = oneshot::channel::<Result<WorkerReport, WorkerError>>();
        let name = job.name.clone();
        let id = job.id.clone();

        let worker = FileWorker::new(
            job,
            Arc::clone(&self.ctx),
            Arc::clone(&self.uploader),
            Arc::clone(&self.events),
        );
        tokio::spawn(async move {
            let outcome = worker.run().await;
            // The watcher only goes away with the runtime
            let _ = done_tx.send(outcome);
        });

        let this = self.clone();
        tokio::spawn(async move {
            let outcome = done_rx.await;
            this.release(&name, &id);
            this.report(&name, outcome);
        });
    }

    /// Forget `name`, provided the entry still belongs to task `id`
    fn release(&self, name: &str, id: &str) {
        let mut registry = self.registry();
        if registry.files.get(name).is_some_and(|task| task.id == id) {
            if let Some(task) = registry.files.remove(name) {
                debug!(
                    "[FILE: {}] Released after {:?}",
                    name,
                    task.admitted_at.elapsed()
                );
            }
        }
    }

    fn report(
        &self,
        name: &str,
        outcome: Result<Result<WorkerReport, WorkerError>, oneshot::error::RecvError>,
    ) {
        match outcome {
            Ok(Ok(report)) => {
                info!(
                    "[FILE: {}] Done: {} bytes, {} upload attempt(s), archive: {:?}, deleted: {}",
                    name, report.size, report.upload_attempts, report.archived_to, report.deleted
                );
                self.events.emit(WorkerEvent::TaskCompleted {
                    file: name.to_string(),
                });
            }
            Ok(Err(err)) => {
                error!("[FILE: {}] Processing failed: {}", name, err);
                self.events.emit(WorkerEvent::TaskFailed {
                    file: name.to_string(),
                    error: err.to_string(),
                });
            }
            Err(_) => {
                error!("[FILE: {}] Worker exited without reporting", name);
                self.events.emit(WorkerEvent::TaskFailed {
                    file: name.to_string(),
                    error: "worker exited without reporting".to_string(),
                });
            }
        }
    }

    /// Replace the directory listing kept for status queries
    pub fn set_listing(&self, listing: Vec<DirEntryInfo>) {
        self.registry().listing = listing;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let registry = self.registry();
        let mut working_files: Vec<String> = registry.files.keys().cloned().collect();
        working_files.sort();

        StatusSnapshot {
            dir_files: registry
                .listing
                .iter()
                .map(|entry| entry.name.clone())
                .collect(),
            working_files,
        }
    }

    pub fn working_files(&self) -> Vec<String> {
        self.snapshot().working_files
    }

    pub fn is_tracked(&self, name: &str) -> bool {
        self.registry().files.contains_key(name)
    }

    pub fn tracked_count(&self) -> usize {
        self.registry().files.len()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

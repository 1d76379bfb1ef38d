//! Per-file processing.
//!
//! A [`FileWorker`] owns exactly one file from discovery to completion:
//!
//! 1. wait until two consecutive size checks agree,
//! 2. re-read the file until it is a valid report,
//! 3. upload it with exponential backoff,
//! 4. optionally archive the original bytes,
//! 5. optionally remove the source file.
//!
//! Every failure is returned to the caller; a worker never stops the process.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::archive;
use crate::events::{EventSink, WorkerEvent};
use crate::job::{Job, JobState, ProcessingContext};
use crate::markup::{self, MarkupError};
use crate::upload::{UploadError, Uploader};

/// A polling loop logs a reminder after this many unsuccessful rounds
const STALL_WARNING_EVERY: u32 = 20;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to stat {path:?}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("size still changing after {checks} checks")]
    NeverStabilized { checks: u32 },
    #[error("still invalid after {attempts} attempts: {last}")]
    NeverValid { attempts: u32, last: MarkupError },
    #[error("unable to send data to API after {attempts} attempts: {last}")]
    UploadExhausted {
        attempts: u32,
        #[source]
        last: UploadError,
    },
    #[error("failed to archive into {path:?}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to delete {path:?}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exponential backoff between upload attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub unit: Duration,
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Wait after the `failures`-th consecutive failure (1-based), or `None`
    /// once no attempts are left. With the defaults this yields 2, 4, 8, 16
    /// and 32 units, then gives up on the sixth failure.
    pub fn delay_after(&self, failures: u32) -> Option<Duration> {
        if failures == 0 || failures >= self.max_attempts {
            return None;
        }
        let factor = 2u32.checked_pow(failures)?;
        self.unit.checked_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            unit: Duration::from_secs(60),
            max_attempts: 6,
        }
    }
}

/// Outcome of the size polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stabilized {
    pub size: u64,
    /// Number of waits taken before two consecutive sizes agreed
    pub waits: u32,
}

/// Poll `stat` for the file `name` until two consecutive observations agree.
///
/// The first observation never counts as stable on its own, so even a file
/// that is complete on discovery is checked twice.
pub async fn wait_until_stable<F, Fut>(
    name: &str,
    mut stat: F,
    interval: Duration,
    max_checks: Option<u32>,
) -> Result<Stabilized, WorkerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<u64, WorkerError>>,
{
    let mut previous: Option<u64> = None;
    let mut checks = 0u32;

    loop {
        let size = stat().await?;
        checks += 1;

        if previous == Some(size) {
            return Ok(Stabilized {
                size,
                waits: checks - 1,
            });
        }
        previous = Some(size);

        if max_checks.is_some_and(|max| checks >= max) {
            return Err(WorkerError::NeverStabilized { checks });
        }
        if checks % STALL_WARNING_EVERY == 0 {
            warn!(
                "[FILE: {}] Size still changing after {} checks (now {} bytes)",
                name, checks, size
            );
        }
        sleep(interval).await;
    }
}

/// Report of a finished worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    pub file: String,
    pub size: u64,
    pub upload_attempts: u32,
    pub archived_to: Option<PathBuf>,
    pub deleted: bool,
}

pub struct FileWorker {
    job: Job,
    ctx: Arc<ProcessingContext>,
    uploader: Arc<Uploader>,
    events: Arc<dyn EventSink>,
    state: JobState,
}

impl FileWorker {
    pub fn new(
        job: Job,
        ctx: Arc<ProcessingContext>,
        uploader: Arc<Uploader>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            job,
            ctx,
            uploader,
            events,
            state: JobState::Discovered,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Drive the file through every stage; consumes the worker
    pub async fn run(mut self) -> Result<WorkerReport, WorkerError> {
        let result = self.process().await;
        self.transition(if result.is_ok() {
            JobState::Done
        } else {
            JobState::Failed
        });
        result
    }

    async fn process(&mut self) -> Result<WorkerReport, WorkerError> {
        let path = self.job.source_path(&self.ctx);
        info!(
            "[FILE: {}] Found new file, start processing {:?}",
            self.job.name, path
        );

        self.transition(JobState::WaitingStable);
        let stable = self.wait_stable(&path).await?;
        self.progress(format_args!(
            "Size is stabilized at {} bytes after {} waits, validating",
            stable.size, stable.waits
        ));

        self.transition(JobState::Validating);
        let payload = self.wait_valid(&path).await?;

        self.transition(JobState::Uploading);
        let upload_attempts = self.send_with_backoff(&payload).await?;
        info!("[FILE: {}] Successfully sent data to API", self.job.name);

        let mut archived_to = None;
        if self.ctx.post_processing.archive {
            self.transition(JobState::Archiving);
            let zip_path = self.archive(&payload).await?;
            info!("[FILE: {}] Zipped file to: {:?}", self.job.name, zip_path);
            archived_to = Some(zip_path);
        }

        let mut deleted = false;
        if self.ctx.post_processing.removes_source() {
            self.transition(JobState::Cleanup);
            tokio::fs::remove_file(&path)
                .await
                .map_err(|source| WorkerError::Cleanup {
                    path: path.clone(),
                    source,
                })?;
            info!("[FILE: {}] Deleted file {:?}", self.job.name, path);
            deleted = true;
        }

        Ok(WorkerReport {
            file: self.job.name.clone(),
            size: stable.size,
            upload_attempts,
            archived_to,
            deleted,
        })
    }

    async fn wait_stable(&self, path: &Path) -> Result<Stabilized, WorkerError> {
        let verbose = self.ctx.verbose;
        let name = self.job.name.as_str();
        wait_until_stable(
            name,
            move || async move {
                let metadata = tokio::fs::metadata(path)
                    .await
                    .map_err(|source| WorkerError::Stat {
                        path: path.to_path_buf(),
                        source,
                    })?;
                if verbose {
                    info!("[FILE: {}] Size is {} bytes", name, metadata.len());
                } else {
                    debug!("[FILE: {}] Size is {} bytes", name, metadata.len());
                }
                Ok::<u64, WorkerError>(metadata.len())
            },
            self.ctx.stabilize_interval,
            self.ctx.max_stable_checks,
        )
        .await
    }

    /// Re-read the file every check interval until it validates
    async fn wait_valid(&self, path: &Path) -> Result<Vec<u8>, WorkerError> {
        let mut attempts = 0u32;
        loop {
            let data = tokio::fs::read(path)
                .await
                .map_err(|source| WorkerError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
            attempts += 1;

            let err = match markup::validate(&data) {
                Ok(()) => return Ok(data),
                Err(err) => err,
            };

            match &err {
                MarkupError::TooSmall { len } => self.progress(format_args!(
                    "File is too small, skipping it for now, size: {}",
                    len
                )),
                other => self.progress(format_args!("Error parsing XML: {}", other)),
            }

            if self
                .ctx
                .max_validate_attempts
                .is_some_and(|max| attempts >= max)
            {
                return Err(WorkerError::NeverValid {
                    attempts,
                    last: err,
                });
            }
            if attempts % STALL_WARNING_EVERY == 0 {
                warn!(
                    "[FILE: {}] Still not a valid report after {} attempts",
                    self.job.name, attempts
                );
            }
            sleep(self.ctx.check_interval).await;
        }
    }

    /// Returns the number of attempts it took to deliver the payload
    async fn send_with_backoff(&self, payload: &[u8]) -> Result<u32, WorkerError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            info!(
                "[FILE: {}] Sending data to API, attempt {}",
                self.job.name, attempt
            );

            let err = match self.uploader.upload(&self.job.name, payload).await {
                Ok(()) => {
                    self.events.emit(WorkerEvent::UploadSucceeded {
                        file: self.job.name.clone(),
                        attempts: attempt,
                    });
                    return Ok(attempt);
                }
                Err(err) => err,
            };

            let retry_in = self.ctx.retry.delay_after(attempt);
            warn!("[FILE: {}] Error sending to API: {}", self.job.name, err);
            self.events.emit(WorkerEvent::UploadAttemptFailed {
                file: self.job.name.clone(),
                attempt,
                error: err.to_string(),
                retry_in,
            });

            match retry_in {
                Some(delay) => {
                    info!("[FILE: {}] Backoff for {:?}", self.job.name, delay);
                    sleep(delay).await;
                }
                None => {
                    return Err(WorkerError::UploadExhausted {
                        attempts: attempt,
                        last: err,
                    })
                }
            }
        }
    }

    async fn archive(&self, payload: &[u8]) -> Result<PathBuf, WorkerError> {
        let zip_path = self.job.archive_path(&self.ctx);
        let entry = self.job.name.clone();
        let data = payload.to_vec();
        let target = zip_path.clone();

        tokio::task::spawn_blocking(move || archive::write_single_entry(&target, &entry, &data))
            .await
            .map_err(io::Error::other)
            .and_then(|written| written)
            .map_err(|source| WorkerError::Archive {
                path: zip_path.clone(),
                source,
            })?;

        Ok(zip_path)
    }

    fn transition(&mut self, next: JobState) {
        debug!("[FILE: {}] {} -> {}", self.job.name, self.state, next);
        self.state = next;
    }

    fn progress(&self, message: std::fmt::Arguments<'_>) {
        if self.ctx.verbose {
            info!("[FILE: {}] {}", self.job.name, message);
        } else {
            debug!("[FILE: {}] {}", self.job.name, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::RecordingSink;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    const VALID: &str = "<report><line>first</line><line>second</line><line>third</line></report>";

    fn scripted(sizes: &[u64]) -> impl FnMut() -> std::future::Ready<Result<u64, WorkerError>> {
        let mut queue: VecDeque<u64> = sizes.iter().copied().collect();
        move || std::future::ready(Ok(queue.pop_front().expect("ran out of sizes")))
    }

    fn test_context(dir: &Path) -> ProcessingContext {
        let mut ctx = Config {
            dir: dir.to_path_buf(),
            out: dir.to_path_buf(),
            ..Config::default()
        }
        .context();
        ctx.stabilize_interval = Duration::from_millis(5);
        ctx.check_interval = Duration::from_millis(5);
        ctx.retry.unit = Duration::from_millis(1);
        ctx
    }

    fn worker_for(ctx: ProcessingContext, name: &str) -> FileWorker {
        let uploader = Uploader::new(&ctx.url, &ctx.token, ctx.connect_timeout).unwrap();
        FileWorker::new(
            Job::new(name),
            Arc::new(ctx),
            Arc::new(uploader),
            Arc::new(RecordingSink::new()),
        )
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        let minutes: Vec<_> = (1..=5)
            .map(|n| policy.delay_after(n).unwrap().as_secs() / 60)
            .collect();

        assert_eq!(minutes, vec![2, 4, 8, 16, 32]);
        assert_eq!(policy.delay_after(6), None);
        assert_eq!(policy.delay_after(0), None);
    }

    #[test]
    fn test_backoff_schedule_scaled() {
        let policy = RetryPolicy {
            unit: Duration::from_millis(1),
            max_attempts: 3,
        };
        assert_eq!(policy.delay_after(1), Some(Duration::from_millis(2)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_millis(4)));
        assert_eq!(policy.delay_after(3), None);
    }

    #[tokio::test]
    async fn test_stable_after_one_comparison() {
        let stable =
            wait_until_stable("a.xml", scripted(&[10, 10]), Duration::from_millis(1), None)
                .await
                .unwrap();
        assert_eq!(stable, Stabilized { size: 10, waits: 1 });
    }

    #[tokio::test]
    async fn test_growing_file_needs_extra_wait() {
        let stable =
            wait_until_stable("a.xml", scripted(&[10, 20, 20]), Duration::from_millis(1), None)
                .await
                .unwrap();
        assert_eq!(stable, Stabilized { size: 20, waits: 2 });
    }

    #[tokio::test]
    async fn test_empty_file_still_checked_twice() {
        let stable =
            wait_until_stable("a.xml", scripted(&[0, 0]), Duration::from_millis(1), None)
                .await
                .unwrap();
        assert_eq!(stable.waits, 1);
    }

    #[tokio::test]
    async fn test_stabilization_cap() {
        let result = wait_until_stable(
            "a.xml",
            scripted(&[1, 2, 3, 4]),
            Duration::from_millis(1),
            Some(3),
        )
        .await;
        assert!(matches!(result, Err(WorkerError::NeverStabilized { checks: 3 })));
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stall_warning_names_the_file() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        // Grows for 20 checks, then holds still
        let mut sizes: Vec<u64> = (1..=20).collect();
        sizes.push(20);
        let stable =
            wait_until_stable("slow.xml", scripted(&sizes), Duration::from_millis(1), None)
                .await
                .unwrap();

        assert_eq!(stable, Stabilized { size: 20, waits: 20 });
        assert!(
            logs.text()
                .contains("[FILE: slow.xml] Size still changing after 20 checks"),
            "got: {}",
            logs.text()
        );
    }

    #[tokio::test]
    async fn test_missing_file_fails_without_stopping() {
        let temp_dir = TempDir::new().unwrap();
        let worker = worker_for(test_context(temp_dir.path()), "gone.xml");

        let result = worker.run().await;
        assert!(matches!(result, Err(WorkerError::Stat { .. })));
    }

    #[tokio::test]
    async fn test_wait_valid_returns_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.xml");
        std::fs::write(&path, VALID).unwrap();
        let worker = worker_for(test_context(temp_dir.path()), "a.xml");

        let data = worker.wait_valid(&path).await.unwrap();
        assert_eq!(data, VALID.as_bytes());
    }

    #[tokio::test]
    async fn test_wait_valid_retries_until_complete() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.xml");
        std::fs::write(&path, &VALID[..60]).unwrap();
        let worker = worker_for(test_context(temp_dir.path()), "a.xml");

        let writer_path = path.clone();
        let finisher = tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            tokio::fs::write(&writer_path, VALID).await.unwrap();
        });

        let data = worker.wait_valid(&path).await.unwrap();
        finisher.await.unwrap();
        assert_eq!(data, VALID.as_bytes());
    }

    #[tokio::test]
    async fn test_wait_valid_cap() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.xml");
        std::fs::write(&path, "<tiny/>").unwrap();
        let mut ctx = test_context(temp_dir.path());
        ctx.max_validate_attempts = Some(2);
        let worker = worker_for(ctx, "a.xml");

        let result = worker.wait_valid(&path).await;
        assert!(matches!(
            result,
            Err(WorkerError::NeverValid {
                attempts: 2,
                last: MarkupError::TooSmall { len: 7 }
            })
        ));
    }

    #[tokio::test]
    async fn test_archive_writes_zip_next_to_output() {
        let temp_dir = TempDir::new().unwrap();
        let worker = worker_for(test_context(temp_dir.path()), "a.xml");

        let zip_path = worker.archive(VALID.as_bytes()).await.unwrap();
        assert_eq!(zip_path, temp_dir.path().join("a.xml.zip"));
        assert!(zip_path.exists());
    }

    #[test]
    fn test_new_worker_starts_discovered() {
        let temp_dir = TempDir::new().unwrap();
        let worker = worker_for(test_context(temp_dir.path()), "a.xml");
        assert_eq!(worker.state(), JobState::Discovered);
    }
}

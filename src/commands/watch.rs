use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::dispatcher::{Admission, Dispatcher, SkipReason};
use crate::events::{EventSink, TracingSink, WorkerEvent};
use crate::scan;
use crate::status;
use crate::upload::Uploader;

/// Command that watches a directory and ships every new report
pub struct WatchCommand {
    config: Config,
    events: Arc<dyn EventSink>,
}

impl WatchCommand {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            events: Arc::new(TracingSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub async fn execute(&self) -> Result<()> {
        let dispatcher = self.prepare().await?;

        if let Some(listen) = &self.config.listen {
            let listener = status::bind(listen).await?;
            let status_dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                if let Err(e) = status::serve(listener, status_dispatcher).await {
                    error!("Status server failed: {:#}", e);
                }
            });
        }

        tokio::spawn(report_files_in_work(
            dispatcher.clone(),
            Arc::clone(&self.events),
            Duration::from_secs(self.config.metrics_interval.max(1)),
        ));

        info!("✅ Watching {:?} for new files", self.config.dir);

        // Set up signal handling for graceful shutdown
        tokio::pin! {
            let shutdown_signal = signal::ctrl_c();
        }

        loop {
            self.scan_once(&dispatcher);

            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("🛑 Shutdown signal received. Exiting.");
                    let working = dispatcher.working_files();
                    if !working.is_empty() {
                        info!("Abandoning {} file(s) in work: {:?}", working.len(), working);
                    }
                    break;
                }
                _ = tokio::time::sleep(Duration::from_secs(self.config.scan_interval.max(1))) => {}
            }
        }

        Ok(())
    }

    /// Check directories and build the dispatcher
    async fn prepare(&self) -> Result<Dispatcher> {
        if !self.config.dir.exists() {
            return Err(anyhow!(
                "Watch directory does not exist: {:?}",
                self.config.dir
            ));
        }
        if !self.config.dir.is_dir() {
            return Err(anyhow!("Path is not a directory: {:?}", self.config.dir));
        }
        if self.config.suffixes().is_empty() {
            return Err(anyhow!("No file patterns configured"));
        }
        if self.config.zip {
            tokio::fs::create_dir_all(&self.config.out)
                .await
                .with_context(|| format!("Failed to create output directory {:?}", self.config.out))?;
        }

        let ctx = self.config.context();
        let uploader = Uploader::new(&ctx.url, &ctx.token, ctx.connect_timeout)
            .context("Failed to build HTTP client")?;

        Ok(Dispatcher::new(
            Arc::new(ctx),
            Arc::new(uploader),
            Arc::clone(&self.events),
        ))
    }

    /// List the directory once and offer every entry to the dispatcher
    pub fn scan_once(&self, dispatcher: &Dispatcher) -> usize {
        debug!("Scanning directory for new files");

        let entries = match scan::list_dir(&self.config.dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!("Directory traverse error: {:#}", e);
                return 0;
            }
        };
        dispatcher.set_listing(entries.clone());

        let mut admitted = 0;
        for entry in &entries {
            match dispatcher.admit(entry) {
                Admission::Admitted => admitted += 1,
                Admission::AlreadyTracked => {
                    debug!("File {} is already in work", entry.name);
                }
                Admission::Skipped(SkipReason::Directory) => {
                    if self.config.verbose {
                        info!("Path {} is directory, skipping", entry.name);
                    }
                }
                Admission::Skipped(SkipReason::Pattern) => {
                    if self.config.verbose {
                        info!("File {} is not accepted by system", entry.name);
                    }
                }
            }
        }

        if admitted > 0 {
            info!("➕ Started {} new worker(s)", admitted);
        }
        admitted
    }
}

/// Periodically publish how many files are in work
async fn report_files_in_work(
    dispatcher: Dispatcher,
    events: Arc<dyn EventSink>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        events.emit(WorkerEvent::FilesInWork {
            count: dispatcher.tracked_count(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn config_for(dir: PathBuf) -> Config {
        Config {
            dir: dir.clone(),
            out: dir,
            listen: None,
            // Keep workers parked in the stabilization loop
            stabilize_interval: 3600,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_watch_nonexistent_directory() {
        let watch_cmd = WatchCommand::new(config_for(PathBuf::from("/nonexistent/path")));

        let result = watch_cmd.execute().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_watch_rejects_empty_patterns() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = config_for(temp_dir.path().to_path_buf());
        config.patterns = " , ".to_string();

        assert!(WatchCommand::new(config).execute().await.is_err());
    }

    #[tokio::test]
    async fn test_scan_once_admits_matching_files() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::write(root.join("a.xml"), "<a/>").unwrap();
        std::fs::write(root.join("b.txt"), "b").unwrap();
        std::fs::create_dir(root.join("c.xml")).unwrap();

        let sink = Arc::new(RecordingSink::new());
        let watch_cmd = WatchCommand::new(config_for(root.to_path_buf())).with_events(sink.clone());
        let dispatcher = watch_cmd.prepare().await.unwrap();

        assert_eq!(watch_cmd.scan_once(&dispatcher), 1);
        // A second scan while the worker is still busy admits nothing
        assert_eq!(watch_cmd.scan_once(&dispatcher), 0);

        let snapshot = dispatcher.snapshot();
        assert_eq!(snapshot.dir_files, vec!["a.xml", "b.txt", "c.xml"]);
        assert_eq!(snapshot.working_files, vec!["a.xml"]);
    }

    #[tokio::test]
    async fn test_prepare_creates_output_dir_for_archives() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = config_for(temp_dir.path().to_path_buf());
        config.out = temp_dir.path().join("archive");
        config.zip = true;

        WatchCommand::new(config).prepare().await.unwrap();
        assert!(temp_dir.path().join("archive").is_dir());
    }

    #[tokio::test]
    async fn test_metrics_loop_reports_registry_size() {
        let temp_dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::new());
        let watch_cmd = WatchCommand::new(config_for(temp_dir.path().to_path_buf()))
            .with_events(sink.clone());
        let dispatcher = watch_cmd.prepare().await.unwrap();

        let handle = tokio::spawn(report_files_in_work(
            dispatcher,
            sink.clone(),
            Duration::from_millis(5),
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.abort();

        assert!(sink
            .events()
            .contains(&WorkerEvent::FilesInWork { count: 0 }));
    }
}

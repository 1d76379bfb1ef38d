use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::worker::RetryPolicy;

/// A single file handed to a worker
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    /// Bare filename as reported by the directory listing
    pub name: String,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
        }
    }

    /// Location of the file inside the watched directory
    pub fn source_path(&self, ctx: &ProcessingContext) -> PathBuf {
        ctx.source_dir.join(&self.name)
    }

    /// Location of the archive written after a successful upload
    pub fn archive_path(&self, ctx: &ProcessingContext) -> PathBuf {
        ctx.output_dir.join(format!("{}.zip", self.name))
    }
}

/// What happens to the source file once it has been delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostProcessing {
    /// Keep a zipped copy of the original payload in the output directory
    pub archive: bool,
    /// Remove the source file after delivery
    pub delete: bool,
}

impl PostProcessing {
    /// An archived file is always removed from the watch directory
    pub fn removes_source(&self) -> bool {
        self.delete || self.archive
    }
}

/// Immutable settings captured when a worker is spawned
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub suffixes: Vec<String>,
    pub url: String,
    pub token: String,
    pub connect_timeout: Duration,
    pub check_interval: Duration,
    pub stabilize_interval: Duration,
    pub retry: RetryPolicy,
    pub max_stable_checks: Option<u32>,
    pub max_validate_attempts: Option<u32>,
    pub verbose: bool,
    pub post_processing: PostProcessing,
}

impl ProcessingContext {
    /// Whether a filename carries one of the accepted suffixes
    pub fn accepts(&self, name: &str) -> bool {
        self.suffixes.iter().any(|suffix| name.ends_with(suffix.as_str()))
    }
}

/// Stages a worker moves through; a worker never goes back
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobState {
    Discovered,
    WaitingStable,
    Validating,
    Uploading,
    Archiving,
    Cleanup,
    Done,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobState::Discovered => "discovered",
            JobState::WaitingStable => "waiting-stable",
            JobState::Validating => "validating",
            JobState::Uploading => "uploading",
            JobState::Archiving => "archiving",
            JobState::Cleanup => "cleanup",
            JobState::Done => "done",
            JobState::Failed => "failed",
        };
        f.write_str(label)
    }
}

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::job::{PostProcessing, ProcessingContext};
use crate::worker::RetryPolicy;

/// Configuration for the watcher and the per-file workers
#[derive(Debug, Clone)]
pub struct Config {
    pub dir: PathBuf,
    pub out: PathBuf,
    pub patterns: String,
    pub separator: String,
    pub url: String,
    pub token: String,
    pub zip: bool,
    pub clear: bool,
    pub verbose: bool,
    pub listen: Option<String>,
    /// Seconds between directory scans
    pub scan_interval: u64,
    /// Seconds between validation attempts of a stabilized file
    pub check_interval: u64,
    /// Connect timeout for upload requests, in seconds
    pub timeout: u64,
    /// Seconds between size checks while a file is still being written
    pub stabilize_interval: u64,
    /// Base unit of the upload backoff, in seconds
    pub backoff_unit: u64,
    pub max_upload_attempts: u32,
    pub metrics_interval: u64,
    pub max_stable_checks: Option<u32>,
    pub max_validate_attempts: Option<u32>,
}

impl Config {
    /// Load tuning values from environment variables with defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stabilize_interval: env_or("FILEHOOK_STABILIZE_INTERVAL", defaults.stabilize_interval),
            backoff_unit: env_or("FILEHOOK_BACKOFF_UNIT", defaults.backoff_unit),
            max_upload_attempts: env_or("FILEHOOK_MAX_UPLOAD_ATTEMPTS", defaults.max_upload_attempts),
            metrics_interval: env_or("FILEHOOK_METRICS_INTERVAL", defaults.metrics_interval),
            max_stable_checks: env_opt("FILEHOOK_MAX_STABLE_CHECKS"),
            max_validate_attempts: env_opt("FILEHOOK_MAX_VALIDATE_ATTEMPTS"),
            ..defaults
        }
    }

    /// Split the configured pattern list on the separator, dropping empty items
    pub fn suffixes(&self) -> Vec<String> {
        if self.separator.is_empty() {
            return vec![self.patterns.trim().to_string()];
        }
        self.patterns
            .split(self.separator.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            unit: Duration::from_secs(self.backoff_unit),
            max_attempts: self.max_upload_attempts.max(1),
        }
    }

    /// Freeze the parts of the configuration a worker needs
    pub fn context(&self) -> ProcessingContext {
        ProcessingContext {
            source_dir: self.dir.clone(),
            output_dir: self.out.clone(),
            suffixes: self.suffixes(),
            url: self.url.clone(),
            token: self.token.clone(),
            connect_timeout: Duration::from_secs(self.timeout),
            // A zero interval would turn the polling loops into busy loops
            check_interval: Duration::from_secs(self.check_interval.max(1)),
            stabilize_interval: Duration::from_secs(self.stabilize_interval.max(1)),
            retry: self.retry_policy(),
            // Stability needs two observations, so a smaller cap always fails
            max_stable_checks: self.max_stable_checks.map(|max| max.max(2)),
            max_validate_attempts: self.max_validate_attempts,
            verbose: self.verbose,
            post_processing: PostProcessing {
                archive: self.zip,
                delete: self.clear,
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            out: PathBuf::from("."),
            patterns: ".xml".to_string(),
            separator: ",".to_string(),
            url: "http://localhost:3000/".to_string(),
            token: String::new(),
            zip: false,
            clear: true,
            verbose: false,
            listen: Some("0.0.0.0:9090".to_string()),
            scan_interval: 60,
            check_interval: 180,
            timeout: 30,
            stabilize_interval: 15,
            backoff_unit: 60,
            max_upload_attempts: 6,
            metrics_interval: 10,
            max_stable_checks: None,
            max_validate_attempts: None,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

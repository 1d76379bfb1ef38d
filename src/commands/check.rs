use anyhow::{anyhow, Result};
use std::path::PathBuf;
use tracing::info;

use crate::markup::{self, MarkupError};
use crate::scan;

/// Verdict for a single file
#[derive(Debug, Clone, PartialEq)]
pub enum CheckStatus {
    Valid,
    Invalid(MarkupError),
    Unreadable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileCheck {
    pub name: String,
    pub size: u64,
    pub status: CheckStatus,
}

#[derive(Debug, Default)]
pub struct CheckReport {
    pub files: Vec<FileCheck>,
}

impl CheckReport {
    pub fn valid_count(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.status == CheckStatus::Valid)
            .count()
    }
}

/// One-shot validation of the matching files in a directory, without uploading
pub struct CheckCommand {
    dir: PathBuf,
    suffixes: Vec<String>,
}

impl CheckCommand {
    pub fn new(dir: PathBuf, suffixes: Vec<String>) -> Self {
        Self { dir, suffixes }
    }

    pub async fn execute(&self) -> Result<CheckReport> {
        if !self.dir.exists() {
            return Err(anyhow!("Directory does not exist: {:?}", self.dir));
        }

        info!("🔎 Checking reports in: {:?}", self.dir);

        let mut report = CheckReport::default();
        for entry in scan::list_dir(&self.dir)? {
            if entry.is_dir || !self.suffixes.iter().any(|s| entry.name.ends_with(s.as_str())) {
                continue;
            }

            let status = match tokio::fs::read(self.dir.join(&entry.name)).await {
                Ok(data) => match markup::validate(&data) {
                    Ok(()) => CheckStatus::Valid,
                    Err(e) => CheckStatus::Invalid(e),
                },
                Err(e) => CheckStatus::Unreadable(e.to_string()),
            };

            report.files.push(FileCheck {
                name: entry.name,
                size: entry.size,
                status,
            });
        }

        Ok(report)
    }

    pub fn print_report(&self, report: &CheckReport) {
        println!("Checked {} file(s) in {:?}", report.files.len(), self.dir);
        for file in &report.files {
            match &file.status {
                CheckStatus::Valid => println!("  ✅ {} ({} bytes)", file.name, file.size),
                CheckStatus::Invalid(e) => println!("  ❌ {}: {}", file.name, e),
                CheckStatus::Unreadable(e) => println!("  ⚠️ {}: {}", file.name, e),
            }
        }
        println!(
            "{} valid, {} not ready",
            report.valid_count(),
            report.files.len() - report.valid_count()
        );
    }
}

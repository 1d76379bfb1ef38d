use anyhow::{anyhow, Result};
use serde::Serialize;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// One entry of a directory listing, as handed to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// List the direct children of `dir`, sorted by filename.
///
/// Entries that vanish between the listing and the stat, or whose names are
/// not valid UTF-8, are skipped.
pub fn list_dir(dir: &Path) -> Result<Vec<DirEntryInfo>> {
    if !dir.is_dir() {
        return Err(anyhow!("Path is not a directory: {:?}", dir));
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                debug!("Skipping unreadable entry: {}", e);
                continue;
            }
        };

        let Some(name) = entry.file_name().to_str() else {
            debug!("Skipping non UTF-8 filename: {:?}", entry.file_name());
            continue;
        };

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!("Skipping {}: {}", name, e);
                continue;
            }
        };

        entries.push(DirEntryInfo {
            name: name.to_string(),
            is_dir: metadata.is_dir(),
            size: metadata.len(),
        });
    }

    Ok(entries)
}

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

use crate::config::LoggingConfig;

/// Upper bound for everything under `<root>/logs`.
pub const MAX_LOG_BYTES: u64 = 200 * 1024 * 1024;

const LOG_STEMS: [&str; 2] = ["portal.log", "net.log"];

#[derive(Debug)]
struct LogFile {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

/// Deletes rotated logs older than `keep_days`, then the oldest ones until the
/// directory fits in [`MAX_LOG_BYTES`].
pub fn run_retention(root: &Path, cfg: &LoggingConfig) -> Result<()> {
    let mut files = scan(&root.join("logs"))?;
    files.sort_by_key(|f| f.modified);

    let max_age = Duration::from_secs(cfg.keep_days.saturating_mul(86_400));
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut total: u64 = files.iter().map(|f| f.size).sum();
    for file in &files {
        let expired = file.modified < cutoff;
        if !expired && total <= MAX_LOG_BYTES {
            continue;
        }
        match fs::remove_file(&file.path) {
            Ok(()) => total = total.saturating_sub(file.size),
            Err(err) => tracing::warn!("Could not remove log {}: {}", file.path.display(), err),
        }
    }
    Ok(())
}

fn scan(dir: &Path) -> Result<Vec<LogFile>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("iterating {}", dir.display()))?;
        let path = entry.path();
        let known = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| LOG_STEMS.iter().any(|stem| n.starts_with(stem)));
        if !known {
            continue;
        }
        let meta = entry
            .metadata()
            .with_context(|| format!("stat {}", path.display()))?;
        if !meta.is_file() {
            continue;
        }
        files.push(LogFile {
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size: meta.len(),
            path,
        });
    }
    Ok(files)
}

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::{debug, info};

use crate::error::{NetError, Result};

/// First line of every file we generate.
pub const GENERATED_MARKER: &str = "# Generated by hotgate";

/// Timestamped backups of system config files with a `latest` pointer.
#[derive(Debug, Clone)]
pub struct ConfigBackup {
    dir: PathBuf,
}

impl ConfigBackup {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn latest_path(&self, target: &Path) -> PathBuf {
        self.dir.join(format!("{}.latest.bak", file_name(target)))
    }

    /// Copies `target` aside before it gets overwritten.
    ///
    /// Files we generated ourselves are skipped, so a leftover from a crashed
    /// run never replaces the real original. A missing target drops the
    /// `latest` pointer: there is nothing to put back later.
    pub fn backup(&self, target: &Path) -> Result<Option<PathBuf>> {
        let contents = match fs::read(target) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.forget_latest(target)?;
                return Ok(None);
            }
            Err(err) => {
                return Err(NetError::io_error(
                    format!("reading {}", target.display()),
                    err,
                ))
            }
        };
        if is_generated(&contents) {
            debug!("{} is ours; not backing up", target.display());
            return Ok(None);
        }

        fs::create_dir_all(&self.dir).map_err(|e| {
            NetError::io_error(format!("creating {}", self.dir.display()), e)
        })?;

        let stamp = Local::now().format("%Y%m%d%H%M%S");
        let stamped = self.dir.join(format!("{}.{}.bak", file_name(target), stamp));
        let latest = self.latest_path(target);
        for dest in [&stamped, &latest] {
            fs::write(dest, &contents)
                .map_err(|e| NetError::io_error(format!("writing {}", dest.display()), e))?;
        }
        info!("Backed up {} to {}", target.display(), stamped.display());
        Ok(Some(stamped))
    }

    fn forget_latest(&self, target: &Path) -> Result<()> {
        let latest = self.latest_path(target);
        match fs::remove_file(&latest) {
            Ok(()) => {
                debug!("{} is gone; dropped {}", target.display(), latest.display());
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(NetError::io_error(
                format!("removing {}", latest.display()),
                err,
            )),
        }
    }

    /// Puts the latest backup back in place. Without a backup, a file we
    /// generated is removed; anything else is left alone.
    pub fn restore(&self, target: &Path) -> Result<bool> {
        let latest = self.latest_path(target);
        if latest.exists() {
            fs::copy(&latest, target).map_err(|e| {
                NetError::io_error(format!("restoring {}", target.display()), e)
            })?;
            info!("Restored {} from {}", target.display(), latest.display());
            return Ok(true);
        }

        if let Ok(contents) = fs::read(target) {
            if is_generated(&contents) {
                fs::remove_file(target).map_err(|e| {
                    NetError::io_error(format!("removing {}", target.display()), e)
                })?;
                debug!("Removed generated {}", target.display());
            }
        }
        Ok(false)
    }
}

/// Writes `body` to `target` behind the generated-file marker.
pub fn write_generated(target: &Path, body: &str) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| NetError::io_error(format!("creating {}", parent.display()), e))?;
    }
    let contents = format!("{GENERATED_MARKER}\n{body}");
    fs::write(target, contents)
        .map_err(|e| NetError::io_error(format!("writing {}", target.display()), e))
}

fn is_generated(contents: &[u8]) -> bool {
    contents.starts_with(GENERATED_MARKER.as_bytes())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string())
}

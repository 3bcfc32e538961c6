use std::{fs::OpenOptions, path::Path, sync::Arc};

use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Append-only `visits.log`, one line per answered request.
#[derive(Clone)]
pub struct PortalLogger {
    visits: Arc<Mutex<File>>,
}

impl PortalLogger {
    pub fn new(portal_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(portal_dir).context("creating portal log directory")?;
        let visits = open_append(portal_dir.join("visits.log")).context("opening visits log")?;
        Ok(Self {
            visits: Arc::new(Mutex::new(File::from_std(visits))),
        })
    }

    pub async fn log_visit_line(&self, line: &str) -> Result<()> {
        let mut file = self.visits.lock().await;
        file.write_all(line.as_bytes())
            .await
            .context("writing visits log")?;
        file.flush().await.context("flushing visits log")?;
        Ok(())
    }
}

pub fn format_visit_line(ip: &str, mac: Option<&str>, uri: &str, decision: &str) -> String {
    let timestamp = Local::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    format_visit_line_at(&timestamp, ip, mac, uri, decision)
}

pub fn format_visit_line_at(
    timestamp: &str,
    ip: &str,
    mac: Option<&str>,
    uri: &str,
    decision: &str,
) -> String {
    let mac = mac.unwrap_or("-");
    let uri = uri.replace('"', "%22");
    format!("[{timestamp}] ip={ip} mac={mac} uri=\"{uri}\" decision={decision}\n")
}

fn open_append(path: impl AsRef<Path>) -> Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("opening log file")
}

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use hotgate_net::MacAddr;

use crate::settings::DEFAULT_ROOT;

const ADMIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "hotgate-portal", author, version, about = "Wi-Fi captive portal")]
pub struct Cli {
    /// State root holding config/, logs/, backups/ and portal/
    #[arg(long, global = true, env = "HOTGATE_ROOT", default_value = DEFAULT_ROOT)]
    pub root: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the portal HTTP server (default)
    Serve(ServeArgs),
    /// Ask the running server to bring the captive network up
    Start,
    /// Tear the captive network down
    Stop,
    /// Show the captive network state
    Status,
    /// Give a device internet access
    Grant(GrantArgs),
    /// Cut a device off
    Revoke(RevokeArgs),
    /// List devices with internet access
    Devices,
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Bring the captive network up once the listener is bound
    #[arg(long)]
    pub start_network: bool,

    /// Tear the captive network down on SIGINT/SIGTERM
    #[arg(long)]
    pub restore_on_exit: bool,
}

#[derive(Args, Debug)]
pub struct GrantArgs {
    pub mac: MacAddr,
}

#[derive(Args, Debug)]
pub struct RevokeArgs {
    pub mac: MacAddr,

    /// Client address whose tracked connections are flushed
    #[arg(long)]
    pub ip: Option<Ipv4Addr>,

    /// Only remove the rules; leave open connections alone
    #[arg(long)]
    pub no_force: bool,
}

/// Calls the loopback admin API of a running server.
pub async fn admin_request(port: u16, method: &str, path: &str) -> Result<(u16, Value)> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let exchange = async {
        let mut stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to portal admin on {addr}"))?;
        let request =
            format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n");
        stream
            .write_all(request.as_bytes())
            .await
            .context("sending admin request")?;
        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .await
            .context("reading admin response")?;
        parse_response(&raw)
    };
    tokio::time::timeout(ADMIN_TIMEOUT, exchange)
        .await
        .with_context(|| format!("waiting for {method} {path}"))?
}

pub fn parse_response(raw: &[u8]) -> Result<(u16, Value)> {
    let text = String::from_utf8_lossy(raw);
    let Some((head, body)) = text.split_once("\r\n\r\n") else {
        bail!("truncated admin response");
    };
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .context("admin response has no status code")?;
    let body = if body.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(body).context("parsing admin response body")?
    };
    Ok((status, body))
}

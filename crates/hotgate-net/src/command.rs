//! Typed system commands and the executor seam.
//!
//! Everything that touches the host goes through [`CommandExecutor`], so the
//! whole bring-up can be driven against a simulated host in tests.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::process::Command;

use log::{debug, warn};

use crate::error::{NetError, Result};
use crate::iptables::IptablesCommand;

/// Exit code reported when a best-effort command could not be spawned.
pub const SPAWN_FAILURE_EXIT: i32 = 127;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpCommand {
    /// `ip route show default`
    RouteShowDefault,
    /// `ip -o link show`
    LinkShow,
    /// `ip -o -4 addr show [dev IFACE]`
    AddrShow { interface: Option<String> },
    AddrFlush { interface: String },
    AddrAdd {
        interface: String,
        address: IpAddr,
        prefix: u8,
    },
    LinkSet { interface: String, up: bool },
    /// `ip neigh show ADDR`
    NeighShow { address: IpAddr },
}

impl IpCommand {
    fn args(&self) -> Vec<String> {
        let v = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        match self {
            IpCommand::RouteShowDefault => v(&["route", "show", "default"]),
            IpCommand::LinkShow => v(&["-o", "link", "show"]),
            IpCommand::AddrShow { interface } => {
                let mut args = v(&["-o", "-4", "addr", "show"]);
                if let Some(iface) = interface {
                    args.push("dev".to_string());
                    args.push(iface.clone());
                }
                args
            }
            IpCommand::AddrFlush { interface } => {
                v(&["addr", "flush", "dev", interface.as_str()])
            }
            IpCommand::AddrAdd {
                interface,
                address,
                prefix,
            } => {
                let cidr = format!("{address}/{prefix}");
                v(&["addr", "add", cidr.as_str(), "dev", interface.as_str()])
            }
            IpCommand::LinkSet { interface, up } => v(&[
                "link",
                "set",
                interface.as_str(),
                if *up { "up" } else { "down" },
            ]),
            IpCommand::NeighShow { address } => {
                let addr = address.to_string();
                v(&["neigh", "show", addr.as_str()])
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfkillCommand {
    Unblock,
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitAction {
    Start,
    Stop,
    Restart,
    Unmask,
    IsActive,
}

impl UnitAction {
    fn as_str(&self) -> &'static str {
        match self {
            UnitAction::Start => "start",
            UnitAction::Stop => "stop",
            UnitAction::Restart => "restart",
            UnitAction::Unmask => "unmask",
            UnitAction::IsActive => "is-active",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    Source,
    Destination,
}

/// A single host command with typed arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemCommand {
    Iptables(IptablesCommand),
    Ip(IpCommand),
    Rfkill(RfkillCommand),
    /// Writes when `value` is set, reads otherwise.
    Sysctl { key: String, value: Option<String> },
    Systemctl { action: UnitAction, unit: String },
    /// `pgrep -x NAME`
    Pgrep { name: String },
    /// `nmcli device set IFACE managed yes|no`
    Nmcli { interface: String, managed: bool },
    /// `conntrack -D -s|-d ADDR`
    Conntrack {
        address: IpAddr,
        direction: FlowDirection,
    },
    Ping { address: IpAddr },
    /// `ss -lunH`, listening UDP sockets.
    ListUdpListeners,
    Nslookup { name: String, server: IpAddr },
}

impl SystemCommand {
    pub fn program(&self) -> &'static str {
        match self {
            SystemCommand::Iptables(_) => "iptables",
            SystemCommand::Ip(_) => "ip",
            SystemCommand::Rfkill(_) => "rfkill",
            SystemCommand::Sysctl { .. } => "sysctl",
            SystemCommand::Systemctl { .. } => "systemctl",
            SystemCommand::Pgrep { .. } => "pgrep",
            SystemCommand::Nmcli { .. } => "nmcli",
            SystemCommand::Conntrack { .. } => "conntrack",
            SystemCommand::Ping { .. } => "ping",
            SystemCommand::ListUdpListeners => "ss",
            SystemCommand::Nslookup { .. } => "nslookup",
        }
    }

    pub fn args(&self) -> Vec<String> {
        match self {
            SystemCommand::Iptables(cmd) => cmd.args(),
            SystemCommand::Ip(cmd) => cmd.args(),
            SystemCommand::Rfkill(RfkillCommand::Unblock) => {
                vec!["unblock".to_string(), "wifi".to_string()]
            }
            SystemCommand::Rfkill(RfkillCommand::List) => {
                vec!["list".to_string(), "wifi".to_string()]
            }
            SystemCommand::Sysctl { key, value } => match value {
                Some(value) => vec!["-w".to_string(), format!("{key}={value}")],
                None => vec!["-n".to_string(), key.clone()],
            },
            SystemCommand::Systemctl { action, unit } => {
                vec![action.as_str().to_string(), unit.clone()]
            }
            SystemCommand::Pgrep { name } => vec!["-x".to_string(), name.clone()],
            SystemCommand::Nmcli { interface, managed } => vec![
                "device".to_string(),
                "set".to_string(),
                interface.clone(),
                "managed".to_string(),
                if *managed { "yes" } else { "no" }.to_string(),
            ],
            SystemCommand::Conntrack { address, direction } => vec![
                "-D".to_string(),
                match direction {
                    FlowDirection::Source => "-s",
                    FlowDirection::Destination => "-d",
                }
                .to_string(),
                address.to_string(),
            ],
            SystemCommand::Ping { address } => vec![
                "-c".to_string(),
                "1".to_string(),
                "-W".to_string(),
                "1".to_string(),
                address.to_string(),
            ],
            SystemCommand::ListUdpListeners => vec!["-lunH".to_string()],
            SystemCommand::Nslookup { name, server } => vec![name.clone(), server.to_string()],
        }
    }
}

impl fmt::Display for SystemCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program())?;
        for arg in self.args() {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// How a non-zero exit is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Spawn failures and non-zero exits become errors.
    MustSucceed,
    /// Outcome is returned as-is; spawn failures are reported as exit 127.
    BestEffort,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Applies an [`ExecMode`] to the raw outcome of spawning `cmd`.
pub fn finish(
    cmd: &SystemCommand,
    mode: ExecMode,
    outcome: io::Result<ExecutionResult>,
) -> Result<ExecutionResult> {
    match (mode, outcome) {
        (ExecMode::MustSucceed, Err(source)) => Err(NetError::Spawn {
            command: cmd.to_string(),
            source,
        }),
        (ExecMode::MustSucceed, Ok(result)) if !result.success() => {
            Err(NetError::CommandFailed {
                command: cmd.to_string(),
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
            })
        }
        (ExecMode::BestEffort, Err(err)) => {
            warn!("{cmd}: spawn failed: {err}");
            Ok(ExecutionResult::failed(SPAWN_FAILURE_EXIT, err.to_string()))
        }
        (_, Ok(result)) => Ok(result),
    }
}

/// Runs host commands. Implementations must be usable from several threads.
pub trait CommandExecutor: Send + Sync {
    /// Spawns the command and waits for it, capturing both output streams.
    fn spawn(&self, cmd: &SystemCommand) -> io::Result<ExecutionResult>;

    fn run(&self, cmd: &SystemCommand, mode: ExecMode) -> Result<ExecutionResult> {
        debug!("exec: {cmd}");
        let result = finish(cmd, mode, self.spawn(cmd))?;
        if !result.success() {
            debug!("{cmd} -> exit {} {}", result.exit_code, result.stderr.trim());
        }
        Ok(result)
    }

    fn must(&self, cmd: SystemCommand) -> Result<ExecutionResult> {
        self.run(&cmd, ExecMode::MustSucceed)
    }

    fn best_effort(&self, cmd: SystemCommand) -> ExecutionResult {
        // BestEffort never yields Err.
        self.run(&cmd, ExecMode::BestEffort)
            .unwrap_or_else(|err| ExecutionResult::failed(SPAWN_FAILURE_EXIT, err.to_string()))
    }
}

/// Executes commands on the real host via `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    fn spawn(&self, cmd: &SystemCommand) -> io::Result<ExecutionResult> {
        let output = Command::new(cmd.program()).args(cmd.args()).output()?;
        Ok(ExecutionResult {
            // Killed by signal
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

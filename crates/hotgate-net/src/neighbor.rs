use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;

use crate::command::{CommandExecutor, IpCommand, SystemCommand};
use crate::config::{pause, Timings};
use crate::mac::MacAddr;

/// Maps a client address to its hardware address.
///
/// `None` means unknown, and callers must treat unknown as unauthorized.
pub trait MacResolver: Send + Sync {
    fn resolve(&self, ip: Ipv4Addr) -> Option<MacAddr>;
}

/// Neighbor table first, then a ping to populate it, then the DHCP leases.
pub struct NeighborMacResolver {
    exec: Arc<dyn CommandExecutor>,
    leases: PathBuf,
    timings: Timings,
}

impl NeighborMacResolver {
    pub fn new(exec: Arc<dyn CommandExecutor>, leases: impl Into<PathBuf>, timings: Timings) -> Self {
        Self {
            exec,
            leases: leases.into(),
            timings,
        }
    }

    fn neighbor(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        let out = self.exec.best_effort(SystemCommand::Ip(IpCommand::NeighShow {
            address: IpAddr::V4(ip),
        }));
        if !out.success() {
            return None;
        }
        parse_lladdr(&out.stdout)
    }

    fn lease(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        let contents = fs::read_to_string(&self.leases).ok()?;
        parse_lease(&contents, ip)
    }
}

impl MacResolver for NeighborMacResolver {
    fn resolve(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        if let Some(mac) = self.neighbor(ip) {
            return Some(mac);
        }

        self.exec.best_effort(SystemCommand::Ping {
            address: IpAddr::V4(ip),
        });
        pause(self.timings.neighbor_retry);
        if let Some(mac) = self.neighbor(ip) {
            return Some(mac);
        }

        let mac = self.lease(ip);
        if mac.is_none() {
            debug!("No MAC known for {ip}");
        }
        mac
    }
}

/// First usable `lladdr` in `ip neigh` output.
pub fn parse_lladdr(output: &str) -> Option<MacAddr> {
    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "lladdr" {
                return tokens
                    .next()
                    .and_then(|raw| raw.parse::<MacAddr>().ok())
                    .filter(MacAddr::is_usable);
            }
        }
        None
    })
}

/// dnsmasq lease lines: `expiry mac ip hostname client-id`.
pub fn parse_lease(contents: &str, ip: Ipv4Addr) -> Option<MacAddr> {
    contents.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields[2].parse::<Ipv4Addr>().ok()? != ip {
            return None;
        }
        fields[1].parse().ok()
    })
}

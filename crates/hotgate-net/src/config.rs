use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NetError, Result};

/// Access point and portal parameters plus the runtime facts discovered
/// during bring-up.
///
/// Runtime fields are only meaningful while `is_network_active` is set and are
/// cleared by [`NetworkConfiguration::reset_runtime`] on every teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfiguration {
    pub interface: String,
    pub gateway_ip: Ipv4Addr,
    /// dnsmasq syntax: `start,end[,mask[,lease]]`.
    pub dhcp_range: String,
    pub ssid: String,
    /// Empty means an open network.
    pub password: String,
    pub port: u16,
    pub channel: u8,
    /// Real resolver handed to authenticated devices.
    pub upstream_dns: Ipv4Addr,

    #[serde(skip)]
    pub upstream_interface: Option<String>,
    #[serde(skip)]
    pub is_vpn_interface: bool,
    #[serde(skip)]
    pub is_network_active: bool,
}

impl Default for NetworkConfiguration {
    fn default() -> Self {
        Self {
            interface: "wlan0".to_string(),
            gateway_ip: Ipv4Addr::new(192, 168, 50, 1),
            dhcp_range: "192.168.50.10,192.168.50.200,255.255.255.0,12h".to_string(),
            ssid: "hotgate".to_string(),
            password: String::new(),
            port: 8080,
            channel: 6,
            upstream_dns: Ipv4Addr::new(8, 8, 8, 8),
            upstream_interface: None,
            is_vpn_interface: false,
            is_network_active: false,
        }
    }
}

impl NetworkConfiguration {
    pub fn reset_runtime(&mut self) {
        self.upstream_interface = None;
        self.is_vpn_interface = false;
        self.is_network_active = false;
    }

    pub fn validate(&self) -> Result<()> {
        if self.interface.trim().is_empty() {
            return Err(NetError::invalid_config("interface", "must not be empty"));
        }
        if self.gateway_ip.is_unspecified() {
            return Err(NetError::invalid_config("gateway_ip", "must be a concrete address"));
        }
        if self.port == 0 {
            return Err(NetError::invalid_config("port", "must be non-zero"));
        }
        if self.ssid.is_empty() || self.ssid.len() > 32 {
            return Err(NetError::invalid_config("ssid", "must be 1..=32 bytes"));
        }
        // Each value lands on one line of hostapd.conf or dnsmasq.conf.
        for (field, value) in [
            ("interface", &self.interface),
            ("ssid", &self.ssid),
            ("password", &self.password),
        ] {
            if value.chars().any(char::is_control) {
                return Err(NetError::invalid_config(field, "must not contain control characters"));
            }
        }
        if !self.password.is_empty() && !(8..=63).contains(&self.password.chars().count()) {
            return Err(NetError::invalid_config(
                "password",
                "WPA2 passphrase must be 8..=63 characters",
            ));
        }
        if !(1..=14).contains(&self.channel) {
            return Err(NetError::invalid_config("channel", "must be a 2.4GHz channel (1..=14)"));
        }
        self.parse_dhcp_range()?;
        Ok(())
    }

    fn parse_dhcp_range(&self) -> Result<(Ipv4Addr, Ipv4Addr, Option<Ipv4Addr>)> {
        let bad = || NetError::invalid_config("dhcp_range", "expected start,end[,mask[,lease]]");
        let parts: Vec<&str> = self.dhcp_range.split(',').map(str::trim).collect();
        if !(2..=4).contains(&parts.len()) {
            return Err(bad());
        }
        let start: Ipv4Addr = parts[0].parse().map_err(|_| bad())?;
        let end: Ipv4Addr = parts[1].parse().map_err(|_| bad())?;
        if u32::from(start) > u32::from(end) {
            return Err(bad());
        }
        let mask = match parts.get(2) {
            Some(raw) => Some(raw.parse::<Ipv4Addr>().map_err(|_| bad())?),
            None => None,
        };
        Ok((start, end, mask))
    }

    /// Prefix length of the AP subnet, taken from the DHCP range mask.
    pub fn prefix_len(&self) -> u8 {
        match self.parse_dhcp_range() {
            Ok((_, _, Some(mask))) => u32::from(mask).count_ones() as u8,
            _ => 24,
        }
    }

    pub fn portal_base_url(&self) -> String {
        format!("http://{}:{}", self.gateway_ip, self.port)
    }

    pub fn login_url(&self) -> String {
        format!("{}/portal/login", self.portal_base_url())
    }
}

/// Handle shared by the orchestrator and every manager.
pub type SharedConfig = Arc<RwLock<NetworkConfiguration>>;

pub fn shared(cfg: NetworkConfiguration) -> SharedConfig {
    Arc::new(RwLock::new(cfg))
}

pub(crate) fn read(cfg: &SharedConfig) -> RwLockReadGuard<'_, NetworkConfiguration> {
    cfg.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write(cfg: &SharedConfig) -> RwLockWriteGuard<'_, NetworkConfiguration> {
    cfg.write().unwrap_or_else(|e| e.into_inner())
}

/// Files the managers read and write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemPaths {
    pub hostapd_conf: PathBuf,
    pub hostapd_default: PathBuf,
    pub dnsmasq_conf: PathBuf,
    pub dhcp_leases: PathBuf,
    pub backup_dir: PathBuf,
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self {
            hostapd_conf: PathBuf::from("/etc/hostapd/hostapd.conf"),
            hostapd_default: PathBuf::from("/etc/default/hostapd"),
            dnsmasq_conf: PathBuf::from("/etc/dnsmasq.conf"),
            dhcp_leases: PathBuf::from("/var/lib/misc/dnsmasq.leases"),
            backup_dir: PathBuf::from("/var/lib/hotgate/backups"),
        }
    }
}

impl SystemPaths {
    /// Default layout with backups kept under `root`.
    pub fn with_root(root: &Path) -> Self {
        Self {
            backup_dir: root.join("backups"),
            ..Self::default()
        }
    }

    /// Re-roots every path under `prefix`, e.g. a temp dir in tests.
    pub fn relocated(&self, prefix: &Path) -> Self {
        let under = |p: &Path| prefix.join(p.strip_prefix("/").unwrap_or(p));
        Self {
            hostapd_conf: under(&self.hostapd_conf),
            hostapd_default: under(&self.hostapd_default),
            dnsmasq_conf: under(&self.dnsmasq_conf),
            dhcp_leases: under(&self.dhcp_leases),
            backup_dir: under(&self.backup_dir),
        }
    }
}

/// Settle delays between dependent steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// After (re)starting a daemon, before checking liveness.
    pub daemon_settle: Duration,
    /// After flushing conntrack, before touching the chains.
    pub conntrack_settle: Duration,
    /// How long the temporary front-of-FORWARD drop stays in place.
    pub drop_rule_linger: Duration,
    /// Between a ping and the second neighbor lookup.
    pub neighbor_retry: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            daemon_settle: Duration::from_secs(2),
            conntrack_settle: Duration::from_millis(500),
            drop_rule_linger: Duration::from_secs(1),
            neighbor_retry: Duration::from_millis(200),
        }
    }
}

impl Timings {
    pub fn immediate() -> Self {
        Self {
            daemon_settle: Duration::ZERO,
            conntrack_settle: Duration::ZERO,
            drop_rule_linger: Duration::ZERO,
            neighbor_retry: Duration::ZERO,
        }
    }
}

pub(crate) fn pause(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = NetworkConfiguration::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.prefix_len(), 24);
        assert_eq!(cfg.login_url(), "http://192.168.50.1:8080/portal/login");
    }

    #[test]
    fn rejects_short_passphrase_and_bad_range() {
        let cfg = NetworkConfiguration {
            password: "short".into(),
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(NetError::InvalidConfig { ref field, .. }) if field == "password"
        ));

        let cfg = NetworkConfiguration {
            dhcp_range: "192.168.50.200,192.168.50.10".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = NetworkConfiguration {
            dhcp_range: "nonsense".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_line_breaks_in_hostapd_values() {
        for (field, cfg) in [
            (
                "ssid",
                NetworkConfiguration {
                    ssid: "Guest\nwpa=0".into(),
                    ..Default::default()
                },
            ),
            (
                "password",
                NetworkConfiguration {
                    password: "hunter22\nignore_broadcast_ssid=1".into(),
                    ..Default::default()
                },
            ),
        ] {
            assert!(matches!(
                cfg.validate(),
                Err(NetError::InvalidConfig { field: ref f, .. }) if f == field
            ));
        }
    }

    #[test]
    fn prefix_follows_mask() {
        let cfg = NetworkConfiguration {
            dhcp_range: "10.0.0.10,10.0.0.20,255.255.0.0,1h".into(),
            ..Default::default()
        };
        assert_eq!(cfg.prefix_len(), 16);
    }

    #[test]
    fn runtime_fields_are_not_persisted() {
        let mut cfg = NetworkConfiguration::default();
        cfg.upstream_interface = Some("eth0".into());
        cfg.is_network_active = true;
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("eth0"));
        let back: NetworkConfiguration = serde_json::from_str(&json).unwrap();
        assert!(!back.is_network_active);
        assert_eq!(back.upstream_interface, None);

        cfg.reset_runtime();
        assert_eq!(cfg, NetworkConfiguration::default());
    }

    #[test]
    fn relocates_paths_under_prefix() {
        let paths = SystemPaths::default().relocated(Path::new("/tmp/x"));
        assert_eq!(paths.hostapd_conf, PathBuf::from("/tmp/x/etc/hostapd/hostapd.conf"));
        assert_eq!(paths.backup_dir, PathBuf::from("/tmp/x/var/lib/hotgate/backups"));
    }
}

use std::env;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use hotgate_net::NetworkConfiguration;

pub const DEFAULT_ROOT: &str = "/var/lib/hotgate";

/// On-disk portal settings, `<root>/config/portal.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalSettings {
    pub interface: String,
    pub gateway: Ipv4Addr,
    pub dhcp_range: String,
    pub ssid: String,
    pub password: String,
    pub port: u16,
    pub channel: u8,
    pub upstream_dns: Ipv4Addr,
    /// Address the HTTP listener binds to.
    pub bind: IpAddr,
    pub max_connections: usize,
    pub read_timeout_ms: u64,
    pub peer_idle_secs: u64,
}

impl Default for PortalSettings {
    fn default() -> Self {
        let net = NetworkConfiguration::default();
        Self {
            interface: net.interface,
            gateway: net.gateway_ip,
            dhcp_range: net.dhcp_range,
            ssid: net.ssid,
            password: net.password,
            port: net.port,
            channel: net.channel,
            upstream_dns: net.upstream_dns,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_connections: 256,
            read_timeout_ms: 5_000,
            peer_idle_secs: 30,
        }
    }
}

impl PortalSettings {
    pub fn path(root: &Path) -> PathBuf {
        root.join("config").join("portal.json")
    }

    /// Reads the settings file (creating it with defaults when missing),
    /// applies `HOTGATE_*` overrides and validates the result.
    pub fn load(root: &Path) -> Result<Self> {
        let mut settings = Self::read_or_create(root)?;
        settings.apply_overrides(|key| env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    fn read_or_create(root: &Path) -> Result<Self> {
        let path = Self::path(root);
        match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("parsing {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let settings = Self::default();
                let data =
                    serde_json::to_vec_pretty(&settings).context("serializing portal settings")?;
                if let Err(err) = hotgate_logging::fs::write_atomic(&path, &data) {
                    tracing::warn!("Could not write default settings: {err:#}");
                }
                Ok(settings)
            }
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Overrides fields from `lookup`, which maps variable names to values.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("HOTGATE_INTERFACE") {
            self.interface = v;
        }
        if let Some(v) = lookup("HOTGATE_GATEWAY") {
            self.gateway = v.parse().context("invalid HOTGATE_GATEWAY")?;
        }
        if let Some(v) = lookup("HOTGATE_DHCP_RANGE") {
            self.dhcp_range = v;
        }
        if let Some(v) = lookup("HOTGATE_SSID") {
            self.ssid = v;
        }
        if let Some(v) = lookup("HOTGATE_PASSWORD") {
            self.password = v;
        }
        if let Some(v) = lookup("HOTGATE_PORT") {
            self.port = v.parse().context("invalid HOTGATE_PORT")?;
        }
        if let Some(v) = lookup("HOTGATE_BIND") {
            self.bind = v.parse().context("invalid HOTGATE_BIND")?;
        }
        if let Some(v) = lookup("HOTGATE_UPSTREAM_DNS") {
            self.upstream_dns = v.parse().context("invalid HOTGATE_UPSTREAM_DNS")?;
        }
        if let Some(v) = lookup("HOTGATE_CHANNEL") {
            self.channel = v.parse().context("invalid HOTGATE_CHANNEL")?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.network_config()
            .validate()
            .context("validating portal settings")?;
        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be at least 1");
        }
        Ok(())
    }

    pub fn network_config(&self) -> NetworkConfiguration {
        NetworkConfiguration {
            interface: self.interface.clone(),
            gateway_ip: self.gateway,
            dhcp_range: self.dhcp_range.clone(),
            ssid: self.ssid.clone(),
            password: self.password.clone(),
            port: self.port,
            channel: self.channel,
            upstream_dns: self.upstream_dns,
            ..NetworkConfiguration::default()
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn peer_idle(&self) -> Duration {
        Duration::from_secs(self.peer_idle_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = PortalSettings::read_or_create(dir.path()).unwrap();
        assert_eq!(settings, PortalSettings::default());
        assert!(PortalSettings::path(dir.path()).is_file());
        settings.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = PortalSettings::path(dir.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"ssid":"cafe","port":9000}"#).unwrap();

        let settings = PortalSettings::read_or_create(dir.path()).unwrap();
        assert_eq!(settings.ssid, "cafe");
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.interface, "wlan0");
    }

    #[test]
    fn env_overrides_win() {
        let vars: HashMap<&str, &str> = [
            ("HOTGATE_INTERFACE", "wlan1"),
            ("HOTGATE_PORT", "8081"),
            ("HOTGATE_GATEWAY", "10.42.0.1"),
        ]
        .into_iter()
        .collect();
        let mut settings = PortalSettings::default();
        settings
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.interface, "wlan1");
        assert_eq!(settings.port, 8081);
        assert_eq!(settings.network_config().login_url(), "http://10.42.0.1:8081/portal/login");
    }

    #[test]
    fn bad_override_is_reported() {
        let mut settings = PortalSettings::default();
        let err = settings
            .apply_overrides(|k| (k == "HOTGATE_PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("HOTGATE_PORT"));
    }

    #[test]
    fn short_passphrase_fails_validation() {
        let settings = PortalSettings {
            password: "1234".into(),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}

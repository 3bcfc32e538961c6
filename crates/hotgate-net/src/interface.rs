use std::net::IpAddr;
use std::sync::Arc;

use log::{info, warn};

use crate::command::{CommandExecutor, IpCommand, RfkillCommand, SystemCommand};
use crate::config::{self, SharedConfig};
use crate::error::{NetError, Result};

const VIRTUAL_PREFIXES: &[&str] = &[
    "docker", "veth", "br-", "virbr", "vmnet", "vboxnet", "lxc", "cni", "flannel",
];

const VPN_PREFIXES: &[&str] = &[
    "tun", "tap", "wg", "ppp", "tailscale", "zt", "nordlynx", "proton", "utun", "ipsec",
];

pub fn is_virtual_interface(name: &str) -> bool {
    VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p))
}

pub fn is_vpn_interface(name: &str) -> bool {
    VPN_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// The interface carrying internet traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub interface: String,
    pub is_vpn: bool,
}

/// Radio and AP interface handling plus upstream detection.
pub struct NetworkManager {
    exec: Arc<dyn CommandExecutor>,
    config: SharedConfig,
}

impl NetworkManager {
    pub fn new(exec: Arc<dyn CommandExecutor>, config: SharedConfig) -> Self {
        Self { exec, config }
    }

    fn ap_interface(&self) -> String {
        config::read(&self.config).interface.clone()
    }

    /// Picks the interface that should carry client traffic out.
    ///
    /// A physical default route wins. When the only default route is a VPN
    /// tunnel, an UP physical interface with an IPv4 address is preferred and
    /// the tunnel is used only as a last resort.
    pub fn detect_upstream(&self) -> Result<Option<Upstream>> {
        let ap = self.ap_interface();
        let routes = self
            .exec
            .must(SystemCommand::Ip(IpCommand::RouteShowDefault))?;

        let candidates: Vec<String> = parse_default_route_devices(&routes.stdout)
            .into_iter()
            .filter(|dev| dev != "lo" && *dev != ap && !is_virtual_interface(dev))
            .collect();

        if let Some(physical) = candidates.iter().find(|dev| !is_vpn_interface(dev)) {
            return Ok(Some(Upstream {
                interface: physical.clone(),
                is_vpn: false,
            }));
        }

        let Some(vpn) = candidates.first() else {
            return Ok(None);
        };

        if let Some(physical) = self.find_physical_uplink(&ap)? {
            info!("Default route is VPN {vpn}; using physical {physical}");
            return Ok(Some(Upstream {
                interface: physical,
                is_vpn: false,
            }));
        }

        Ok(Some(Upstream {
            interface: vpn.clone(),
            is_vpn: true,
        }))
    }

    fn find_physical_uplink(&self, ap: &str) -> Result<Option<String>> {
        let links = self.exec.must(SystemCommand::Ip(IpCommand::LinkShow))?;
        for (name, up) in parse_links(&links.stdout) {
            if !up || name == "lo" || name == ap {
                continue;
            }
            if is_virtual_interface(&name) || is_vpn_interface(&name) {
                continue;
            }
            let addrs = self.exec.best_effort(SystemCommand::Ip(IpCommand::AddrShow {
                interface: Some(name.clone()),
            }));
            if addrs.success() && addrs.stdout.contains(" inet ") {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }

    /// Lifts the soft block and fails if the radio stays blocked.
    pub fn unblock_radio(&self) -> Result<()> {
        self.exec
            .best_effort(SystemCommand::Rfkill(RfkillCommand::Unblock));
        let listing = self.exec.best_effort(SystemCommand::Rfkill(RfkillCommand::List));
        if !listing.success() {
            warn!("rfkill unavailable ({}); assuming radio is free", listing.stderr.trim());
            return Ok(());
        }
        if let Some(state) = blocked_state(&listing.stdout) {
            return Err(NetError::RadioBlocked { state });
        }
        Ok(())
    }

    /// Takes the AP interface away from NetworkManager and assigns the gateway.
    pub fn configure_ap_interface(&self) -> Result<()> {
        let (interface, gateway, prefix) = {
            let cfg = config::read(&self.config);
            (cfg.interface.clone(), cfg.gateway_ip, cfg.prefix_len())
        };

        self.exec.best_effort(SystemCommand::Nmcli {
            interface: interface.clone(),
            managed: false,
        });
        self.exec.must(SystemCommand::Ip(IpCommand::AddrFlush {
            interface: interface.clone(),
        }))?;
        self.exec.must(SystemCommand::Ip(IpCommand::LinkSet {
            interface: interface.clone(),
            up: false,
        }))?;
        self.exec.must(SystemCommand::Ip(IpCommand::LinkSet {
            interface: interface.clone(),
            up: true,
        }))?;
        self.exec.must(SystemCommand::Ip(IpCommand::AddrAdd {
            interface: interface.clone(),
            address: IpAddr::V4(gateway),
            prefix,
        }))?;
        info!("AP interface {interface} up at {gateway}/{prefix}");
        Ok(())
    }

    pub fn enable_ip_forwarding(&self) -> Result<()> {
        self.exec.must(SystemCommand::Sysctl {
            key: "net.ipv4.ip_forward".to_string(),
            value: Some("1".to_string()),
        })?;
        Ok(())
    }

    pub fn restore_interface(&self) {
        let interface = self.ap_interface();
        self.exec.best_effort(SystemCommand::Ip(IpCommand::AddrFlush {
            interface: interface.clone(),
        }));
        self.exec.best_effort(SystemCommand::Ip(IpCommand::LinkSet {
            interface,
            up: false,
        }));
    }

    /// Hands the interface back to NetworkManager.
    pub fn restart_interface(&self) {
        let interface = self.ap_interface();
        self.exec.best_effort(SystemCommand::Nmcli {
            interface: interface.clone(),
            managed: true,
        });
        self.exec.best_effort(SystemCommand::Ip(IpCommand::LinkSet {
            interface,
            up: true,
        }));
    }
}

/// Devices named by `ip route show default`, in listing order.
pub fn parse_default_route_devices(output: &str) -> Vec<String> {
    let mut devices = Vec::new();
    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("default") {
            continue;
        }
        while let Some(token) = tokens.next() {
            if token == "dev" {
                if let Some(dev) = tokens.next() {
                    if !devices.iter().any(|d| d == dev) {
                        devices.push(dev.to_string());
                    }
                }
                break;
            }
        }
    }
    devices
}

/// `(name, admin_up)` pairs from `ip -o link show`.
pub fn parse_links(output: &str) -> Vec<(String, bool)> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(3, ": ");
            let _index = fields.next()?;
            let name = fields.next()?;
            let rest = fields.next().unwrap_or("");
            let name = name.split('@').next().unwrap_or(name).trim().to_string();
            let flags = rest
                .strip_prefix('<')
                .and_then(|r| r.split('>').next())
                .unwrap_or("");
            let up = flags.split(',').any(|f| f == "UP");
            Some((name, up))
        })
        .collect()
}

fn blocked_state(listing: &str) -> Option<String> {
    let blocked: Vec<&str> = listing
        .lines()
        .map(str::trim)
        .filter(|line| {
            (line.starts_with("Soft blocked:") || line.starts_with("Hard blocked:"))
                && line.ends_with("yes")
        })
        .collect();
    if blocked.is_empty() {
        None
    } else {
        Some(blocked.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{shared, NetworkConfiguration};
    use crate::testing::SimulatedHost;
    use std::net::Ipv4Addr;

    fn manager(host: &Arc<SimulatedHost>) -> NetworkManager {
        NetworkManager::new(host.clone(), shared(NetworkConfiguration::default()))
    }

    #[test]
    fn parses_route_and_link_listings() {
        let routes = "default via 10.0.0.1 dev eth0 proto dhcp metric 100\n\
                      default dev wg0 scope link\n\
                      10.0.0.0/24 dev eth0 proto kernel scope link src 10.0.0.2\n";
        assert_eq!(parse_default_route_devices(routes), ["eth0", "wg0"]);

        let links = "1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN\n\
                     5: veth1a2b@if4: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500\n\
                     3: wlan0: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN\n";
        assert_eq!(
            parse_links(links),
            [
                ("lo".to_string(), true),
                ("veth1a2b".to_string(), true),
                ("wlan0".to_string(), false)
            ]
        );
    }

    #[test]
    fn prefers_physical_default_route() {
        let host = Arc::new(SimulatedHost::new());
        host.add_link("docker0", true, Some((Ipv4Addr::new(172, 17, 0, 1), 16)));
        host.clear_default_routes();
        host.add_default_route("docker0", Ipv4Addr::new(172, 17, 0, 254));
        host.add_default_route("eth0", Ipv4Addr::new(10, 0, 0, 1));

        let upstream = manager(&host).detect_upstream().unwrap().unwrap();
        assert_eq!(
            upstream,
            Upstream {
                interface: "eth0".into(),
                is_vpn: false
            }
        );
    }

    #[test]
    fn vpn_default_route_falls_back_to_physical_uplink() {
        let host = Arc::new(SimulatedHost::new());
        host.add_link("wg0", true, Some((Ipv4Addr::new(10, 8, 0, 2), 32)));
        host.clear_default_routes();
        host.add_default_route("wg0", Ipv4Addr::new(10, 8, 0, 1));

        let upstream = manager(&host).detect_upstream().unwrap().unwrap();
        assert_eq!(upstream.interface, "eth0");
        assert!(!upstream.is_vpn);
    }

    #[test]
    fn vpn_only_host_flags_vpn() {
        let host = Arc::new(SimulatedHost::bare());
        host.add_link("wlan0", false, None);
        host.add_link("tun0", true, Some((Ipv4Addr::new(10, 9, 0, 2), 32)));
        host.add_default_route("tun0", Ipv4Addr::new(10, 9, 0, 1));

        let upstream = manager(&host).detect_upstream().unwrap().unwrap();
        assert_eq!(
            upstream,
            Upstream {
                interface: "tun0".into(),
                is_vpn: true
            }
        );
    }

    #[test]
    fn no_default_route_means_no_upstream() {
        let host = Arc::new(SimulatedHost::new());
        host.clear_default_routes();
        assert_eq!(manager(&host).detect_upstream().unwrap(), None);

        // A default route through the AP itself does not count.
        host.add_default_route("wlan0", Ipv4Addr::new(192, 168, 50, 254));
        assert_eq!(manager(&host).detect_upstream().unwrap(), None);
    }

    #[test]
    fn hard_block_is_fatal_soft_block_is_lifted() {
        let host = Arc::new(SimulatedHost::new());
        host.set_rfkill(true, false);
        manager(&host).unblock_radio().unwrap();

        host.set_rfkill(true, true);
        let err = manager(&host).unblock_radio().unwrap_err();
        assert!(matches!(err, NetError::RadioBlocked { ref state } if state.contains("Hard")));
    }

    #[test]
    fn missing_rfkill_is_tolerated() {
        let host = Arc::new(SimulatedHost::new());
        host.remove_rfkill();
        manager(&host).unblock_radio().unwrap();
    }

    #[test]
    fn configures_gateway_address() {
        let host = Arc::new(SimulatedHost::new());
        manager(&host).configure_ap_interface().unwrap();
        assert!(host.link_is_up("wlan0"));
        assert_eq!(host.link_addrs("wlan0"), [(Ipv4Addr::new(192, 168, 50, 1), 24)]);

        // Re-running flushes first, so the add does not collide.
        manager(&host).configure_ap_interface().unwrap();
        assert_eq!(host.link_addrs("wlan0").len(), 1);

        manager(&host).restore_interface();
        assert!(!host.link_is_up("wlan0"));
        assert!(host.link_addrs("wlan0").is_empty());
    }
}

//! Bring-up and tear-down of the whole captive network.
//!
//! `set_up_network` runs each step strictly in order. Any fatal step unwinds
//! everything through the same best-effort path `restore_configuration` uses,
//! so a half-configured host always returns to a clean state.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{error, info, warn};
use serde::Serialize;

use crate::command::{CommandExecutor, SystemCommand};
use crate::config::{self, NetworkConfiguration, SharedConfig, SystemPaths, Timings};
use crate::control::{dns_accept, dns_redirect, portal_redirect, CaptivePortalControlManager};
use crate::dnsmasq::DnsmasqManager;
use crate::error::{NetError, Result};
use crate::firewall::FirewallService;
use crate::hostapd::HostapdManager;
use crate::interface::NetworkManager;
use crate::iptables::Protocol;
use crate::neighbor::NeighborMacResolver;

/// Name looked up through the spoofing resolver during validation.
const PROBE_DOMAIN: &str = "connectivitycheck.gstatic.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Down,
    Detecting,
    Configuring,
    Validating,
    Up,
    RestoringDown,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrchestratorState::Down => "down",
            OrchestratorState::Detecting => "detecting",
            OrchestratorState::Configuring => "configuring",
            OrchestratorState::Validating => "validating",
            OrchestratorState::Up => "up",
            OrchestratorState::RestoringDown => "restoring_down",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkStatus {
    pub state: OrchestratorState,
    pub active: bool,
    pub interface: String,
    pub gateway: Ipv4Addr,
    pub port: u16,
    pub ssid: String,
    pub upstream: Option<String>,
    pub vpn: bool,
}

pub struct NetworkOrchestrator {
    exec: Arc<dyn CommandExecutor>,
    config: SharedConfig,
    paths: SystemPaths,
    timings: Timings,
    interface: NetworkManager,
    hostapd: HostapdManager,
    dnsmasq: DnsmasqManager,
    control: CaptivePortalControlManager,
    state: Mutex<OrchestratorState>,
    /// Held for the whole of a bring-up or tear-down.
    flight: Mutex<()>,
}

impl NetworkOrchestrator {
    pub fn new(
        exec: Arc<dyn CommandExecutor>,
        config: SharedConfig,
        paths: SystemPaths,
        timings: Timings,
    ) -> Self {
        Self {
            interface: NetworkManager::new(exec.clone(), config.clone()),
            hostapd: HostapdManager::new(exec.clone(), config.clone(), paths.clone(), timings),
            dnsmasq: DnsmasqManager::new(exec.clone(), config.clone(), paths.clone(), timings),
            control: CaptivePortalControlManager::new(exec.clone(), config.clone()),
            exec,
            config,
            paths,
            timings,
            state: Mutex::new(OrchestratorState::Down),
            flight: Mutex::new(()),
        }
    }

    pub fn config(&self) -> SharedConfig {
        self.config.clone()
    }

    /// Snapshot of the editable and runtime configuration.
    pub fn configuration(&self) -> NetworkConfiguration {
        config::read(&self.config).clone()
    }

    /// A firewall service sharing this orchestrator's executor and config.
    pub fn firewall(&self) -> FirewallService {
        FirewallService::new(self.exec.clone(), self.config.clone(), self.timings)
    }

    pub fn mac_resolver(&self) -> NeighborMacResolver {
        NeighborMacResolver::new(self.exec.clone(), self.paths.dhcp_leases.clone(), self.timings)
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: OrchestratorState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            info!("Network state {} -> {}", *state, next);
            *state = next;
        }
    }

    fn single_flight(&self) -> MutexGuard<'_, ()> {
        self.flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> NetworkStatus {
        let cfg = config::read(&self.config);
        NetworkStatus {
            state: self.state(),
            active: cfg.is_network_active,
            interface: cfg.interface.clone(),
            gateway: cfg.gateway_ip,
            port: cfg.port,
            ssid: cfg.ssid.clone(),
            upstream: cfg.upstream_interface.clone(),
            vpn: cfg.is_vpn_interface,
        }
    }

    /// Brings the captive network up. Returns whether it is up afterwards.
    ///
    /// Never fails outward: errors are logged and rolled back.
    pub fn set_up_network(&self) -> bool {
        let _flight = self.single_flight();

        if config::read(&self.config).is_network_active {
            info!("Network already active");
            return true;
        }
        if let Err(err) = config::read(&self.config).validate() {
            error!("Refusing to start: {err}");
            return false;
        }

        self.set_state(OrchestratorState::Detecting);
        match self.interface.detect_upstream() {
            Ok(Some(upstream)) => {
                info!(
                    "Upstream interface {} (vpn={})",
                    upstream.interface, upstream.is_vpn
                );
                let mut cfg = config::write(&self.config);
                cfg.upstream_interface = Some(upstream.interface);
                cfg.is_vpn_interface = upstream.is_vpn;
            }
            Ok(None) => {
                warn!("No upstream interface with a default route; not starting");
                self.set_state(OrchestratorState::Down);
                return false;
            }
            Err(err) => {
                error!("Upstream detection failed: {err}");
                self.unwind();
                return false;
            }
        }

        match self.bring_up() {
            Ok(()) => {
                config::write(&self.config).is_network_active = true;
                self.set_state(OrchestratorState::Up);
                info!("Captive network up");
                true
            }
            Err(err) => {
                error!("Bring-up failed, rolling back: {err}");
                self.unwind();
                false
            }
        }
    }

    fn bring_up(&self) -> Result<()> {
        self.set_state(OrchestratorState::Configuring);

        self.interface.unblock_radio()?;
        self.interface.configure_ap_interface()?;

        self.hostapd.configure()?;
        self.hostapd.start()?;

        self.interface.enable_ip_forwarding()?;

        self.dnsmasq.configure()?;
        self.dnsmasq.start()?;

        if config::read(&self.config).upstream_interface.is_some() {
            self.control.install_baseline()?;
            self.control.verify_dns_redirect()?;
        }

        self.set_state(OrchestratorState::Validating);
        self.validate()
    }

    /// End-to-end checks. Missing DNS rules and a missing :53 listener are
    /// fatal; everything else is only logged.
    fn validate(&self) -> Result<()> {
        let (iface, gw, port) = {
            let cfg = config::read(&self.config);
            (cfg.interface.clone(), cfg.gateway_ip, cfg.port)
        };

        for rule in [
            dns_redirect(&iface, gw, Protocol::Udp),
            dns_accept(&iface, Protocol::Udp),
        ] {
            if !self.control.rule_present(&rule) {
                return Err(NetError::missing_rule(&rule));
            }
        }

        let listeners = self.exec.best_effort(SystemCommand::ListUdpListeners);
        if listeners.success() {
            if !has_listener(&listeners.stdout, 53) {
                return Err(NetError::ListenerMissing {
                    proto: "udp".to_string(),
                    port: 53,
                });
            }
        } else {
            warn!("Could not list UDP listeners: {}", listeners.stderr.trim());
        }

        for dport in [80, 443] {
            let rule = portal_redirect(&iface, gw, port, dport);
            if !self.control.rule_present(&rule) {
                warn!("Portal redirect for port {dport} missing: {rule}");
            }
        }

        let forwarding = self.exec.best_effort(SystemCommand::Sysctl {
            key: "net.ipv4.ip_forward".to_string(),
            value: None,
        });
        if forwarding.stdout.trim() != "1" {
            warn!("IP forwarding reads '{}'", forwarding.stdout.trim());
        }

        let lookup = self.exec.best_effort(SystemCommand::Nslookup {
            name: PROBE_DOMAIN.to_string(),
            server: IpAddr::V4(gw),
        });
        let answer = format!("Address: {gw}");
        if !lookup.success() || !lookup.stdout.lines().any(|l| l.trim() == answer) {
            warn!("DNS spoofing check did not answer with {gw}");
        }

        Ok(())
    }

    /// Tears the captive network down and restores the original host setup.
    pub fn restore_configuration(&self) {
        let _flight = self.single_flight();
        self.unwind();
    }

    fn unwind(&self) {
        self.set_state(OrchestratorState::RestoringDown);
        self.interface.restore_interface();
        self.hostapd.stop();
        self.dnsmasq.stop();
        self.control.teardown();
        self.interface.restart_interface();
        config::write(&self.config).reset_runtime();
        self.set_state(OrchestratorState::Down);
        info!("Network configuration restored");
    }
}

/// Whether `ss -lunH` output shows something bound to `port`.
pub fn has_listener(output: &str, port: u16) -> bool {
    let suffix = format!(":{port}");
    output.lines().any(|line| {
        line.split_whitespace()
            .nth(3)
            .map_or(false, |local| local.ends_with(&suffix))
    })
}

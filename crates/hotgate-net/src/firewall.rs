//! Per-device internet access on top of the `AUTHENTICATED` chain.
//!
//! Granting is idempotent and cheap. Revoking is forceful: a temporary drop
//! at the head of FORWARD outranks the established/related accept, and the
//! conntrack flush tears down flows that would otherwise bypass the new rules.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::command::{CommandExecutor, FlowDirection, SystemCommand};
use crate::config::{self, pause, SharedConfig, Timings};
use crate::error::Result;
use crate::iptables::{parse_listed_macs, Chain, IptablesCommand, Protocol, Rule, Table, Target};
use crate::mac::MacAddr;

/// Attempts per rule when purging duplicates left by repeated grants.
const PURGE_ATTEMPTS: usize = 3;

pub fn authenticated_accept(mac: MacAddr) -> Rule {
    Rule::new(Table::Filter, Chain::authenticated(), Target::Accept).mac_source(mac)
}

pub fn forward_kill(mac: MacAddr) -> Rule {
    Rule::new(Table::Filter, Chain::Forward, Target::Drop).mac_source(mac)
}

/// nat rules that exempt an authorized device from the portal redirects.
pub fn bypass_rules(interface: &str, mac: MacAddr, resolver: Ipv4Addr) -> Vec<Rule> {
    let mut rules = Vec::with_capacity(4);
    for proto in [Protocol::Udp, Protocol::Tcp] {
        rules.push(
            Rule::new(
                Table::Nat,
                Chain::Prerouting,
                Target::Dnat {
                    to: IpAddr::V4(resolver),
                    port: Some(53),
                },
            )
            .in_interface(interface)
            .mac_source(mac)
            .protocol(proto)
            .dst_port(53),
        );
    }
    for dport in [80, 443] {
        rules.push(
            Rule::new(Table::Nat, Chain::Prerouting, Target::Accept)
                .in_interface(interface)
                .mac_source(mac)
                .protocol(Protocol::Tcp)
                .dst_port(dport),
        );
    }
    rules
}

pub struct FirewallService {
    exec: Arc<dyn CommandExecutor>,
    config: SharedConfig,
    timings: Timings,
}

impl FirewallService {
    pub fn new(exec: Arc<dyn CommandExecutor>, config: SharedConfig, timings: Timings) -> Self {
        Self {
            exec,
            config,
            timings,
        }
    }

    fn bypass_for(&self, mac: MacAddr) -> Vec<Rule> {
        let cfg = config::read(&self.config);
        bypass_rules(&cfg.interface, mac, cfg.upstream_dns)
    }

    fn ipt(cmd: IptablesCommand) -> SystemCommand {
        SystemCommand::Iptables(cmd)
    }

    /// Deletes `rule` until nothing matches, at most `PURGE_ATTEMPTS` times.
    fn purge(&self, rule: &Rule) -> usize {
        let mut removed = 0;
        for _ in 0..PURGE_ATTEMPTS {
            let result = self
                .exec
                .best_effort(Self::ipt(IptablesCommand::Delete(rule.clone())));
            if !result.success() {
                break;
            }
            removed += 1;
        }
        removed
    }

    pub fn grant(&self, mac: MacAddr) -> Result<()> {
        if self.has_internet_access(mac) {
            debug!("{mac} already authorized");
            return Ok(());
        }

        self.exec.must(Self::ipt(IptablesCommand::Insert(
            authenticated_accept(mac),
            Some(1),
        )))?;

        for rule in self.bypass_for(mac) {
            let present = self
                .exec
                .best_effort(Self::ipt(IptablesCommand::Check(rule.clone())))
                .success();
            if present {
                continue;
            }
            let inserted = self
                .exec
                .best_effort(Self::ipt(IptablesCommand::Insert(rule.clone(), Some(1))));
            if !inserted.success() {
                warn!("Bypass rule for {mac} not installed: {rule}");
            }
        }

        info!("Granted internet access to {mac}");
        Ok(())
    }

    /// Cuts `mac` off. With `force_disconnect`, open connections die too.
    ///
    /// When the forced drop cannot be inserted the remaining cleanup still
    /// runs and the insert error is returned afterwards.
    pub fn revoke(
        &self,
        mac: MacAddr,
        client_ip: Option<Ipv4Addr>,
        force_disconnect: bool,
    ) -> Result<()> {
        let kill = forward_kill(mac);
        let mut outcome = Ok(());

        if force_disconnect {
            if let Err(err) = self
                .exec
                .must(Self::ipt(IptablesCommand::Insert(kill.clone(), Some(1))))
            {
                error!("Could not insert drop for {mac}: {err}");
                outcome = Err(err);
            }

            if let Some(ip) = client_ip {
                for direction in [FlowDirection::Source, FlowDirection::Destination] {
                    self.exec.best_effort(SystemCommand::Conntrack {
                        address: IpAddr::V4(ip),
                        direction,
                    });
                }
                pause(self.timings.conntrack_settle);
            }
        }

        for rule in self.bypass_for(mac) {
            self.purge(&rule);
        }

        let removed = self.purge(&authenticated_accept(mac));
        debug!("Removed {removed} AUTHENTICATED rule(s) for {mac}");

        if force_disconnect && outcome.is_ok() {
            pause(self.timings.drop_rule_linger);
            self.purge(&kill);
        }

        if outcome.is_ok() {
            info!("Revoked internet access for {mac}");
        }
        outcome
    }

    pub fn has_internet_access(&self, mac: MacAddr) -> bool {
        self.list_authenticated().contains(&mac)
    }

    /// MACs in the `AUTHENTICATED` chain, in rule order, duplicates kept.
    pub fn list_authenticated(&self) -> Vec<MacAddr> {
        let listing = self.exec.best_effort(Self::ipt(IptablesCommand::List {
            table: Table::Filter,
            chain: Some(Chain::authenticated()),
        }));
        if !listing.success() {
            debug!("AUTHENTICATED chain unavailable: {}", listing.stderr.trim());
            return Vec::new();
        }
        parse_listed_macs(&listing.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{shared, NetworkConfiguration};
    use crate::control::{portal_redirect, dns_redirect, CaptivePortalControlManager};
    use crate::error::NetError;
    use crate::testing::SimulatedHost;

    const GW: Ipv4Addr = Ipv4Addr::new(192, 168, 50, 1);

    fn mac() -> MacAddr {
        "aa:bb:cc:dd:ee:01".parse().unwrap()
    }

    fn setup() -> (Arc<SimulatedHost>, FirewallService) {
        let host = Arc::new(SimulatedHost::new());
        let mut cfg = NetworkConfiguration::default();
        cfg.upstream_interface = Some("eth0".into());
        let cfg = shared(cfg);
        CaptivePortalControlManager::new(host.clone(), cfg.clone())
            .install_baseline()
            .unwrap();
        host.clear_history();
        let fw = FirewallService::new(host.clone(), cfg, Timings::immediate());
        (host, fw)
    }

    #[test]
    fn bypass_rules_outrank_baseline_redirects() {
        let (host, fw) = setup();
        fw.grant(mac()).unwrap();

        let pre = host.rules(Table::Nat, "PREROUTING");
        let last_bypass = pre.iter().rposition(|r| r.mac() == Some(mac())).unwrap();
        for baseline in [
            dns_redirect("wlan0", GW, Protocol::Udp),
            dns_redirect("wlan0", GW, Protocol::Tcp),
            portal_redirect("wlan0", GW, 8080, 80),
            portal_redirect("wlan0", GW, 8080, 443),
        ] {
            let at = pre.iter().position(|r| *r == baseline).unwrap();
            assert!(last_bypass < at, "bypass must precede {baseline}");
        }
    }

    #[test]
    fn grant_is_idempotent() {
        let (host, fw) = setup();
        fw.grant(mac()).unwrap();
        let nat_after_one = host.rules(Table::Nat, "PREROUTING");
        let auth_after_one = host.rules(Table::Filter, "AUTHENTICATED");

        fw.grant(mac()).unwrap();
        assert_eq!(host.rules(Table::Nat, "PREROUTING"), nat_after_one);
        assert_eq!(host.rules(Table::Filter, "AUTHENTICATED"), auth_after_one);
        assert_eq!(fw.list_authenticated(), vec![mac()]);
        assert!(fw.has_internet_access(mac()));
    }

    #[test]
    fn grant_fails_without_authenticated_chain() {
        let host = Arc::new(SimulatedHost::new());
        let fw = FirewallService::new(
            host.clone(),
            shared(NetworkConfiguration::default()),
            Timings::immediate(),
        );
        assert!(fw.grant(mac()).is_err());
        assert!(host.rules(Table::Nat, "PREROUTING").is_empty());
    }

    #[test]
    fn revoke_kills_in_flight_traffic() {
        let (host, fw) = setup();
        let ip = Ipv4Addr::new(192, 168, 50, 23);
        fw.grant(mac()).unwrap();
        host.add_flow(IpAddr::V4(ip), "93.184.216.34".parse().unwrap());
        host.add_flow("93.184.216.34".parse().unwrap(), IpAddr::V4(ip));

        fw.revoke(mac(), Some(ip), true).unwrap();

        assert_eq!(host.flows_involving(IpAddr::V4(ip)), 0);
        assert!(!fw.has_internet_access(mac()));
        assert!(host
            .rules(Table::Nat, "PREROUTING")
            .iter()
            .all(|r| r.mac() != Some(mac())));
        assert!(host
            .rules(Table::Filter, "FORWARD")
            .iter()
            .all(|r| r.mac() != Some(mac())));

        // The drop went in at the head of FORWARD before conntrack was flushed.
        let cmds = host.commands();
        let drop = cmds
            .iter()
            .position(|c| c.starts_with("iptables -t filter -I FORWARD 1 -m mac"))
            .unwrap();
        let flush = cmds.iter().position(|c| c.starts_with("conntrack -D")).unwrap();
        assert!(drop < flush);
    }

    #[test]
    fn revoke_purges_duplicate_grants() {
        let (host, fw) = setup();
        for _ in 0..3 {
            host.must(SystemCommand::Iptables(IptablesCommand::Append(
                authenticated_accept(mac()),
            )))
            .unwrap();
        }
        assert_eq!(fw.list_authenticated().len(), 3);

        fw.revoke(mac(), None, true).unwrap();
        assert!(fw.list_authenticated().is_empty());
    }

    #[test]
    fn failed_drop_insert_still_removes_access() {
        let (host, fw) = setup();
        fw.grant(mac()).unwrap();
        host.fail_on("-I FORWARD 1");

        let err = fw
            .revoke(mac(), Some(Ipv4Addr::new(192, 168, 50, 23)), true)
            .unwrap_err();
        assert!(matches!(err, NetError::CommandFailed { .. }));
        assert!(!fw.has_internet_access(mac()));
    }

    #[test]
    fn soft_revoke_leaves_connections() {
        let (host, fw) = setup();
        let ip = Ipv4Addr::new(192, 168, 50, 23);
        fw.grant(mac()).unwrap();
        host.add_flow(IpAddr::V4(ip), "1.1.1.1".parse().unwrap());

        fw.revoke(mac(), Some(ip), false).unwrap();
        assert!(!fw.has_internet_access(mac()));
        assert_eq!(host.flows_involving(IpAddr::V4(ip)), 1);
        assert!(host.commands().iter().all(|c| !c.contains("FORWARD 1")));
    }

    #[test]
    fn listing_is_case_insensitive() {
        let (host, fw) = setup();
        let upper: MacAddr = "AA:BB:CC:DD:EE:01".parse().unwrap();
        fw.grant(upper).unwrap();
        assert!(fw.has_internet_access(mac()));
        assert!(host.rules(Table::Filter, "AUTHENTICATED").len() == 1);
    }
}

//! Baseline captive firewall.
//!
//! Rule order matters: netfilter stops at the first matching rule, so the
//! DNS redirect goes in before anything else, the portal port is accepted
//! before HTTP is redirected to it, and the AP's forward path ends in the
//! `AUTHENTICATED` jump followed by a catch-all drop.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use log::{debug, info};

use crate::command::{CommandExecutor, SystemCommand};
use crate::config::{self, SharedConfig};
use crate::error::{NetError, Result};
use crate::iptables::{Chain, IptablesCommand, Policy, Protocol, Rule, Table, Target};

/// `-t nat PREROUTING -i IFACE -p PROTO --dport 53 -j DNAT --to-destination GW:53`
pub fn dns_redirect(interface: &str, gateway: Ipv4Addr, proto: Protocol) -> Rule {
    Rule::new(
        Table::Nat,
        Chain::Prerouting,
        Target::Dnat {
            to: IpAddr::V4(gateway),
            port: Some(53),
        },
    )
    .in_interface(interface)
    .protocol(proto)
    .dst_port(53)
}

pub fn dns_accept(interface: &str, proto: Protocol) -> Rule {
    Rule::new(Table::Filter, Chain::Input, Target::Accept)
        .in_interface(interface)
        .protocol(proto)
        .dst_port(53)
}

/// Sends unauthenticated web traffic on `dport` to the portal.
pub fn portal_redirect(interface: &str, gateway: Ipv4Addr, portal_port: u16, dport: u16) -> Rule {
    Rule::new(
        Table::Nat,
        Chain::Prerouting,
        Target::Dnat {
            to: IpAddr::V4(gateway),
            port: Some(portal_port),
        },
    )
    .in_interface(interface)
    .protocol(Protocol::Tcp)
    .dst_port(dport)
}

pub fn authenticated_jump(interface: &str) -> Rule {
    Rule::new(
        Table::Filter,
        Chain::Forward,
        Target::Jump(Chain::authenticated()),
    )
    .in_interface(interface)
}

pub fn forward_drop(interface: &str) -> Rule {
    Rule::new(Table::Filter, Chain::Forward, Target::Drop).in_interface(interface)
}

pub fn masquerade(upstream: &str) -> Rule {
    Rule::new(Table::Nat, Chain::Postrouting, Target::Masquerade).out_interface(upstream)
}

pub fn mss_clamp() -> Rule {
    Rule::new(Table::Mangle, Chain::Forward, Target::ClampMssToPmtu)
        .protocol(Protocol::Tcp)
        .tcp_syn()
}

const TABLES: [Table; 3] = [Table::Filter, Table::Nat, Table::Mangle];
const BUILTIN_FILTER: [Chain; 3] = [Chain::Input, Chain::Forward, Chain::Output];

/// Installs and removes the baseline captive topology.
pub struct CaptivePortalControlManager {
    exec: Arc<dyn CommandExecutor>,
    config: SharedConfig,
}

impl CaptivePortalControlManager {
    pub fn new(exec: Arc<dyn CommandExecutor>, config: SharedConfig) -> Self {
        Self { exec, config }
    }

    fn append(&self, rule: Rule) -> Result<()> {
        self.exec
            .must(SystemCommand::Iptables(IptablesCommand::Append(rule)))?;
        Ok(())
    }

    fn set_policy(&self, chain: Chain, policy: Policy) -> Result<()> {
        self.exec
            .must(SystemCommand::Iptables(IptablesCommand::SetPolicy { chain, policy }))?;
        Ok(())
    }

    fn wipe(&self) {
        for table in TABLES {
            self.exec
                .best_effort(SystemCommand::Iptables(IptablesCommand::Flush { table, chain: None }));
        }
        for table in TABLES {
            self.exec.best_effort(SystemCommand::Iptables(IptablesCommand::DeleteChain {
                table,
                chain: None,
            }));
        }
    }

    pub fn install_baseline(&self) -> Result<()> {
        let (iface, gw, port, upstream, vpn) = {
            let cfg = config::read(&self.config);
            (
                cfg.interface.clone(),
                cfg.gateway_ip,
                cfg.port,
                cfg.upstream_interface.clone(),
                cfg.is_vpn_interface,
            )
        };

        self.wipe();

        for proto in [Protocol::Udp, Protocol::Tcp] {
            self.append(dns_redirect(&iface, gw, proto))?;
        }

        self.set_policy(Chain::Input, Policy::Accept)?;
        self.set_policy(Chain::Forward, Policy::Drop)?;
        self.set_policy(Chain::Output, Policy::Accept)?;

        self.append(Rule::new(Table::Filter, Chain::Input, Target::Accept).in_interface("lo"))?;
        self.append(Rule::new(Table::Filter, Chain::Output, Target::Accept).out_interface("lo"))?;

        for chain in BUILTIN_FILTER {
            self.append(
                Rule::new(Table::Filter, chain, Target::Accept)
                    .connection_state("RELATED,ESTABLISHED"),
            )?;
        }

        for proto in [Protocol::Udp, Protocol::Tcp] {
            self.append(dns_accept(&iface, proto))?;
        }
        self.append(
            Rule::new(Table::Filter, Chain::Input, Target::Accept)
                .in_interface(&iface)
                .protocol(Protocol::Udp)
                .dst_port(67),
        )?;
        self.append(
            Rule::new(Table::Filter, Chain::Output, Target::Accept)
                .out_interface(&iface)
                .protocol(Protocol::Udp)
                .dst_port(68),
        )?;

        self.append(
            Rule::new(Table::Filter, Chain::Input, Target::Accept)
                .in_interface(&iface)
                .protocol(Protocol::Tcp)
                .dst_port(port),
        )?;

        self.append(Rule::new(Table::Filter, Chain::Input, Target::Accept).protocol(Protocol::Icmp))?;
        self.append(
            Rule::new(Table::Filter, Chain::Forward, Target::Accept)
                .in_interface(&iface)
                .protocol(Protocol::Icmp),
        )?;

        for dport in [80, 443] {
            self.append(portal_redirect(&iface, gw, port, dport))?;
        }

        // Survives from a previous run when teardown was skipped.
        self.exec.best_effort(SystemCommand::Iptables(IptablesCommand::NewChain {
            table: Table::Filter,
            chain: Chain::authenticated(),
        }));
        self.exec.must(SystemCommand::Iptables(IptablesCommand::Flush {
            table: Table::Filter,
            chain: Some(Chain::authenticated()),
        }))?;
        self.append(authenticated_jump(&iface))?;
        self.append(forward_drop(&iface))?;

        if let Some(upstream) = upstream {
            self.append(masquerade(&upstream))?;
            if vpn {
                self.append(mss_clamp())?;
            }
            info!("Baseline firewall installed on {iface} via {upstream} (vpn={vpn})");
        } else {
            info!("Baseline firewall installed on {iface} without upstream NAT");
        }
        Ok(())
    }

    pub fn rule_present(&self, rule: &Rule) -> bool {
        self.exec
            .best_effort(SystemCommand::Iptables(IptablesCommand::Check(rule.clone())))
            .success()
    }

    /// Fails when the UDP DNS redirect is not in the nat table.
    pub fn verify_dns_redirect(&self) -> Result<()> {
        let rule = {
            let cfg = config::read(&self.config);
            dns_redirect(&cfg.interface, cfg.gateway_ip, Protocol::Udp)
        };
        if !self.rule_present(&rule) {
            return Err(NetError::missing_rule(&rule));
        }
        debug!("DNS redirect present");
        Ok(())
    }

    /// Removes every rule and chain and reopens all filter policies.
    pub fn teardown(&self) {
        self.wipe();
        for chain in BUILTIN_FILTER {
            self.exec.best_effort(SystemCommand::Iptables(IptablesCommand::SetPolicy {
                chain,
                policy: Policy::Accept,
            }));
        }
        info!("Firewall reset to accept-all");
    }
}

//! In-memory host for driving the managers without root.
//!
//! `SimulatedHost` interprets every [`SystemCommand`] against a small model of
//! the kernel and userland: iptables tables with ordered chains, conntrack
//! flows, the neighbor table, rfkill, systemd units, processes, routes, links
//! and UDP listeners. Every command is recorded together with its mode.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Mutex, MutexGuard};

use crate::command::{
    finish, CommandExecutor, ExecMode, ExecutionResult, FlowDirection, IpCommand, RfkillCommand,
    SystemCommand, UnitAction,
};
use crate::error::Result;
use crate::iptables::{Chain, IptablesCommand, Policy, Rule, Table, Target};
use crate::mac::MacAddr;

#[derive(Debug, Clone)]
struct ChainState {
    name: String,
    policy: Option<Policy>,
    rules: Vec<Rule>,
}

#[derive(Debug, Clone)]
struct Link {
    name: String,
    up: bool,
    addrs: Vec<(Ipv4Addr, u8)>,
}

#[derive(Debug, Clone, Copy)]
struct Flow {
    src: IpAddr,
    dst: IpAddr,
}

#[derive(Debug)]
struct HostState {
    tables: HashMap<Table, Vec<ChainState>>,
    flows: Vec<Flow>,
    neighbors: HashMap<IpAddr, MacAddr>,
    learn_on_ping: HashMap<IpAddr, MacAddr>,
    soft_blocked: bool,
    hard_blocked: bool,
    rfkill_available: bool,
    units: HashMap<String, bool>,
    dies_on_start: HashSet<String>,
    processes: HashSet<String>,
    udp_listeners: HashSet<u16>,
    default_routes: Vec<(String, Ipv4Addr)>,
    links: Vec<Link>,
    sysctl: HashMap<String, String>,
    failures: Vec<String>,
    history: Vec<(SystemCommand, ExecMode)>,
}

impl HostState {
    fn empty() -> Self {
        let mut tables = HashMap::new();
        for table in [Table::Filter, Table::Nat, Table::Mangle] {
            let chains = table
                .builtin_chains()
                .iter()
                .map(|name| ChainState {
                    name: name.to_string(),
                    policy: Some(Policy::Accept),
                    rules: Vec::new(),
                })
                .collect();
            tables.insert(table, chains);
        }
        Self {
            tables,
            flows: Vec::new(),
            neighbors: HashMap::new(),
            learn_on_ping: HashMap::new(),
            soft_blocked: false,
            hard_blocked: false,
            rfkill_available: true,
            units: HashMap::new(),
            dies_on_start: HashSet::new(),
            processes: HashSet::new(),
            udp_listeners: HashSet::new(),
            default_routes: Vec::new(),
            links: vec![Link {
                name: "lo".to_string(),
                up: true,
                addrs: vec![(Ipv4Addr::LOCALHOST, 8)],
            }],
            sysctl: HashMap::new(),
            failures: Vec::new(),
            history: Vec::new(),
        }
    }

    fn chain_mut(&mut self, table: Table, name: &str) -> Option<&mut ChainState> {
        self.tables
            .get_mut(&table)
            .and_then(|chains| chains.iter_mut().find(|c| c.name == name))
    }

    fn chain(&self, table: Table, name: &str) -> Option<&ChainState> {
        self.tables
            .get(&table)
            .and_then(|chains| chains.iter().find(|c| c.name == name))
    }

    fn link_mut(&mut self, name: &str) -> Option<&mut Link> {
        self.links.iter_mut().find(|l| l.name == name)
    }
}

/// Simulated host; cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct SimulatedHost {
    state: Mutex<HostState>,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHost {
    /// A host with `eth0` online as the default route and a down `wlan0`.
    pub fn new() -> Self {
        let host = Self::bare();
        host.add_link("eth0", true, Some((Ipv4Addr::new(10, 0, 0, 2), 24)));
        host.add_link("wlan0", false, None);
        host.add_default_route("eth0", Ipv4Addr::new(10, 0, 0, 1));
        host
    }

    /// Only loopback; no routes.
    pub fn bare() -> Self {
        Self {
            state: Mutex::new(HostState::empty()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_link(&self, name: &str, up: bool, addr: Option<(Ipv4Addr, u8)>) {
        self.lock().links.push(Link {
            name: name.to_string(),
            up,
            addrs: addr.into_iter().collect(),
        });
    }

    pub fn add_default_route(&self, interface: &str, via: Ipv4Addr) {
        self.lock()
            .default_routes
            .push((interface.to_string(), via));
    }

    pub fn clear_default_routes(&self) {
        self.lock().default_routes.clear();
    }

    pub fn set_rfkill(&self, soft: bool, hard: bool) {
        let mut state = self.lock();
        state.soft_blocked = soft;
        state.hard_blocked = hard;
    }

    /// Makes `rfkill` behave as if it were not installed.
    pub fn remove_rfkill(&self) {
        self.lock().rfkill_available = false;
    }

    /// The unit starts but its process exits right away.
    pub fn dies_on_start(&self, unit: &str) {
        self.lock().dies_on_start.insert(unit.to_string());
    }

    /// Every command whose rendered line contains `needle` exits 1.
    pub fn fail_on(&self, needle: &str) {
        self.lock().failures.push(needle.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn add_neighbor(&self, ip: IpAddr, mac: MacAddr) {
        self.lock().neighbors.insert(ip, mac);
    }

    /// The neighbor entry only appears after something pings `ip`.
    pub fn learn_on_ping(&self, ip: IpAddr, mac: MacAddr) {
        self.lock().learn_on_ping.insert(ip, mac);
    }

    pub fn add_flow(&self, src: IpAddr, dst: IpAddr) {
        self.lock().flows.push(Flow { src, dst });
    }

    /// Tracked flows where `ip` is either endpoint.
    pub fn flows_involving(&self, ip: IpAddr) -> usize {
        self.lock()
            .flows
            .iter()
            .filter(|f| f.src == ip || f.dst == ip)
            .count()
    }

    pub fn history(&self) -> Vec<(SystemCommand, ExecMode)> {
        self.lock().history.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock()
            .history
            .iter()
            .map(|(cmd, _)| cmd.to_string())
            .collect()
    }

    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    /// Rules of a chain in evaluation order; empty when the chain is missing.
    pub fn rules(&self, table: Table, chain: &str) -> Vec<Rule> {
        self.lock()
            .chain(table, chain)
            .map(|c| c.rules.clone())
            .unwrap_or_default()
    }

    pub fn policy(&self, chain: &str) -> Option<Policy> {
        self.lock()
            .chain(Table::Filter, chain)
            .and_then(|c| c.policy)
    }

    pub fn chain_exists(&self, table: Table, chain: &str) -> bool {
        self.lock().chain(table, chain).is_some()
    }

    /// Total rule count over every table and chain.
    pub fn rule_count(&self) -> usize {
        self.lock()
            .tables
            .values()
            .flat_map(|chains| chains.iter())
            .map(|c| c.rules.len())
            .sum()
    }

    pub fn custom_chains(&self) -> Vec<String> {
        self.lock()
            .tables
            .values()
            .flat_map(|chains| chains.iter())
            .filter(|c| c.policy.is_none())
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn is_unit_active(&self, unit: &str) -> bool {
        self.lock().units.get(unit).copied().unwrap_or(false)
    }

    pub fn sysctl(&self, key: &str) -> Option<String> {
        self.lock().sysctl.get(key).cloned()
    }

    pub fn link_is_up(&self, name: &str) -> bool {
        self.lock()
            .links
            .iter()
            .any(|l| l.name == name && l.up)
    }

    pub fn link_addrs(&self, name: &str) -> Vec<(Ipv4Addr, u8)> {
        self.lock()
            .links
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.addrs.clone())
            .unwrap_or_default()
    }

    fn interpret(&self, cmd: &SystemCommand) -> ExecutionResult {
        let mut state = self.lock();
        let line = cmd.to_string();
        if state.failures.iter().any(|needle| line.contains(needle)) {
            return ExecutionResult::failed(1, "injected failure");
        }

        match cmd {
            SystemCommand::Iptables(ipt) => iptables(&mut state, ipt),
            SystemCommand::Ip(ip) => ip_cmd(&mut state, ip),
            SystemCommand::Rfkill(RfkillCommand::Unblock) => {
                state.soft_blocked = false;
                ExecutionResult::ok("")
            }
            SystemCommand::Rfkill(RfkillCommand::List) => ExecutionResult::ok(format!(
                "0: phy0: Wireless LAN\n\tSoft blocked: {}\n\tHard blocked: {}\n",
                yes_no(state.soft_blocked),
                yes_no(state.hard_blocked)
            )),
            SystemCommand::Sysctl { key, value } => match value {
                Some(value) => {
                    state.sysctl.insert(key.clone(), value.clone());
                    ExecutionResult::ok(format!("{key} = {value}\n"))
                }
                None => match state.sysctl.get(key) {
                    Some(value) => ExecutionResult::ok(format!("{value}\n")),
                    None => ExecutionResult::ok("0\n"),
                },
            },
            SystemCommand::Systemctl { action, unit } => systemctl(&mut state, *action, unit),
            SystemCommand::Pgrep { name } => {
                if state.processes.contains(name) {
                    ExecutionResult::ok("4242\n")
                } else {
                    ExecutionResult::failed(1, "")
                }
            }
            SystemCommand::Nmcli { .. } => ExecutionResult::ok(""),
            SystemCommand::Conntrack { address, direction } => {
                let before = state.flows.len();
                state.flows.retain(|f| match direction {
                    FlowDirection::Source => f.src != *address,
                    FlowDirection::Destination => f.dst != *address,
                });
                let deleted = before - state.flows.len();
                let summary = format!(
                    "conntrack v1.4.7 (conntrack-tools): {deleted} flow entries have been deleted.\n"
                );
                if deleted == 0 {
                    ExecutionResult::failed(1, summary)
                } else {
                    ExecutionResult {
                        exit_code: 0,
                        stdout: String::new(),
                        stderr: summary,
                    }
                }
            }
            SystemCommand::Ping { address } => match state.learn_on_ping.get(address).copied() {
                Some(mac) => {
                    state.neighbors.insert(*address, mac);
                    ExecutionResult::ok("1 packets transmitted, 1 received\n")
                }
                None => ExecutionResult::failed(1, "1 packets transmitted, 0 received\n"),
            },
            SystemCommand::ListUdpListeners => {
                let mut ports: Vec<_> = state.udp_listeners.iter().copied().collect();
                ports.sort_unstable();
                let out: String = ports
                    .iter()
                    .map(|p| format!("UNCONN 0      0            0.0.0.0:{p}        0.0.0.0:*\n"))
                    .collect();
                ExecutionResult::ok(out)
            }
            SystemCommand::Nslookup { name, server } => {
                if state.udp_listeners.contains(&53) {
                    ExecutionResult::ok(format!(
                        "Server:\t\t{server}\nAddress:\t{server}#53\n\nName:\t{name}\nAddress: {server}\n"
                    ))
                } else {
                    ExecutionResult::failed(1, ";; connection timed out; no servers could be reached\n")
                }
            }
        }
    }
}

impl CommandExecutor for SimulatedHost {
    fn spawn(&self, cmd: &SystemCommand) -> io::Result<ExecutionResult> {
        if matches!(cmd, SystemCommand::Rfkill(_)) && !self.lock().rfkill_available {
            return Err(io::Error::new(io::ErrorKind::NotFound, "rfkill: not found"));
        }
        Ok(self.interpret(cmd))
    }

    fn run(&self, cmd: &SystemCommand, mode: ExecMode) -> Result<ExecutionResult> {
        self.lock().history.push((cmd.clone(), mode));
        finish(cmd, mode, self.spawn(cmd))
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

const NO_CHAIN: &str = "iptables: No chain/target/match by that name.\n";

fn iptables(state: &mut HostState, cmd: &IptablesCommand) -> ExecutionResult {
    match cmd {
        IptablesCommand::Append(rule) => {
            if let Some(missing) = missing_jump(state, rule) {
                return missing;
            }
            match state.chain_mut(rule.table(), rule.chain().as_str()) {
                Some(chain) => {
                    chain.rules.push(rule.clone());
                    ExecutionResult::ok("")
                }
                None => ExecutionResult::failed(1, NO_CHAIN),
            }
        }
        IptablesCommand::Insert(rule, position) => {
            if let Some(missing) = missing_jump(state, rule) {
                return missing;
            }
            match state.chain_mut(rule.table(), rule.chain().as_str()) {
                Some(chain) => {
                    let index = position.map(|p| p.saturating_sub(1) as usize).unwrap_or(0);
                    if index > chain.rules.len() {
                        return ExecutionResult::failed(1, "iptables: Index of insertion too big.\n");
                    }
                    chain.rules.insert(index, rule.clone());
                    ExecutionResult::ok("")
                }
                None => ExecutionResult::failed(1, NO_CHAIN),
            }
        }
        IptablesCommand::Delete(rule) | IptablesCommand::Check(rule) => {
            let delete = matches!(cmd, IptablesCommand::Delete(_));
            let Some(chain) = state.chain_mut(rule.table(), rule.chain().as_str()) else {
                return ExecutionResult::failed(1, NO_CHAIN);
            };
            match chain.rules.iter().position(|r| r == rule) {
                Some(index) => {
                    if delete {
                        chain.rules.remove(index);
                    }
                    ExecutionResult::ok("")
                }
                None => ExecutionResult::failed(
                    1,
                    "iptables: Bad rule (does a matching rule exist in that chain?).\n",
                ),
            }
        }
        IptablesCommand::Flush { table, chain } => {
            let Some(chains) = state.tables.get_mut(table) else {
                return ExecutionResult::failed(1, NO_CHAIN);
            };
            match chain {
                None => {
                    chains.iter_mut().for_each(|c| c.rules.clear());
                    ExecutionResult::ok("")
                }
                Some(name) => match chains.iter_mut().find(|c| c.name == name.as_str()) {
                    Some(c) => {
                        c.rules.clear();
                        ExecutionResult::ok("")
                    }
                    None => ExecutionResult::failed(1, NO_CHAIN),
                },
            }
        }
        IptablesCommand::NewChain { table, chain } => {
            if state.chain(*table, chain.as_str()).is_some() {
                return ExecutionResult::failed(1, "iptables: Chain already exists.\n");
            }
            if let Some(chains) = state.tables.get_mut(table) {
                chains.push(ChainState {
                    name: chain.as_str().to_string(),
                    policy: None,
                    rules: Vec::new(),
                });
            }
            ExecutionResult::ok("")
        }
        IptablesCommand::DeleteChain { table, chain } => delete_chain(state, *table, chain.as_ref()),
        IptablesCommand::SetPolicy { chain, policy } => {
            match state.chain_mut(Table::Filter, chain.as_str()) {
                Some(c) if c.policy.is_some() => {
                    c.policy = Some(*policy);
                    ExecutionResult::ok("")
                }
                _ => ExecutionResult::failed(1, "iptables: Bad built-in chain name.\n"),
            }
        }
        IptablesCommand::List { table, chain } => list(state, *table, chain.as_ref()),
    }
}

fn missing_jump(state: &HostState, rule: &Rule) -> Option<ExecutionResult> {
    match rule.target() {
        Target::Jump(target) if state.chain(rule.table(), target.as_str()).is_none() => {
            Some(ExecutionResult::failed(
                2,
                format!("iptables v1.8.9: Couldn't load target `{}'\n", target.as_str()),
            ))
        }
        _ => None,
    }
}

fn is_referenced(chains: &[ChainState], name: &str) -> bool {
    chains
        .iter()
        .flat_map(|c| c.rules.iter())
        .any(|r| matches!(r.target(), Target::Jump(t) if t.as_str() == name))
}

fn delete_chain(state: &mut HostState, table: Table, chain: Option<&Chain>) -> ExecutionResult {
    let Some(chains) = state.tables.get_mut(&table) else {
        return ExecutionResult::failed(1, NO_CHAIN);
    };
    match chain {
        Some(chain) => {
            let name = chain.as_str();
            let Some(index) = chains
                .iter()
                .position(|c| c.name == name && c.policy.is_none())
            else {
                return ExecutionResult::failed(1, NO_CHAIN);
            };
            if !chains[index].rules.is_empty() || is_referenced(chains, name) {
                return ExecutionResult::failed(1, "iptables: Directory not empty.\n");
            }
            chains.remove(index);
            ExecutionResult::ok("")
        }
        None => {
            let removable: Vec<String> = {
                let view: &[ChainState] = chains;
                view.iter()
                    .filter(|c| c.policy.is_none() && c.rules.is_empty())
                    .filter(|c| !is_referenced(view, &c.name))
                    .map(|c| c.name.clone())
                    .collect()
            };
            chains.retain(|c| !removable.contains(&c.name));
            if chains.iter().any(|c| c.policy.is_none()) {
                ExecutionResult::failed(1, "iptables: Too many links.\n")
            } else {
                ExecutionResult::ok("")
            }
        }
    }
}

fn render_rule(rule: &Rule) -> String {
    let mut args = rule.spec_args();
    // iptables prints hardware addresses upper-case
    for i in 1..args.len() {
        if args[i - 1] == "--mac-source" {
            args[i] = args[i].to_uppercase();
        }
    }
    format!("-A {} {}", rule.chain().as_str(), args.join(" "))
}

fn list(state: &HostState, table: Table, chain: Option<&Chain>) -> ExecutionResult {
    let Some(chains) = state.tables.get(&table) else {
        return ExecutionResult::failed(1, NO_CHAIN);
    };
    let selected: Vec<&ChainState> = match chain {
        Some(name) => match chains.iter().find(|c| c.name == name.as_str()) {
            Some(c) => vec![c],
            None => return ExecutionResult::failed(1, NO_CHAIN),
        },
        None => chains.iter().collect(),
    };

    let mut out = String::new();
    for c in &selected {
        match c.policy {
            Some(policy) => out.push_str(&format!("-P {} {}\n", c.name, policy.as_str())),
            None => out.push_str(&format!("-N {}\n", c.name)),
        }
    }
    for c in &selected {
        for rule in &c.rules {
            out.push_str(&render_rule(rule));
            out.push('\n');
        }
    }
    ExecutionResult::ok(out)
}

fn ip_cmd(state: &mut HostState, cmd: &IpCommand) -> ExecutionResult {
    let no_device = |name: &str| ExecutionResult::failed(1, format!("Device \"{name}\" does not exist.\n"));
    match cmd {
        IpCommand::RouteShowDefault => ExecutionResult::ok(
            state
                .default_routes
                .iter()
                .map(|(iface, via)| format!("default via {via} dev {iface} proto dhcp metric 100\n"))
                .collect::<String>(),
        ),
        IpCommand::LinkShow => ExecutionResult::ok(
            state
                .links
                .iter()
                .enumerate()
                .map(|(i, link)| {
                    let flags = if link.up {
                        "BROADCAST,MULTICAST,UP,LOWER_UP"
                    } else {
                        "BROADCAST,MULTICAST"
                    };
                    let oper = if link.up { "UP" } else { "DOWN" };
                    format!(
                        "{}: {}: <{}> mtu 1500 qdisc noqueue state {} mode DEFAULT group default qlen 1000\\    link/ether 02:00:00:00:00:{:02x} brd ff:ff:ff:ff:ff:ff\n",
                        i + 1,
                        link.name,
                        flags,
                        oper,
                        i + 1
                    )
                })
                .collect::<String>(),
        ),
        IpCommand::AddrShow { interface } => {
            if let Some(name) = interface {
                if !state.links.iter().any(|l| &l.name == name) {
                    return no_device(name);
                }
            }
            let out = state
                .links
                .iter()
                .enumerate()
                .filter(|(_, l)| interface.as_ref().map_or(true, |n| &l.name == n))
                .flat_map(|(i, l)| {
                    l.addrs.iter().map(move |(addr, prefix)| {
                        format!(
                            "{}: {}    inet {}/{} scope global {}\\       valid_lft forever preferred_lft forever\n",
                            i + 1,
                            l.name,
                            addr,
                            prefix,
                            l.name
                        )
                    })
                })
                .collect::<String>();
            ExecutionResult::ok(out)
        }
        IpCommand::AddrFlush { interface } => match state.link_mut(interface) {
            Some(link) => {
                link.addrs.clear();
                ExecutionResult::ok("")
            }
            None => no_device(interface),
        },
        IpCommand::AddrAdd {
            interface,
            address,
            prefix,
        } => {
            let IpAddr::V4(v4) = address else {
                return ExecutionResult::failed(2, "Error: IPv6 is not supported here.\n");
            };
            match state.link_mut(interface) {
                Some(link) if link.addrs.iter().any(|(a, _)| a == v4) => {
                    ExecutionResult::failed(2, "RTNETLINK answers: File exists\n")
                }
                Some(link) => {
                    link.addrs.push((*v4, *prefix));
                    ExecutionResult::ok("")
                }
                None => no_device(interface),
            }
        }
        IpCommand::LinkSet { interface, up } => match state.link_mut(interface) {
            Some(link) => {
                link.up = *up;
                ExecutionResult::ok("")
            }
            None => no_device(interface),
        },
        IpCommand::NeighShow { address } => match state.neighbors.get(address) {
            Some(mac) => ExecutionResult::ok(format!("{address} dev wlan0 lladdr {mac} REACHABLE\n")),
            None => ExecutionResult::ok(""),
        },
    }
}

fn systemctl(state: &mut HostState, action: UnitAction, unit: &str) -> ExecutionResult {
    match action {
        UnitAction::Start | UnitAction::Restart => {
            let dies = state.dies_on_start.contains(unit);
            state.units.insert(unit.to_string(), !dies);
            if !dies {
                state.processes.insert(unit.to_string());
                if unit == "dnsmasq" {
                    state.udp_listeners.insert(53);
                }
            }
            ExecutionResult::ok("")
        }
        UnitAction::Stop => {
            state.units.insert(unit.to_string(), false);
            state.processes.remove(unit);
            if unit == "dnsmasq" {
                state.udp_listeners.remove(&53);
            }
            ExecutionResult::ok("")
        }
        UnitAction::Unmask => ExecutionResult::ok(""),
        UnitAction::IsActive => {
            if state.units.get(unit).copied().unwrap_or(false) {
                ExecutionResult::ok("active\n")
            } else {
                ExecutionResult {
                    exit_code: 3,
                    stdout: "inactive\n".to_string(),
                    stderr: String::new(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipt(cmd: IptablesCommand) -> SystemCommand {
        SystemCommand::Iptables(cmd)
    }

    #[test]
    fn insert_and_list_keep_order() {
        let host = SimulatedHost::bare();
        let a = Rule::new(Table::Filter, Chain::Forward, Target::Accept).in_interface("a");
        let b = Rule::new(Table::Filter, Chain::Forward, Target::Drop).in_interface("b");
        host.must(ipt(IptablesCommand::Append(a.clone()))).unwrap();
        host.must(ipt(IptablesCommand::Insert(b.clone(), Some(1)))).unwrap();
        assert_eq!(host.rules(Table::Filter, "FORWARD"), vec![b, a]);

        let listing = host
            .must(ipt(IptablesCommand::List {
                table: Table::Filter,
                chain: Some(Chain::Forward),
            }))
            .unwrap()
            .stdout;
        assert_eq!(
            listing,
            "-P FORWARD ACCEPT\n-A FORWARD -i b -j DROP\n-A FORWARD -i a -j ACCEPT\n"
        );
    }

    #[test]
    fn delete_of_missing_rule_fails() {
        let host = SimulatedHost::bare();
        let rule = Rule::new(Table::Filter, Chain::Input, Target::Accept);
        let result = host.best_effort(ipt(IptablesCommand::Delete(rule)));
        assert_eq!(result.exit_code, 1);
    }

    #[test]
    fn records_mode_and_injected_failures() {
        let host = SimulatedHost::new();
        host.fail_on("restart hostapd");
        let cmd = SystemCommand::Systemctl {
            action: UnitAction::Restart,
            unit: "hostapd".into(),
        };
        assert!(host.must(cmd.clone()).is_err());
        assert_eq!(host.history(), vec![(cmd, ExecMode::MustSucceed)]);
        assert!(!host.is_unit_active("hostapd"));
    }

    #[test]
    fn ping_teaches_neighbor_table() {
        let host = SimulatedHost::new();
        let ip: IpAddr = "192.168.50.23".parse().unwrap();
        let mac: MacAddr = "aa:bb:cc:00:00:01".parse().unwrap();
        host.learn_on_ping(ip, mac);

        let neigh = SystemCommand::Ip(IpCommand::NeighShow { address: ip });
        assert_eq!(host.best_effort(neigh.clone()).stdout, "");
        host.best_effort(SystemCommand::Ping { address: ip });
        assert!(host.best_effort(neigh).stdout.contains("lladdr aa:bb:cc:00:00:01"));
    }
}

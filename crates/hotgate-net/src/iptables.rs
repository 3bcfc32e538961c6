//! Typed iptables rules and commands.
//!
//! Rules are plain values: the same `Rule` is used to append, insert, check
//! and delete, so a deletion always matches exactly what was installed.
//!
//! ```
//! use hotgate_net::iptables::*;
//!
//! let rule = Rule::new(Table::Nat, Chain::Prerouting, Target::Dnat {
//!     to: "192.168.50.1".parse().unwrap(),
//!     port: Some(8080),
//! })
//! .in_interface("wlan0")
//! .protocol(Protocol::Tcp)
//! .dst_port(80);
//!
//! let args = IptablesCommand::Append(rule).args();
//! assert_eq!(args[..4], ["-t", "nat", "-A", "PREROUTING"]);
//! ```

use std::fmt;
use std::net::IpAddr;

use crate::mac::MacAddr;

/// Name of the chain authorized devices are accepted from.
pub const AUTHENTICATED_CHAIN: &str = "AUTHENTICATED";

/// Table types in netfilter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Filter,
    Nat,
    Mangle,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
            Table::Mangle => "mangle",
        }
    }

    /// Chains the kernel creates for this table.
    pub fn builtin_chains(&self) -> &'static [&'static str] {
        match self {
            Table::Filter => &["INPUT", "FORWARD", "OUTPUT"],
            Table::Nat => &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"],
            Table::Mangle => &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
        }
    }
}

/// Chain names
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Chain {
    Input,
    Output,
    Forward,
    Prerouting,
    Postrouting,
    Custom(String),
}

impl Chain {
    pub fn authenticated() -> Self {
        Chain::Custom(AUTHENTICATED_CHAIN.to_string())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Chain::Input => "INPUT",
            Chain::Output => "OUTPUT",
            Chain::Forward => "FORWARD",
            Chain::Prerouting => "PREROUTING",
            Chain::Postrouting => "POSTROUTING",
            Chain::Custom(name) => name,
        }
    }
}

/// Target actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Accept,
    Drop,
    Reject,
    Masquerade,
    Dnat { to: IpAddr, port: Option<u16> },
    TcpMss { mss: u16 },
    ClampMssToPmtu,
    Jump(Chain),
}

impl Target {
    fn as_str(&self) -> &str {
        match self {
            Target::Accept => "ACCEPT",
            Target::Drop => "DROP",
            Target::Reject => "REJECT",
            Target::Masquerade => "MASQUERADE",
            Target::Dnat { .. } => "DNAT",
            Target::TcpMss { .. } | Target::ClampMssToPmtu => "TCPMSS",
            Target::Jump(chain) => chain.as_str(),
        }
    }
}

/// Built-in chain policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Accept,
    Drop,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Accept => "ACCEPT",
            Policy::Drop => "DROP",
        }
    }
}

/// Protocol types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    fn as_str(&self) -> &str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }
}

/// Iptables rule builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    table: Table,
    chain: Chain,
    protocol: Option<Protocol>,
    in_interface: Option<String>,
    out_interface: Option<String>,
    mac_source: Option<MacAddr>,
    src_port: Option<u16>,
    dst_port: Option<u16>,
    tcp_syn_only: bool,
    state: Option<String>,
    target: Target,
}

impl Rule {
    pub fn new(table: Table, chain: Chain, target: Target) -> Self {
        Self {
            table,
            chain,
            protocol: None,
            in_interface: None,
            out_interface: None,
            mac_source: None,
            src_port: None,
            dst_port: None,
            tcp_syn_only: false,
            state: None,
            target,
        }
    }

    pub fn protocol(mut self, proto: Protocol) -> Self {
        self.protocol = Some(proto);
        self
    }

    pub fn in_interface(mut self, iface: &str) -> Self {
        self.in_interface = Some(iface.to_string());
        self
    }

    pub fn out_interface(mut self, iface: &str) -> Self {
        self.out_interface = Some(iface.to_string());
        self
    }

    pub fn mac_source(mut self, mac: MacAddr) -> Self {
        self.mac_source = Some(mac);
        self
    }

    pub fn src_port(mut self, port: u16) -> Self {
        self.src_port = Some(port);
        self
    }

    pub fn dst_port(mut self, port: u16) -> Self {
        self.dst_port = Some(port);
        self
    }

    /// Matches only TCP segments with SYN set and RST clear.
    pub fn tcp_syn(mut self) -> Self {
        self.tcp_syn_only = true;
        self
    }

    pub fn connection_state(mut self, state: &str) -> Self {
        self.state = Some(state.to_string());
        self
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn mac(&self) -> Option<MacAddr> {
        self.mac_source
    }

    /// Match and target arguments, i.e. what `iptables -S` prints after `-A CHAIN`.
    pub fn spec_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(proto) = &self.protocol {
            args.push("-p".to_string());
            args.push(proto.as_str().to_string());
        }

        if let Some(iface) = &self.in_interface {
            args.push("-i".to_string());
            args.push(iface.clone());
        }

        if let Some(iface) = &self.out_interface {
            args.push("-o".to_string());
            args.push(iface.clone());
        }

        if let Some(mac) = &self.mac_source {
            args.push("-m".to_string());
            args.push("mac".to_string());
            args.push("--mac-source".to_string());
            args.push(mac.to_string());
        }

        if let Some(port) = self.src_port {
            args.push("--sport".to_string());
            args.push(port.to_string());
        }

        if let Some(port) = self.dst_port {
            args.push("--dport".to_string());
            args.push(port.to_string());
        }

        if self.tcp_syn_only {
            args.push("--tcp-flags".to_string());
            args.push("SYN,RST".to_string());
            args.push("SYN".to_string());
        }

        if let Some(state) = &self.state {
            args.push("-m".to_string());
            args.push("state".to_string());
            args.push("--state".to_string());
            args.push(state.clone());
        }

        args.push("-j".to_string());
        args.push(self.target.as_str().to_string());

        match &self.target {
            Target::Dnat { to, port } => {
                args.push("--to-destination".to_string());
                if let Some(p) = port {
                    args.push(format!("{}:{}", to, p));
                } else {
                    args.push(to.to_string());
                }
            }
            Target::TcpMss { mss } => {
                args.push("--set-mss".to_string());
                args.push(mss.to_string());
            }
            Target::ClampMssToPmtu => {
                args.push("--clamp-mss-to-pmtu".to_string());
            }
            _ => {}
        }

        args
    }

    fn to_args(&self, action: &str, position: Option<u32>) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.as_str().to_string(),
            action.to_string(),
            self.chain.as_str().to_string(),
        ];
        if let Some(pos) = position {
            args.push(pos.to_string());
        }
        args.extend(self.spec_args());
        args
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "-t {} -A {} {}",
            self.table.as_str(),
            self.chain.as_str(),
            self.spec_args().join(" ")
        )
    }
}

/// One invocation of the `iptables` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IptablesCommand {
    Append(Rule),
    /// Insert at a 1-based position; `None` means the head of the chain.
    Insert(Rule, Option<u32>),
    Delete(Rule),
    Check(Rule),
    Flush { table: Table, chain: Option<Chain> },
    NewChain { table: Table, chain: Chain },
    /// `-X`; with no chain every empty user-defined chain is removed.
    DeleteChain { table: Table, chain: Option<Chain> },
    SetPolicy { chain: Chain, policy: Policy },
    /// `-S`, rule-spec listing.
    List { table: Table, chain: Option<Chain> },
}

impl IptablesCommand {
    pub fn args(&self) -> Vec<String> {
        match self {
            IptablesCommand::Append(rule) => rule.to_args("-A", None),
            IptablesCommand::Insert(rule, pos) => rule.to_args("-I", *pos),
            IptablesCommand::Delete(rule) => rule.to_args("-D", None),
            IptablesCommand::Check(rule) => rule.to_args("-C", None),
            IptablesCommand::Flush { table, chain } => table_op(*table, "-F", chain.as_ref()),
            IptablesCommand::NewChain { table, chain } => table_op(*table, "-N", Some(chain)),
            IptablesCommand::DeleteChain { table, chain } => {
                table_op(*table, "-X", chain.as_ref())
            }
            IptablesCommand::SetPolicy { chain, policy } => vec![
                "-t".to_string(),
                Table::Filter.as_str().to_string(),
                "-P".to_string(),
                chain.as_str().to_string(),
                policy.as_str().to_string(),
            ],
            IptablesCommand::List { table, chain } => table_op(*table, "-S", chain.as_ref()),
        }
    }
}

fn table_op(table: Table, flag: &str, chain: Option<&Chain>) -> Vec<String> {
    let mut args = vec![
        "-t".to_string(),
        table.as_str().to_string(),
        flag.to_string(),
    ];
    if let Some(chain) = chain {
        args.push(chain.as_str().to_string());
    }
    args
}

/// Extracts every `--mac-source` value from `iptables -S` output.
///
/// The kernel prints MACs upper-case; they are normalised through `MacAddr`.
pub fn parse_listed_macs(listing: &str) -> Vec<MacAddr> {
    let mut macs = Vec::new();
    for line in listing.lines() {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "--mac-source" {
                if let Some(mac) = tokens.next().and_then(|raw| raw.parse().ok()) {
                    macs.push(mac);
                }
            }
        }
    }
    macs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_builder() {
        let rule =
            Rule::new(Table::Nat, Chain::Postrouting, Target::Masquerade).out_interface("eth0");

        let args = IptablesCommand::Append(rule).args();
        assert_eq!(
            args,
            ["-t", "nat", "-A", "POSTROUTING", "-o", "eth0", "-j", "MASQUERADE"]
        );
    }

    #[test]
    fn test_dnat_rule() {
        let rule = Rule::new(
            Table::Nat,
            Chain::Prerouting,
            Target::Dnat {
                to: "192.168.1.1".parse().unwrap(),
                port: Some(8080),
            },
        )
        .in_interface("wlan0")
        .protocol(Protocol::Tcp)
        .dst_port(80);

        let args = IptablesCommand::Append(rule).args();
        assert!(args.contains(&"DNAT".to_string()));
        assert!(args.contains(&"--to-destination".to_string()));
        assert!(args.contains(&"192.168.1.1:8080".to_string()));
    }

    #[test]
    fn insert_places_position_after_chain() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let rule = Rule::new(Table::Filter, Chain::Forward, Target::Drop).mac_source(mac);

        let args = IptablesCommand::Insert(rule, Some(1)).args();
        assert_eq!(
            args,
            [
                "-t",
                "filter",
                "-I",
                "FORWARD",
                "1",
                "-m",
                "mac",
                "--mac-source",
                "aa:bb:cc:dd:ee:ff",
                "-j",
                "DROP"
            ]
        );
    }

    #[test]
    fn mss_clamp_renders_tcp_flags() {
        let rule = Rule::new(Table::Mangle, Chain::Forward, Target::ClampMssToPmtu)
            .protocol(Protocol::Tcp)
            .tcp_syn();
        assert_eq!(
            rule.spec_args().join(" "),
            "-p tcp --tcp-flags SYN,RST SYN -j TCPMSS --clamp-mss-to-pmtu"
        );
    }

    #[test]
    fn jump_targets_custom_chain() {
        let rule = Rule::new(
            Table::Filter,
            Chain::Forward,
            Target::Jump(Chain::authenticated()),
        )
        .in_interface("wlan0");
        assert_eq!(rule.spec_args().join(" "), "-i wlan0 -j AUTHENTICATED");
    }

    #[test]
    fn parses_macs_from_listing() {
        let listing = "-N AUTHENTICATED\n\
                       -A AUTHENTICATED -m mac --mac-source AA:BB:CC:DD:EE:01 -j ACCEPT\n\
                       -A AUTHENTICATED -m mac --mac-source aa:bb:cc:dd:ee:02 -j ACCEPT\n\
                       -A AUTHENTICATED -m mac --mac-source garbage -j ACCEPT\n";
        let macs: Vec<String> = parse_listed_macs(listing)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(macs, ["aa:bb:cc:dd:ee:01", "aa:bb:cc:dd:ee:02"]);
    }
}

//! Host network plumbing for the hotgate captive portal.
//!
//! Every external effect is a typed [`SystemCommand`] run through a
//! [`CommandExecutor`]; the managers build on that to raise the access point,
//! install the captive firewall and flip individual devices between blocked
//! and online.

pub mod backup;
pub mod command;
pub mod config;
pub mod control;
pub mod dnsmasq;
pub mod error;
pub mod firewall;
pub mod hostapd;
pub mod interface;
pub mod iptables;
pub mod mac;
pub mod neighbor;
pub mod orchestrator;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use command::{CommandExecutor, ExecMode, ExecutionResult, SystemCommand, SystemExecutor};
pub use config::{shared, NetworkConfiguration, SharedConfig, SystemPaths, Timings};
pub use control::CaptivePortalControlManager;
pub use dnsmasq::DnsmasqManager;
pub use error::{NetError, Result};
pub use firewall::FirewallService;
pub use hostapd::HostapdManager;
pub use interface::{NetworkManager, Upstream};
pub use mac::MacAddr;
pub use neighbor::{MacResolver, NeighborMacResolver};
pub use orchestrator::{NetworkOrchestrator, NetworkStatus, OrchestratorState};

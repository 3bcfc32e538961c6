//! Tracing targets routed to their own log files.

/// Everything emitted by the network crate (commands, firewall, daemons).
/// `log` records bridged through `LogTracer` carry their module path, so the
/// crate name doubles as the target prefix.
pub const T_NET: &str = "hotgate_net";
/// Per-request portal decisions.
pub const T_PORTAL: &str = "hotgate::portal";

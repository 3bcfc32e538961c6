use std::sync::Arc;

use log::{info, warn};

use crate::backup::{write_generated, ConfigBackup};
use crate::command::{CommandExecutor, SystemCommand, UnitAction};
use crate::config::{self, pause, NetworkConfiguration, SharedConfig, SystemPaths, Timings};
use crate::error::{NetError, Result};

const UNIT: &str = "dnsmasq";

/// DHCP server and catch-all DNS resolver lifecycle.
pub struct DnsmasqManager {
    exec: Arc<dyn CommandExecutor>,
    config: SharedConfig,
    paths: SystemPaths,
    backups: ConfigBackup,
    timings: Timings,
}

impl DnsmasqManager {
    pub fn new(
        exec: Arc<dyn CommandExecutor>,
        config: SharedConfig,
        paths: SystemPaths,
        timings: Timings,
    ) -> Self {
        let backups = ConfigBackup::new(paths.backup_dir.clone());
        Self {
            exec,
            config,
            paths,
            backups,
            timings,
        }
    }

    pub fn configure(&self) -> Result<()> {
        let body = render_config(&config::read(&self.config), &self.paths);
        self.backups.backup(&self.paths.dnsmasq_conf)?;
        write_generated(&self.paths.dnsmasq_conf, &body)?;
        info!("Wrote {}", self.paths.dnsmasq_conf.display());
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        self.exec.must(unit(UnitAction::Restart))?;
        pause(self.timings.daemon_settle);

        let status = self.exec.best_effort(unit(UnitAction::IsActive));
        let state = status.stdout.trim();
        if state != "active" {
            return Err(NetError::DaemonNotRunning {
                daemon: UNIT.to_string(),
                detail: format!("service state '{state}'"),
            });
        }
        info!("dnsmasq active");
        Ok(())
    }

    pub fn stop(&self) {
        self.exec.best_effort(unit(UnitAction::Stop));
        if let Err(err) = self.backups.restore(&self.paths.dnsmasq_conf) {
            warn!("Restoring {} failed: {err}", self.paths.dnsmasq_conf.display());
        }
    }
}

fn unit(action: UnitAction) -> SystemCommand {
    SystemCommand::Systemctl {
        action,
        unit: UNIT.to_string(),
    }
}

/// Every name resolves to the gateway; DHCP hands out the gateway as router
/// and resolver.
pub fn render_config(cfg: &NetworkConfiguration, paths: &SystemPaths) -> String {
    format!(
        "interface={iface}\n\
         bind-interfaces\n\
         listen-address={gw}\n\
         dhcp-range={range}\n\
         dhcp-option=3,{gw}\n\
         dhcp-option=6,{gw}\n\
         dhcp-authoritative\n\
         dhcp-leasefile={leases}\n\
         no-resolv\n\
         no-poll\n\
         address=/#/{gw}\n\
         log-dhcp\n",
        iface = cfg.interface,
        gw = cfg.gateway_ip,
        range = cfg.dhcp_range,
        leases = paths.dhcp_leases.display(),
    )
}

use std::sync::Arc;

use log::{info, warn};

use crate::backup::{write_generated, ConfigBackup};
use crate::command::{CommandExecutor, SystemCommand, UnitAction};
use crate::config::{self, pause, NetworkConfiguration, SharedConfig, SystemPaths, Timings};
use crate::error::{NetError, Result};

const UNIT: &str = "hostapd";

/// Access point daemon lifecycle.
pub struct HostapdManager {
    exec: Arc<dyn CommandExecutor>,
    config: SharedConfig,
    paths: SystemPaths,
    backups: ConfigBackup,
    timings: Timings,
}

impl HostapdManager {
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
        let cfg = config::read(&self.config);
        cfg.validate()?;
        let body = render_config(&cfg);
        self.backups.backup(&self.paths.hostapd_conf)?;
        self.backups.backup(&self.paths.hostapd_default)?;
        write_generated(&self.paths.hostapd_conf, &body)?;
        write_generated(
            &self.paths.hostapd_default,
            &format!("DAEMON_CONF=\"{}\"\n", self.paths.hostapd_conf.display()),
        )?;
        info!("Wrote {}", self.paths.hostapd_conf.display());
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        // Fresh Debian images ship the unit masked.
        self.exec.best_effort(unit(UnitAction::Unmask));
        self.exec.must(unit(UnitAction::Restart))?;
        pause(self.timings.daemon_settle);

        if !self.is_running() {
            return Err(NetError::DaemonNotRunning {
                daemon: UNIT.to_string(),
                detail: "no hostapd process after restart".to_string(),
            });
        }
        info!("hostapd running");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.exec
            .best_effort(SystemCommand::Pgrep {
                name: UNIT.to_string(),
            })
            .success()
    }

    /// Stops the daemon and puts the original config files back.
    pub fn stop(&self) {
        self.exec.best_effort(unit(UnitAction::Stop));
        for path in [&self.paths.hostapd_conf, &self.paths.hostapd_default] {
            if let Err(err) = self.backups.restore(path) {
                warn!("Restoring {} failed: {err}", path.display());
            }
        }
    }
}

fn unit(action: UnitAction) -> SystemCommand {
    SystemCommand::Systemctl {
        action,
        unit: UNIT.to_string(),
    }
}

pub fn render_config(cfg: &NetworkConfiguration) -> String {
    let base = format!(
        "interface={}\ndriver=nl80211\nssid={}\nhw_mode=g\nchannel={}\nwmm_enabled=1\nmacaddr_acl=0\nignore_broadcast_ssid=0\n",
        cfg.interface, cfg.ssid, cfg.channel
    );
    if cfg.password.is_empty() {
        format!("{base}auth_algs=1\n")
    } else {
        format!(
            "{base}auth_algs=1\nwpa=2\nwpa_passphrase={}\nwpa_key_mgmt=WPA-PSK\nrsn_pairwise=CCMP\n",
            cfg.password
        )
    }
}

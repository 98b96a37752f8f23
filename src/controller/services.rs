//! Supervision of conflicting network services and the AP/DHCP daemons

use super::command::{Cmd, CommandExecutor, RetryPolicy};
use super::error::{HotspotError, HotspotResult};
use std::path::Path;
use std::time::Duration;

pub const AP_DAEMON: &str = "hostapd";
pub const DHCP_DAEMON: &str = "dnsmasq";

/// Whether a service was running when it was captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceState {
    pub name: String,
    pub was_active: bool,
}

/// Service activity recorded just before stopping, in capture order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStateSet {
    services: Vec<ServiceState>,
}

impl ServiceStateSet {
    #[cfg(test)]
    pub fn was_active(&self, name: &str) -> Option<bool> {
        self.services
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.was_active)
    }

    pub fn names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceState> {
        self.services.iter()
    }
}

/// `systemctl is-active` prints exactly `active` for a running unit.
pub fn parse_is_active(stdout: &str) -> bool {
    stdout.trim() == "active"
}

pub struct ServiceSupervisor<'a> {
    exec: &'a dyn CommandExecutor,
    dhcp_retry: RetryPolicy,
    dhcp_settle: Duration,
}

impl<'a> ServiceSupervisor<'a> {
    pub fn new(exec: &'a dyn CommandExecutor, dhcp_retry: RetryPolicy, dhcp_settle: Duration) -> Self {
        Self {
            exec,
            dhcp_retry,
            dhcp_settle,
        }
    }

    pub async fn is_service_active(&self, name: &str) -> HotspotResult<bool> {
        let output = self
            .exec
            .execute(&Cmd::new("systemctl").args(["is-active", name]))
            .await?;
        Ok(parse_is_active(&output.stdout))
    }

    async fn systemctl(&self, action: &str, name: &str) -> HotspotResult<()> {
        let cmd = Cmd::new("systemctl").args([action, name]);
        self.exec.execute(&cmd).await?.check(&cmd)?;
        Ok(())
    }

    /// Record each service's activity, then stop it regardless.
    pub async fn capture_and_stop(&self, names: &[String]) -> ServiceStateSet {
        let mut set = ServiceStateSet::default();
        for name in names {
            let was_active = match self.is_service_active(name).await {
                Ok(active) => active,
                Err(e) => {
                    tracing::warn!(service = %name, error = %e, "Could not query service state");
                    false
                }
            };
            tracing::info!(service = %name, was_active, "Captured service state");
            set.services.push(ServiceState {
                name: name.clone(),
                was_active,
            });

            if let Err(e) = self.systemctl("stop", name).await {
                tracing::warn!(service = %name, error = %e, "Failed to stop service");
            }
        }
        set
    }

    /// Restart every tracked service, including ones that were inactive at
    /// capture time. All services are attempted.
    pub async fn restart(&self, names: &[String]) -> HotspotResult<()> {
        let mut failed = Vec::new();
        for name in names {
            tracing::info!(service = %name, "Restarting service");
            if let Err(e) = self.systemctl("restart", name).await {
                tracing::warn!(service = %name, error = %e, "Failed to restart service");
                failed.push(name.clone());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(HotspotError::CommandFailed {
                command: "systemctl restart".to_string(),
                message: format!("failed to restart {}", failed.join(", ")),
            })
        }
    }

    /// Restart hostapd so it picks up the freshly written config.
    pub async fn start_ap_daemon(&self, config_path: &Path) -> HotspotResult<()> {
        tracing::info!(config = %config_path.display(), "Starting hostapd");
        let cmd = Cmd::new("systemctl").args(["restart", AP_DAEMON]);
        let output = self.exec.execute(&cmd).await?;
        if output.success() {
            Ok(())
        } else {
            Err(HotspotError::ApDaemonFailed(output.error_message()))
        }
    }

    pub async fn stop_ap_daemon(&self) -> HotspotResult<()> {
        tracing::info!("Stopping hostapd");
        self.systemctl("stop", AP_DAEMON).await
    }

    /// Replace any running dnsmasq with one using `config_path`. Returns
    /// whether the daemon is alive after the retry budget; a dead daemon is
    /// reported, not raised.
    pub async fn start_dhcp_daemon(&self, config_path: &Path) -> HotspotResult<bool> {
        self.stop_dhcp_daemon().await?;

        // dnsmasq forks into the background; keep it off our working directory.
        let launch = Cmd::new(DHCP_DAEMON)
            .arg(format!("--conf-file={}", config_path.display()))
            .current_dir("/");
        for attempt in 1..=self.dhcp_retry.max_attempts.max(1) {
            let wait = self.dhcp_retry.delay_before(attempt);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }

            tracing::info!(attempt, config = %config_path.display(), "Starting dnsmasq");
            let output = self.exec.execute(&launch).await?;
            if !output.success() {
                tracing::warn!(attempt, error = %output.error_message(), "dnsmasq launch failed");
            }

            if !self.dhcp_settle.is_zero() {
                tokio::time::sleep(self.dhcp_settle).await;
            }

            if self.is_process_running(DHCP_DAEMON).await {
                tracing::info!("dnsmasq is running");
                return Ok(true);
            }
            tracing::warn!(attempt, "dnsmasq is not running after launch");
        }

        tracing::error!("dnsmasq failed to stay up; clients will not receive addresses");
        Ok(false)
    }

    /// Kill any dnsmasq instance. Having nothing to kill is fine.
    pub async fn stop_dhcp_daemon(&self) -> HotspotResult<()> {
        self.exec
            .execute(&Cmd::new("pkill").args(["-x", DHCP_DAEMON]))
            .await?;
        Ok(())
    }

    pub async fn is_process_running(&self, name: &str) -> bool {
        match self.exec.execute(&Cmd::new("pgrep").args(["-x", name])).await {
            Ok(output) => !output.stdout.trim().is_empty(),
            Err(e) => {
                tracing::warn!(process = %name, error = %e, "Failed to query process table");
                false
            }
        }
    }

    /// Whether `binary` resolves on PATH.
    pub async fn binary_available(&self, binary: &str) -> bool {
        match self.exec.execute(&Cmd::new("which").arg(binary)).await {
            Ok(output) => output.success() && !output.stdout.trim().is_empty(),
            Err(_) => false,
        }
    }

    /// Fail with the first of `binaries` that is not installed.
    pub async fn ensure_binaries(&self, binaries: &[&str]) -> HotspotResult<()> {
        for binary in binaries {
            if !self.binary_available(binary).await {
                tracing::error!(binary = %binary, "Required binary is not installed");
                return Err(HotspotError::DependencyMissing((*binary).to_string()));
            }
        }
        Ok(())
    }
}

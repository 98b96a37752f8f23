//! firewalld rules for DHCP and broadcast traffic

use super::command::{Cmd, CommandExecutor};
use super::error::{HotspotError, HotspotResult};
use super::services::parse_is_active;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

const FIREWALL_SERVICE: &str = "firewalld";

/// firewall-cmd reports success textually, including on re-adds
/// (`Warning: ALREADY_ENABLED ... success`).
pub fn output_reports_success(stdout: &str) -> bool {
    stdout.to_ascii_lowercase().contains("success")
}

/// The zone name from `firewall-cmd --get-active-zones`: the first
/// non-indented line.
pub fn parse_active_zone(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find(|line| !line.is_empty() && !line.starts_with(char::is_whitespace))
        .map(|line| line.trim().to_string())
}

pub fn broadcast_rich_rules(subnet: Ipv4Net) -> Vec<String> {
    vec![
        r#"rule family="ipv4" destination address="255.255.255.255" protocol value="udp" accept"#
            .to_string(),
        r#"rule family="ipv4" destination address="255.255.255.255" protocol value="tcp" accept"#
            .to_string(),
        format!(
            r#"rule family="ipv4" source address="{}" protocol value="udp" accept"#,
            subnet.trunc()
        ),
    ]
}

pub struct FirewallConfigurator<'a> {
    exec: &'a dyn CommandExecutor,
}

impl<'a> FirewallConfigurator<'a> {
    pub fn new(exec: &'a dyn CommandExecutor) -> Self {
        Self { exec }
    }

    async fn is_running(&self) -> HotspotResult<bool> {
        let output = self
            .exec
            .execute(&Cmd::new("systemctl").args(["is-active", FIREWALL_SERVICE]))
            .await?;
        Ok(parse_is_active(&output.stdout))
    }

    async fn active_zone(&self) -> HotspotResult<String> {
        let cmd = Cmd::new("firewall-cmd").arg("--get-active-zones");
        let output = self.exec.execute(&cmd).await?;
        parse_active_zone(&output.stdout).ok_or_else(|| HotspotError::CommandFailed {
            command: cmd.to_string(),
            message: "no active firewall zone".to_string(),
        })
    }

    async fn firewall_cmd(&self, cmd: Cmd) -> HotspotResult<()> {
        let output = self.exec.execute(&cmd).await?;
        if output_reports_success(&output.stdout) {
            Ok(())
        } else {
            Err(HotspotError::CommandFailed {
                command: cmd.to_string(),
                message: output.error_message(),
            })
        }
    }

    async fn add_permanent(&self, zone: &str, change: String) -> HotspotResult<()> {
        self.firewall_cmd(
            Cmd::new("firewall-cmd")
                .arg("--permanent")
                .arg(format!("--zone={}", zone))
                .arg(change),
        )
        .await
    }

    async fn reload(&self) -> HotspotResult<()> {
        self.firewall_cmd(Cmd::new("firewall-cmd").arg("--reload")).await
    }

    /// Permit DHCP in the active zone. Returns `false` without touching
    /// anything when firewalld is not running.
    pub async fn ensure_dhcp_allowed(&self, ip_address: Ipv4Addr) -> HotspotResult<bool> {
        if !self.is_running().await? {
            tracing::info!("firewalld is not active, skipping DHCP rule");
            return Ok(false);
        }

        let zone = self.active_zone().await?;
        tracing::info!(zone = %zone, ip = %ip_address, "Allowing DHCP through firewalld");
        self.add_permanent(&zone, "--add-service=dhcp".to_string()).await?;
        self.reload().await?;
        Ok(true)
    }

    /// Permit broadcast traffic and UDP from the hotspot subnet.
    pub async fn ensure_broadcast_allowed(&self, subnet: Ipv4Net) -> HotspotResult<bool> {
        if !self.is_running().await? {
            tracing::info!("firewalld is not active, skipping broadcast rules");
            return Ok(false);
        }

        let zone = self.active_zone().await?;
        tracing::info!(zone = %zone, subnet = %subnet, "Allowing broadcast traffic through firewalld");
        for rule in broadcast_rich_rules(subnet) {
            self.add_permanent(&zone, format!("--add-rich-rule={}", rule)).await?;
        }
        self.reload().await?;
        Ok(true)
    }
}

//! Capture and replay of the station network configuration

use super::command::{Cmd, CommandExecutor, RetryPolicy};
use super::error::{HotspotError, HotspotResult};
use super::interface::InterfaceController;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// systemd-resolved stub listener; never a real upstream.
const RESOLVED_STUB: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 53);

/// Address, default route and resolvers of an interface at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSnapshot {
    pub ip: Option<Ipv4Net>,
    pub gateway: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
}

/// First `via` address in `ip route show default` output.
pub fn parse_default_gateway(stdout: &str) -> Option<Ipv4Addr> {
    stdout.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "via" {
                return tokens.next().and_then(|gw| gw.parse().ok());
            }
        }
        None
    })
}

/// IPv4 servers from `resolvectl dns <if>`, e.g. `Link 3 (wlan0): 8.8.8.8 1.1.1.1`.
pub fn parse_resolvectl_dns(stdout: &str) -> Vec<Ipv4Addr> {
    stdout
        .lines()
        .filter_map(|line| line.split_once(':').map(|(_, servers)| servers))
        .flat_map(str::split_whitespace)
        .filter_map(|token| token.parse().ok())
        .collect()
}

/// `nameserver` entries of a resolv.conf, skipping the resolved stub.
pub fn parse_resolv_conf(contents: &str) -> Vec<Ipv4Addr> {
    contents
        .lines()
        .filter_map(|line| line.trim().strip_prefix("nameserver"))
        .filter_map(|rest| rest.trim().parse::<Ipv4Addr>().ok())
        .filter(|ip| *ip != RESOLVED_STUB)
        .collect()
}

pub fn render_resolv_conf(servers: &[Ipv4Addr]) -> String {
    servers
        .iter()
        .map(|ip| format!("nameserver {}\n", ip))
        .collect()
}

impl NetworkSnapshot {
    /// Record the current configuration of `interface`. Never fails; any field
    /// that cannot be determined is left empty.
    pub async fn capture(exec: &dyn CommandExecutor, interface: &str, resolv_conf: &Path) -> Self {
        let interfaces = InterfaceController::new(exec, RetryPolicy::new(1, Duration::ZERO));

        let ip = match interfaces.addresses(interface).await {
            Ok(addrs) => addrs.into_iter().next(),
            Err(e) => {
                tracing::warn!(interface = %interface, error = %e, "Could not read interface address");
                None
            }
        };

        let gateway = match exec
            .execute(&Cmd::new("ip").args(["-4", "route", "show", "default", "dev", interface]))
            .await
        {
            Ok(output) => parse_default_gateway(&output.stdout),
            Err(e) => {
                tracing::warn!(interface = %interface, error = %e, "Could not read default route");
                None
            }
        };

        let mut dns_servers = match exec
            .execute(&Cmd::new("resolvectl").args(["dns", interface]))
            .await
        {
            Ok(output) if output.success() => parse_resolvectl_dns(&output.stdout),
            Ok(_) => Vec::new(),
            Err(e) => {
                tracing::debug!(error = %e, "resolvectl unavailable");
                Vec::new()
            }
        };
        if dns_servers.is_empty() {
            dns_servers = std::fs::read_to_string(resolv_conf)
                .map(|contents| parse_resolv_conf(&contents))
                .unwrap_or_default();
        }

        let snapshot = Self {
            ip,
            gateway,
            dns_servers,
        };
        tracing::info!(
            interface = %interface,
            ip = ?snapshot.ip,
            gateway = ?snapshot.gateway,
            dns = ?snapshot.dns_servers,
            "Captured network configuration"
        );
        snapshot
    }

    /// Replay this snapshot onto `interface`. Every aspect is attempted even
    /// when an earlier one fails; empty fields are left unset.
    pub async fn restore(
        &self,
        exec: &dyn CommandExecutor,
        interface: &str,
        resolv_conf: &Path,
    ) -> HotspotResult<()> {
        let interfaces = InterfaceController::new(exec, RetryPolicy::new(1, Duration::ZERO));
        let mut failed = Vec::new();

        if let Err(e) = interfaces.flush_addresses(interface).await {
            tracing::warn!(interface = %interface, error = %e, "Failed to flush addresses");
            failed.push("flush".to_string());
        }

        if let Some(ip) = self.ip {
            if let Err(e) = interfaces.add_address(interface, ip).await {
                tracing::warn!(interface = %interface, address = %ip, error = %e, "Failed to restore address");
                failed.push("address".to_string());
            }
        }

        if let Some(gateway) = self.gateway {
            let cmd = Cmd::new("ip").args([
                "route",
                "replace",
                "default",
                "via",
                &gateway.to_string(),
                "dev",
                interface,
            ]);
            if let Err(e) = exec.execute(&cmd).await.and_then(|out| out.check(&cmd)) {
                tracing::warn!(gateway = %gateway, error = %e, "Failed to restore default route");
                failed.push("gateway".to_string());
            }
        }

        if !self.dns_servers.is_empty() {
            let contents = render_resolv_conf(&self.dns_servers);
            if let Err(e) = std::fs::write(resolv_conf, contents) {
                tracing::warn!(path = %resolv_conf.display(), error = %e, "Failed to restore resolvers");
                failed.push("dns".to_string());
            }
        }

        if failed.is_empty() {
            tracing::info!(interface = %interface, "Network configuration restored");
            Ok(())
        } else {
            Err(HotspotError::RestoreIncomplete(failed))
        }
    }
}

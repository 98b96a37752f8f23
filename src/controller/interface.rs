//! Wireless interface link, mode and address control

use super::command::{Cmd, CommandExecutor, CommandOutput, RetryPolicy};
use super::error::{HotspotError, HotspotResult};
use ipnet::Ipv4Net;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiMode {
    Managed,
    AccessPoint,
}

impl WifiMode {
    /// Interface type name understood by `iw dev <if> set type`.
    pub fn iw_type(self) -> &'static str {
        match self {
            Self::Managed => "managed",
            Self::AccessPoint => "__ap",
        }
    }
}

/// Interpret `ip link show <if>` output.
///
/// `state UNKNOWN` is treated as a missing interface, matching how the
/// wireless driver reports an absent radio.
pub fn parse_link_state(output: &CommandOutput) -> LinkState {
    if !output.success() || output.stdout.contains("state UNKNOWN") {
        LinkState::Missing
    } else if output.stdout.contains("state DOWN") {
        LinkState::Down
    } else {
        LinkState::Up
    }
}

/// Extract every `inet a.b.c.d/nn` from `ip -4 -o addr show` output.
pub fn parse_inet_addresses(stdout: &str) -> Vec<Ipv4Net> {
    let mut addresses = Vec::new();
    for line in stdout.lines() {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token != "inet" {
                continue;
            }
            if let Some(Ok(net)) = tokens.next().map(str::parse::<Ipv4Net>) {
                addresses.push(net);
            }
        }
    }
    addresses
}

/// Whether `rfkill list` reports the Wireless LAN radio as soft or hard
/// blocked. Only the first Wireless LAN section is considered.
pub fn parse_rfkill_blocked(stdout: &str) -> bool {
    let mut in_wlan_section = false;
    for line in stdout.lines() {
        let line = line.trim();
        if line.contains("Wireless LAN") {
            in_wlan_section = true;
        } else if in_wlan_section {
            if line.contains("Soft blocked: yes") || line.contains("Hard blocked: yes") {
                return true;
            }
            if is_rfkill_device_header(line) {
                break;
            }
        }
    }
    false
}

fn is_rfkill_device_header(line: &str) -> bool {
    line.split_once(':')
        .is_some_and(|(index, _)| !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()))
}

pub struct InterfaceController<'a> {
    exec: &'a dyn CommandExecutor,
    address_retry: RetryPolicy,
}

impl<'a> InterfaceController<'a> {
    pub fn new(exec: &'a dyn CommandExecutor, address_retry: RetryPolicy) -> Self {
        Self {
            exec,
            address_retry,
        }
    }

    pub async fn link_state(&self, interface: &str) -> HotspotResult<LinkState> {
        let output = self
            .exec
            .execute(&Cmd::new("ip").args(["link", "show", interface]))
            .await?;
        Ok(parse_link_state(&output))
    }

    /// Bring the link administratively up if it is down.
    pub async fn ensure_up(&self, interface: &str) -> HotspotResult<()> {
        match self.link_state(interface).await? {
            LinkState::Missing => {
                tracing::error!(interface = %interface, "Wireless interface not found");
                Err(HotspotError::InterfaceNotFound(interface.to_string()))
            }
            LinkState::Down => {
                tracing::info!(interface = %interface, "Interface is down, bringing it up");
                self.set_link(interface, true).await
            }
            LinkState::Up => Ok(()),
        }
    }

    pub async fn set_link(&self, interface: &str, up: bool) -> HotspotResult<()> {
        let cmd = Cmd::new("ip").args(["link", "set", interface, if up { "up" } else { "down" }]);
        self.exec.execute(&cmd).await?.check(&cmd)?;
        Ok(())
    }

    /// Down, change type, up. Not atomic: the link is brought back up even
    /// when the type change fails so the radio is not left down.
    pub async fn set_mode(&self, interface: &str, mode: WifiMode) -> HotspotResult<()> {
        tracing::info!(interface = %interface, mode = ?mode, "Switching interface mode");

        self.set_link(interface, false).await?;

        let cmd = Cmd::new("iw").args(["dev", interface, "set", "type", mode.iw_type()]);
        let mode_result = self.exec.execute(&cmd).await.and_then(|out| out.check(&cmd));

        let up_result = self.set_link(interface, true).await;
        mode_result?;
        up_result
    }

    pub async fn flush_addresses(&self, interface: &str) -> HotspotResult<()> {
        let cmd = Cmd::new("ip").args(["addr", "flush", "dev", interface]);
        self.exec.execute(&cmd).await?.check(&cmd)?;
        Ok(())
    }

    pub async fn add_address(&self, interface: &str, cidr: Ipv4Net) -> HotspotResult<()> {
        let cmd = Cmd::new("ip").args(["addr", "add", &cidr.to_string(), "dev", interface]);
        let output = self.exec.execute(&cmd).await?;
        // Re-adding an address that is already present is not a failure.
        if output.success() || output.stderr.contains("File exists") {
            Ok(())
        } else {
            Err(HotspotError::CommandFailed {
                command: cmd.to_string(),
                message: output.error_message(),
            })
        }
    }

    pub async fn addresses(&self, interface: &str) -> HotspotResult<Vec<Ipv4Net>> {
        let output = self
            .exec
            .execute(&Cmd::new("ip").args(["-4", "-o", "addr", "show", "dev", interface]))
            .await?;
        Ok(parse_inet_addresses(&output.stdout))
    }

    /// Replace all addresses with `cidr` and confirm the kernel reports it.
    pub async fn assign_static_address(&self, interface: &str, cidr: Ipv4Net) -> HotspotResult<()> {
        self.flush_addresses(interface).await?;

        let assigned = self
            .address_retry
            .run(|attempt| async move {
                if let Err(e) = self.add_address(interface, cidr).await {
                    tracing::warn!(interface = %interface, attempt, error = %e, "Address add failed");
                }
                match self.addresses(interface).await {
                    Ok(current) => current.contains(&cidr),
                    Err(e) => {
                        tracing::warn!(interface = %interface, error = %e, "Address query failed");
                        false
                    }
                }
            })
            .await;

        if assigned {
            tracing::info!(interface = %interface, address = %cidr, "Static address assigned");
            Ok(())
        } else {
            Err(HotspotError::AddressAssignmentFailed {
                interface: interface.to_string(),
                address: cidr.to_string(),
            })
        }
    }

    /// Whether rfkill is blocking the wireless radio. Errors count as
    /// not blocked.
    pub async fn is_radio_blocked(&self) -> bool {
        match self.exec.execute(&Cmd::new("rfkill").arg("list")).await {
            Ok(output) if !output.stdout.trim().is_empty() => parse_rfkill_blocked(&output.stdout),
            Ok(_) => {
                tracing::warn!("rfkill returned empty output");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to query rfkill");
                false
            }
        }
    }
}

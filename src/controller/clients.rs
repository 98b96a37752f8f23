//! Connected stations and the hostapd MAC deny list

use super::command::{Cmd, CommandExecutor};
use super::error::{HotspotError, HotspotResult};
use super::services::AP_DAEMON;
use super::state::HostPaths;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Placeholder entries shipped in the stock hostapd.deny.
const DEFAULT_DENY_ENTRIES: [&str; 3] = [
    "00:20:30:40:50:60",
    "00:ab:cd:ef:12:34",
    "00:00:30:40:50:60",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedClient {
    pub mac: String,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    /// dBm, always negative or zero
    pub signal_strength: Option<i32>,
}

/// `aa:bb:cc:dd:ee:ff`, either case.
pub fn is_valid_mac(value: &str) -> bool {
    let parts: Vec<&str> = value.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Stations from `hostapd_cli all_sta`: a bare MAC line opens a station
/// block, `signal=` inside it sets the strength.
pub fn parse_all_sta(stdout: &str) -> Vec<ConnectedClient> {
    let mut clients: Vec<ConnectedClient> = Vec::new();
    for line in stdout.lines().map(str::trim) {
        if line.len() == 17 && line.chars().all(|c| c.is_ascii_hexdigit() || c == ':') {
            clients.push(ConnectedClient {
                mac: line.to_string(),
                ip: None,
                hostname: None,
                signal_strength: None,
            });
        } else if let Some(value) = line.strip_prefix("signal=") {
            if let (Some(client), Ok(signal)) = (clients.last_mut(), value.trim().parse::<i32>()) {
                client.signal_strength = Some(-signal.abs());
            }
        }
    }
    clients
}

/// Fill in IP and hostname from a dnsmasq lease file
/// (`<expiry> <mac> <ip> <hostname> ...`).
pub fn apply_leases(clients: &mut [ConnectedClient], leases: &str) {
    for line in leases.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            continue;
        }
        if let Some(client) = clients
            .iter_mut()
            .find(|c| c.mac.eq_ignore_ascii_case(parts[1]))
        {
            client.ip = Some(parts[2].to_string());
            client.hostname = Some(parts[3].to_string());
        }
    }
}

/// Valid, non-placeholder MACs from deny file contents.
pub fn parse_deny_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| is_valid_mac(line))
        .filter(|line| {
            !DEFAULT_DENY_ENTRIES
                .iter()
                .any(|d| d.eq_ignore_ascii_case(line))
        })
        .map(str::to_string)
        .collect()
}

fn read_optional(path: &Path) -> HotspotResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(HotspotError::ConfigWriteFailed {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub struct ClientManager<'a> {
    exec: &'a dyn CommandExecutor,
    paths: &'a HostPaths,
    interface: &'a str,
}

impl<'a> ClientManager<'a> {
    pub fn new(exec: &'a dyn CommandExecutor, paths: &'a HostPaths, interface: &'a str) -> Self {
        Self {
            exec,
            paths,
            interface,
        }
    }

    fn hostapd_cli(&self) -> Cmd {
        Cmd::new("hostapd_cli")
            .arg("-p")
            .arg(self.paths.hostapd_ctrl_dir.display().to_string())
            .args(["-i", self.interface])
    }

    pub async fn connected(&self) -> HotspotResult<Vec<ConnectedClient>> {
        let cmd = self.hostapd_cli().arg("all_sta");
        let output = self.exec.execute(&cmd).await?.check(&cmd)?;
        let mut clients = parse_all_sta(&output.stdout);

        match read_optional(&self.paths.dhcp_leases)? {
            Some(leases) => apply_leases(&mut clients, &leases),
            None => {
                tracing::debug!(path = %self.paths.dhcp_leases.display(), "No DHCP lease file")
            }
        }

        tracing::info!(count = clients.len(), "Fetched connected clients");
        Ok(clients)
    }

    async fn reload_ap_daemon(&self) -> HotspotResult<()> {
        let cmd = Cmd::new("systemctl").args(["reload", AP_DAEMON]);
        self.exec.execute(&cmd).await?.check(&cmd)?;
        Ok(())
    }

    /// Kick `mac` off the hotspot and keep it out.
    pub async fn ban(&self, mac: &str) -> HotspotResult<()> {
        if !is_valid_mac(mac) {
            return Err(HotspotError::InvalidConfig(format!("'{}' is not a MAC address", mac)));
        }

        let cmd = self.hostapd_cli().args(["deauthenticate", mac]);
        let output = self.exec.execute(&cmd).await?;
        if !output.stdout.contains("OK") {
            return Err(HotspotError::CommandFailed {
                command: cmd.to_string(),
                message: output.error_message(),
            });
        }

        let deny_file = &self.paths.deny_file;
        let write_err = |source: std::io::Error| HotspotError::ConfigWriteFailed {
            path: deny_file.clone(),
            source,
        };
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(deny_file)
            .map_err(write_err)?;
        writeln!(file, "{}", mac).map_err(write_err)?;

        tracing::info!(mac = %mac, path = %deny_file.display(), "Banned client");
        self.reload_ap_daemon().await
    }

    /// Remove `mac` from the deny list. Returns `false` when it was not listed.
    pub async fn unban(&self, mac: &str) -> HotspotResult<bool> {
        let deny_file = &self.paths.deny_file;
        let Some(contents) = read_optional(deny_file)? else {
            tracing::warn!(path = %deny_file.display(), "Deny file does not exist");
            return Ok(false);
        };

        let kept: Vec<&str> = contents
            .lines()
            .filter(|line| !line.trim().eq_ignore_ascii_case(mac))
            .collect();
        if kept.len() == contents.lines().count() {
            tracing::info!(mac = %mac, "MAC was not banned");
            return Ok(false);
        }

        let mut rewritten = kept.join("\n");
        if !rewritten.is_empty() {
            rewritten.push('\n');
        }
        fs::write(deny_file, rewritten).map_err(|source| HotspotError::ConfigWriteFailed {
            path: deny_file.clone(),
            source,
        })?;

        tracing::info!(mac = %mac, "Unbanned client");
        self.reload_ap_daemon().await?;
        Ok(true)
    }

    pub fn banned(&self) -> HotspotResult<Vec<String>> {
        Ok(read_optional(&self.paths.deny_file)?
            .map(|contents| parse_deny_list(&contents))
            .unwrap_or_default())
    }
}

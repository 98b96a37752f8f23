//! hostapd and dnsmasq configuration rendering

use super::error::{HotspotError, HotspotResult};
use super::state::{HostPaths, HotspotConfig};
use std::net::Ipv4Addr;
use std::path::Path;

/// Resolvers advertised to clients; dnsmasq itself does not serve DNS.
pub const CLIENT_DNS_SERVERS: [Ipv4Addr; 2] = [Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)];

/// Render the hostapd configuration for a WPA2-PSK access point.
pub fn render_ap_config(cfg: &HotspotConfig, paths: &HostPaths) -> String {
    let hw_mode = if cfg.channel > 14 { "a" } else { "g" };
    format!(
        r#"interface={interface}
driver=nl80211
ctrl_interface={ctrl_dir}
ssid={ssid}
hw_mode={hw_mode}
channel={channel}
country_code={country}
ieee80211n=1
wmm_enabled=1
auth_algs=1
ignore_broadcast_ssid=0
macaddr_acl=0
deny_mac_file={deny_file}
wpa=2
wpa_passphrase={passphrase}
wpa_key_mgmt=WPA-PSK
rsn_pairwise=CCMP
logger_syslog=0
logger_stdout=0
"#,
        interface = cfg.interface,
        ctrl_dir = paths.hostapd_ctrl_dir.display(),
        ssid = cfg.ssid,
        hw_mode = hw_mode,
        channel = cfg.channel,
        country = cfg.country_code,
        deny_file = paths.deny_file.display(),
        passphrase = cfg.passphrase,
    )
}

/// Render the dnsmasq configuration. DNS serving is disabled with `port=0`;
/// the daemon only leases addresses.
pub fn render_dhcp_config(
    interface: &str,
    dhcp_start: Ipv4Addr,
    dhcp_end: Ipv4Addr,
    lease_duration: &str,
    ip_address: Ipv4Addr,
    log_path: &Path,
) -> String {
    let [dns1, dns2] = CLIENT_DNS_SERVERS;
    format!(
        r#"interface={interface}
bind-interfaces
dhcp-range={dhcp_start},{dhcp_end},{lease_duration}
dhcp-option=3,{ip_address}
dhcp-option=6,{dns1},{dns2}
port=0
log-dhcp
log-facility={log}
"#,
        log = log_path.display(),
    )
}

/// Replace the file at `path` with `contents`. Never appends.
pub fn write_config(path: &Path, contents: &str) -> HotspotResult<()> {
    let to_err = |source: std::io::Error| HotspotError::ConfigWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(to_err(e)),
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(to_err)?;
    }
    std::fs::write(path, contents).map_err(to_err)?;

    tracing::debug!(path = %path.display(), "Wrote config file");
    Ok(())
}

//! Shared state types for the hotspot controller

use super::error::{HotspotError, HotspotResult};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::command::RetryPolicy;

pub const DEFAULT_INTERFACE: &str = "wlan0";
pub const DEFAULT_AP_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 8, 1);
pub const DEFAULT_DHCP_RANGE: &str = "192.168.8.100,192.168.8.200,12h";
pub const DEFAULT_CHANNEL: u8 = 6;
pub const DEFAULT_COUNTRY_CODE: &str = "US";

/// Lifecycle state of the hotspot session
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Inactive,
    Starting,
    Active,
    Stopping,
    Failed,
}

/// Address pool handed out by the DHCP daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    pub lease: String,
}

impl fmt::Display for DhcpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.start, self.end, self.lease)
    }
}

impl FromStr for DhcpRange {
    type Err = HotspotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let [start, end, lease] = parts.as_slice() else {
            return Err(HotspotError::InvalidConfig(format!(
                "DHCP range '{}' must be '<start>,<end>,<lease>'",
                s
            )));
        };
        Ok(Self {
            start: parse_ipv4(start)?,
            end: parse_ipv4(end)?,
            lease: (*lease).to_string(),
        })
    }
}

pub fn parse_ipv4(value: &str) -> HotspotResult<Ipv4Addr> {
    value
        .trim()
        .parse()
        .map_err(|_| HotspotError::InvalidConfig(format!("'{}' is not an IPv4 address", value)))
}

/// Everything needed to bring up one hotspot session.
///
/// Owned by the caller; the lifecycle only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotspotConfig {
    pub interface: String,
    pub ssid: String,
    pub passphrase: String,
    pub ip_address: Ipv4Addr,
    pub dhcp_start: Ipv4Addr,
    pub dhcp_end: Ipv4Addr,
    pub lease_duration: String,
    pub channel: u8,
    pub country_code: String,
}

impl HotspotConfig {
    pub fn dhcp_range(&self) -> DhcpRange {
        DhcpRange {
            start: self.dhcp_start,
            end: self.dhcp_end,
            lease: self.lease_duration.clone(),
        }
    }

    /// The AP address with its /24 prefix, as assigned to the interface.
    pub fn ap_cidr(&self) -> Ipv4Net {
        Ipv4Net::new(self.ip_address, 24).unwrap_or_else(|_| Ipv4Net::from(self.ip_address))
    }

    /// The /24 network the hotspot serves.
    pub fn subnet(&self) -> Ipv4Net {
        self.ap_cidr().trunc()
    }

    /// Full validation performed before any mutation.
    pub fn validate(&self) -> HotspotResult<()> {
        validate_credentials(&self.ssid, &self.passphrase)?;
        if self.interface.trim().is_empty() {
            return Err(HotspotError::InvalidConfig(
                "interface must be set".to_string(),
            ));
        }
        validate_dhcp(self.ip_address, &self.dhcp_range())
    }
}

/// Longest SSID hostapd accepts, in bytes.
pub const MAX_SSID_LEN: usize = 32;
/// WPA-PSK passphrase length bounds (a 64-char value would be a raw PSK).
pub const MIN_PASSPHRASE_LEN: usize = 8;
pub const MAX_PASSPHRASE_LEN: usize = 63;

/// Check an SSID/passphrase pair before it is written into the hostapd
/// key=value file. Control characters would start a new config line.
pub fn validate_credentials(ssid: &str, passphrase: &str) -> HotspotResult<()> {
    if ssid.is_empty() || passphrase.is_empty() {
        return Err(HotspotError::InvalidConfig(
            "SSID and passphrase must be set".to_string(),
        ));
    }
    if ssid.len() > MAX_SSID_LEN {
        return Err(HotspotError::InvalidConfig(format!(
            "SSID must be at most {} bytes",
            MAX_SSID_LEN
        )));
    }
    if ssid.chars().any(char::is_control) {
        return Err(HotspotError::InvalidConfig(
            "SSID must not contain control characters".to_string(),
        ));
    }
    if !(MIN_PASSPHRASE_LEN..=MAX_PASSPHRASE_LEN).contains(&passphrase.len()) {
        return Err(HotspotError::InvalidConfig(format!(
            "passphrase must be {} to {} characters",
            MIN_PASSPHRASE_LEN, MAX_PASSPHRASE_LEN
        )));
    }
    if !passphrase.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
        return Err(HotspotError::InvalidConfig(
            "passphrase must be printable ASCII".to_string(),
        ));
    }
    Ok(())
}

/// Check that the AP address and DHCP pool form a usable private /24.
pub fn validate_dhcp(ip: Ipv4Addr, range: &DhcpRange) -> HotspotResult<()> {
    for addr in [ip, range.start, range.end] {
        if !addr.is_private() {
            return Err(HotspotError::InvalidConfig(format!(
                "{} is not in a private address range",
                addr
            )));
        }
    }

    if !same_slash24(ip, range.start) || !same_slash24(range.start, range.end) {
        return Err(HotspotError::InvalidConfig(
            "All addresses must be in the same /24 subnet".to_string(),
        ));
    }

    if u32::from(range.start) >= u32::from(range.end) {
        return Err(HotspotError::InvalidConfig(
            "DHCP start must be less than end".to_string(),
        ));
    }

    let lease = range.lease.trim();
    if lease.is_empty() || lease.contains([',', ' ', '\n']) {
        return Err(HotspotError::InvalidConfig(format!(
            "Invalid lease duration '{}'",
            range.lease
        )));
    }

    Ok(())
}

fn same_slash24(a: Ipv4Addr, b: Ipv4Addr) -> bool {
    a.octets()[..3] == b.octets()[..3]
}

/// Host file locations touched by the orchestrator
#[derive(Debug, Clone)]
pub struct HostPaths {
    pub ap_config: PathBuf,
    pub dhcp_config: PathBuf,
    pub dhcp_log: PathBuf,
    pub dhcp_leases: PathBuf,
    pub resolv_conf: PathBuf,
    pub deny_file: PathBuf,
    pub hostapd_ctrl_dir: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            ap_config: PathBuf::from("/etc/hostapd/hostapd.conf"),
            dhcp_config: PathBuf::from("/etc/dnsmasq.d/deck-hotspot.conf"),
            dhcp_log: PathBuf::from("/var/log/deck-hotspot-dnsmasq.log"),
            dhcp_leases: PathBuf::from("/var/lib/misc/dnsmasq.leases"),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            deny_file: PathBuf::from("/etc/hostapd/hostapd.deny"),
            hostapd_ctrl_dir: PathBuf::from("/var/run/hostapd"),
        }
    }
}

/// Timing knobs for the lifecycle
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    pub address_retry: RetryPolicy,
    pub dhcp_retry: RetryPolicy,
    /// Wait after launching the DHCP daemon before checking it is alive.
    pub dhcp_settle: Duration,
    pub tracked_services: Vec<String>,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            address_retry: RetryPolicy::new(2, Duration::from_secs(1)),
            dhcp_retry: RetryPolicy::new(2, Duration::from_secs(1)).with_backoff(2.0),
            dhcp_settle: Duration::from_secs(1),
            tracked_services: vec!["NetworkManager".to_string(), "iwd".to_string()],
        }
    }
}

/// Serializable status view (for IPC)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotspotStatus {
    pub state: SessionState,
    pub ap_running: bool,
    pub radio_blocked: bool,
    pub interface: String,
    pub ssid: Option<String>,
    pub ip_address: Option<String>,
}

#[cfg(test)]
pub(crate) fn sample_config() -> HotspotConfig {
    HotspotConfig {
        interface: "wlan0".to_string(),
        ssid: "Deck-AP".to_string(),
        passphrase: "Passw0rd1".to_string(),
        ip_address: Ipv4Addr::new(192, 168, 8, 1),
        dhcp_start: Ipv4Addr::new(192, 168, 8, 100),
        dhcp_end: Ipv4Addr::new(192, 168, 8, 200),
        lease_duration: "12h".to_string(),
        channel: DEFAULT_CHANNEL,
        country_code: DEFAULT_COUNTRY_CODE.to_string(),
    }
}

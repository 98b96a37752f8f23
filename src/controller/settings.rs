//! Persistent hotspot settings
//!
//! Stored as JSON next to the daemon's other state. The file may hold the
//! hotspot passphrase, so it is written with mode 0600 and replaced
//! atomically.

use super::state::{
    validate_credentials, validate_dhcp, DhcpRange, HotspotConfig, DEFAULT_AP_IP,
    DEFAULT_DHCP_RANGE, MAX_SSID_LEN,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Default path for the settings file
pub const SETTINGS_PATH: &str = "/var/lib/deck-hotspot/settings.json";

/// Unambiguous characters for generated passphrases (no 0/O, 1/l/I).
const PASSPHRASE_CHARSET: &[u8] = b"abcdefghjkmnpqrstuvwxyzABCDEFGHJKMNPQRSTUVWXYZ23456789";
const PASSPHRASE_LEN: usize = 8;

const HOSTNAME_PATH: &str = "/proc/sys/kernel/hostname";
const FALLBACK_SSID: &str = "deck-hotspot";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub ssid: String,
    pub passphrase: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotspotSettings {
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub always_use_stored_credentials: bool,
    #[serde(default = "default_ip_address")]
    pub ip_address: Ipv4Addr,
    /// `<start>,<end>,<lease>`
    #[serde(default = "default_dhcp_range")]
    pub dhcp_range: String,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_ip_address() -> Ipv4Addr {
    DEFAULT_AP_IP
}

fn default_dhcp_range() -> String {
    DEFAULT_DHCP_RANGE.to_string()
}

fn default_version() -> u32 {
    1
}

impl Default for HotspotSettings {
    fn default() -> Self {
        Self {
            ssid: None,
            passphrase: None,
            always_use_stored_credentials: false,
            ip_address: default_ip_address(),
            dhcp_range: default_dhcp_range(),
            version: default_version(),
        }
    }
}

/// Byte positions of a v4 UUID that carry the version and variant bits.
const UUID_FIXED_BYTES: [usize; 2] = [6, 8];

/// Random passphrase drawn from [`PASSPHRASE_CHARSET`].
pub fn generate_passphrase() -> String {
    uuid::Uuid::new_v4()
        .as_bytes()
        .iter()
        .enumerate()
        .filter(|(i, _)| !UUID_FIXED_BYTES.contains(i))
        .take(PASSPHRASE_LEN)
        .map(|(_, b)| PASSPHRASE_CHARSET[*b as usize % PASSPHRASE_CHARSET.len()] as char)
        .collect()
}

/// The system hostname, used as the failsafe SSID.
pub fn hostname() -> String {
    fs::read_to_string(HOSTNAME_PATH)
        .ok()
        .map(|name| ssid_from_hostname(name.trim()))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_SSID.to_string())
}

/// Cut a hostname down to a valid SSID length on a char boundary.
fn ssid_from_hostname(name: &str) -> String {
    let mut end = name.len().min(MAX_SSID_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

impl HotspotSettings {
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read settings file")?;
        let settings: Self =
            serde_json::from_str(&content).context("Failed to parse settings file")?;

        tracing::info!(
            path = %path.display(),
            always_use_stored_credentials = settings.always_use_stored_credentials,
            ip = %settings.ip_address,
            dhcp_range = %settings.dhcp_range,
            "Loaded hotspot settings"
        );
        Ok(settings)
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create settings directory")?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &content).context("Failed to write settings file")?;

        let mut perms = fs::metadata(&temp_path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&temp_path, perms)?;

        fs::rename(&temp_path, path).context("Failed to finalize settings file")?;

        tracing::info!(path = %path.display(), "Saved hotspot settings");
        Ok(())
    }

    fn stored_credentials(&self) -> Option<Credentials> {
        match (&self.ssid, &self.passphrase) {
            (Some(ssid), Some(passphrase)) if !ssid.is_empty() && !passphrase.is_empty() => {
                Some(Credentials {
                    ssid: ssid.clone(),
                    passphrase: passphrase.clone(),
                })
            }
            _ => None,
        }
    }

    /// Pick the credentials for a new session.
    ///
    /// Returns `true` alongside the credentials when the settings were changed
    /// and need saving: stored credentials were requested but missing, so a
    /// failsafe pair was generated and stored.
    pub fn resolve_credentials(&mut self, hostname: &str) -> (Credentials, bool) {
        if !self.always_use_stored_credentials {
            return (
                Credentials {
                    ssid: hostname.to_string(),
                    passphrase: generate_passphrase(),
                },
                false,
            );
        }

        if let Some(stored) = self.stored_credentials() {
            return (stored, false);
        }

        tracing::warn!("Stored credentials missing, generating failsafe");
        let generated = Credentials {
            ssid: hostname.to_string(),
            passphrase: generate_passphrase(),
        };
        self.ssid = Some(generated.ssid.clone());
        self.passphrase = Some(generated.passphrase.clone());
        (generated, true)
    }

    /// Replace the session credentials. The pair is only stored when
    /// `always_use` is set; otherwise the stored pair is left as is and only
    /// the flag is cleared.
    pub fn update_credentials(
        &mut self,
        ssid: &str,
        passphrase: &str,
        always_use: bool,
    ) -> Result<Credentials> {
        validate_credentials(ssid, passphrase)?;

        self.always_use_stored_credentials = always_use;
        if always_use {
            self.ssid = Some(ssid.to_string());
            self.passphrase = Some(passphrase.to_string());
        }

        tracing::info!(ssid = %ssid, always_use, "Updated credentials");
        Ok(Credentials {
            ssid: ssid.to_string(),
            passphrase: passphrase.to_string(),
        })
    }

    /// Validate and store a new AP address and DHCP pool. Nothing changes
    /// when validation fails.
    pub fn update_dhcp_range(
        &mut self,
        ip_address: Ipv4Addr,
        start: Ipv4Addr,
        end: Ipv4Addr,
        lease: &str,
    ) -> Result<()> {
        let range = DhcpRange {
            start,
            end,
            lease: lease.to_string(),
        };
        validate_dhcp(ip_address, &range)?;

        self.ip_address = ip_address;
        self.dhcp_range = range.to_string();
        tracing::info!(ip = %self.ip_address, dhcp_range = %self.dhcp_range, "Updated DHCP settings");
        Ok(())
    }

    pub fn dhcp(&self) -> Result<DhcpRange> {
        self.dhcp_range
            .parse()
            .with_context(|| format!("Stored DHCP range '{}' is invalid", self.dhcp_range))
    }

    pub fn to_hotspot_config(
        &self,
        credentials: &Credentials,
        interface: &str,
        channel: u8,
        country_code: &str,
    ) -> Result<HotspotConfig> {
        let range = self.dhcp()?;
        Ok(HotspotConfig {
            interface: interface.to_string(),
            ssid: credentials.ssid.clone(),
            passphrase: credentials.passphrase.clone(),
            ip_address: self.ip_address,
            dhcp_start: range.start,
            dhcp_end: range.end,
            lease_duration: range.lease,
            channel,
            country_code: country_code.to_string(),
        })
    }
}

//! Hotspot session state machine
//!
//! `start` captures the station configuration, hands the radio to hostapd and
//! dnsmasq, and records everything needed to undo that in a [`Session`].
//! `stop` replays the session in reverse. The restore path never gives up
//! part way: each step is attempted and failures are collected.

use super::command::{CommandExecutor, RetryPolicy};
use super::config_gen::{render_ap_config, render_dhcp_config, write_config};
use super::error::{HotspotError, HotspotResult};
use super::firewall::FirewallConfigurator;
use super::interface::{InterfaceController, WifiMode};
use super::services::{ServiceStateSet, ServiceSupervisor, AP_DAEMON, DHCP_DAEMON};
use super::snapshot::NetworkSnapshot;
use super::state::{HostPaths, HotspotConfig, HotspotStatus, LifecycleOptions, SessionState};
use std::sync::Arc;
use std::time::Duration;

/// Everything captured for one hotspot activation.
#[derive(Debug, Clone)]
pub struct Session {
    pub config: HotspotConfig,
    pub snapshot: NetworkSnapshot,
    pub services: ServiceStateSet,
}

pub struct HotspotLifecycle {
    exec: Arc<dyn CommandExecutor>,
    paths: HostPaths,
    options: LifecycleOptions,
    state: SessionState,
    session: Option<Session>,
}

/// Log a failed non-fatal start step and carry on; fatal errors propagate.
fn tolerate(step: &str, result: HotspotResult<()>) -> HotspotResult<()> {
    match result {
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            tracing::warn!(step, error = %e, "Start step failed, continuing");
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

impl HotspotLifecycle {
    pub fn new(exec: Arc<dyn CommandExecutor>, paths: HostPaths, options: LifecycleOptions) -> Self {
        Self {
            exec,
            paths,
            options,
            state: SessionState::Inactive,
            session: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    #[cfg(test)]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    fn interfaces(&self) -> InterfaceController<'_> {
        InterfaceController::new(self.exec.as_ref(), self.options.address_retry)
    }

    fn supervisor(&self) -> ServiceSupervisor<'_> {
        ServiceSupervisor::new(
            self.exec.as_ref(),
            self.options.dhcp_retry,
            self.options.dhcp_settle,
        )
    }

    /// Bring up the access point described by `cfg`.
    ///
    /// Rejected with [`HotspotError::AlreadyActive`] unless the session is
    /// inactive. A fatal error after the network snapshot was taken triggers
    /// the same best-effort restore as [`stop`](Self::stop).
    pub async fn start(&mut self, cfg: &HotspotConfig) -> HotspotResult<()> {
        if self.state != SessionState::Inactive {
            tracing::warn!(state = ?self.state, "Refusing to start a second hotspot session");
            return Err(HotspotError::AlreadyActive);
        }

        tracing::info!(interface = %cfg.interface, ssid = %cfg.ssid, ip = %cfg.ip_address, "Starting hotspot");
        self.state = SessionState::Starting;

        let mut partial = None;
        match self.run_start(cfg, &mut partial).await {
            Ok(()) => {
                self.session = partial;
                self.state = SessionState::Active;
                self.log_assigned_address(&cfg.interface).await;
                tracing::info!("Hotspot is active");
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to start hotspot");
                if let Some(session) = partial {
                    self.state = SessionState::Failed;
                    let failed = self.restore(&session).await;
                    if !failed.is_empty() {
                        tracing::warn!(steps = ?failed, "Restore after failed start was incomplete");
                    }
                }
                self.state = SessionState::Inactive;
                Err(err)
            }
        }
    }

    async fn run_start(&self, cfg: &HotspotConfig, slot: &mut Option<Session>) -> HotspotResult<()> {
        cfg.validate()?;

        let exec = self.exec.as_ref();
        let supervisor = self.supervisor();
        let interfaces = self.interfaces();

        supervisor.ensure_binaries(&[AP_DAEMON, DHCP_DAEMON]).await?;

        let firewall = FirewallConfigurator::new(exec);
        if let Err(e) = firewall.ensure_dhcp_allowed(cfg.ip_address).await {
            tracing::warn!(error = %e, "Failed to allow DHCP through the firewall");
        }
        if let Err(e) = firewall.ensure_broadcast_allowed(cfg.subnet()).await {
            tracing::warn!(error = %e, "Failed to allow broadcast traffic through the firewall");
        }

        tolerate("link-up", interfaces.ensure_up(&cfg.interface).await)?;

        let snapshot = NetworkSnapshot::capture(exec, &cfg.interface, &self.paths.resolv_conf).await;
        let session = slot.insert(Session {
            config: cfg.clone(),
            snapshot,
            services: ServiceStateSet::default(),
        });
        session.services = supervisor
            .capture_and_stop(&self.options.tracked_services)
            .await;

        tolerate(
            "access-point-mode",
            interfaces.set_mode(&cfg.interface, WifiMode::AccessPoint).await,
        )?;
        tolerate(
            "static-address",
            interfaces
                .assign_static_address(&cfg.interface, cfg.ap_cidr())
                .await,
        )?;

        tolerate(
            "ap-config",
            write_config(&self.paths.ap_config, &render_ap_config(cfg, &self.paths)),
        )?;
        supervisor.start_ap_daemon(&self.paths.ap_config).await?;

        let dhcp_config = render_dhcp_config(
            &cfg.interface,
            cfg.dhcp_start,
            cfg.dhcp_end,
            &cfg.lease_duration,
            cfg.ip_address,
            &self.paths.dhcp_log,
        );
        tolerate("dhcp-config", write_config(&self.paths.dhcp_config, &dhcp_config))?;
        supervisor.start_dhcp_daemon(&self.paths.dhcp_config).await?;

        Ok(())
    }

    async fn log_assigned_address(&self, interface: &str) {
        match self.interfaces().addresses(interface).await {
            Ok(addrs) => tracing::info!(interface = %interface, addresses = ?addrs, "Hotspot address"),
            Err(e) => tracing::warn!(interface = %interface, error = %e, "Could not read hotspot address"),
        }
    }

    /// Tear down the access point and restore the captured configuration.
    ///
    /// A no-op unless the session is active. The session always ends
    /// `Inactive`; failed steps are reported as
    /// [`HotspotError::RestoreIncomplete`].
    pub async fn stop(&mut self) -> HotspotResult<()> {
        if self.state != SessionState::Active {
            tracing::debug!(state = ?self.state, "Hotspot not active, nothing to stop");
            return Ok(());
        }

        tracing::info!("Stopping hotspot");
        self.state = SessionState::Stopping;

        let failed = match self.session.take() {
            Some(session) => self.restore(&session).await,
            None => Vec::new(),
        };

        self.state = SessionState::Inactive;
        if failed.is_empty() {
            tracing::info!("Hotspot stopped");
            Ok(())
        } else {
            let err = HotspotError::RestoreIncomplete(failed);
            tracing::warn!(error = %err, "Hotspot stopped with incomplete restore");
            Err(err)
        }
    }

    /// Undo a (possibly partial) session. Returns the names of failed steps.
    async fn restore(&self, session: &Session) -> Vec<String> {
        let exec = self.exec.as_ref();
        let supervisor = self.supervisor();
        let interfaces = InterfaceController::new(exec, RetryPolicy::new(1, Duration::ZERO));
        let interface = session.config.interface.as_str();
        let mut failed = Vec::new();

        let mut record = |step: &str, result: HotspotResult<()>| {
            if let Err(e) = result {
                tracing::warn!(step, error = %e, "Restore step failed");
                match e {
                    HotspotError::RestoreIncomplete(steps) => failed.extend(steps),
                    _ => failed.push(step.to_string()),
                }
            }
        };

        record("ap-daemon", supervisor.stop_ap_daemon().await);
        record("dhcp-daemon", supervisor.stop_dhcp_daemon().await);
        record(
            "managed-mode",
            interfaces.set_mode(interface, WifiMode::Managed).await,
        );
        record("link-up", interfaces.set_link(interface, true).await);
        record("flush", interfaces.flush_addresses(interface).await);
        record(
            "snapshot",
            session
                .snapshot
                .restore(exec, interface, &self.paths.resolv_conf)
                .await,
        );
        for service in session.services.iter() {
            tracing::info!(
                service = %service.name,
                was_active = service.was_active,
                "Restoring service"
            );
        }
        record(
            "services",
            supervisor.restart(&session.services.names()).await,
        );

        failed
    }

    /// Whether hostapd is running, regardless of session bookkeeping.
    pub async fn is_active(&self) -> bool {
        self.supervisor().is_process_running(AP_DAEMON).await
    }

    pub async fn is_radio_blocked(&self) -> bool {
        self.interfaces().is_radio_blocked().await
    }

    pub async fn status(&self, interface: &str) -> HotspotStatus {
        let config = self.session.as_ref().map(|s| &s.config);
        HotspotStatus {
            state: self.state,
            ap_running: self.is_active().await,
            radio_blocked: self.is_radio_blocked().await,
            interface: config.map_or_else(|| interface.to_string(), |c| c.interface.clone()),
            ssid: config.map(|c| c.ssid.clone()),
            ip_address: config.map(|c| c.ip_address.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::state::sample_config;
    use crate::controller::testing::FakeHost;
    use std::net::Ipv4Addr;
    use tempfile::{tempdir, TempDir};

    struct Harness {
        host: Arc<FakeHost>,
        lifecycle: HotspotLifecycle,
        dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let paths = HostPaths {
            ap_config: dir.path().join("hostapd.conf"),
            dhcp_config: dir.path().join("dnsmasq.conf"),
            dhcp_log: dir.path().join("dnsmasq.log"),
            dhcp_leases: dir.path().join("dnsmasq.leases"),
            resolv_conf: dir.path().join("resolv.conf"),
            deny_file: dir.path().join("hostapd.deny"),
            hostapd_ctrl_dir: dir.path().join("hostapd"),
        };
        let options = LifecycleOptions {
            address_retry: RetryPolicy::new(2, Duration::ZERO),
            dhcp_retry: RetryPolicy::new(2, Duration::ZERO),
            dhcp_settle: Duration::ZERO,
            ..LifecycleOptions::default()
        };
        let host = Arc::new(FakeHost::station());
        let lifecycle = HotspotLifecycle::new(host.clone(), paths, options);
        Harness {
            host,
            lifecycle,
            dir,
        }
    }

    #[tokio::test]
    async fn test_start_activates_access_point() {
        let mut h = harness();

        h.lifecycle.start(&sample_config()).await.unwrap();

        assert_eq!(h.lifecycle.state(), SessionState::Active);
        let link = h.host.with_state(|s| s.link_mut("wlan0").clone());
        assert_eq!(link.mode, WifiMode::AccessPoint);
        assert_eq!(link.addrs, vec!["192.168.8.1/24"]);

        let ap_conf = std::fs::read_to_string(h.dir.path().join("hostapd.conf")).unwrap();
        assert!(ap_conf.contains("ssid=Deck-AP\n"));
        assert!(ap_conf.contains("wpa_passphrase=Passw0rd1\n"));

        assert!(h.host.with_state(|s| s.processes.contains("dnsmasq")));
        assert!(h.lifecycle.is_active().await);
        assert!(h.host.with_state(|s| !s.services["NetworkManager"] && !s.services["iwd"]));
    }

    #[tokio::test]
    async fn test_start_order() {
        let mut h = harness();

        h.lifecycle.start(&sample_config()).await.unwrap();

        let pos = |c: &str| h.host.position(c).unwrap_or_else(|| panic!("{} not run", c));
        assert!(pos("which hostapd") < pos("systemctl is-active firewalld"));
        assert!(pos("ip link show wlan0") < pos("resolvectl dns wlan0"));
        assert!(pos("resolvectl dns wlan0") < pos("systemctl stop NetworkManager"));
        assert!(pos("systemctl stop iwd") < pos("iw dev wlan0 set type __ap"));
        assert!(pos("iw dev wlan0 set type __ap") < pos("ip addr add 192.168.8.1/24 dev wlan0"));
        assert!(pos("systemctl restart hostapd") < pos("pkill -x dnsmasq"));
    }

    #[tokio::test]
    async fn test_stop_order() {
        let mut h = harness();
        h.lifecycle.start(&sample_config()).await.unwrap();
        h.host.clear_log();

        h.lifecycle.stop().await.unwrap();

        let log = h.host.commands();
        let pos = |c: &str| h.host.position(c).unwrap_or_else(|| panic!("{} not run", c));
        let last = |c: &str| log.iter().rposition(|l| l == c).unwrap();
        assert!(pos("systemctl stop hostapd") < pos("pkill -x dnsmasq"));
        assert!(pos("pkill -x dnsmasq") < pos("iw dev wlan0 set type managed"));
        assert!(pos("iw dev wlan0 set type managed") < last("ip link set wlan0 up"));
        assert!(last("ip link set wlan0 up") < pos("ip addr flush dev wlan0"));
        assert!(pos("ip addr flush dev wlan0") < pos("ip addr add 10.0.0.5/24 dev wlan0"));
        assert!(
            pos("ip addr add 10.0.0.5/24 dev wlan0")
                < pos("ip route replace default via 10.0.0.1 dev wlan0")
        );
        assert!(
            pos("ip route replace default via 10.0.0.1 dev wlan0")
                < pos("systemctl restart NetworkManager")
        );
        assert!(pos("systemctl restart NetworkManager") < pos("systemctl restart iwd"));
        assert_eq!(log.last().map(String::as_str), Some("systemctl restart iwd"));
    }

    #[tokio::test]
    async fn test_stop_restores_station_config() {
        let mut h = harness();
        h.lifecycle.start(&sample_config()).await.unwrap();
        let captured = h.lifecycle.session().unwrap().snapshot.clone();
        assert_eq!(captured.ip, Some("10.0.0.5/24".parse().unwrap()));

        h.lifecycle.stop().await.unwrap();

        assert_eq!(h.lifecycle.state(), SessionState::Inactive);
        assert!(h.lifecycle.session().is_none());
        let (link, gateway) = h
            .host
            .with_state(|s| (s.link_mut("wlan0").clone(), s.gateway.clone()));
        assert_eq!(link.mode, WifiMode::Managed);
        assert!(link.up);
        assert_eq!(link.addrs, vec!["10.0.0.5/24"]);
        assert_eq!(gateway, Some((Ipv4Addr::new(10, 0, 0, 1), "wlan0".to_string())));
        assert_eq!(
            std::fs::read_to_string(h.dir.path().join("resolv.conf")).unwrap(),
            "nameserver 8.8.8.8\nnameserver 1.1.1.1\n"
        );
        assert!(h.host.ran("systemctl restart NetworkManager"));
        assert!(h.host.ran("systemctl restart iwd"));
        assert!(!h.lifecycle.is_active().await);
        assert!(h.host.with_state(|s| !s.processes.contains("dnsmasq")));
    }

    #[tokio::test]
    async fn test_stop_when_inactive_runs_nothing() {
        let mut h = harness();

        h.lifecycle.stop().await.unwrap();

        assert_eq!(h.lifecycle.state(), SessionState::Inactive);
        assert!(h.host.commands().is_empty());
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let mut h = harness();
        h.lifecycle.start(&sample_config()).await.unwrap();
        let snapshot = h.lifecycle.session().unwrap().snapshot.clone();
        h.host.clear_log();

        let err = h.lifecycle.start(&sample_config()).await.unwrap_err();

        assert!(matches!(err, HotspotError::AlreadyActive));
        assert_eq!(h.lifecycle.state(), SessionState::Active);
        assert_eq!(h.lifecycle.session().unwrap().snapshot, snapshot);
        assert!(h.host.commands().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_mutation() {
        let mut h = harness();
        let mut cfg = sample_config();
        cfg.ssid.clear();

        let err = h.lifecycle.start(&cfg).await.unwrap_err();

        assert!(matches!(err, HotspotError::InvalidConfig(_)));
        assert_eq!(h.lifecycle.state(), SessionState::Inactive);
        assert!(h.host.commands().is_empty());
    }

    #[tokio::test]
    async fn test_missing_dependency_aborts_before_mutation() {
        let mut h = harness();
        h.host.with_state(|s| {
            s.binaries.remove("hostapd");
        });

        let err = h.lifecycle.start(&sample_config()).await.unwrap_err();

        assert!(matches!(err, HotspotError::DependencyMissing(_)));
        assert_eq!(h.lifecycle.state(), SessionState::Inactive);
        assert_eq!(h.host.commands(), vec!["which hostapd"]);
    }

    #[tokio::test]
    async fn test_missing_interface_aborts_before_snapshot() {
        let mut h = harness();
        let mut cfg = sample_config();
        cfg.interface = "wlan9".to_string();

        let err = h.lifecycle.start(&cfg).await.unwrap_err();

        assert!(matches!(err, HotspotError::InterfaceNotFound(_)));
        assert_eq!(h.lifecycle.state(), SessionState::Inactive);
        assert!(!h.host.commands().iter().any(|c| c.starts_with("systemctl stop")));
    }

    #[tokio::test]
    async fn test_firewall_failure_is_not_fatal() {
        let mut h = harness();
        h.host.fail_on("firewall-cmd");

        h.lifecycle.start(&sample_config()).await.unwrap();

        assert_eq!(h.lifecycle.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_ap_daemon_failure_restores_network() {
        let mut h = harness();
        h.host.fail_on("systemctl restart hostapd");

        let err = h.lifecycle.start(&sample_config()).await.unwrap_err();

        assert!(matches!(err, HotspotError::ApDaemonFailed(_)));
        assert_eq!(h.lifecycle.state(), SessionState::Inactive);
        assert!(h.lifecycle.session().is_none());
        let link = h.host.with_state(|s| s.link_mut("wlan0").clone());
        assert_eq!(link.mode, WifiMode::Managed);
        assert_eq!(link.addrs, vec!["10.0.0.5/24"]);
        assert!(h.host.ran("systemctl restart NetworkManager"));
        assert!(!h.host.commands().iter().any(|c| c.starts_with("dnsmasq")));
    }

    #[tokio::test]
    async fn test_stop_continues_past_failures() {
        let mut h = harness();
        h.lifecycle.start(&sample_config()).await.unwrap();
        h.host.fail_on("iw dev wlan0 set type managed");
        h.host.fail_on("ip route replace");

        let err = h.lifecycle.stop().await.unwrap_err();

        match err {
            HotspotError::RestoreIncomplete(steps) => {
                assert_eq!(steps, vec!["managed-mode", "gateway"]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(h.lifecycle.state(), SessionState::Inactive);
        assert!(h.host.ran("systemctl restart iwd"));
        assert_eq!(
            std::fs::read_to_string(h.dir.path().join("resolv.conf")).unwrap(),
            "nameserver 8.8.8.8\nnameserver 1.1.1.1\n"
        );
    }

    #[tokio::test]
    async fn test_status_reports_session() {
        let mut h = harness();
        h.lifecycle.start(&sample_config()).await.unwrap();

        let status = h.lifecycle.status("wlan0").await;

        assert_eq!(status.state, SessionState::Active);
        assert!(status.ap_running);
        assert!(!status.radio_blocked);
        assert_eq!(status.ssid.as_deref(), Some("Deck-AP"));
        assert_eq!(status.ip_address.as_deref(), Some("192.168.8.1"));
    }
}

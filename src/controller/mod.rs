//! Hotspot controller - AP lifecycle, settings and the daemon that owns them

pub mod clients;
pub mod command;
pub mod config_gen;
pub mod error;
pub mod firewall;
pub mod interface;
pub mod ipc;
pub mod lifecycle;
pub mod services;
pub mod settings;
pub mod snapshot;
pub mod state;
#[cfg(test)]
mod testing;

pub use state::{HostPaths, LifecycleOptions};

use anyhow::{Context, Result};
use command::{CommandExecutor, SystemExecutor};
use ipc::{IpcRequest, IpcResponse};
use lifecycle::HotspotLifecycle;
use settings::{Credentials, HotspotSettings};
use state::{HotspotConfig, SessionState};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::UnixListener;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::{mpsc, Mutex};

/// Default path of the daemon's control socket
pub const SOCKET_PATH: &str = "/run/deck-hotspot.sock";

/// Daemon configuration
pub struct DaemonConfig {
    pub interface: String,
    pub socket_path: PathBuf,
    pub settings_path: PathBuf,
    pub channel: u8,
    pub country_code: String,
    pub paths: HostPaths,
    pub options: LifecycleOptions,
}

struct SettingsState {
    settings: HotspotSettings,
    /// Credentials for the next start, resolved once and kept until changed.
    credentials: Option<Credentials>,
}

/// Shared application state
pub struct AppState {
    pub config: DaemonConfig,
    pub exec: Arc<dyn CommandExecutor>,
    /// Held for the whole of a start or stop; `try_lock` failing means busy.
    pub lifecycle: Mutex<HotspotLifecycle>,
    settings: StdMutex<SettingsState>,
    pub command_tx: mpsc::Sender<ControlCommand>,
}

/// Commands that can be sent to the control loop
#[derive(Debug, Clone)]
pub enum ControlCommand {
    Shutdown,
}

impl AppState {
    pub fn new(
        config: DaemonConfig,
        exec: Arc<dyn CommandExecutor>,
        settings: HotspotSettings,
        command_tx: mpsc::Sender<ControlCommand>,
    ) -> Self {
        let lifecycle =
            HotspotLifecycle::new(exec.clone(), config.paths.clone(), config.options.clone());
        Self {
            config,
            exec,
            lifecycle: Mutex::new(lifecycle),
            settings: StdMutex::new(SettingsState {
                settings,
                credentials: None,
            }),
            command_tx,
        }
    }

    fn settings_state(&self) -> std::sync::MutexGuard<'_, SettingsState> {
        self.settings.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn settings(&self) -> HotspotSettings {
        self.settings_state().settings.clone()
    }

    /// The credentials the next start will use, generating them on first use.
    pub fn current_credentials(&self) -> Result<Credentials> {
        let mut guard = self.settings_state();
        if let Some(credentials) = &guard.credentials {
            return Ok(credentials.clone());
        }

        let (credentials, changed) = guard.settings.resolve_credentials(&settings::hostname());
        if changed {
            guard
                .settings
                .save_to(&self.config.settings_path)
                .context("Failed to persist generated credentials")?;
        }
        guard.credentials = Some(credentials.clone());
        Ok(credentials)
    }

    pub fn update_credentials(
        &self,
        ssid: &str,
        passphrase: &str,
        always_use: bool,
    ) -> Result<Credentials> {
        let mut guard = self.settings_state();
        let mut next = guard.settings.clone();
        let credentials = next.update_credentials(ssid, passphrase, always_use)?;
        next.save_to(&self.config.settings_path)?;
        guard.settings = next;
        guard.credentials = Some(credentials.clone());
        Ok(credentials)
    }

    pub fn update_dhcp_range(
        &self,
        ip_address: Ipv4Addr,
        start: Ipv4Addr,
        end: Ipv4Addr,
        lease: &str,
    ) -> Result<()> {
        let mut guard = self.settings_state();
        let mut next = guard.settings.clone();
        next.update_dhcp_range(ip_address, start, end, lease)?;
        next.save_to(&self.config.settings_path)?;
        guard.settings = next;
        Ok(())
    }

    /// Hotspot configuration for a start request.
    pub fn session_config(&self) -> Result<HotspotConfig> {
        let credentials = self.current_credentials()?;
        self.settings().to_hotspot_config(
            &credentials,
            &self.config.interface,
            self.config.channel,
            &self.config.country_code,
        )
    }
}

/// Run the daemon
pub async fn run_daemon(config: DaemonConfig) -> Result<()> {
    tracing::info!(
        interface = %config.interface,
        socket = %config.socket_path.display(),
        settings = %config.settings_path.display(),
        "Initializing hotspot controller"
    );

    let settings = HotspotSettings::load_from(&config.settings_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load settings, using defaults");
        HotspotSettings::default()
    });

    let (command_tx, mut command_rx) = mpsc::channel::<ControlCommand>(8);
    let exec: Arc<dyn CommandExecutor> = Arc::new(SystemExecutor);
    let app_state = Arc::new(AppState::new(config, exec, settings, command_tx));

    let socket_path = app_state.config.socket_path.clone();
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
    tracing::info!(path = %socket_path.display(), "IPC server listening");

    let ipc_state = app_state.clone();
    let ipc_handle = tokio::spawn(async move { ipc::run_ipc_server(listener, ipc_state).await });

    let mut sigterm = unix_signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        Some(ControlCommand::Shutdown) = command_rx.recv() => {
            tracing::info!("Shutdown requested");
        }
        _ = signal::ctrl_c() => {
            tracing::info!("Received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }

    ipc_handle.abort();

    tracing::info!("Cleaning up...");
    let mut lifecycle = app_state.lifecycle.lock().await;
    if lifecycle.state() == SessionState::Active {
        if let Err(e) = lifecycle.stop().await {
            tracing::warn!(error = %e, "Hotspot did not stop cleanly");
        }
    }
    let _ = std::fs::remove_file(&socket_path);

    Ok(())
}

fn expect_ok(response: IpcResponse) -> Result<IpcResponse> {
    match response {
        IpcResponse::Error(e) => anyhow::bail!("Daemon error: {}", e),
        IpcResponse::Busy => anyhow::bail!("Daemon is busy starting or stopping the hotspot"),
        other => Ok(other),
    }
}

/// Send a request and print the daemon's answer (for CLI)
pub async fn run_client(socket_path: &Path, request: IpcRequest) -> Result<()> {
    let response = ipc::request(socket_path, &request)
        .await
        .context("Is the daemon running?")?;

    match expect_ok(response)? {
        IpcResponse::Status(status) => {
            println!("Hotspot Status");
            println!("==============");
            println!("State: {:?}", status.state);
            println!("Interface: {}", status.interface);
            println!("AP daemon running: {}", status.ap_running);
            if status.radio_blocked {
                println!("Radio: blocked (rfkill)");
            }
            if let Some(ssid) = &status.ssid {
                println!("SSID: {}", ssid);
            }
            if let Some(ip) = &status.ip_address {
                println!("Address: {}", ip);
            }
        }
        IpcResponse::Settings(view) => {
            println!("SSID: {}", view.ssid);
            println!("Passphrase: {}", view.passphrase);
            println!("Always use stored credentials: {}", view.always_use_stored_credentials);
            println!("Address: {}", view.ip_address);
            println!("DHCP range: {}", view.dhcp_range);
        }
        IpcResponse::Clients(clients) => {
            println!("Connected clients: {}", clients.len());
            for client in &clients {
                println!(
                    "  - {} ip={} host={} signal={}",
                    client.mac,
                    client.ip.as_deref().unwrap_or("-"),
                    client.hostname.as_deref().unwrap_or("-"),
                    client
                        .signal_strength
                        .map(|s| format!("{} dBm", s))
                        .unwrap_or_else(|| "-".to_string())
                );
            }
        }
        IpcResponse::BanList(macs) => {
            println!("Banned clients: {}", macs.len());
            for mac in &macs {
                println!("  - {}", mac);
            }
        }
        IpcResponse::Unbanned(removed) => {
            if removed {
                println!("Removed from ban list");
            } else {
                println!("MAC was not on the ban list");
            }
        }
        IpcResponse::Ok => println!("OK"),
        IpcResponse::Busy | IpcResponse::Error(_) => {}
    }
    Ok(())
}

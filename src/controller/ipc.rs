//! IPC server for CLI client communication
//!
//! One JSON request per line, one JSON response per line.

use super::clients::{ClientManager, ConnectedClient};
use super::settings::Credentials;
use super::state::HotspotStatus;
use super::{AppState, ControlCommand};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// IPC request from client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IpcRequest {
    Start,
    Stop,
    Status,
    GetSettings,
    UpdateCredentials {
        ssid: String,
        passphrase: String,
        #[serde(default)]
        always_use: bool,
    },
    UpdateDhcpRange {
        ip_address: Ipv4Addr,
        start: Ipv4Addr,
        end: Ipv4Addr,
        #[serde(default = "default_lease")]
        lease: String,
    },
    Clients,
    BanList,
    Ban { mac: String },
    Unban { mac: String },
    Shutdown,
}

fn default_lease() -> String {
    "12h".to_string()
}

impl IpcRequest {
    /// Request kind for logging; payloads may carry a passphrase.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Status => "status",
            Self::GetSettings => "get-settings",
            Self::UpdateCredentials { .. } => "update-credentials",
            Self::UpdateDhcpRange { .. } => "update-dhcp-range",
            Self::Clients => "clients",
            Self::BanList => "ban-list",
            Self::Ban { .. } => "ban",
            Self::Unban { .. } => "unban",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Settings as shown to clients: the credentials the next start will use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsView {
    pub ssid: String,
    pub passphrase: String,
    pub always_use_stored_credentials: bool,
    pub ip_address: Ipv4Addr,
    pub dhcp_range: String,
}

/// IPC response to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IpcResponse {
    Status(HotspotStatus),
    Settings(SettingsView),
    Clients(Vec<ConnectedClient>),
    BanList(Vec<String>),
    Unbanned(bool),
    Ok,
    /// Another start/stop is in flight.
    Busy,
    Error(String),
}

/// Run the IPC server
pub async fn run_ipc_server(listener: UnixListener, state: Arc<AppState>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, state).await {
                        tracing::warn!(error = %e, "IPC client error");
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept IPC connection");
            }
        }
    }
}

async fn handle_client(stream: UnixStream, state: Arc<AppState>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }

        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => handle_request(&state, request).await,
            Err(e) => IpcResponse::Error(format!("Invalid request: {}", e)),
        };

        let json = serde_json::to_string(&response)? + "\n";
        writer.write_all(json.as_bytes()).await?;
    }

    Ok(())
}

fn settings_view(state: &AppState, credentials: Credentials) -> IpcResponse {
    let settings = state.settings();
    IpcResponse::Settings(SettingsView {
        ssid: credentials.ssid,
        passphrase: credentials.passphrase,
        always_use_stored_credentials: settings.always_use_stored_credentials,
        ip_address: settings.ip_address,
        dhcp_range: settings.dhcp_range,
    })
}

fn error_response(e: impl std::fmt::Display) -> IpcResponse {
    IpcResponse::Error(e.to_string())
}

pub async fn handle_request(state: &AppState, request: IpcRequest) -> IpcResponse {
    tracing::debug!(request = request.name(), "Handling IPC request");

    match request {
        IpcRequest::Start => {
            let Ok(mut lifecycle) = state.lifecycle.try_lock() else {
                return IpcResponse::Busy;
            };
            let config = match state.session_config() {
                Ok(config) => config,
                Err(e) => return error_response(format!("{:#}", e)),
            };
            match lifecycle.start(&config).await {
                Ok(()) => IpcResponse::Ok,
                Err(e) => error_response(e),
            }
        }
        IpcRequest::Stop => {
            let Ok(mut lifecycle) = state.lifecycle.try_lock() else {
                return IpcResponse::Busy;
            };
            match lifecycle.stop().await {
                Ok(()) => IpcResponse::Ok,
                Err(e) => error_response(e),
            }
        }
        IpcRequest::Status => {
            let Ok(lifecycle) = state.lifecycle.try_lock() else {
                return IpcResponse::Busy;
            };
            IpcResponse::Status(lifecycle.status(&state.config.interface).await)
        }
        IpcRequest::GetSettings => match state.current_credentials() {
            Ok(credentials) => settings_view(state, credentials),
            Err(e) => error_response(format!("{:#}", e)),
        },
        IpcRequest::UpdateCredentials {
            ssid,
            passphrase,
            always_use,
        } => match state.update_credentials(&ssid, &passphrase, always_use) {
            Ok(credentials) => settings_view(state, credentials),
            Err(e) => error_response(format!("{:#}", e)),
        },
        IpcRequest::UpdateDhcpRange {
            ip_address,
            start,
            end,
            lease,
        } => match state
            .update_dhcp_range(ip_address, start, end, &lease)
            .and_then(|()| state.current_credentials())
        {
            Ok(credentials) => settings_view(state, credentials),
            Err(e) => error_response(format!("{:#}", e)),
        },
        IpcRequest::Clients => {
            match ClientManager::new(state.exec.as_ref(), &state.config.paths, &state.config.interface)
                .connected()
                .await
            {
                Ok(clients) => IpcResponse::Clients(clients),
                Err(e) => error_response(e),
            }
        }
        IpcRequest::BanList => {
            match ClientManager::new(state.exec.as_ref(), &state.config.paths, &state.config.interface)
                .banned()
            {
                Ok(macs) => IpcResponse::BanList(macs),
                Err(e) => error_response(e),
            }
        }
        IpcRequest::Ban { mac } => {
            match ClientManager::new(state.exec.as_ref(), &state.config.paths, &state.config.interface)
                .ban(&mac)
                .await
            {
                Ok(()) => IpcResponse::Ok,
                Err(e) => error_response(e),
            }
        }
        IpcRequest::Unban { mac } => {
            match ClientManager::new(state.exec.as_ref(), &state.config.paths, &state.config.interface)
                .unban(&mac)
                .await
            {
                Ok(removed) => IpcResponse::Unbanned(removed),
                Err(e) => error_response(e),
            }
        }
        IpcRequest::Shutdown => {
            if let Err(e) = state.command_tx.send(ControlCommand::Shutdown).await {
                return error_response(format!("Control loop is not running: {}", e));
            }
            IpcResponse::Ok
        }
    }
}

/// Send one request to the daemon and wait for its response (client side)
pub async fn request(socket_path: &Path, request: &IpcRequest) -> Result<IpcResponse> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("Failed to connect to {}", socket_path.display()))?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let json = serde_json::to_string(request)? + "\n";
    writer.write_all(json.as_bytes()).await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    if line.is_empty() {
        anyhow::bail!("Daemon closed the connection without responding");
    }

    serde_json::from_str(&line).context("Failed to parse daemon response")
}

//! Deck Hotspot - software access point that restores the station network on teardown
//!
//! This binary provides two kinds of commands:
//! - `daemon`: owns the hotspot lifecycle and serves requests on a Unix socket
//! - everything else: a one-shot client that talks to the daemon

mod controller;

use clap::{Parser, Subcommand};
use controller::ipc::IpcRequest;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "deck-hotspot")]
#[command(about = "WiFi hotspot orchestrator", long_about = None)]
struct Cli {
    /// Unix socket path for daemon communication
    #[arg(long, global = true, default_value = controller::SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hotspot daemon
    Daemon {
        /// Wireless interface to turn into an access point
        #[arg(long, default_value = controller::state::DEFAULT_INTERFACE)]
        interface: String,

        /// Settings file
        #[arg(long, default_value = controller::settings::SETTINGS_PATH)]
        settings: PathBuf,

        /// WiFi channel
        #[arg(long, default_value_t = controller::state::DEFAULT_CHANNEL)]
        channel: u8,

        /// Regulatory country code
        #[arg(long, default_value = controller::state::DEFAULT_COUNTRY_CODE)]
        country_code: String,
    },

    /// Show hotspot status
    Status,

    /// Start the hotspot
    Start,

    /// Stop the hotspot and restore the network
    Stop,

    /// Show credentials and DHCP settings
    Settings,

    /// Change SSID and passphrase
    SetCredentials {
        ssid: String,
        passphrase: String,

        /// Store the credentials and reuse them on every start
        #[arg(long)]
        always_use: bool,
    },

    /// Change the AP address and DHCP pool
    SetDhcp {
        ip_address: Ipv4Addr,
        start: Ipv4Addr,
        end: Ipv4Addr,

        /// Lease duration (dnsmasq syntax)
        #[arg(long, default_value = "12h")]
        lease: String,
    },

    /// List connected clients
    Clients,

    /// List banned MAC addresses
    Bans,

    /// Disconnect a client and ban its MAC address
    Ban { mac: String },

    /// Remove a MAC address from the ban list
    Unban { mac: String },

    /// Stop the daemon (and the hotspot, if active)
    Shutdown,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let request = match cli.command {
        Commands::Daemon {
            interface,
            settings,
            channel,
            country_code,
        } => {
            tracing::info!("Starting Deck Hotspot daemon");
            return controller::run_daemon(controller::DaemonConfig {
                interface,
                socket_path: cli.socket,
                settings_path: settings,
                channel,
                country_code,
                paths: controller::HostPaths::default(),
                options: controller::LifecycleOptions::default(),
            })
            .await;
        }
        Commands::Status => IpcRequest::Status,
        Commands::Start => IpcRequest::Start,
        Commands::Stop => IpcRequest::Stop,
        Commands::Settings => IpcRequest::GetSettings,
        Commands::SetCredentials {
            ssid,
            passphrase,
            always_use,
        } => IpcRequest::UpdateCredentials {
            ssid,
            passphrase,
            always_use,
        },
        Commands::SetDhcp {
            ip_address,
            start,
            end,
            lease,
        } => IpcRequest::UpdateDhcpRange {
            ip_address,
            start,
            end,
            lease,
        },
        Commands::Clients => IpcRequest::Clients,
        Commands::Bans => IpcRequest::BanList,
        Commands::Ban { mac } => IpcRequest::Ban { mac },
        Commands::Unban { mac } => IpcRequest::Unban { mac },
        Commands::Shutdown => IpcRequest::Shutdown,
    };

    controller::run_client(&cli.socket, request).await
}

//! edge-overlay
//!
//! Joins edge devices on separate networks into one virtual IPv4 network.
//!
//! Usage:
//!   Server:  edge-overlay server --device-id-file /etc/edge/device-id --passphrase <SECRET>
//!   Client:  edge-overlay client --endpoint-file /etc/edge/endpoint --device-id-file /etc/edge/device-id --passphrase <SECRET>
//!   PSK:     edge-overlay generate-psk

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edge_overlay::broadcast::{AesGcmCipher, Cipher, HttpPublisher, PlainCipher};
use edge_overlay::config::{expand_tilde, load_device_id, load_toml, BroadcastConfig, ClientConfig, ServerConfig};
use edge_overlay::control::{start_client, start_server, Capabilities};
use edge_overlay::device::TunFactory;
use edge_overlay::discovery::{LogNotifier, OutboundIp};
use edge_overlay::lock::InstanceLock;
use edge_overlay::transport::{generate_psk, StaticPskProvider, Transport};
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "edge-overlay")]
#[command(version)]
#[command(about = "Overlay tunnel for edge orchestration")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

/// Pre-shared-key options shared by server and client.
#[derive(clap::Args, Clone, Default)]
struct PskArgs {
    /// PSK identity presented when dialing (used with --psk-key)
    #[arg(long, requires = "psk_key")]
    psk_identity: Option<String>,

    /// Hex-encoded PSK (generate one with: edge-overlay generate-psk)
    #[arg(long, requires = "psk_identity", conflicts_with = "psk_file")]
    psk_key: Option<String>,

    /// File with `identity:hex-key` lines; the first entry is used when dialing
    #[arg(long)]
    psk_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the tunnel server and the broadcast endpoint
    Server {
        /// TOML file with [server] and [broadcast] sections
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address to listen on (default: all interfaces)
        #[arg(long)]
        listen: Option<String>,

        /// Tunnel listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// Overlay network CIDR (e.g., 10.0.0.0/24)
        #[arg(short, long)]
        network: Option<String>,

        /// File holding this device's identifier
        #[arg(long)]
        device_id_file: PathBuf,

        #[command(flatten)]
        psk: PskArgs,

        /// Passphrase for the broadcast payload cipher
        #[arg(long)]
        passphrase: Option<String>,

        /// Drop packets for a client whose queue is full instead of blocking
        #[arg(long)]
        drop_on_full: bool,
    },
    /// Run the tunnel client
    Client {
        /// TOML file with [client] and [broadcast] sections
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Two-line endpoint file: server host, then tunnel port
        #[arg(short, long)]
        endpoint_file: Option<PathBuf>,

        /// File holding this device's identifier
        #[arg(long)]
        device_id_file: PathBuf,

        #[command(flatten)]
        psk: PskArgs,

        /// Passphrase for the broadcast payload cipher
        #[arg(long)]
        passphrase: Option<String>,

        /// Single-instance lock file (default: runtime directory)
        #[arg(long)]
        lock_file: Option<PathBuf>,
    },
    /// Print a random hex-encoded pre-shared key
    GeneratePsk,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ServerFile {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    broadcast: BroadcastConfig,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ClientFile {
    client: Option<ClientConfig>,
    #[serde(default)]
    broadcast: BroadcastConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match args.command {
        Command::Server {
            config,
            listen,
            port,
            network,
            device_id_file,
            psk,
            passphrase,
            drop_on_full,
        } => {
            let mut file: ServerFile = match config {
                Some(path) => load_toml(&path).context("Failed to load server config")?,
                None => ServerFile::default(),
            };
            if let Some(listen) = listen {
                file.server.listen_addr = listen;
            }
            if let Some(port) = port {
                file.server.port = port;
            }
            if let Some(network) = network {
                file.server.network = network
                    .parse::<Ipv4Net>()
                    .context("Invalid overlay network CIDR (e.g., 10.0.0.0/24)")?;
            }
            if drop_on_full {
                file.server.drop_on_full = true;
            }
            run_server(file, &device_id_file, &psk, passphrase.as_deref()).await
        }
        Command::Client {
            config,
            endpoint_file,
            device_id_file,
            psk,
            passphrase,
            lock_file,
        } => {
            let file: ClientFile = match config {
                Some(path) => load_toml(&path).context("Failed to load client config")?,
                None => ClientFile::default(),
            };
            let client_config = match (file.client, endpoint_file) {
                (Some(mut client), Some(endpoint)) => {
                    client.endpoint_file = endpoint;
                    client
                }
                (Some(client), None) => client,
                (None, Some(endpoint)) => ClientConfig::new(endpoint),
                (None, None) => anyhow::bail!(
                    "No endpoint file given.\n\
                     Pass --endpoint-file or set client.endpoint_file in --config"
                ),
            };
            run_client(
                client_config,
                file.broadcast,
                &device_id_file,
                &psk,
                passphrase.as_deref(),
                lock_file.as_deref(),
            )
            .await
        }
        Command::GeneratePsk => {
            println!("{}", generate_psk());
            Ok(())
        }
    }
}

async fn run_server(
    file: ServerFile,
    device_id_file: &Path,
    psk: &PskArgs,
    passphrase: Option<&str>,
) -> Result<()> {
    let device_id = load_device_id(&expand_tilde(device_id_file)).context("Failed to load device id")?;
    let caps = capabilities(psk, passphrase, file.broadcast.request_timeout())?;

    let handle = start_server(&device_id, file.server, file.broadcast, caps)
        .await
        .context("Failed to start overlay server")?;
    let addresses = handle.addresses();
    log::info!(
        "Overlay server {} up: virtual {}, private {}, broadcast {}",
        device_id,
        addresses.virtual_ip,
        addresses.private_ip,
        handle.broadcast_addr()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Shutting down");
    handle.close().await.context("Failed to close overlay server")?;
    Ok(())
}

async fn run_client(
    mut client_config: ClientConfig,
    broadcast: BroadcastConfig,
    device_id_file: &Path,
    psk: &PskArgs,
    passphrase: Option<&str>,
    lock_file: Option<&Path>,
) -> Result<()> {
    let _lock = match lock_file {
        Some(path) => InstanceLock::acquire_at(&expand_tilde(path)),
        None => InstanceLock::acquire(),
    }
    .context("Failed to acquire client lock")?;

    let device_id = load_device_id(&expand_tilde(device_id_file)).context("Failed to load device id")?;
    client_config.endpoint_file = expand_tilde(&client_config.endpoint_file);
    let caps = capabilities(psk, passphrase, broadcast.request_timeout())?;

    let client = start_client(
        &device_id,
        client_config,
        broadcast,
        caps,
        Arc::new(LogNotifier),
    )
    .await
    .context("Failed to start overlay client")?;
    if let Some(address) = client.virtual_address().await {
        log::info!("Overlay client {} up as {}", device_id, address);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Shutting down");
    client.close().await.context("Failed to close overlay client")?;
    Ok(())
}

fn capabilities(
    psk: &PskArgs,
    passphrase: Option<&str>,
    request_timeout: std::time::Duration,
) -> Result<Capabilities> {
    Ok(Capabilities {
        transport: transport(psk)?,
        interfaces: Arc::new(TunFactory::new()),
        network: Arc::new(OutboundIp::new()),
        cipher: cipher(passphrase)?,
        publisher: Arc::new(HttpPublisher::new(request_timeout).context("Failed to build HTTP client")?),
    })
}

fn transport(psk: &PskArgs) -> Result<Transport> {
    let provider = match (&psk.psk_file, &psk.psk_identity, &psk.psk_key) {
        (Some(path), _, _) => {
            StaticPskProvider::load_file(&expand_tilde(path)).context("Failed to load PSK file")?
        }
        (None, Some(identity), Some(key)) => {
            StaticPskProvider::from_hex(identity.as_str(), key).context("Invalid PSK")?
        }
        _ => {
            log::warn!("No PSK configured: tunnel traffic is not encrypted");
            return Ok(Transport::plain());
        }
    };
    Ok(Transport::psk(Arc::new(provider)))
}

fn cipher(passphrase: Option<&str>) -> Result<Arc<dyn Cipher>> {
    match passphrase {
        Some(passphrase) => Ok(Arc::new(
            AesGcmCipher::from_passphrase(passphrase).context("Invalid broadcast passphrase")?,
        )),
        None => {
            log::warn!("No passphrase configured: broadcast payloads are sent in clear");
            Ok(Arc::new(PlainCipher))
        }
    }
}

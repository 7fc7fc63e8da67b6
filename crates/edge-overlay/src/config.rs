//! Overlay configuration types.
//!
//! Server, client and broadcast settings are plain serde structs so they can be
//! loaded from TOML and overridden from the command line. The endpoint file
//! (host on line 1, tunnel port on line 2) and the device-id file keep the
//! platform's plain-text formats.

use crate::error::{OverlayError, OverlayResult};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default overlay network (10.0.0.0/24).
pub const DEFAULT_NETWORK: &str = "10.0.0.0/24";

/// Well-known tunnel server port.
pub const DEFAULT_TUNNEL_PORT: u16 = 3334;

/// Well-known broadcast exchange port.
pub const DEFAULT_BROADCAST_PORT: u16 = 3333;

/// Port of the peer registration endpoint served by every orchestrator.
pub const DEFAULT_PEER_PORT: u16 = 56002;

/// Path of the peer registration endpoint.
pub const DEFAULT_PEER_PATH: &str = "/api/v1/discoverymgr/register";

/// Maximum size of one tunneled packet.
pub const DEFAULT_PACKET_SIZE: usize = 1024;

/// Capacity of every packet queue.
pub const DEFAULT_QUEUE_SIZE: usize = 200;

/// Fixed delay between client registration attempts.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5000;

/// Settle time after a reconnect before announcing it.
pub const DEFAULT_RECONCILE_DELAY_MS: u64 = 3000;

/// Prefix prepended to the contents of the device-id file.
pub const DEVICE_ID_PREFIX: &str = "edge-orchestration-";

/// How addresses return to the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimPolicy {
    /// Addresses are never reused for the server's lifetime.
    #[default]
    Never,
    /// An address becomes reusable after an explicit `remove_client`.
    OnRemove,
}

/// Tunnel server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address. Empty means all interfaces.
    #[serde(default)]
    pub listen_addr: String,

    /// Tunnel listen port.
    #[serde(default = "default_tunnel_port")]
    pub port: u16,

    /// Overlay network CIDR. Server gets the first host, clients the rest.
    #[serde(default = "default_network")]
    pub network: Ipv4Net,

    /// Requested interface name (system assigns one if unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_name: Option<String>,

    /// Maximum packet size read from the device or a session.
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,

    /// Interface MTU. Defaults to the packet size so reads never truncate.
    #[serde(default = "default_packet_size_u16")]
    pub mtu: u16,

    /// Capacity of each session's outgoing queue.
    #[serde(default = "default_queue_size")]
    pub session_queue_size: usize,

    /// Capacity of the shared device and dispatch queues.
    #[serde(default = "default_queue_size")]
    pub device_queue_size: usize,

    /// Drop packets for a session whose queue is full instead of blocking dispatch.
    ///
    /// When `false` (default): a slow client applies backpressure to the
    /// dispatch task, delaying packets to every destination.
    ///
    /// When `true`: the packet is dropped and counted against the session,
    /// so one slow client cannot stall the rest.
    #[serde(default)]
    pub drop_on_full: bool,

    /// Address reclamation policy.
    #[serde(default)]
    pub reclaim: ReclaimPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: String::new(),
            port: DEFAULT_TUNNEL_PORT,
            network: default_network(),
            interface_name: None,
            packet_size: DEFAULT_PACKET_SIZE,
            mtu: default_packet_size_u16(),
            session_queue_size: DEFAULT_QUEUE_SIZE,
            device_queue_size: DEFAULT_QUEUE_SIZE,
            drop_on_full: false,
            reclaim: ReclaimPolicy::Never,
        }
    }
}

impl ServerConfig {
    /// Validate the server configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.network.prefix_len() > 30 {
            return Err(format!(
                "'network' {} is too small: need room for the server and at least one client",
                self.network
            ));
        }
        validate_sizes(self.packet_size, self.mtu)?;
        if self.session_queue_size == 0 || self.device_queue_size == 0 {
            return Err("queue sizes must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Tunnel client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Path of the two-line endpoint file.
    pub endpoint_file: PathBuf,

    /// Prefix length appended to the address the server assigns.
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,

    /// Requested interface name (system assigns one if unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_name: Option<String>,

    /// Maximum packet size read from the device or the connection.
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,

    /// Interface MTU.
    #[serde(default = "default_packet_size_u16")]
    pub mtu: u16,

    /// Capacity of the inbound and outbound packet queues.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Fixed delay between registration attempts, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Delay after a successful reconnect before it is announced, in milliseconds.
    #[serde(default = "default_reconcile_delay_ms")]
    pub reconcile_delay_ms: u64,
}

impl ClientConfig {
    /// Create a configuration with defaults for the given endpoint file.
    pub fn new(endpoint_file: impl Into<PathBuf>) -> Self {
        Self {
            endpoint_file: endpoint_file.into(),
            prefix_len: default_prefix_len(),
            interface_name: None,
            packet_size: DEFAULT_PACKET_SIZE,
            mtu: default_packet_size_u16(),
            queue_size: DEFAULT_QUEUE_SIZE,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            reconcile_delay_ms: DEFAULT_RECONCILE_DELAY_MS,
        }
    }

    /// Validate the client configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.endpoint_file.as_os_str().is_empty() {
            return Err("'endpoint_file' is required and cannot be empty".to_string());
        }
        if self.prefix_len == 0 || self.prefix_len > 30 {
            return Err(format!(
                "'prefix_len' {} must be between 1 and 30",
                self.prefix_len
            ));
        }
        validate_sizes(self.packet_size, self.mtu)?;
        if self.queue_size == 0 {
            return Err("'queue_size' must be greater than zero".to_string());
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn reconcile_delay(&self) -> Duration {
        Duration::from_millis(self.reconcile_delay_ms)
    }
}

/// Broadcast peer exchange configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Port of the broadcast registration server.
    #[serde(default = "default_broadcast_port")]
    pub port: u16,

    /// Port of every peer's registration endpoint.
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,

    /// Path of every peer's registration endpoint.
    #[serde(default = "default_peer_path")]
    pub peer_path: String,

    /// Registration attempts before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between registration attempts, in milliseconds.
    #[serde(default = "default_broadcast_retry_ms")]
    pub retry_delay_ms: u64,

    /// Timeout of a single HTTP request, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_BROADCAST_PORT,
            peer_port: DEFAULT_PEER_PORT,
            peer_path: DEFAULT_PEER_PATH.to_string(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_broadcast_retry_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl BroadcastConfig {
    /// Validate the broadcast configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("'max_attempts' must be at least 1".to_string());
        }
        if !self.peer_path.starts_with('/') {
            return Err(format!("'peer_path' {} must start with '/'", self.peer_path));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn validate_sizes(packet_size: usize, mtu: u16) -> Result<(), String> {
    if !(20..=65535).contains(&packet_size) {
        return Err(format!(
            "'packet_size' {} must be between 20 and 65535",
            packet_size
        ));
    }
    if usize::from(mtu) > packet_size {
        return Err(format!(
            "'mtu' {} exceeds 'packet_size' {}: packets would be truncated",
            mtu, packet_size
        ));
    }
    Ok(())
}

// ============================================================================
// Endpoint File
// ============================================================================

/// Contents of the two-line endpoint file.
///
/// Line 1 is the tunnel/broadcast server host, line 2 the tunnel port. The
/// broadcast exchange only needs the host, so the port stays optional here
/// and is checked by [`EndpointFile::tunnel_port`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFile {
    pub host: String,
    port: Option<String>,
}

impl EndpointFile {
    /// Read and parse the endpoint file.
    pub fn load(path: &Path) -> OverlayResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OverlayError::config_with_source(
                format!("Failed to read endpoint file {}", path.display()),
                e,
            )
        })?;
        Self::parse(&content)
            .map_err(|e| OverlayError::config(format!("{}: {}", path.display(), e)))
    }

    /// Parse endpoint file contents.
    pub fn parse(content: &str) -> Result<Self, String> {
        let mut lines = content.lines().map(str::trim);
        let host = lines
            .next()
            .filter(|line| !line.is_empty())
            .ok_or_else(|| "line 1 (server host) is missing".to_string())?
            .to_string();
        let port = lines.next().filter(|line| !line.is_empty()).map(String::from);
        Ok(Self { host, port })
    }

    /// Tunnel port from line 2.
    pub fn tunnel_port(&self) -> OverlayResult<u16> {
        let raw = self
            .port
            .as_deref()
            .ok_or_else(|| OverlayError::config("endpoint file line 2 (tunnel port) is missing"))?;
        raw.parse::<u16>().map_err(|e| {
            OverlayError::config_with_source(format!("Invalid tunnel port '{}'", raw), e)
        })
    }
}

// ============================================================================
// Device Identifier / Config Loading
// ============================================================================

/// Load the platform device identifier from the device-id file.
pub fn load_device_id(path: &Path) -> OverlayResult<String> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        OverlayError::config_with_source(
            format!("Failed to read device id file {}", path.display()),
            e,
        )
    })?;
    let id = content.trim();
    if id.is_empty() {
        return Err(OverlayError::config(format!(
            "Device id file {} is empty",
            path.display()
        )));
    }
    Ok(format!("{}{}", DEVICE_ID_PREFIX, id))
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    path.to_path_buf()
}

/// Load a TOML configuration file.
pub fn load_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> OverlayResult<T> {
    let path = expand_tilde(path);
    let content = std::fs::read_to_string(&path).map_err(|e| {
        OverlayError::config_with_source(
            format!("Failed to read config file {}", path.display()),
            e,
        )
    })?;
    toml::from_str(&content).map_err(|e| {
        OverlayError::config_with_source(
            format!("Failed to parse config file {}", path.display()),
            e,
        )
    })
}

// Default value functions for serde
fn default_network() -> Ipv4Net {
    DEFAULT_NETWORK
        .parse()
        .expect("DEFAULT_NETWORK is a valid CIDR")
}

fn default_tunnel_port() -> u16 {
    DEFAULT_TUNNEL_PORT
}

fn default_broadcast_port() -> u16 {
    DEFAULT_BROADCAST_PORT
}

fn default_peer_port() -> u16 {
    DEFAULT_PEER_PORT
}

fn default_peer_path() -> String {
    DEFAULT_PEER_PATH.to_string()
}

fn default_packet_size() -> usize {
    DEFAULT_PACKET_SIZE
}

fn default_packet_size_u16() -> u16 {
    DEFAULT_PACKET_SIZE as u16
}

fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}

fn default_prefix_len() -> u8 {
    24
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

fn default_reconcile_delay_ms() -> u64 {
    DEFAULT_RECONCILE_DELAY_MS
}

fn default_max_attempts() -> u32 {
    5
}

fn default_broadcast_retry_ms() -> u64 {
    2000
}

fn default_request_timeout_ms() -> u64 {
    5000
}

//! Overlay tunnel for edge orchestration.
//!
//! Edge devices on separate physical networks join one virtual IPv4 network
//! through a central tunnel server:
//! - **server**: assigns each device a stable virtual address and forwards
//!   packets by destination address
//! - **client**: bridges a local virtual interface to the server and
//!   reconnects on its own after a failure
//! - **broadcast**: HTTP side-channel where devices announce their
//!   (id, private address, virtual address) and learn about each other
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          edge-overlay                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  TUN ◄──► TunnelClient ◄══ framed TCP (plain|PSK) ══► TunnelServer ◄──► TUN
//! ├──────────────────────────────────────────────────────────────────┤
//! │  BroadcastClient ── POST /register ──► BroadcastServer ──► peers │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod broadcast;
pub mod client;
pub mod config;
pub mod control;
pub mod device;
pub mod discovery;
pub mod error;
pub mod framing;
pub mod lock;
pub mod packet;
pub mod pool;
pub mod server;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{AesGcmCipher, BroadcastClient, BroadcastServer, Cipher, HttpPublisher, PeerPublisher, PlainCipher};
pub use client::{ClientDeps, TunnelClient};
pub use config::{BroadcastConfig, ClientConfig, EndpointFile, ReclaimPolicy, ServerConfig};
pub use control::{start_client, start_server, Capabilities, OverlayAddresses, ServerHandle};
pub use discovery::{DiscoveryNotifier, LogNotifier, NetworkInfo, OutboundIp};
pub use error::{OverlayError, OverlayResult};
pub use lock::InstanceLock;
pub use server::{Delivery, PeerRecord, TunnelServer};
pub use transport::Transport;

//! Collaborators supplied by the surrounding platform.
//!
//! Peer discovery only needs to hear when the tunnel drops and when it comes
//! back; the broadcast exchange needs the host's private address. Both are
//! injected so embedders can wire them to their own services.

use crate::error::{OverlayError, OverlayResult};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Receives tunnel connectivity changes.
pub trait DiscoveryNotifier: Send + Sync {
    /// The tunnel connection was lost or closed.
    fn connection_closed(&self);

    /// The tunnel connection was re-established.
    fn connection_reconciled(&self);
}

/// Notifier that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl DiscoveryNotifier for LogNotifier {
    fn connection_closed(&self) {
        log::info!("Overlay connection closed");
    }

    fn connection_reconciled(&self) {
        log::info!("Overlay connection reconciled");
    }
}

/// Notifier that counts notices.
#[derive(Debug, Default)]
pub struct CountingNotifier {
    closed: AtomicUsize,
    reconciled: AtomicUsize,
}

impl CountingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn reconciled(&self) -> usize {
        self.reconciled.load(Ordering::SeqCst)
    }
}

impl DiscoveryNotifier for CountingNotifier {
    fn connection_closed(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_reconciled(&self) {
        self.reconciled.fetch_add(1, Ordering::SeqCst);
    }
}

/// Source of the host's private (outbound) address.
pub trait NetworkInfo: Send + Sync {
    fn private_ip(&self) -> OverlayResult<Ipv4Addr>;
}

/// Outbound address chosen by the routing table.
///
/// Connecting a UDP socket sends nothing; it only selects the local address
/// the kernel would use to reach `probe`.
#[derive(Debug, Clone, Copy)]
pub struct OutboundIp {
    probe: (Ipv4Addr, u16),
}

impl Default for OutboundIp {
    fn default() -> Self {
        Self {
            probe: (Ipv4Addr::new(8, 8, 8, 8), 80),
        }
    }
}

impl OutboundIp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different probe destination, e.g. the tunnel server.
    pub fn with_probe(probe: Ipv4Addr, port: u16) -> Self {
        Self {
            probe: (probe, port),
        }
    }
}

impl NetworkInfo for OutboundIp {
    fn private_ip(&self) -> OverlayResult<Ipv4Addr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(self.probe)?;
        match socket.local_addr()?.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
            other => Err(OverlayError::config(format!(
                "No usable outbound IPv4 address (got {})",
                other
            ))),
        }
    }
}

/// Fixed private address.
#[derive(Debug, Clone, Copy)]
pub struct StaticNetworkInfo(pub Ipv4Addr);

impl NetworkInfo for StaticNetworkInfo {
    fn private_ip(&self) -> OverlayResult<Ipv4Addr> {
        Ok(self.0)
    }
}

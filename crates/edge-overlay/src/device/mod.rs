//! Virtual network interfaces.
//!
//! [`InterfaceFactory`] creates a [`VirtualInterface`]; the owner assigns it
//! an address, brings it up, and splits off a reader and a writer for the
//! packet tasks. The interface handle stays with the owner so it can be
//! brought down on close.
//!
//! Two implementations:
//! - [`TunFactory`]: OS TUN device configured through `ip`/`ifconfig`
//! - [`MemoryFactory`]: channel-backed device for tests and embedders

mod memory;
mod tun;

pub use self::memory::{MemoryFactory, MemoryHandle, MemoryInterface};
pub use self::tun::{TunFactory, TunInterface};

use crate::error::OverlayResult;
use async_trait::async_trait;
use ipnet::Ipv4Net;

/// Parameters for a new interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRequest {
    /// Requested name. If None, the system assigns one.
    pub name: Option<String>,
    pub mtu: u16,
}

impl InterfaceRequest {
    pub fn new(mtu: u16) -> Self {
        Self { name: None, mtu }
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }
}

/// Creates virtual interfaces.
#[async_trait]
pub trait InterfaceFactory: Send + Sync {
    async fn create(&self, request: &InterfaceRequest) -> OverlayResult<Box<dyn VirtualInterface>>;
}

/// A host-local virtual network device.
#[async_trait]
pub trait VirtualInterface: Send {
    fn name(&self) -> &str;

    /// Assign an address and mask. An address that is already present is not an error.
    async fn assign_address(&mut self, address: Ipv4Net) -> OverlayResult<()>;

    /// Bring the link up or down.
    async fn set_up(&mut self, up: bool) -> OverlayResult<()>;

    /// Take the packet halves. Fails if they were already taken.
    fn split(&mut self) -> OverlayResult<(Box<dyn PacketReader>, Box<dyn PacketWriter>)>;
}

/// Read half of a virtual interface.
#[async_trait]
pub trait PacketReader: Send {
    /// Read one packet into `buf`, returning its length.
    async fn read(&mut self, buf: &mut [u8]) -> OverlayResult<usize>;
}

/// Write half of a virtual interface.
#[async_trait]
pub trait PacketWriter: Send {
    /// Write one packet.
    async fn write(&mut self, packet: &[u8]) -> OverlayResult<()>;
}

/// Create an interface, assign `address`, and bring it up.
///
/// On failure the half-configured interface is dropped and the error returned.
pub async fn create_configured(
    factory: &dyn InterfaceFactory,
    request: &InterfaceRequest,
    address: Ipv4Net,
) -> OverlayResult<Box<dyn VirtualInterface>> {
    let mut iface = factory.create(request).await?;
    iface.assign_address(address).await?;
    iface.set_up(true).await?;
    log::info!("Virtual interface {} up with {}", iface.name(), address);
    Ok(iface)
}

//! OS TUN devices.

use super::{InterfaceFactory, InterfaceRequest, PacketReader, PacketWriter, VirtualInterface};
use crate::error::{OverlayError, OverlayResult};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tun::{AbstractDevice, AsyncDevice, Configuration, DeviceReader, DeviceWriter};

/// Transmit queue length set on Linux links.
const TX_QUEUE_LEN: &str = "300";

/// Creates TUN devices through the `tun` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TunFactory;

impl TunFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl InterfaceFactory for TunFactory {
    async fn create(&self, request: &InterfaceRequest) -> OverlayResult<Box<dyn VirtualInterface>> {
        Ok(Box::new(TunInterface::create(request)?))
    }
}

/// A TUN device. Addressing and link state go through the OS tools.
pub struct TunInterface {
    device: Option<AsyncDevice>,
    name: String,
    mtu: u16,
}

impl TunInterface {
    pub fn create(request: &InterfaceRequest) -> OverlayResult<Self> {
        let mut config = Configuration::default();
        config.mtu(request.mtu);

        if let Some(ref name) = request.name {
            #[allow(deprecated)]
            config.name(name);
        }

        #[cfg(target_os = "linux")]
        config.platform_config(|platform_config| {
            platform_config.ensure_root_privileges(true);
        });

        let device = tun::create_as_async(&config)
            .map_err(|e| OverlayError::device_with_source("Failed to create TUN device", e))?;
        let name = device
            .tun_name()
            .map_err(|e| OverlayError::device_with_source("Failed to get TUN name", e))?;

        log::info!("Created TUN device {}", name);
        Ok(Self {
            device: Some(device),
            name,
            mtu: request.mtu,
        })
    }
}

#[async_trait]
impl VirtualInterface for TunInterface {
    fn name(&self) -> &str {
        &self.name
    }

    async fn assign_address(&mut self, address: Ipv4Net) -> OverlayResult<()> {
        let (program, args) = address_command(&self.name, address);
        run_command(program, &args, &format!("assign {} to {}", address, self.name)).await
    }

    async fn set_up(&mut self, up: bool) -> OverlayResult<()> {
        let (program, args) = link_command(&self.name, up, self.mtu);
        let state = if up { "up" } else { "down" };
        run_command(program, &args, &format!("set {} {}", self.name, state)).await
    }

    fn split(&mut self) -> OverlayResult<(Box<dyn PacketReader>, Box<dyn PacketWriter>)> {
        let device = self
            .device
            .take()
            .ok_or_else(|| OverlayError::device(format!("{} already split", self.name)))?;
        // The tun crate returns (writer, reader).
        let (writer, reader) = device
            .split()
            .map_err(|e| OverlayError::device_with_source("Failed to split TUN device", e))?;
        Ok((Box::new(TunReader { reader }), Box::new(TunWriter { writer })))
    }
}

struct TunReader {
    reader: DeviceReader,
}

#[async_trait]
impl PacketReader for TunReader {
    async fn read(&mut self, buf: &mut [u8]) -> OverlayResult<usize> {
        Ok(self.reader.read(buf).await?)
    }
}

struct TunWriter {
    writer: DeviceWriter,
}

#[async_trait]
impl PacketWriter for TunWriter {
    async fn write(&mut self, packet: &[u8]) -> OverlayResult<()> {
        self.writer.write_all(packet).await?;
        Ok(())
    }
}

// ============================================================================
// OS Commands
// ============================================================================

#[cfg(not(target_os = "macos"))]
fn address_command(name: &str, address: Ipv4Net) -> (&'static str, Vec<String>) {
    (
        "ip",
        vec![
            "addr".into(),
            "add".into(),
            address.to_string(),
            "dev".into(),
            name.into(),
        ],
    )
}

#[cfg(target_os = "macos")]
fn address_command(name: &str, address: Ipv4Net) -> (&'static str, Vec<String>) {
    // Point-to-point interfaces need a destination; use the local address.
    (
        "ifconfig",
        vec![
            name.into(),
            "inet".into(),
            address.addr().to_string(),
            address.addr().to_string(),
            "netmask".into(),
            address.netmask().to_string(),
        ],
    )
}

#[cfg(not(target_os = "macos"))]
fn link_command(name: &str, up: bool, mtu: u16) -> (&'static str, Vec<String>) {
    (
        "ip",
        vec![
            "link".into(),
            "set".into(),
            "dev".into(),
            name.into(),
            if up { "up" } else { "down" }.into(),
            "mtu".into(),
            mtu.to_string(),
            "txqueuelen".into(),
            TX_QUEUE_LEN.into(),
        ],
    )
}

#[cfg(target_os = "macos")]
fn link_command(name: &str, up: bool, _mtu: u16) -> (&'static str, Vec<String>) {
    let _ = TX_QUEUE_LEN;
    (
        "ifconfig",
        vec![name.into(), if up { "up" } else { "down" }.into()],
    )
}

/// Check if an error message indicates that a resource already exists.
///
/// - Linux iproute2: "RTNETLINK answers: File exists"
/// - macOS ifconfig: "ioctl (SIOCAIFADDR): File exists"
fn is_already_exists_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("file exists") || lower.contains("eexist")
}

async fn run_command(program: &str, args: &[String], what: &str) -> OverlayResult<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| OverlayError::device_with_source(format!("Failed to execute {}", program), e))?;

    if output.status.success() {
        log::debug!("{} {}: ok", program, args.join(" "));
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if is_already_exists_error(stderr) {
        log::warn!("Failed to {} (treating as success): {}", what, stderr);
        return Ok(());
    }
    Err(OverlayError::device(format!("Failed to {}: {}", what, stderr)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_already_exists_error() {
        assert!(is_already_exists_error("RTNETLINK answers: File exists"));
        assert!(is_already_exists_error("ifconfig: ioctl (SIOCAIFADDR): file exists"));
        assert!(!is_already_exists_error("RTNETLINK answers: Operation not permitted"));
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_linux_commands() {
        let (program, args) = address_command("tun0", "10.0.0.2/24".parse().unwrap());
        assert_eq!(program, "ip");
        assert_eq!(args, ["addr", "add", "10.0.0.2/24", "dev", "tun0"]);

        let (_, args) = link_command("tun0", true, 1024);
        assert_eq!(
            args,
            ["link", "set", "dev", "tun0", "up", "mtu", "1024", "txqueuelen", "300"]
        );
        let (_, args) = link_command("tun0", false, 1024);
        assert_eq!(args[4], "down");
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn test_macos_commands() {
        let (program, args) = address_command("utun4", "10.0.0.2/24".parse().unwrap());
        assert_eq!(program, "ifconfig");
        assert_eq!(
            args,
            ["utun4", "inet", "10.0.0.2", "10.0.0.2", "netmask", "255.255.255.0"]
        );
        let (_, args) = link_command("utun4", false, 1024);
        assert_eq!(args, ["utun4", "down"]);
    }

    #[tokio::test]
    async fn test_run_command_failure_is_device_error() {
        let result = run_command("false", &[], "run false").await;
        assert!(matches!(result, Err(OverlayError::Device(_))));
    }
}

//! Frame codec and registration messages for the tunnel protocol.
//!
//! Every message on a tunnel connection is a length-prefixed frame
//! (u32 big-endian length followed by the payload). Registration is two
//! frames: the client sends its device identifier as UTF-8, the server
//! answers with the assigned virtual address in dotted-decimal form.

use crate::error::{OverlayError, OverlayResult};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Upper bound for any single frame.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Upper bound for a device identifier.
pub const MAX_DEVICE_ID_LEN: usize = 256;

/// Write one length-prefixed frame.
pub async fn write_message<W: AsyncWriteExt + Unpin>(writer: &mut W, data: &[u8]) -> OverlayResult<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| OverlayError::Protocol(format!("Message too large: {} bytes", data.len())))?;
    // Single buffer so the prefix and payload go out in one write.
    let mut frame = Vec::with_capacity(4 + data.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(data);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> OverlayResult<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(OverlayError::Protocol(format!(
            "Message too large: {} > {}",
            len, max_size
        )));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

/// Encode the device identifier sent by a registering client.
pub fn encode_device_id(device_id: &str) -> OverlayResult<Vec<u8>> {
    validate_device_id(device_id)?;
    Ok(device_id.as_bytes().to_vec())
}

/// Decode a device identifier received from a registering client.
pub fn decode_device_id(data: &[u8]) -> OverlayResult<String> {
    let id = std::str::from_utf8(data)
        .map_err(|e| OverlayError::Protocol(format!("Device id is not UTF-8: {}", e)))?;
    validate_device_id(id)?;
    Ok(id.to_string())
}

fn validate_device_id(id: &str) -> OverlayResult<()> {
    if id.is_empty() {
        return Err(OverlayError::Protocol("Device id is empty".into()));
    }
    if id.len() > MAX_DEVICE_ID_LEN {
        return Err(OverlayError::Protocol(format!(
            "Device id too long: {} > {}",
            id.len(),
            MAX_DEVICE_ID_LEN
        )));
    }
    Ok(())
}

/// Encode the address assigned to a client.
pub fn encode_assigned_address(addr: Ipv4Addr) -> Vec<u8> {
    addr.to_string().into_bytes()
}

/// Parse the server's address answer as `<addr>/<prefix_len>`.
pub fn parse_assigned_address(data: &[u8], prefix_len: u8) -> OverlayResult<Ipv4Net> {
    let text = std::str::from_utf8(data)
        .map_err(|e| OverlayError::Protocol(format!("Address response is not UTF-8: {}", e)))?;
    let cidr = format!("{}/{}", text.trim(), prefix_len);
    cidr.parse::<Ipv4Net>()
        .map_err(|e| OverlayError::Protocol(format!("{} is an invalid network/mask: {}", cidr, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_frames_survive_coalescing() {
        let (mut a, mut b) = duplex(1024);
        // Two frames written back to back arrive in a single buffer on the wire.
        write_message(&mut a, b"dev-1").await.unwrap();
        write_message(&mut a, b"second").await.unwrap();

        assert_eq!(read_message(&mut b, MAX_FRAME_SIZE).await.unwrap(), b"dev-1");
        assert_eq!(read_message(&mut b, MAX_FRAME_SIZE).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_frames_survive_fragmentation() {
        // A tiny pipe forces the payload through several partial reads.
        let (mut a, mut b) = duplex(3);
        let payload: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move { write_message(&mut a, &payload).await });

        let received = read_message(&mut b, MAX_FRAME_SIZE).await.unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_frame() {
        let (mut a, mut b) = duplex(64);
        write_message(&mut a, &[0u8; 32]).await.unwrap();
        let result = read_message(&mut b, 16).await;
        assert!(matches!(result, Err(OverlayError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_read_eof_is_transport_error() {
        let (a, mut b) = duplex(64);
        drop(a);
        let result = read_message(&mut b, MAX_FRAME_SIZE).await;
        assert!(matches!(result, Err(OverlayError::Transport(_))));
    }

    #[test]
    fn test_device_id_roundtrip() {
        let encoded = encode_device_id("edge-orchestration-42").unwrap();
        assert_eq!(decode_device_id(&encoded).unwrap(), "edge-orchestration-42");
    }

    #[test]
    fn test_device_id_rejects_empty_and_invalid() {
        assert!(encode_device_id("").is_err());
        assert!(decode_device_id(&[]).is_err());
        assert!(decode_device_id(&[0xff, 0xfe]).is_err());
        assert!(decode_device_id("x".repeat(MAX_DEVICE_ID_LEN + 1).as_bytes()).is_err());
    }

    #[test]
    fn test_assigned_address_parses_with_prefix() {
        let addr = Ipv4Addr::new(10, 0, 0, 2);
        let net = parse_assigned_address(&encode_assigned_address(addr), 24).unwrap();
        assert_eq!(net.addr(), addr);
        assert_eq!(net.prefix_len(), 24);
        assert_eq!(net.netmask(), Ipv4Addr::new(255, 255, 255, 0));
    }

    #[test]
    fn test_assigned_address_rejects_garbage() {
        assert!(matches!(
            parse_assigned_address(b"not-an-ip", 24),
            Err(OverlayError::Protocol(_))
        ));
        assert!(parse_assigned_address(b"10.0.0.256", 24).is_err());
    }
}

//! Channel-backed virtual interfaces.
//!
//! Each created interface has a matching [`MemoryHandle`]: packets passed to
//! [`MemoryHandle::inject`] come out of the interface's reader, and packets
//! written to the interface are returned by [`MemoryHandle::recv`].

use super::{InterfaceFactory, InterfaceRequest, PacketReader, PacketWriter, VirtualInterface};
use crate::error::{OverlayError, OverlayResult};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

const INJECT_QUEUE: usize = 256;

#[derive(Debug, Default)]
struct LinkState {
    address: Option<Ipv4Net>,
    up: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Factory for in-memory interfaces.
#[derive(Default)]
pub struct MemoryFactory {
    handles: Mutex<Vec<MemoryHandle>>,
    counter: AtomicUsize,
    fail: bool,
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory whose `create` always fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Handles of every interface created so far, oldest first.
    pub fn handles(&self) -> Vec<MemoryHandle> {
        lock(&self.handles).clone()
    }

    /// Handle of the most recently created interface.
    pub fn last_handle(&self) -> Option<MemoryHandle> {
        lock(&self.handles).last().cloned()
    }

    pub fn created_count(&self) -> usize {
        lock(&self.handles).len()
    }
}

#[async_trait]
impl InterfaceFactory for MemoryFactory {
    async fn create(&self, request: &InterfaceRequest) -> OverlayResult<Box<dyn VirtualInterface>> {
        if self.fail {
            return Err(OverlayError::device("memory interface creation disabled"));
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = request
            .name
            .clone()
            .unwrap_or_else(|| format!("mem{}", index));

        let (inject_tx, inject_rx) = mpsc::channel(INJECT_QUEUE);
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(LinkState::default()));

        lock(&self.handles).push(MemoryHandle {
            name: name.clone(),
            state: state.clone(),
            inject: inject_tx,
            written: Arc::new(tokio::sync::Mutex::new(written_rx)),
        });

        Ok(Box::new(MemoryInterface {
            name,
            state,
            halves: Some((inject_rx, written_tx)),
        }))
    }
}

/// In-memory interface.
pub struct MemoryInterface {
    name: String,
    state: Arc<Mutex<LinkState>>,
    halves: Option<(mpsc::Receiver<Vec<u8>>, mpsc::UnboundedSender<Vec<u8>>)>,
}

#[async_trait]
impl VirtualInterface for MemoryInterface {
    fn name(&self) -> &str {
        &self.name
    }

    async fn assign_address(&mut self, address: Ipv4Net) -> OverlayResult<()> {
        lock(&self.state).address = Some(address);
        Ok(())
    }

    async fn set_up(&mut self, up: bool) -> OverlayResult<()> {
        lock(&self.state).up = up;
        Ok(())
    }

    fn split(&mut self) -> OverlayResult<(Box<dyn PacketReader>, Box<dyn PacketWriter>)> {
        let (rx, tx) = self
            .halves
            .take()
            .ok_or_else(|| OverlayError::device(format!("{} already split", self.name)))?;
        Ok((Box::new(MemoryReader { rx }), Box::new(MemoryWriter { tx })))
    }
}

struct MemoryReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl PacketReader for MemoryReader {
    async fn read(&mut self, buf: &mut [u8]) -> OverlayResult<usize> {
        let packet = self.rx.recv().await.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "memory interface closed")
        })?;
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }
}

struct MemoryWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl PacketWriter for MemoryWriter {
    async fn write(&mut self, packet: &[u8]) -> OverlayResult<()> {
        self.tx.send(packet.to_vec()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "memory interface closed")
        })?;
        Ok(())
    }
}

/// Test-side view of an in-memory interface.
#[derive(Clone)]
pub struct MemoryHandle {
    name: String,
    state: Arc<Mutex<LinkState>>,
    inject: mpsc::Sender<Vec<u8>>,
    written: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl MemoryHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Option<Ipv4Net> {
        lock(&self.state).address
    }

    pub fn is_up(&self) -> bool {
        lock(&self.state).up
    }

    /// Deliver a packet as if the host stack had sent it into the interface.
    pub async fn inject(&self, packet: Vec<u8>) -> OverlayResult<()> {
        self.inject.send(packet).await.map_err(|_| {
            OverlayError::Transport(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "memory interface reader dropped",
            ))
        })
    }

    /// Next packet written to the interface.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.written.lock().await.recv().await
    }

    /// Next packet written to the interface, or None after `timeout`.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }
}

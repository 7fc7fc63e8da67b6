//! Tunnel server.
//!
//! Accepts client connections, assigns each device a virtual address, and
//! forwards packets by destination address between client sessions and the
//! server's own virtual interface.
//!
//! # Tasks
//!
//! ```text
//!   accept ──► registration (per connection) ──► session recv/send tasks
//!
//!   session recv ──┐                           ┌──► session queue ──► session send
//!                  ├──► dispatch ── route ─────┤
//!   device-read ───┘                           └──► to-device queue ──► device-write
//! ```
//!
//! All registry state sits behind one `tokio::sync::Mutex`, held only while
//! maps are read or mutated, never across I/O.

use crate::config::ServerConfig;
use crate::device::{create_configured, InterfaceFactory, InterfaceRequest, PacketReader, PacketWriter, VirtualInterface};
use crate::error::{OverlayError, OverlayResult};
use crate::framing::{decode_device_id, encode_assigned_address};
use crate::packet::extract_dest_ip;
use crate::pool::AddressPool;
use crate::transport::{Connecting, ConnectionReader, ConnectionWriter, Listener, Transport};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Packet counters for the tunnel server.
///
/// Atomic counters instead of per-packet logging in the hot paths.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Packets read from the virtual interface.
    pub device_packets_read: AtomicU64,
    /// Frames received from client sessions.
    pub session_packets_received: AtomicU64,
    /// Packets queued to a client session.
    pub packets_to_sessions: AtomicU64,
    /// Packets queued to the local virtual interface.
    pub packets_to_device: AtomicU64,
    /// Packets dropped because a queue was full (drop_on_full=true).
    pub packets_dropped_full: AtomicU64,
    /// Packets that waited for queue space (drop_on_full=false).
    pub packets_backpressure: AtomicU64,
    /// Frames larger than the configured packet size.
    pub packets_oversized: AtomicU64,
    /// Failed writes to the virtual interface.
    pub device_write_failed: AtomicU64,
    /// Completed registrations.
    pub sessions_registered: AtomicU64,
    /// Sessions removed after a connection failure.
    pub sessions_pruned: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            device_packets_read: self.device_packets_read.load(Ordering::Relaxed),
            session_packets_received: self.session_packets_received.load(Ordering::Relaxed),
            packets_to_sessions: self.packets_to_sessions.load(Ordering::Relaxed),
            packets_to_device: self.packets_to_device.load(Ordering::Relaxed),
            packets_dropped_full: self.packets_dropped_full.load(Ordering::Relaxed),
            packets_backpressure: self.packets_backpressure.load(Ordering::Relaxed),
            packets_oversized: self.packets_oversized.load(Ordering::Relaxed),
            device_write_failed: self.device_write_failed.load(Ordering::Relaxed),
            sessions_registered: self.sessions_registered.load(Ordering::Relaxed),
            sessions_pruned: self.sessions_pruned.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub device_packets_read: u64,
    pub session_packets_received: u64,
    pub packets_to_sessions: u64,
    pub packets_to_device: u64,
    pub packets_dropped_full: u64,
    pub packets_backpressure: u64,
    pub packets_oversized: u64,
    pub device_write_failed: u64,
    pub sessions_registered: u64,
    pub sessions_pruned: u64,
}

/// Addresses a device announced through the broadcast exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub virtual_ip: String,
    pub private_ip: String,
}

/// Where `route` put a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Queued to the session of the device holding this address.
    Session(Ipv4Addr),
    /// Queued to the local virtual interface.
    LocalDevice,
    /// Dropped: queue full under drop_on_full, or queue closed.
    Dropped,
}

/// A registered client connection.
struct Session {
    /// Distinguishes this connection from earlier ones of the same device,
    /// so a stale failure never prunes a newer session.
    session_id: u64,
    address: Ipv4Addr,
    tx: mpsc::Sender<Bytes>,
    dropped: Arc<AtomicU64>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Registry {
    sessions: HashMap<String, Session>,
    by_address: HashMap<Ipv4Addr, String>,
    peers: HashMap<String, PeerRecord>,
    pool: AddressPool,
}

impl Registry {
    /// Remove the session and its address mapping if `session_id` still owns them.
    fn prune(&mut self, device_id: &str, session_id: u64) -> bool {
        let owned = self
            .sessions
            .get(device_id)
            .is_some_and(|s| s.session_id == session_id);
        if !owned {
            return false;
        }
        if let Some(session) = self.sessions.remove(device_id) {
            if self.by_address.get(&session.address).map(String::as_str) == Some(device_id) {
                self.by_address.remove(&session.address);
            }
            session.abort();
        }
        true
    }
}

/// Queues between the packet tasks, taken by `run`.
struct Pipes {
    listener: Listener,
    device_reader: Box<dyn PacketReader>,
    device_writer: Box<dyn PacketWriter>,
    from_sessions_rx: mpsc::Receiver<Bytes>,
    from_device_tx: mpsc::Sender<Bytes>,
    from_device_rx: mpsc::Receiver<Bytes>,
    to_device_rx: mpsc::Receiver<Bytes>,
}

struct Lifecycle {
    pipes: Option<Pipes>,
    device: Option<Box<dyn VirtualInterface>>,
    tasks: Vec<JoinHandle<()>>,
}

struct ServerInner {
    config: ServerConfig,
    server_ip: Ipv4Addr,
    local_addr: SocketAddr,
    interface_name: String,
    registry: Mutex<Registry>,
    stats: ServerStats,
    next_session_id: AtomicU64,
    alive: AtomicBool,
    from_sessions_tx: mpsc::Sender<Bytes>,
    to_device_tx: mpsc::Sender<Bytes>,
    shutdown_tx: watch::Sender<bool>,
    lifecycle: Mutex<Lifecycle>,
}

/// Tunnel server endpoint.
///
/// Cheap to clone; clones share the same server.
#[derive(Clone)]
pub struct TunnelServer {
    inner: Arc<ServerInner>,
}

impl TunnelServer {
    /// Bind the listener, build the pool, and bring up the server's interface.
    ///
    /// On failure everything created so far is dropped.
    pub async fn create(
        config: ServerConfig,
        transport: Transport,
        interfaces: Arc<dyn InterfaceFactory>,
    ) -> OverlayResult<Self> {
        config.validate().map_err(OverlayError::config)?;

        let listener = transport.listen(&config.listen_addr, config.port).await?;
        let local_addr = listener.local_addr()?;

        let pool = AddressPool::new(config.network, config.reclaim);
        let server_ip = pool.server_ip();
        let server_net = pool.server_net()?;

        let request = InterfaceRequest::new(config.mtu).with_name(config.interface_name.clone());
        let mut device = create_configured(interfaces.as_ref(), &request, server_net).await?;
        let (device_reader, device_writer) = device.split()?;
        let interface_name = device.name().to_string();

        let (from_sessions_tx, from_sessions_rx) = mpsc::channel(config.device_queue_size);
        let (from_device_tx, from_device_rx) = mpsc::channel(config.device_queue_size);
        let (to_device_tx, to_device_rx) = mpsc::channel(config.device_queue_size);
        let (shutdown_tx, _) = watch::channel(false);

        log::info!("Tunnel server created:");
        log::info!("  Listen: {} (secure: {})", local_addr, transport.is_secure());
        log::info!("  Network: {}", config.network);
        log::info!("  Server IP: {}", server_ip);
        log::info!("  Interface: {}", interface_name);

        Ok(Self {
            inner: Arc::new(ServerInner {
                server_ip,
                local_addr,
                interface_name,
                registry: Mutex::new(Registry {
                    sessions: HashMap::new(),
                    by_address: HashMap::new(),
                    peers: HashMap::new(),
                    pool,
                }),
                stats: ServerStats::new(),
                next_session_id: AtomicU64::new(1),
                alive: AtomicBool::new(true),
                from_sessions_tx,
                to_device_tx,
                shutdown_tx,
                lifecycle: Mutex::new(Lifecycle {
                    pipes: Some(Pipes {
                        listener,
                        device_reader,
                        device_writer,
                        from_sessions_rx,
                        from_device_tx,
                        from_device_rx,
                        to_device_rx,
                    }),
                    device: Some(device),
                    tasks: Vec::new(),
                }),
                config,
            }),
        })
    }

    /// Start the accept, dispatch, device-read and device-write tasks.
    pub async fn run(&self) -> OverlayResult<()> {
        if !self.is_alive() {
            return Err(OverlayError::NotAlive("Server"));
        }
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let pipes = lifecycle
            .pipes
            .take()
            .ok_or_else(|| OverlayError::config("Server is already running"))?;

        let inner = &self.inner;
        let tasks = vec![
            tokio::spawn(run_accept(inner.clone(), pipes.listener)),
            tokio::spawn(run_dispatch(
                inner.clone(),
                pipes.from_sessions_rx,
                pipes.from_device_rx,
            )),
            tokio::spawn(run_device_reader(
                inner.clone(),
                pipes.device_reader,
                pipes.from_device_tx,
            )),
            tokio::spawn(run_device_writer(
                inner.clone(),
                pipes.device_writer,
                pipes.to_device_rx,
            )),
        ];
        lifecycle.tasks = tasks;

        log::info!("Tunnel server running on {}", self.inner.local_addr);
        Ok(())
    }

    /// Route one packet by its destination address.
    ///
    /// Packets for an address with a live session go to that session's queue;
    /// everything else, including packets too short to carry a destination,
    /// goes to the local interface.
    pub async fn route(&self, packet: Bytes) -> Delivery {
        route(&self.inner, packet).await
    }

    /// Remove every registry entry of a device.
    pub async fn remove_client(&self, device_id: &str) {
        let mut registry = self.inner.registry.lock().await;
        if let Some(session) = registry.sessions.remove(device_id) {
            session.abort();
        }
        registry.by_address.retain(|_, id| id != device_id);
        registry.peers.remove(device_id);
        let released = registry.pool.release(device_id);
        drop(registry);

        match released {
            Some(ip) => log::info!("Removed client {} (address {} released)", device_id, ip),
            None => log::info!("Removed client {}", device_id),
        }
    }

    /// Store or overwrite a device's peer record.
    pub async fn set_client_ip(&self, device_id: &str, private_ip: &str, virtual_ip: &str) {
        let record = PeerRecord {
            virtual_ip: virtual_ip.to_string(),
            private_ip: private_ip.to_string(),
        };
        self.inner
            .registry
            .lock()
            .await
            .peers
            .insert(device_id.to_string(), record);
        log::debug!("Peer {} at {} / {}", device_id, private_ip, virtual_ip);
    }

    /// Snapshot of all peer records.
    pub async fn client_ip_map(&self) -> HashMap<String, PeerRecord> {
        self.inner.registry.lock().await.peers.clone()
    }

    /// Address assigned to a device, if any.
    pub async fn client_address(&self, device_id: &str) -> Option<Ipv4Addr> {
        self.inner.registry.lock().await.pool.lookup(device_id)
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.inner.registry.lock().await.sessions.len()
    }

    /// Packets dropped for one device's current session.
    pub async fn session_drops(&self, device_id: &str) -> Option<u64> {
        self.inner
            .registry
            .lock()
            .await
            .sessions
            .get(device_id)
            .map(|s| s.dropped.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn server_ip(&self) -> Ipv4Addr {
        self.inner.server_ip
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn interface_name(&self) -> &str {
        &self.inner.interface_name
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// Stop all tasks, close every session, and bring the interface down.
    ///
    /// Returns `NotAlive` on every call after the first.
    pub async fn close(&self) -> OverlayResult<()> {
        if !self.inner.alive.swap(false, Ordering::SeqCst) {
            return Err(OverlayError::NotAlive("Server"));
        }
        log::info!("Closing tunnel server on {}", self.inner.local_addr);
        let _ = self.inner.shutdown_tx.send(true);

        let mut lifecycle = self.inner.lifecycle.lock().await;
        for task in lifecycle.tasks.drain(..) {
            task.abort();
        }
        // Never-run servers still hold the listener and device halves here.
        lifecycle.pipes = None;

        {
            let mut registry = self.inner.registry.lock().await;
            for (_, session) in registry.sessions.drain() {
                session.abort();
            }
            registry.by_address.clear();
        }

        if let Some(mut device) = lifecycle.device.take() {
            if let Err(e) = device.set_up(false).await {
                log::warn!("Failed to bring {} down: {}", device.name(), e);
            }
        }

        log::info!("Tunnel server closed");
        Ok(())
    }
}

// ============================================================================
// Tasks
// ============================================================================

async fn run_accept(inner: Arc<ServerInner>, listener: Listener) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    loop {
        let incoming = tokio::select! {
            _ = shutdown.changed() => break,
            incoming = listener.accept() => incoming,
        };
        match incoming {
            Ok(connecting) => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    let peer = connecting.peer_addr();
                    if let Err(e) = register(inner, connecting).await {
                        log::warn!("Registration from {} failed: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                log::warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
    log::debug!("Accept task exiting");
}

/// Read the device id, assign an address, answer, and start the session tasks.
async fn register(inner: Arc<ServerInner>, connecting: Connecting) -> OverlayResult<()> {
    let peer = connecting.peer_addr();
    let mut conn = connecting.establish().await?;

    let device_id = decode_device_id(&conn.receive().await?)?;
    let address = inner.registry.lock().await.pool.allocate(&device_id)?;
    conn.send(&encode_assigned_address(address)).await?;

    let session_id = inner.next_session_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::channel(inner.config.session_queue_size);
    let (reader, writer) = conn.into_split();

    // Tasks are spawned while the registry is locked so a failure inside
    // them cannot prune before the session is recorded.
    let mut registry = inner.registry.lock().await;
    if !inner.alive.load(Ordering::SeqCst) {
        return Err(OverlayError::NotAlive("Server"));
    }
    let tasks = vec![
        tokio::spawn(run_session_receiver(
            inner.clone(),
            device_id.clone(),
            session_id,
            reader,
        )),
        tokio::spawn(run_session_sender(
            inner.clone(),
            device_id.clone(),
            session_id,
            writer,
            rx,
        )),
    ];
    let session = Session {
        session_id,
        address,
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
        tasks,
    };
    if let Some(old) = registry.sessions.insert(device_id.clone(), session) {
        log::info!("Client {} reconnected, replacing session {}", device_id, old.session_id);
        old.abort();
    }
    registry.by_address.insert(address, device_id.clone());
    drop(registry);

    inner.stats.sessions_registered.fetch_add(1, Ordering::Relaxed);
    log::info!("Client {} from {} assigned {}", device_id, peer, address);
    Ok(())
}

async fn run_session_receiver(
    inner: Arc<ServerInner>,
    device_id: String,
    session_id: u64,
    mut reader: ConnectionReader,
) {
    let packet_size = inner.config.packet_size;
    let reason = loop {
        let frame = match reader.receive().await {
            Ok(frame) => frame,
            Err(e) => break e,
        };
        inner
            .stats
            .session_packets_received
            .fetch_add(1, Ordering::Relaxed);
        if frame.len() > packet_size {
            inner.stats.packets_oversized.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        if inner.from_sessions_tx.send(Bytes::from(frame)).await.is_err() {
            return;
        }
    };
    prune(&inner, &device_id, session_id, &reason).await;
}

async fn run_session_sender(
    inner: Arc<ServerInner>,
    device_id: String,
    session_id: u64,
    mut writer: ConnectionWriter,
    mut rx: mpsc::Receiver<Bytes>,
) {
    while let Some(packet) = rx.recv().await {
        if let Err(e) = writer.send(&packet).await {
            prune(&inner, &device_id, session_id, &e).await;
            return;
        }
    }
    // Queue closed: the session was replaced or removed.
    let _ = writer.shutdown().await;
}

async fn prune(inner: &ServerInner, device_id: &str, session_id: u64, reason: &OverlayError) {
    let pruned = inner.registry.lock().await.prune(device_id, session_id);
    if pruned {
        inner.stats.sessions_pruned.fetch_add(1, Ordering::Relaxed);
        log::info!("Client {} disconnected: {}", device_id, reason);
    }
}

async fn run_dispatch(
    inner: Arc<ServerInner>,
    mut from_sessions: mpsc::Receiver<Bytes>,
    mut from_device: mpsc::Receiver<Bytes>,
) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    loop {
        let packet = tokio::select! {
            _ = shutdown.changed() => break,
            Some(packet) = from_sessions.recv() => packet,
            Some(packet) = from_device.recv() => packet,
            else => break,
        };
        route(&inner, packet).await;
    }
    log::debug!("Dispatch task exiting");
}

async fn run_device_reader(
    inner: Arc<ServerInner>,
    mut reader: Box<dyn PacketReader>,
    from_device: mpsc::Sender<Bytes>,
) {
    let mut buf = vec![0u8; inner.config.packet_size];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                log::error!("Virtual interface closed");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                log::error!("Virtual interface read error: {}", e);
                break;
            }
        };
        inner.stats.device_packets_read.fetch_add(1, Ordering::Relaxed);
        if from_device
            .send(Bytes::copy_from_slice(&buf[..n]))
            .await
            .is_err()
        {
            break;
        }
    }
}

async fn run_device_writer(
    inner: Arc<ServerInner>,
    mut writer: Box<dyn PacketWriter>,
    mut to_device: mpsc::Receiver<Bytes>,
) {
    while let Some(packet) = to_device.recv().await {
        if let Err(e) = writer.write(&packet).await {
            inner.stats.device_write_failed.fetch_add(1, Ordering::Relaxed);
            log::warn!("Failed to write to virtual interface: {}", e);
        }
    }
}

async fn route(inner: &ServerInner, packet: Bytes) -> Delivery {
    let target = match extract_dest_ip(&packet) {
        Some(dest) => {
            let registry = inner.registry.lock().await;
            registry
                .by_address
                .get(&dest)
                .and_then(|id| registry.sessions.get(id))
                .map(|s| (dest, s.tx.clone(), s.dropped.clone()))
        }
        None => None,
    };

    match target {
        Some((dest, tx, dropped)) => {
            if enqueue(inner, &tx, packet, Some(&dropped)).await {
                inner.stats.packets_to_sessions.fetch_add(1, Ordering::Relaxed);
                Delivery::Session(dest)
            } else {
                Delivery::Dropped
            }
        }
        None => {
            if enqueue(inner, &inner.to_device_tx, packet, None).await {
                inner.stats.packets_to_device.fetch_add(1, Ordering::Relaxed);
                Delivery::LocalDevice
            } else {
                Delivery::Dropped
            }
        }
    }
}

/// Queue a packet, blocking on a full queue unless drop_on_full is set.
async fn enqueue(
    inner: &ServerInner,
    tx: &mpsc::Sender<Bytes>,
    packet: Bytes,
    session_drops: Option<&AtomicU64>,
) -> bool {
    match tx.try_send(packet) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(packet)) => {
            if inner.config.drop_on_full {
                inner.stats.packets_dropped_full.fetch_add(1, Ordering::Relaxed);
                if let Some(drops) = session_drops {
                    drops.fetch_add(1, Ordering::Relaxed);
                }
                false
            } else {
                inner.stats.packets_backpressure.fetch_add(1, Ordering::Relaxed);
                tx.send(packet).await.is_ok()
            }
        }
        // Closed is expected while a session is being torn down.
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

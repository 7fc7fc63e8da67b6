//! Tunnel client.
//!
//! Keeps one connection to the tunnel server and bridges packets between it
//! and a local virtual interface. A lost connection is rebuilt with the same
//! fixed-delay registration loop used at startup.
//!
//! Each connection generation runs four tasks:
//! - send: outbound queue → connection
//! - receive: connection → inbound queue
//! - device-read: interface → outbound queue
//! - device-write: inbound queue → interface
//!
//! The queues belong to the generation, so packets in flight when it fails
//! are dropped.

use crate::broadcast::BroadcastClient;
use crate::config::{ClientConfig, EndpointFile};
use crate::device::{create_configured, InterfaceFactory, InterfaceRequest, PacketReader, PacketWriter, VirtualInterface};
use crate::discovery::DiscoveryNotifier;
use crate::error::{OverlayError, OverlayResult};
use crate::framing::{encode_device_id, parse_assigned_address};
use crate::transport::{Connection, ConnectionReader, ConnectionWriter, Transport};
use bytes::Bytes;
use ipnet::Ipv4Net;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Capabilities a client is built with.
#[derive(Clone)]
pub struct ClientDeps {
    pub transport: Transport,
    pub interfaces: Arc<dyn InterfaceFactory>,
    pub notifier: Arc<dyn DiscoveryNotifier>,
    /// Announces the client's addresses after every (re)connect, if set.
    pub broadcast: Option<Arc<BroadcastClient>>,
}

/// A registered connection with its configured interface.
struct Link {
    conn: Connection,
    device: Box<dyn VirtualInterface>,
    address: Ipv4Net,
}

#[derive(Default)]
struct LinkState {
    /// Established by `create` or a reconnect, not yet handed to tasks.
    pending: Option<Link>,
    device: Option<Box<dyn VirtualInterface>>,
    tasks: Vec<JoinHandle<()>>,
    /// Ends the running generation with an error.
    report: Option<mpsc::Sender<TaskExit>>,
    /// Set between generations; error reports are ignored meanwhile.
    recovering: bool,
    address: Option<Ipv4Net>,
}

type TaskExit = (&'static str, OverlayError);

struct ClientInner {
    device_id: String,
    config: ClientConfig,
    deps: ClientDeps,
    alive: AtomicBool,
    connected: AtomicBool,
    state: Mutex<LinkState>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Tunnel client endpoint.
#[derive(Clone)]
pub struct TunnelClient {
    inner: Arc<ClientInner>,
}

impl TunnelClient {
    /// Register with the server and bring up the local interface.
    ///
    /// Transport failures are retried forever at the configured delay. An
    /// unreadable endpoint file, an unparseable address, or an interface
    /// failure is returned immediately.
    pub async fn create(
        device_id: impl Into<String>,
        config: ClientConfig,
        deps: ClientDeps,
    ) -> OverlayResult<Self> {
        config.validate().map_err(OverlayError::config)?;
        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            device_id: device_id.into(),
            config,
            deps,
            alive: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            state: Mutex::new(LinkState::default()),
            supervisor: Mutex::new(None),
            shutdown_tx,
        });

        let link = establish(&inner).await?;
        {
            let mut state = inner.state.lock().await;
            state.address = Some(link.address);
            state.pending = Some(link);
        }
        inner.connected.store(true, Ordering::SeqCst);
        Ok(Self { inner })
    }

    /// Start the packet tasks and the reconnect supervisor.
    pub async fn run(&self) -> OverlayResult<()> {
        if !self.is_alive() {
            return Err(OverlayError::NotAlive("Client"));
        }
        let mut supervisor = self.inner.supervisor.lock().await;
        if supervisor.is_some() {
            return Err(OverlayError::config("Client is already running"));
        }
        let link = {
            let mut state = self.inner.state.lock().await;
            if state.recovering {
                return Err(OverlayError::config("Client is reconnecting"));
            }
            let link = state
                .pending
                .take()
                .ok_or_else(|| OverlayError::config("Client has no connection to run"))?;
            state.recovering = true;
            link
        };

        *supervisor = Some(tokio::spawn(supervise(self.inner.clone(), link)));
        spawn_broadcast(&self.inner).await;
        Ok(())
    }

    /// Tear down the current connection and reconnect.
    ///
    /// A running client hands the error to its supervisor; otherwise the
    /// reconnect happens inline. Does nothing once the client is closed or
    /// while a reconnect is already under way.
    pub async fn handle_error(&self, err: OverlayError) {
        if !self.is_alive() {
            return;
        }
        let report = {
            let mut state = self.inner.state.lock().await;
            if let Some(report) = state.report.clone() {
                Some(report)
            } else if state.recovering {
                log::debug!("Reconnect already in progress, ignoring: {}", err);
                return;
            } else {
                state.recovering = true;
                None
            }
        };
        match report {
            Some(report) => {
                let _ = report.send(("caller", err)).await;
            }
            None => {
                let link = handle_error(&self.inner, err).await;
                let mut state = self.inner.state.lock().await;
                state.recovering = false;
                state.pending = link;
            }
        }
    }

    /// Stop all tasks and release the connection and interface.
    ///
    /// Returns `NotAlive` on every call after the first.
    pub async fn close(&self) -> OverlayResult<()> {
        if !self.inner.alive.swap(false, Ordering::SeqCst) {
            return Err(OverlayError::NotAlive("Client"));
        }
        log::info!("Closing tunnel client {}", self.inner.device_id);
        let _ = self.inner.shutdown_tx.send(true);

        if let Some(supervisor) = self.inner.supervisor.lock().await.take() {
            supervisor.abort();
        }

        let (device, pending) = {
            let mut state = self.inner.state.lock().await;
            for task in state.tasks.drain(..) {
                task.abort();
            }
            state.report = None;
            self.inner.connected.store(false, Ordering::SeqCst);
            self.inner.deps.notifier.connection_closed();
            (state.device.take(), state.pending.take())
        };
        release_device(device).await;
        release_device(pending.map(|link| link.device)).await;

        log::info!("Tunnel client closed");
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Address assigned by the server on the latest registration.
    pub async fn virtual_address(&self) -> Option<Ipv4Net> {
        self.inner.state.lock().await.address
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }
}

/// Run generations until the client closes or a reconnect fails fatally.
async fn supervise(inner: Arc<ClientInner>, mut link: Link) {
    loop {
        let reason = match run_generation(&inner, link).await {
            Ok(reason) => reason,
            Err(e) => e,
        };
        link = match handle_error(&inner, reason).await {
            Some(link) => link,
            None => break,
        };
    }
    log::debug!("Client supervisor exiting");
}

/// Start the four packet tasks and wait for the first to end.
async fn run_generation(inner: &Arc<ClientInner>, link: Link) -> OverlayResult<OverlayError> {
    let Link {
        conn, mut device, ..
    } = link;
    let (conn_reader, conn_writer) = conn.into_split();
    let (device_reader, device_writer) = device.split()?;

    let queue_size = inner.config.queue_size;
    let packet_size = inner.config.packet_size;
    let (outbound_tx, outbound_rx) = mpsc::channel(queue_size);
    let (inbound_tx, inbound_rx) = mpsc::channel(queue_size);
    let (done_tx, mut done_rx) = mpsc::channel::<TaskExit>(4);

    let tasks = vec![
        spawn_reporting("send", done_tx.clone(), run_sender(conn_writer, outbound_rx)),
        spawn_reporting(
            "receive",
            done_tx.clone(),
            run_receiver(conn_reader, inbound_tx, packet_size),
        ),
        spawn_reporting(
            "device-read",
            done_tx.clone(),
            run_device_reader(device_reader, outbound_tx, packet_size),
        ),
        spawn_reporting(
            "device-write",
            done_tx.clone(),
            run_device_writer(device_writer, inbound_rx),
        ),
    ];

    {
        let mut state = inner.state.lock().await;
        if !inner.alive.load(Ordering::SeqCst) {
            for task in tasks {
                task.abort();
            }
            drop(state);
            release_device(Some(device)).await;
            return Err(OverlayError::NotAlive("Client"));
        }
        state.device = Some(device);
        state.tasks = tasks;
        state.report = Some(done_tx);
        state.recovering = false;
    }

    let (task, reason) = match done_rx.recv().await {
        Some(exit) => exit,
        None => ("all", OverlayError::NotAlive("Client")),
    };
    log::warn!("Tunnel {} task ended: {}", task, reason);

    let mut state = inner.state.lock().await;
    state.report = None;
    state.recovering = true;
    for task in state.tasks.drain(..) {
        task.abort();
    }
    Ok(reason)
}

fn spawn_reporting<F>(
    name: &'static str,
    done: mpsc::Sender<TaskExit>,
    task: F,
) -> JoinHandle<()>
where
    F: std::future::Future<Output = OverlayError> + Send + 'static,
{
    tokio::spawn(async move {
        let reason = task.await;
        let _ = done.send((name, reason)).await;
    })
}

async fn run_sender(mut writer: ConnectionWriter, mut outbound: mpsc::Receiver<Bytes>) -> OverlayError {
    while let Some(packet) = outbound.recv().await {
        if let Err(e) = writer.send(&packet).await {
            return e;
        }
    }
    queue_closed("outbound")
}

async fn run_receiver(
    mut reader: ConnectionReader,
    inbound: mpsc::Sender<Bytes>,
    packet_size: usize,
) -> OverlayError {
    loop {
        let frame = match reader.receive().await {
            Ok(frame) => frame,
            Err(e) => return e,
        };
        if frame.len() > packet_size {
            log::warn!("Dropping {} byte frame (limit {})", frame.len(), packet_size);
            continue;
        }
        if inbound.send(Bytes::from(frame)).await.is_err() {
            return queue_closed("inbound");
        }
    }
}

async fn run_device_reader(
    mut reader: Box<dyn PacketReader>,
    outbound: mpsc::Sender<Bytes>,
    packet_size: usize,
) -> OverlayError {
    let mut buf = vec![0u8; packet_size];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return OverlayError::device("virtual interface closed"),
            Ok(n) => n,
            Err(e) => return e,
        };
        if outbound.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
            return queue_closed("outbound");
        }
    }
}

async fn run_device_writer(mut writer: Box<dyn PacketWriter>, mut inbound: mpsc::Receiver<Bytes>) -> OverlayError {
    while let Some(packet) = inbound.recv().await {
        if let Err(e) = writer.write(&packet).await {
            return e;
        }
    }
    queue_closed("inbound")
}

fn queue_closed(queue: &str) -> OverlayError {
    OverlayError::Transport(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("{} queue closed", queue),
    ))
}

/// Disconnect, fire the closed notice, and reconnect.
///
/// Callers hold the `recovering` flag. Returns the new link, or None if the
/// client closed or reconnecting failed fatally (the client is then stopped).
async fn handle_error(inner: &Arc<ClientInner>, err: OverlayError) -> Option<Link> {
    if !inner.alive.load(Ordering::SeqCst) {
        return None;
    }
    log::warn!("Tunnel connection lost: {}", err);

    let (device, pending) = {
        let mut state = inner.state.lock().await;
        inner.connected.store(false, Ordering::SeqCst);
        for task in state.tasks.drain(..) {
            task.abort();
        }
        state.report = None;
        (state.device.take(), state.pending.take())
    };
    release_device(device).await;
    release_device(pending.map(|link| link.device)).await;
    inner.deps.notifier.connection_closed();

    let link = match establish(inner).await {
        Ok(link) => link,
        Err(OverlayError::NotAlive(_)) => return None,
        Err(e) => {
            log::error!("Reconnect failed, client stopped: {}", e);
            inner.alive.store(false, Ordering::SeqCst);
            return None;
        }
    };

    // Parked so a concurrent close() releases it.
    inner.state.lock().await.pending = Some(link);
    let waited = wait_or_shutdown(inner, inner.config.reconcile_delay()).await;
    let link = inner.state.lock().await.pending.take()?;
    if !waited {
        release_device(Some(link.device)).await;
        return None;
    }

    inner.state.lock().await.address = Some(link.address);
    inner.connected.store(true, Ordering::SeqCst);
    inner.deps.notifier.connection_reconciled();
    log::info!("Tunnel reconnected as {}", link.address);
    spawn_broadcast(inner).await;
    Some(link)
}

/// Register with the server, retrying transport failures at a fixed delay.
///
/// The endpoint file is re-read on every attempt so an edit made during an
/// outage is picked up.
async fn establish(inner: &Arc<ClientInner>) -> OverlayResult<Link> {
    let hello = encode_device_id(&inner.device_id)?;

    let mut attempt = 0u32;
    let (conn, address, endpoint, port) = loop {
        if !inner.alive.load(Ordering::SeqCst) {
            return Err(OverlayError::NotAlive("Client"));
        }
        attempt = attempt.saturating_add(1);
        let endpoint = EndpointFile::load(&inner.config.endpoint_file)?;
        let port = endpoint.tunnel_port()?;

        match register(&inner.deps.transport, &endpoint.host, port, &hello, inner.config.prefix_len).await {
            Ok((conn, address)) => break (conn, address, endpoint, port),
            Err(e) if e.is_recoverable() => {
                log::warn!(
                    "Registration with {}:{} failed ({}), attempt {}, retrying in {:?}",
                    endpoint.host,
                    port,
                    e,
                    attempt,
                    inner.config.retry_delay()
                );
                if !wait_or_shutdown(inner, inner.config.retry_delay()).await {
                    return Err(OverlayError::NotAlive("Client"));
                }
            }
            Err(e) => return Err(e),
        }
    };

    let request = InterfaceRequest::new(inner.config.mtu).with_name(inner.config.interface_name.clone());
    let device = create_configured(inner.deps.interfaces.as_ref(), &request, address).await?;
    log::info!(
        "Registered {} with {}:{} as {}",
        inner.device_id,
        endpoint.host,
        port,
        address
    );
    Ok(Link {
        conn,
        device,
        address,
    })
}

/// One registration exchange: send the device id, read back the address.
async fn register(
    transport: &Transport,
    host: &str,
    port: u16,
    hello: &[u8],
    prefix_len: u8,
) -> OverlayResult<(Connection, Ipv4Net)> {
    let mut conn = transport.connect(host, port).await?;
    conn.send(hello).await?;
    let answer = conn.receive().await?;
    let address = parse_assigned_address(&answer, prefix_len)?;
    Ok((conn, address))
}

/// Sleep for `delay`; false if the client shut down meanwhile.
async fn wait_or_shutdown(inner: &ClientInner, delay: std::time::Duration) -> bool {
    let mut shutdown = inner.shutdown_tx.subscribe();
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => inner.alive.load(Ordering::SeqCst),
        _ = shutdown.changed() => false,
    }
}

async fn release_device(device: Option<Box<dyn VirtualInterface>>) {
    if let Some(mut device) = device {
        if let Err(e) = device.set_up(false).await {
            log::warn!("Failed to bring {} down: {}", device.name(), e);
        }
    }
}

async fn spawn_broadcast(inner: &Arc<ClientInner>) {
    let Some(broadcast) = inner.deps.broadcast.clone() else {
        return;
    };
    let Some(address) = inner.state.lock().await.address else {
        return;
    };
    let device_id = inner.device_id.clone();
    tokio::spawn(async move {
        if let Err(e) = broadcast.register(&device_id, address.addr()).await {
            log::warn!("Broadcast registration for {} failed: {}", device_id, e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::device::MemoryFactory;
    use crate::discovery::CountingNotifier;
    use crate::server::TunnelServer;
    use std::io::Write;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn endpoint_file(port: u16) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "127.0.0.1\n{}\n", port).unwrap();
        file
    }

    fn fast_config(endpoint: &NamedTempFile) -> ClientConfig {
        let mut config = ClientConfig::new(endpoint.path());
        config.retry_delay_ms = 50;
        config.reconcile_delay_ms = 10;
        config
    }

    fn deps(notifier: Arc<CountingNotifier>) -> (ClientDeps, Arc<MemoryFactory>) {
        let factory = Arc::new(MemoryFactory::new());
        (
            ClientDeps {
                transport: Transport::plain(),
                interfaces: factory.clone(),
                notifier,
                broadcast: None,
            },
            factory,
        )
    }

    async fn start_server() -> TunnelServer {
        start_server_on(0).await
    }

    async fn start_server_on(port: u16) -> TunnelServer {
        let config = ServerConfig {
            listen_addr: "127.0.0.1".into(),
            port,
            ..Default::default()
        };
        let server = TunnelServer::create(config, Transport::plain(), Arc::new(MemoryFactory::new()))
            .await
            .unwrap();
        server.run().await.unwrap();
        server
    }

    #[tokio::test]
    async fn test_create_registers_and_configures_device() {
        let server = start_server().await;
        let endpoint = endpoint_file(server.local_addr().port());
        let notifier = Arc::new(CountingNotifier::new());
        let (deps, factory) = deps(notifier.clone());

        let client = TunnelClient::create("dev-1", fast_config(&endpoint), deps)
            .await
            .unwrap();
        assert!(client.is_connected());
        assert_eq!(
            client.virtual_address().await,
            Some("10.0.0.2/24".parse().unwrap())
        );
        let handle = factory.last_handle().unwrap();
        assert_eq!(handle.address(), Some("10.0.0.2/24".parse().unwrap()));
        assert!(handle.is_up());

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_fails_on_missing_endpoint_file() {
        let notifier = Arc::new(CountingNotifier::new());
        let (deps, _factory) = deps(notifier);
        let config = ClientConfig::new("/nonexistent/edge-overlay/endpoint");
        let result = TunnelClient::create("dev-1", config, deps).await;
        assert!(matches!(result, Err(OverlayError::Config(_))));
    }

    #[tokio::test]
    async fn test_create_fails_on_device_error() {
        let server = start_server().await;
        let endpoint = endpoint_file(server.local_addr().port());
        let deps = ClientDeps {
            transport: Transport::plain(),
            interfaces: Arc::new(MemoryFactory::failing()),
            notifier: Arc::new(CountingNotifier::new()),
            broadcast: None,
        };
        let result = TunnelClient::create("dev-1", fast_config(&endpoint), deps).await;
        assert!(matches!(result, Err(OverlayError::Device(_))));
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_fails_on_bad_address_answer() {
        // A fake server that answers registration with garbage.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            crate::framing::read_message(&mut stream, 1024).await.unwrap();
            crate::framing::write_message(&mut stream, b"not-an-address")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let endpoint = endpoint_file(port);
        let (deps, _factory) = deps(Arc::new(CountingNotifier::new()));
        let result = TunnelClient::create("dev-1", fast_config(&endpoint), deps).await;
        assert!(matches!(result, Err(OverlayError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_packets_flow_between_device_and_server() {
        let server = start_server().await;
        let endpoint = endpoint_file(server.local_addr().port());
        let notifier = Arc::new(CountingNotifier::new());
        let (deps, factory) = deps(notifier);

        let client = TunnelClient::create("dev-1", fast_config(&endpoint), deps)
            .await
            .unwrap();
        client.run().await.unwrap();
        let handle = factory.last_handle().unwrap();

        // Packet to an address without a session lands on the server's device.
        let packet = crate::packet::ipv4_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            b"to-server",
        );
        handle.inject(packet.clone()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while server.stats().packets_to_device == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_twice() {
        let server = start_server().await;
        let endpoint = endpoint_file(server.local_addr().port());
        let notifier = Arc::new(CountingNotifier::new());
        let (deps, factory) = deps(notifier.clone());

        let client = TunnelClient::create("dev-1", fast_config(&endpoint), deps)
            .await
            .unwrap();
        client.run().await.unwrap();

        assert!(client.close().await.is_ok());
        assert!(!client.is_alive());
        assert!(!client.is_connected());
        assert_eq!(notifier.closed(), 1);
        assert!(matches!(
            client.close().await,
            Err(OverlayError::NotAlive("Client"))
        ));
        assert_eq!(notifier.closed(), 1);
        assert!(!factory.last_handle().unwrap().is_up());
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_retries_until_server_is_up() {
        // Reserve a port, then free it so the first dials are refused.
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let endpoint = endpoint_file(port);
        let (deps, _factory) = deps(Arc::new(CountingNotifier::new()));
        let config = fast_config(&endpoint);
        let connecting = tokio::spawn(TunnelClient::create("dev-1", config, deps));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!connecting.is_finished());

        let server_config = ServerConfig {
            listen_addr: "127.0.0.1".into(),
            port,
            ..Default::default()
        };
        let server = TunnelServer::create(server_config, Transport::plain(), Arc::new(MemoryFactory::new()))
            .await
            .unwrap();
        server.run().await.unwrap();

        let client = tokio::time::timeout(Duration::from_secs(5), connecting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(client.is_connected());
        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Records the connected flag each notice observes.
    #[derive(Default)]
    struct ConnectedAtNotice {
        client: std::sync::OnceLock<TunnelClient>,
        seen: std::sync::Mutex<Vec<(&'static str, bool)>>,
    }

    impl ConnectedAtNotice {
        fn record(&self, notice: &'static str) {
            let connected = self.client.get().map(|c| c.is_connected()).unwrap_or(false);
            self.seen.lock().unwrap().push((notice, connected));
        }

        fn seen(&self) -> Vec<(&'static str, bool)> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl DiscoveryNotifier for ConnectedAtNotice {
        fn connection_closed(&self) {
            self.record("closed");
        }

        fn connection_reconciled(&self) {
            self.record("reconciled");
        }
    }

    #[tokio::test]
    async fn test_handle_error_during_reconnect_is_ignored() {
        let server = start_server().await;
        let port = server.local_addr().port();
        let endpoint = endpoint_file(port);
        let notifier = Arc::new(CountingNotifier::new());
        let (deps, factory) = deps(notifier.clone());

        let client = TunnelClient::create("dev-1", fast_config(&endpoint), deps)
            .await
            .unwrap();
        client.run().await.unwrap();

        server.close().await.unwrap();
        wait_for(|| notifier.closed() == 1).await;

        // The supervisor is already retrying; this must not start a second loop.
        let lost = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        tokio::time::timeout(Duration::from_secs(1), client.handle_error(OverlayError::Transport(lost)))
            .await
            .expect("handle_error blocked on a second reconnect");
        assert_eq!(notifier.closed(), 1);

        let restarted = start_server_on(port).await;
        wait_for(|| notifier.reconciled() == 1).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(notifier.reconciled(), 1);
        assert_eq!(notifier.closed(), 1);
        assert_eq!(factory.created_count(), 2);
        let up = factory.handles().iter().filter(|h| h.is_up()).count();
        assert_eq!(up, 1);
        assert_eq!(restarted.session_count().await, 1);

        client.close().await.unwrap();
        restarted.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_notices_see_updated_connected_flag() {
        let server = start_server().await;
        let port = server.local_addr().port();
        let endpoint = endpoint_file(port);
        let notifier = Arc::new(ConnectedAtNotice::default());
        let deps = ClientDeps {
            transport: Transport::plain(),
            interfaces: Arc::new(MemoryFactory::new()),
            notifier: notifier.clone(),
            broadcast: None,
        };

        let client = TunnelClient::create("dev-1", fast_config(&endpoint), deps)
            .await
            .unwrap();
        let _ = notifier.client.set(client.clone());
        client.run().await.unwrap();

        server.close().await.unwrap();
        wait_for(|| notifier.seen().len() == 1).await;
        let restarted = start_server_on(port).await;
        wait_for(|| notifier.seen().len() == 2).await;

        assert_eq!(notifier.seen(), vec![("closed", false), ("reconciled", true)]);

        client.close().await.unwrap();
        restarted.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_during_reconcile_wait_releases_new_device() {
        let server = start_server().await;
        let port = server.local_addr().port();
        let endpoint = endpoint_file(port);
        let notifier = Arc::new(CountingNotifier::new());
        let (deps, factory) = deps(notifier.clone());
        let mut config = fast_config(&endpoint);
        config.reconcile_delay_ms = 5_000;

        let client = TunnelClient::create("dev-1", config, deps).await.unwrap();
        client.run().await.unwrap();

        server.close().await.unwrap();
        wait_for(|| notifier.closed() == 1).await;
        let restarted = start_server_on(port).await;
        wait_for(|| factory.created_count() == 2).await;
        // Let the rebuilt link reach the reconcile wait.
        tokio::time::sleep(Duration::from_millis(100)).await;

        client.close().await.unwrap();
        assert_eq!(notifier.reconciled(), 0);
        assert!(factory.handles().iter().all(|h| !h.is_up()));
        restarted.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_endpoint_file_reread_between_attempts() {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = probe.local_addr().unwrap().port();
        drop(probe);

        let endpoint = endpoint_file(dead_port);
        let (deps, _factory) = deps(Arc::new(CountingNotifier::new()));
        let connecting = tokio::spawn(TunnelClient::create("dev-1", fast_config(&endpoint), deps));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!connecting.is_finished());

        // Point the endpoint file at a live server mid-outage.
        let server = start_server().await;
        std::fs::write(
            endpoint.path(),
            format!("127.0.0.1\n{}\n", server.local_addr().port()),
        )
        .unwrap();

        let client = tokio::time::timeout(Duration::from_secs(5), connecting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(client.is_connected());
        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_interface_triggers_reconnect() {
        let server = start_server().await;
        let endpoint = endpoint_file(server.local_addr().port());
        let notifier = Arc::new(CountingNotifier::new());
        let (deps, factory) = deps(notifier.clone());

        let client = TunnelClient::create("dev-1", fast_config(&endpoint), deps)
            .await
            .unwrap();
        client.run().await.unwrap();

        // An empty read is end of stream for the interface.
        factory.last_handle().unwrap().inject(Vec::new()).await.unwrap();
        wait_for(|| notifier.reconciled() == 1).await;
        assert_eq!(notifier.closed(), 1);
        assert_eq!(factory.created_count(), 2);
        assert!(client.is_connected());

        client.close().await.unwrap();
        server.close().await.unwrap();
    }
}

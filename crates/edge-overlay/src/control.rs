//! Starting a complete overlay endpoint.
//!
//! The server side is a tunnel server plus the broadcast HTTP endpoint that
//! shares its peer registry. The client side is a tunnel client wired to a
//! broadcast client so every (re)connect is announced.

use crate::broadcast::{BroadcastClient, BroadcastServer, Cipher, PeerPublisher};
use crate::client::{ClientDeps, TunnelClient};
use crate::config::{BroadcastConfig, ClientConfig, ServerConfig};
use crate::device::InterfaceFactory;
use crate::discovery::{DiscoveryNotifier, NetworkInfo};
use crate::error::{OverlayError, OverlayResult};
use crate::server::TunnelServer;
use crate::transport::Transport;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

/// Collaborators shared by both sides.
#[derive(Clone)]
pub struct Capabilities {
    pub transport: Transport,
    pub interfaces: Arc<dyn InterfaceFactory>,
    pub network: Arc<dyn NetworkInfo>,
    pub cipher: Arc<dyn Cipher>,
    pub publisher: Arc<dyn PeerPublisher>,
}

/// A host's own addresses on both networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayAddresses {
    pub virtual_ip: Ipv4Addr,
    pub private_ip: Ipv4Addr,
}

/// Running tunnel and broadcast servers.
pub struct ServerHandle {
    tunnel: TunnelServer,
    broadcast_addr: SocketAddr,
    broadcast_stop: Mutex<Option<oneshot::Sender<()>>>,
    broadcast_task: Mutex<Option<JoinHandle<OverlayResult<()>>>>,
    private_ip: Ipv4Addr,
}

impl ServerHandle {
    pub fn tunnel(&self) -> &TunnelServer {
        &self.tunnel
    }

    pub fn broadcast_addr(&self) -> SocketAddr {
        self.broadcast_addr
    }

    pub fn addresses(&self) -> OverlayAddresses {
        OverlayAddresses {
            virtual_ip: self.tunnel.server_ip(),
            private_ip: self.private_ip,
        }
    }

    /// Stop the broadcast endpoint, then the tunnel server.
    ///
    /// Returns `NotAlive` if already closed.
    pub async fn close(&self) -> OverlayResult<()> {
        if let Some(stop) = self.broadcast_stop.lock().await.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.broadcast_task.lock().await.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Broadcast server exited with error: {}", e),
                Err(e) => log::warn!("Broadcast server task failed: {}", e),
            }
        }
        self.tunnel.close().await
    }
}

/// Start the tunnel server and its broadcast endpoint, and record the
/// server's own peer entry under `device_id`.
pub async fn start_server(
    device_id: &str,
    server_config: ServerConfig,
    broadcast_config: BroadcastConfig,
    caps: Capabilities,
) -> OverlayResult<ServerHandle> {
    broadcast_config.validate().map_err(OverlayError::config)?;
    let private_ip = caps.network.private_ip()?;
    let listen_host = server_config.listen_addr.clone();

    let tunnel = TunnelServer::create(server_config, caps.transport, caps.interfaces).await?;
    tunnel.run().await?;

    let broadcast = BroadcastServer::new(tunnel.clone(), caps.cipher, caps.publisher, broadcast_config);
    broadcast.register_self(device_id, private_ip).await;

    let listener = match broadcast.bind(&listen_host).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = tunnel.close().await;
            return Err(e);
        }
    };
    let broadcast_addr = listener.local_addr()?;
    let (stop_tx, stop_rx) = oneshot::channel();
    let task = tokio::spawn(broadcast.serve(listener, async {
        let _ = stop_rx.await;
    }));

    Ok(ServerHandle {
        tunnel,
        broadcast_addr,
        broadcast_stop: Mutex::new(Some(stop_tx)),
        broadcast_task: Mutex::new(Some(task)),
        private_ip,
    })
}

/// Register with the tunnel server, start the client, and announce it.
pub async fn start_client(
    device_id: &str,
    client_config: ClientConfig,
    broadcast_config: BroadcastConfig,
    caps: Capabilities,
    notifier: Arc<dyn DiscoveryNotifier>,
) -> OverlayResult<TunnelClient> {
    broadcast_config.validate().map_err(OverlayError::config)?;
    let broadcast = BroadcastClient::new(
        client_config.endpoint_file.clone(),
        broadcast_config,
        caps.cipher,
        caps.network,
        caps.publisher,
    );
    let deps = ClientDeps {
        transport: caps.transport,
        interfaces: caps.interfaces,
        notifier,
        broadcast: Some(Arc::new(broadcast)),
    };
    let client = TunnelClient::create(device_id, client_config, deps).await?;
    client.run().await?;
    Ok(client)
}

/// The client's current addresses, if it holds a virtual one.
pub async fn client_addresses(
    client: &TunnelClient,
    network: &dyn NetworkInfo,
) -> OverlayResult<Option<OverlayAddresses>> {
    let Some(virtual_net) = client.virtual_address().await else {
        return Ok(None);
    };
    Ok(Some(OverlayAddresses {
        virtual_ip: virtual_net.addr(),
        private_ip: network.private_ip()?,
    }))
}

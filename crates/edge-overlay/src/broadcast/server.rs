//! Broadcast registration server.

use super::{Cipher, PeerPublisher, PeerRegistration, REGISTER_PATH};
use crate::config::BroadcastConfig;
use crate::error::{OverlayError, OverlayResult};
use crate::server::TunnelServer;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Clone)]
struct BroadcastState {
    tunnel: TunnelServer,
    cipher: Arc<dyn Cipher>,
    publisher: Arc<dyn PeerPublisher>,
    config: Arc<BroadcastConfig>,
}

/// HTTP endpoint that records peers and introduces them to each other.
///
/// Peer records live in the tunnel server's registry.
pub struct BroadcastServer {
    state: BroadcastState,
}

impl BroadcastServer {
    pub fn new(
        tunnel: TunnelServer,
        cipher: Arc<dyn Cipher>,
        publisher: Arc<dyn PeerPublisher>,
        config: BroadcastConfig,
    ) -> Self {
        Self {
            state: BroadcastState {
                tunnel,
                cipher,
                publisher,
                config: Arc::new(config),
            },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(REGISTER_PATH, post(handle_register))
            .with_state(self.state.clone())
    }

    /// Record the server's own addresses.
    pub async fn register_self(&self, device_id: &str, private_ip: Ipv4Addr) {
        let virtual_ip = self.state.tunnel.server_ip();
        self.state
            .tunnel
            .set_client_ip(device_id, &private_ip.to_string(), &virtual_ip.to_string())
            .await;
        log::info!(
            "Registered server record {} ({} / {})",
            device_id,
            private_ip,
            virtual_ip
        );
    }

    /// Bind the configured broadcast port on `host`.
    pub async fn bind(&self, host: &str) -> OverlayResult<TcpListener> {
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        let listener = TcpListener::bind((host, self.state.config.port)).await?;
        Ok(listener)
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> OverlayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = listener.local_addr()?;
        log::info!("Broadcast server listening on {}", addr);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(OverlayError::Transport)?;
        log::info!("Broadcast server on {} stopped", addr);
        Ok(())
    }
}

async fn handle_register(State(state): State<BroadcastState>, body: Bytes) -> StatusCode {
    let payload = match PeerRegistration::open(state.cipher.as_ref(), &body) {
        Ok(payload) => payload,
        Err(OverlayError::Cipher(e)) => {
            log::warn!("Rejecting registration: {}", e);
            return StatusCode::SERVICE_UNAVAILABLE;
        }
        Err(e) => {
            log::warn!("Rejecting registration: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    state
        .tunnel
        .set_client_ip(&payload.device_id, &payload.private_ip, &payload.virtual_ip)
        .await;
    log::info!(
        "Peer {} registered ({} / {})",
        payload.device_id,
        payload.private_ip,
        payload.virtual_ip
    );

    tokio::spawn(fan_out(state, payload));
    StatusCode::OK
}

/// Introduce `newcomer` and every other known peer to each other.
async fn fan_out(state: BroadcastState, newcomer: PeerRegistration) {
    let sealed_newcomer = match newcomer.seal(state.cipher.as_ref()) {
        Ok(sealed) => sealed,
        Err(e) => {
            log::warn!("Broadcast of {} abandoned: {}", newcomer.device_id, e);
            return;
        }
    };
    let newcomer_url = peer_url(&state.config, &newcomer.virtual_ip);

    let peers = state.tunnel.client_ip_map().await;
    for (device_id, record) in peers {
        if device_id == newcomer.device_id {
            continue;
        }

        let url = peer_url(&state.config, &record.virtual_ip);
        if let Err(e) = state.publisher.publish(&url, sealed_newcomer.clone()).await {
            log::warn!("Announcing {} to {} failed: {}", newcomer.device_id, device_id, e);
        }

        let existing = PeerRegistration::new(device_id.as_str(), record.private_ip, record.virtual_ip);
        let sealed = match existing.seal(state.cipher.as_ref()) {
            Ok(sealed) => sealed,
            Err(e) => {
                log::warn!("Broadcast of {} abandoned: {}", device_id, e);
                continue;
            }
        };
        if let Err(e) = state.publisher.publish(&newcomer_url, sealed).await {
            log::warn!("Announcing {} to {} failed: {}", device_id, newcomer.device_id, e);
        }
    }
}

fn peer_url(config: &BroadcastConfig, virtual_ip: &str) -> String {
    format!("http://{}:{}{}", virtual_ip, config.peer_port, config.peer_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{AesGcmCipher, HttpPublisher, RecordingPublisher};
    use crate::config::ServerConfig;
    use crate::device::MemoryFactory;
    use crate::transport::Transport;
    use std::time::Duration;

    async fn tunnel() -> TunnelServer {
        let config = ServerConfig {
            listen_addr: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };
        TunnelServer::create(config, Transport::plain(), Arc::new(MemoryFactory::new()))
            .await
            .unwrap()
    }

    async fn start(
        tunnel: TunnelServer,
        cipher: Arc<dyn Cipher>,
        publisher: Arc<RecordingPublisher>,
    ) -> (SocketAddr, BroadcastServer, tokio::sync::oneshot::Sender<()>) {
        let config = BroadcastConfig {
            port: 0,
            ..Default::default()
        };
        let server = BroadcastServer::new(tunnel.clone(), cipher.clone(), publisher.clone(), config.clone());
        let listener = server.bind("127.0.0.1").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
        let serving = BroadcastServer::new(tunnel, cipher, publisher, config);
        tokio::spawn(serving.serve(listener, async {
            let _ = stop_rx.await;
        }));
        (addr, server, stop_tx)
    }

    async fn post(addr: SocketAddr, body: Vec<u8>) -> reqwest::StatusCode {
        reqwest::Client::new()
            .post(format!("http://{}{}", addr, REGISTER_PATH))
            .body(body)
            .send()
            .await
            .unwrap()
            .status()
    }

    async fn wait_for_posts(publisher: &RecordingPublisher, count: usize) -> Vec<(String, Vec<u8>)> {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let posts = publisher.posts();
                if posts.len() >= count {
                    return posts;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_stores_record() {
        let tunnel = tunnel().await;
        let cipher: Arc<dyn Cipher> = Arc::new(AesGcmCipher::from_passphrase("edge").unwrap());
        let publisher = Arc::new(RecordingPublisher::new());
        let (addr, _server, _stop) = start(tunnel.clone(), cipher.clone(), publisher).await;

        let body = PeerRegistration::new("dev-1", "192.168.1.10", "10.0.0.2")
            .seal(cipher.as_ref())
            .unwrap();
        assert_eq!(post(addr, body).await, reqwest::StatusCode::OK);

        let map = tunnel.client_ip_map().await;
        assert_eq!(map["dev-1"].private_ip, "192.168.1.10");
        assert_eq!(map["dev-1"].virtual_ip, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_undecryptable_body_is_503() {
        let tunnel = tunnel().await;
        let cipher: Arc<dyn Cipher> = Arc::new(AesGcmCipher::from_passphrase("edge").unwrap());
        let publisher = Arc::new(RecordingPublisher::new());
        let (addr, _server, _stop) = start(tunnel.clone(), cipher, publisher).await;

        let wrong = AesGcmCipher::from_passphrase("other").unwrap();
        let body = PeerRegistration::new("dev-1", "192.168.1.10", "10.0.0.2")
            .seal(&wrong)
            .unwrap();
        assert_eq!(post(addr, body).await, reqwest::StatusCode::SERVICE_UNAVAILABLE);
        assert!(tunnel.client_ip_map().await.is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_introduces_both_sides() {
        let tunnel = tunnel().await;
        let cipher: Arc<dyn Cipher> = Arc::new(AesGcmCipher::from_passphrase("edge").unwrap());
        let publisher = Arc::new(RecordingPublisher::new());
        let (addr, server, _stop) = start(tunnel.clone(), cipher.clone(), publisher.clone()).await;
        server
            .register_self("edge-orchestration-server", Ipv4Addr::new(192, 168, 1, 1))
            .await;

        let body = PeerRegistration::new("dev-1", "192.168.1.10", "10.0.0.2")
            .seal(cipher.as_ref())
            .unwrap();
        assert_eq!(post(addr, body).await, reqwest::StatusCode::OK);

        let posts = wait_for_posts(&publisher, 2).await;
        assert_eq!(posts.len(), 2);

        let to_server = posts
            .iter()
            .find(|(url, _)| url == "http://10.0.0.1:56002/api/v1/discoverymgr/register")
            .unwrap();
        let announced = PeerRegistration::open(cipher.as_ref(), &to_server.1).unwrap();
        assert_eq!(announced.device_id, "dev-1");

        let to_newcomer = posts
            .iter()
            .find(|(url, _)| url == "http://10.0.0.2:56002/api/v1/discoverymgr/register")
            .unwrap();
        let introduced = PeerRegistration::open(cipher.as_ref(), &to_newcomer.1).unwrap();
        assert_eq!(introduced.device_id, "edge-orchestration-server");
        assert_eq!(introduced.virtual_ip, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_failing_peer_does_not_stop_fan_out() {
        let tunnel = tunnel().await;
        tunnel.set_client_ip("dev-a", "192.168.1.2", "10.0.0.3").await;
        tunnel.set_client_ip("dev-b", "192.168.1.3", "10.0.0.4").await;

        let cipher: Arc<dyn Cipher> = Arc::new(crate::broadcast::PlainCipher);
        let publisher = Arc::new(
            RecordingPublisher::new().failing_on("http://10.0.0.3:56002/api/v1/discoverymgr/register"),
        );
        let (addr, _server, _stop) = start(tunnel, cipher.clone(), publisher.clone()).await;

        let body = PeerRegistration::new("dev-1", "192.168.1.10", "10.0.0.2")
            .seal(cipher.as_ref())
            .unwrap();
        assert_eq!(post(addr, body).await, reqwest::StatusCode::OK);

        // Two known peers, two POSTs each; the failure is not retried.
        let posts = wait_for_posts(&publisher, 4).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(publisher.posts().len(), 4);
        assert_eq!(
            posts
                .iter()
                .filter(|(url, _)| url.starts_with("http://10.0.0.2:"))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_reregistration_overwrites() {
        let tunnel = tunnel().await;
        let cipher: Arc<dyn Cipher> = Arc::new(crate::broadcast::PlainCipher);
        let publisher = Arc::new(RecordingPublisher::new());
        let (addr, _server, _stop) = start(tunnel.clone(), cipher.clone(), publisher).await;

        for private in ["192.168.1.10", "192.168.1.11"] {
            let body = PeerRegistration::new("dev-1", private, "10.0.0.2")
                .seal(cipher.as_ref())
                .unwrap();
            assert_eq!(post(addr, body).await, reqwest::StatusCode::OK);
        }
        let map = tunnel.client_ip_map().await;
        assert_eq!(map.len(), 1);
        assert_eq!(map["dev-1"].private_ip, "192.168.1.11");
    }

    #[tokio::test]
    async fn test_http_publisher_reports_status() {
        let tunnel = tunnel().await;
        let cipher: Arc<dyn Cipher> = Arc::new(AesGcmCipher::from_passphrase("edge").unwrap());
        let (addr, _server, _stop) =
            start(tunnel, cipher, Arc::new(RecordingPublisher::new())).await;

        let publisher = HttpPublisher::new(Duration::from_secs(2)).unwrap();
        let url = format!("http://{}{}", addr, REGISTER_PATH);
        // Plaintext cannot be decrypted by the server: 503.
        let result = publisher.publish(&url, b"{}".to_vec()).await;
        assert!(matches!(result, Err(OverlayError::Http(_))));
    }
}

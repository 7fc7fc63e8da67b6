//! Broadcast registration client.

use super::{Cipher, PeerPublisher, PeerRegistration, REGISTER_PATH};
use crate::config::{BroadcastConfig, EndpointFile};
use crate::discovery::NetworkInfo;
use crate::error::{OverlayError, OverlayResult};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

/// Announces this device to the broadcast server.
pub struct BroadcastClient {
    endpoint_file: PathBuf,
    config: BroadcastConfig,
    cipher: Arc<dyn Cipher>,
    network: Arc<dyn NetworkInfo>,
    publisher: Arc<dyn PeerPublisher>,
}

impl BroadcastClient {
    pub fn new(
        endpoint_file: impl Into<PathBuf>,
        config: BroadcastConfig,
        cipher: Arc<dyn Cipher>,
        network: Arc<dyn NetworkInfo>,
        publisher: Arc<dyn PeerPublisher>,
    ) -> Self {
        Self {
            endpoint_file: endpoint_file.into(),
            config,
            cipher,
            network,
            publisher,
        }
    }

    /// Announce `device_id` with its virtual address.
    ///
    /// Delivery failures are retried up to the configured number of attempts;
    /// endpoint, address and cipher failures are returned at once.
    pub async fn register(&self, device_id: &str, virtual_ip: Ipv4Addr) -> OverlayResult<()> {
        let endpoint = EndpointFile::load(&self.endpoint_file)?;
        let private_ip = self.network.private_ip()?;
        let body = PeerRegistration::new(device_id, private_ip.to_string(), virtual_ip.to_string())
            .seal(self.cipher.as_ref())?;
        let url = format!("http://{}:{}{}", endpoint.host, self.config.port, REGISTER_PATH);

        let mut last_err = None;
        for attempt in 1..=self.config.max_attempts {
            match self.publisher.publish(&url, body.clone()).await {
                Ok(()) => {
                    log::info!("Registered {} with broadcast server {}", device_id, url);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!(
                        "Broadcast registration attempt {}/{} to {} failed: {}",
                        attempt,
                        self.config.max_attempts,
                        url,
                        e
                    );
                    last_err = Some(e);
                }
            }
            if attempt < self.config.max_attempts {
                tokio::time::sleep(self.config.retry_delay()).await;
            }
        }
        Err(last_err.unwrap_or_else(|| OverlayError::Http(format!("No attempts made to {}", url))))
    }
}

//! Broadcast peer exchange.
//!
//! Clients announce `{DeviceID, PrivateIP, VirtualIP}` to the broadcast
//! server after every (re)connect. The server records the announcement and
//! introduces the new peer and every known peer to each other through their
//! local registration endpoints.
//!
//! Payloads are JSON, encrypted with the configured [`Cipher`].

mod cipher;
mod client;
mod server;

pub use self::cipher::{AesGcmCipher, Cipher, PlainCipher};
pub use self::client::BroadcastClient;
pub use self::server::BroadcastServer;

use crate::error::{OverlayError, OverlayResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Path of the broadcast server's registration route.
pub const REGISTER_PATH: &str = "/register";

/// One peer's addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRegistration {
    #[serde(rename = "DeviceID", alias = "deviceId", alias = "device_id")]
    pub device_id: String,
    #[serde(rename = "PrivateIP", alias = "privateIp", alias = "private_ip")]
    pub private_ip: String,
    #[serde(rename = "VirtualIP", alias = "virtualIp", alias = "virtual_ip")]
    pub virtual_ip: String,
}

impl PeerRegistration {
    pub fn new(
        device_id: impl Into<String>,
        private_ip: impl Into<String>,
        virtual_ip: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            private_ip: private_ip.into(),
            virtual_ip: virtual_ip.into(),
        }
    }

    /// Serialize and encrypt.
    pub fn seal(&self, cipher: &dyn Cipher) -> OverlayResult<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| OverlayError::Cipher(format!("Failed to encode payload: {}", e)))?;
        cipher.encrypt(&json)
    }

    /// Decrypt and deserialize.
    pub fn open(cipher: &dyn Cipher, body: &[u8]) -> OverlayResult<Self> {
        let json = cipher.decrypt(body)?;
        serde_json::from_slice(&json)
            .map_err(|e| OverlayError::Protocol(format!("Invalid registration payload: {}", e)))
    }
}

/// Delivers an encrypted registration to a URL.
#[async_trait]
pub trait PeerPublisher: Send + Sync {
    /// POST `body`. Anything but `200 OK` is an error.
    async fn publish(&self, url: &str, body: Vec<u8>) -> OverlayResult<()>;
}

/// [`PeerPublisher`] over HTTP.
#[derive(Clone)]
pub struct HttpPublisher {
    client: reqwest::Client,
}

impl HttpPublisher {
    pub fn new(timeout: Duration) -> OverlayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OverlayError::Http(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PeerPublisher for HttpPublisher {
    async fn publish(&self, url: &str, body: Vec<u8>) -> OverlayResult<()> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| OverlayError::Http(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(OverlayError::Http(format!(
                "POST {} answered {}",
                url, status
            )));
        }
        Ok(())
    }
}

/// [`PeerPublisher`] that records every POST instead of sending it.
#[derive(Default)]
pub struct RecordingPublisher {
    posts: Mutex<Vec<(String, Vec<u8>)>>,
    failing_urls: Vec<String>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer POSTs to `url` with an error (they are still recorded).
    pub fn failing_on(mut self, url: impl Into<String>) -> Self {
        self.failing_urls.push(url.into());
        self
    }

    /// Every POST so far, oldest first.
    pub fn posts(&self) -> Vec<(String, Vec<u8>)> {
        self.posts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl PeerPublisher for RecordingPublisher {
    async fn publish(&self, url: &str, body: Vec<u8>) -> OverlayResult<()> {
        self.posts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((url.to_string(), body));
        if self.failing_urls.iter().any(|u| u == url) {
            return Err(OverlayError::Http(format!("POST {} answered 500", url)));
        }
        Ok(())
    }
}

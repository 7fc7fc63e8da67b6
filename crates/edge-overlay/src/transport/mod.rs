//! Byte-stream transport with framed messages.
//!
//! A [`Transport`] dials or listens for TCP connections, either plain or
//! secured with a pre-shared-key session (see [`psk`]). Both variants expose
//! the same [`Connection`] API: one `send` writes exactly one frame, one
//! `receive` returns exactly one frame.

pub mod psk;

use crate::error::{OverlayError, OverlayResult};
use crate::framing::{read_message, write_message, MAX_FRAME_SIZE};
use psk::{client_handshake, server_handshake, PskProvider, SessionCipher, SEAL_OVERHEAD};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

pub use psk::{generate_psk, StaticPskProvider};

/// Bound on a PSK negotiation so a silent peer cannot hold a registration slot.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
enum Security {
    Plain,
    Psk(Arc<dyn PskProvider>),
}

/// Connection factory, plain or PSK-secured.
#[derive(Clone)]
pub struct Transport {
    security: Security,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("secure", &self.is_secure())
            .finish()
    }
}

impl Transport {
    /// Plain framed TCP.
    pub fn plain() -> Self {
        Self {
            security: Security::Plain,
        }
    }

    /// Framed TCP with a pre-shared-key session.
    pub fn psk(provider: Arc<dyn PskProvider>) -> Self {
        Self {
            security: Security::Psk(provider),
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.security, Security::Psk(_))
    }

    /// Dial `host:port` and complete the session setup.
    pub async fn connect(&self, host: &str, port: u16) -> OverlayResult<Connection> {
        let mut stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;

        let cipher = match &self.security {
            Security::Plain => None,
            Security::Psk(provider) => {
                let cipher = tokio::time::timeout(
                    HANDSHAKE_TIMEOUT,
                    client_handshake(&mut stream, provider.as_ref()),
                )
                .await
                .map_err(|_| OverlayError::Handshake("Timed out".into()))??;
                Some(Arc::new(cipher))
            }
        };

        log::debug!("Connected to {} (secure: {})", peer, cipher.is_some());
        Ok(Connection::new(stream, peer, cipher))
    }

    /// Bind a listener on `host:port`. An empty host binds all interfaces.
    pub async fn listen(&self, host: &str, port: u16) -> OverlayResult<Listener> {
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        let inner = TcpListener::bind((host, port)).await?;
        log::info!("Tunnel transport listening on {}", inner.local_addr()?);
        Ok(Listener {
            inner,
            security: self.security.clone(),
        })
    }
}

/// Listening side of a [`Transport`].
pub struct Listener {
    inner: TcpListener,
    security: Security,
}

impl Listener {
    /// Accept the next TCP connection.
    ///
    /// Session setup runs in [`Connecting::establish`] so a slow peer never
    /// stalls the accept loop.
    pub async fn accept(&self) -> OverlayResult<Connecting> {
        let (stream, peer) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Connecting {
            stream,
            peer,
            security: self.security.clone(),
        })
    }

    pub fn local_addr(&self) -> OverlayResult<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }
}

/// An accepted connection whose session is not yet set up.
pub struct Connecting {
    stream: TcpStream,
    peer: SocketAddr,
    security: Security,
}

impl Connecting {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Complete the session setup (PSK handshake when secured).
    pub async fn establish(mut self) -> OverlayResult<Connection> {
        let cipher = match &self.security {
            Security::Plain => None,
            Security::Psk(provider) => {
                let (cipher, identity) = tokio::time::timeout(
                    HANDSHAKE_TIMEOUT,
                    server_handshake(&mut self.stream, provider.as_ref()),
                )
                .await
                .map_err(|_| OverlayError::Handshake("Timed out".into()))??;
                log::debug!("PSK session with {} as '{}'", self.peer, identity);
                Some(Arc::new(cipher))
            }
        };
        Ok(Connection::new(self.stream, self.peer, cipher))
    }
}

/// An established, framed connection.
pub struct Connection {
    reader: ConnectionReader,
    writer: ConnectionWriter,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr, cipher: Option<Arc<SessionCipher>>) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: ConnectionReader {
                inner: read_half,
                cipher: cipher.clone(),
                peer,
            },
            writer: ConnectionWriter {
                inner: write_half,
                cipher,
                peer,
            },
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.reader.peer
    }

    /// Send one frame.
    pub async fn send(&mut self, data: &[u8]) -> OverlayResult<()> {
        self.writer.send(data).await
    }

    /// Receive one frame.
    pub async fn receive(&mut self) -> OverlayResult<Vec<u8>> {
        self.reader.receive().await
    }

    /// Split into independently owned halves for concurrent send/receive tasks.
    pub fn into_split(self) -> (ConnectionReader, ConnectionWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.reader.peer)
            .field("encrypted", &self.reader.cipher.is_some())
            .finish_non_exhaustive()
    }
}

/// Receiving half of a [`Connection`].
pub struct ConnectionReader {
    inner: OwnedReadHalf,
    cipher: Option<Arc<SessionCipher>>,
    peer: SocketAddr,
}

impl ConnectionReader {
    pub async fn receive(&mut self) -> OverlayResult<Vec<u8>> {
        match &self.cipher {
            None => read_message(&mut self.inner, MAX_FRAME_SIZE).await,
            Some(cipher) => {
                let sealed = read_message(&mut self.inner, MAX_FRAME_SIZE + SEAL_OVERHEAD).await?;
                cipher.open(&sealed)
            }
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

/// Sending half of a [`Connection`].
pub struct ConnectionWriter {
    inner: OwnedWriteHalf,
    cipher: Option<Arc<SessionCipher>>,
    peer: SocketAddr,
}

impl ConnectionWriter {
    pub async fn send(&mut self, data: &[u8]) -> OverlayResult<()> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(OverlayError::Protocol(format!(
                "Frame too large: {} > {}",
                data.len(),
                MAX_FRAME_SIZE
            )));
        }
        match &self.cipher {
            None => write_message(&mut self.inner, data).await,
            Some(cipher) => {
                let sealed = cipher.seal(data)?;
                write_message(&mut self.inner, &sealed).await
            }
        }
    }

    /// Close the write direction.
    pub async fn shutdown(&mut self) -> OverlayResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

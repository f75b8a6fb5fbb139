//! TCP and TLS transport for chatlink sessions.
//!
//! A [`Transport`] opens one framed connection to the server. The connection
//! is split: writes go through [`Connection`], decoded inbound packets arrive
//! on an [`Inbound`] channel fed by a reader task owned by the connection.

use crate::error::LinkError;
use async_trait::async_trait;
use bytes::BytesMut;
use chatlink_wire::{FrameDecoder, Packet, DEFAULT_MAX_FRAME_SIZE};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

/// Decoded inbound packets, ending with the error that stopped the reader
pub type Inbound = mpsc::Receiver<Result<Packet, LinkError>>;

const INBOUND_CAPACITY: usize = 256;
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Opens connections to a chat server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `address` and start reading frames
    async fn open(&self, address: &str) -> Result<(Arc<dyn Connection>, Inbound), LinkError>;
}

/// Write side of an open connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Encode and write one packet
    async fn write(&self, packet: &Packet) -> Result<(), LinkError>;

    /// Close the connection. Idempotent.
    fn close(&self);

    /// Whether the connection is still usable
    fn is_open(&self) -> bool;
}

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS client stream
    #[cfg(feature = "tls")]
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Framed TCP transport, optionally wrapped in TLS
#[derive(Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    max_frame_size: usize,
    #[cfg(feature = "tls")]
    tls: Option<tls::TlsClientConfig>,
}

impl TcpTransport {
    /// Plain TCP with a connect timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Limit accepted and produced frame sizes
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Wrap every connection in TLS
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, tls: tls::TlsClientConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    async fn connect_stream(&self, address: &str) -> Result<IoStream, LinkError> {
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                LinkError::recoverable(format!(
                    "connecting to {} timed out after {:?}",
                    address, self.connect_timeout
                ))
            })?
            .map_err(|e| LinkError::recoverable(format!("failed to connect to {}: {}", address, e)))?;

        if let Err(e) = tcp.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", address, e);
        }

        #[cfg(feature = "tls")]
        if let Some(tls) = &self.tls {
            return tls::connect_tls(tls, tcp)
                .await
                .map_err(|e| LinkError::unrecoverable(format!("{:#}", e)));
        }

        Ok(IoStream::Plain(tcp))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, address: &str) -> Result<(Arc<dyn Connection>, Inbound), LinkError> {
        let stream = self.connect_stream(address).await?;
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let open = Arc::new(AtomicBool::new(true));

        let decoder = FrameDecoder::with_max_frame_size(self.max_frame_size);
        let reader_task = tokio::spawn(read_frames(
            reader,
            decoder,
            tx,
            Arc::clone(&open),
            address.to_string(),
        ));

        debug!("Connected to {}", address);
        let connection = TcpConnection {
            peer: address.to_string(),
            writer: Arc::new(Mutex::new(writer)),
            open,
            max_frame_size: self.max_frame_size,
            reader: reader_task.abort_handle(),
        };
        Ok((Arc::new(connection), rx))
    }
}

async fn read_frames(
    mut reader: ReadHalf<IoStream>,
    mut decoder: FrameDecoder,
    tx: mpsc::Sender<Result<Packet, LinkError>>,
    open: Arc<AtomicBool>,
    peer: String,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let failure = 'read: loop {
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(packet)) => {
                    if tx.send(Ok(packet)).await.is_err() {
                        trace!("Inbound receiver for {} dropped, stopping reader", peer);
                        open.store(false, Ordering::Release);
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => break 'read LinkError::from(e),
            }
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) => break LinkError::recoverable("connection closed by server"),
            Ok(n) => trace!("Read {} bytes from {}", n, peer),
            Err(e) => break LinkError::from(e),
        }
    };

    open.store(false, Ordering::Release);
    debug!("Reader for {} stopped: {}", peer, failure);
    let _ = tx.send(Err(failure)).await;
}

/// Write half of a framed TCP connection
pub struct TcpConnection {
    peer: String,
    writer: Arc<Mutex<WriteHalf<IoStream>>>,
    open: Arc<AtomicBool>,
    max_frame_size: usize,
    reader: AbortHandle,
}

#[async_trait]
impl Connection for TcpConnection {
    async fn write(&self, packet: &Packet) -> Result<(), LinkError> {
        if !self.is_open() {
            return Err(LinkError::recoverable(format!("connection to {} is closed", self.peer)));
        }

        let frame = packet.encode(self.max_frame_size)?;
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            warn!("Write to {} failed: {}", self.peer, e);
            self.open.store(false, Ordering::Release);
            return Err(e.into());
        }

        trace!("Sent '{}' (seq {}) to {}", packet.command, packet.sequence_id, self.peer);
        Ok(())
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.reader.abort();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let writer = Arc::clone(&self.writer);
            handle.spawn(async move {
                let _ = writer.lock().await.shutdown().await;
            });
        }
        debug!("Closed connection to {}", self.peer);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(feature = "tls")]
/// TLS client support
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, ServerName};
    use rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::TlsConnector;
    use tracing::info;

    /// Client-side TLS settings shared by every connection
    #[derive(Clone)]
    pub struct TlsClientConfig {
        /// rustls configuration
        pub client_config: Arc<ClientConfig>,
        /// SNI / certificate name to verify
        pub server_name: String,
    }

    /// Create a TLS client configuration trusting the CA certificates in `ca_pem`
    pub fn make_client_config(ca_pem: &str) -> Result<ClientConfig> {
        info!("Creating TLS client configuration");

        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut roots = RootCertStore::empty();
        let ca_results: Result<Vec<_>, _> = rustls_pemfile::certs(&mut ca_pem.as_bytes()).collect();
        let ca_certs = ca_results.context("Failed to parse CA certificates")?;
        if ca_certs.is_empty() {
            anyhow::bail!("No CA certificates found");
        }

        for ca_cert in ca_certs {
            roots
                .add(CertificateDer::from(ca_cert))
                .context("Failed to add CA certificate to root store")?;
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(config)
    }

    /// Run the TLS handshake over an established TCP stream
    pub async fn connect_tls(config: &TlsClientConfig, tcp_stream: TcpStream) -> Result<IoStream> {
        let peer_addr = tcp_stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        debug!("Connecting via TLS to {} (SNI: {})", peer_addr, config.server_name);

        let connector = TlsConnector::from(Arc::clone(&config.client_config));
        let server_name = ServerName::try_from(config.server_name.clone())
            .map_err(|_| anyhow::anyhow!("Invalid server name: {}", config.server_name))?;

        let tls_stream = connector.connect(server_name, tcp_stream).await.with_context(|| {
            format!(
                "TLS handshake failed with {} (SNI: {})",
                peer_addr, config.server_name
            )
        })?;

        Ok(IoStream::TlsClient(Box::new(tls_stream)))
    }
}

//! TCP transport implementation for LIME channels.
//!
//! Envelopes travel as one JSON document per line. Endpoints are addressed
//! with `net.tcp://host:port` URIs.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

use super::{Transport, TransportBase, TransportFactory};
use crate::error::{LimeError, Result};
use crate::protocol::Envelope;
use crate::serialization::{EnvelopeSerializer, JsonEnvelopeSerializer};

/// URI scheme of TCP endpoints
pub const TCP_URI_SCHEME: &str = "net.tcp";

/// Port used when the URI has none
pub const DEFAULT_TCP_PORT: u16 = 55321;

/// Upper bound of a single envelope frame
const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Parse a `net.tcp://host:port` endpoint into host and port.
pub fn parse_tcp_uri(uri: &str) -> Result<(String, u16)> {
    let parsed: http::Uri = uri
        .parse()
        .map_err(|e| LimeError::InvalidFormat(format!("'{uri}': {e}")))?;

    if parsed.scheme_str() != Some(TCP_URI_SCHEME) {
        return Err(LimeError::InvalidArgument(format!(
            "Invalid URI scheme. The expected value is '{TCP_URI_SCHEME}'"
        )));
    }

    let host = parsed
        .host()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| LimeError::InvalidArgument(format!("'{uri}' has no host")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');

    Ok((host.to_string(), parsed.port_u16().unwrap_or(DEFAULT_TCP_PORT)))
}

/// Transport over a connected TCP stream.
pub struct TcpTransport {
    reader: tokio::sync::Mutex<FramedRead<OwnedReadHalf, LinesCodec>>,
    writer: tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, LinesCodec>>,
    serializer: Arc<dyn EnvelopeSerializer>,
    remote_addr: SocketAddr,
    closed: CancellationToken,
    base: TransportBase,
}

impl TcpTransport {
    /// Wrap a connected stream.
    pub fn new(stream: TcpStream, serializer: Arc<dyn EnvelopeSerializer>) -> Result<Self> {
        let remote_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: tokio::sync::Mutex::new(FramedRead::new(
                read_half,
                LinesCodec::new_with_max_length(MAX_FRAME_LENGTH),
            )),
            writer: tokio::sync::Mutex::new(FramedWrite::new(
                write_half,
                LinesCodec::new_with_max_length(MAX_FRAME_LENGTH),
            )),
            serializer,
            remote_addr,
            closed: CancellationToken::new(),
            base: TransportBase::new(),
        })
    }

    /// Connect to a `net.tcp://` endpoint using the JSON serializer.
    pub async fn connect(uri: &str) -> Result<Self> {
        let (host, port) = parse_tcp_uri(uri)?;
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| LimeError::Transport(format!("Failed to connect to {uri}: {e}")))?;

        let transport = Self::new(stream, Arc::new(JsonEnvelopeSerializer))?;
        tracing::debug!("TCP transport connected to {}", transport.remote_addr);
        Ok(transport)
    }

    /// Address of the remote peer
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn closed_error() -> LimeError {
        LimeError::Transport("The transport is closed".to_string())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, envelope: Envelope, cancel: &CancellationToken) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Self::closed_error());
        }
        let frame = self.serializer.serialize(&envelope)?;

        let mut writer = self.writer.lock().await;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LimeError::Cancelled),
            () = self.closed.cancelled() => Err(Self::closed_error()),
            result = writer.send(frame) => Ok(result?),
        }
    }

    async fn receive(&self, cancel: &CancellationToken) -> Result<Envelope> {
        let mut reader = self.reader.lock().await;
        loop {
            let frame = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(LimeError::Cancelled),
                () = self.closed.cancelled() => return Err(Self::closed_error()),
                frame = reader.next() => frame,
            };

            match frame {
                None => {
                    return Err(LimeError::Transport(format!(
                        "Connection closed by {}",
                        self.remote_addr
                    )))
                },
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => return self.serializer.deserialize(&line),
            }
        }
    }

    async fn perform_close(&self, _cancel: &CancellationToken) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();

        let mut writer = self.writer.lock().await;
        match writer.get_mut().shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    fn base(&self) -> &TransportBase {
        &self.base
    }

    fn name(&self) -> &'static str {
        "TCP"
    }
}

/// Connects a fresh [`TcpTransport`] to a fixed endpoint on every call.
#[derive(Debug, Clone)]
pub struct TcpTransportFactory {
    uri: String,
}

impl TcpTransportFactory {
    /// Create a factory for `uri`
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    async fn create(&self, cancel: &CancellationToken) -> Result<Arc<dyn Transport>> {
        tokio::select! {
            () = cancel.cancelled() => Err(LimeError::Cancelled),
            transport = TcpTransport::connect(&self.uri) => {
                Ok(Arc::new(transport?) as Arc<dyn Transport>)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_uri() {
        let (host, port) = parse_tcp_uri("net.tcp://localhost:55322").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 55322);
    }

    #[test]
    fn test_parse_tcp_uri_default_port() {
        let (host, port) = parse_tcp_uri("net.tcp://iris.limeprotocol.org").unwrap();
        assert_eq!(host, "iris.limeprotocol.org");
        assert_eq!(port, DEFAULT_TCP_PORT);
    }

    #[test]
    fn test_parse_tcp_uri_wrong_scheme() {
        let result = parse_tcp_uri("http://localhost:55321");
        assert!(matches!(result, Err(LimeError::InvalidArgument(_))));
    }

    #[test]
    fn test_parse_tcp_uri_garbage() {
        assert!(parse_tcp_uri("not a uri").is_err());
    }
}

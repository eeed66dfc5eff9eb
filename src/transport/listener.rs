//! Server-side transport listeners.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::tcp::{parse_tcp_uri, TcpTransport};
use super::Transport;
use crate::error::{LimeError, Result};
use crate::serialization::{EnvelopeSerializer, JsonEnvelopeSerializer};
use crate::sync::lock;

/// Accepts incoming transports.
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// Bind to `uri` and start listening
    async fn start(&self, uri: &str) -> Result<()>;

    /// Wait for the next incoming transport
    async fn accept_transport(&self, cancel: &CancellationToken) -> Result<Arc<dyn Transport>>;

    /// Stop listening. Pending accepts fail.
    async fn stop(&self) -> Result<()>;
}

struct Active {
    listener: Arc<TcpListener>,
    stopped: CancellationToken,
}

/// Listener producing [`TcpTransport`]s.
///
/// Loopback hosts bind every interface so that the endpoint is reachable by
/// both `localhost` and the machine address.
pub struct TcpTransportListener {
    active: Mutex<Option<Active>>,
    serializer: Arc<dyn EnvelopeSerializer>,
}

impl TcpTransportListener {
    /// Create a stopped listener using the JSON serializer
    pub fn new() -> Self {
        Self::with_serializer(Arc::new(JsonEnvelopeSerializer))
    }

    /// Create a stopped listener with a custom serializer
    pub fn with_serializer(serializer: Arc<dyn EnvelopeSerializer>) -> Self {
        Self {
            active: Mutex::new(None),
            serializer,
        }
    }

    /// Bound address, if started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.active)
            .as_ref()
            .and_then(|active| active.listener.local_addr().ok())
    }

    async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
        let is_loopback = host.eq_ignore_ascii_case("localhost")
            || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback());
        if is_loopback {
            return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        tokio::net::lookup_host((host, port))
            .await?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| {
                LimeError::InvalidArgument(format!("Could not resolve the address of '{host}'"))
            })
    }
}

impl Default for TcpTransportListener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn start(&self, uri: &str) -> Result<()> {
        if lock(&self.active).is_some() {
            return Err(LimeError::InvalidOperation(
                "The listener is already active".to_string(),
            ));
        }

        let (host, port) = parse_tcp_uri(uri)?;
        let addr = Self::resolve(&host, port).await?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LimeError::Transport(format!("Failed to bind TCP to {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;

        let mut active = lock(&self.active);
        if active.is_some() {
            return Err(LimeError::InvalidOperation(
                "The listener is already active".to_string(),
            ));
        }
        *active = Some(Active {
            listener: Arc::new(listener),
            stopped: CancellationToken::new(),
        });

        tracing::info!("TCP listener started on {}", local_addr);
        Ok(())
    }

    async fn accept_transport(&self, cancel: &CancellationToken) -> Result<Arc<dyn Transport>> {
        let (listener, stopped) = {
            let active = lock(&self.active);
            let active = active.as_ref().ok_or_else(|| {
                LimeError::InvalidOperation(
                    "The listener was not started. Call start first.".to_string(),
                )
            })?;
            (active.listener.clone(), active.stopped.clone())
        };

        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => return Err(LimeError::Cancelled),
            () = stopped.cancelled() => {
                return Err(LimeError::InvalidOperation("The listener was stopped".to_string()))
            }
            accepted = listener.accept() => accepted?,
        };

        tracing::debug!("Accepted TCP connection from {}", peer);
        let transport = TcpTransport::new(stream, self.serializer.clone())?;
        Ok(Arc::new(transport))
    }

    async fn stop(&self) -> Result<()> {
        let active = lock(&self.active).take();
        if let Some(active) = active {
            active.stopped.cancel();
            tracing::info!("TCP listener stopped");
        }
        Ok(())
    }
}

//! Transport layer abstraction for LIME channels.
//!
//! A transport is a bidirectional envelope stream. Channels own exactly one
//! transport and never look at how it frames bytes.
//!
//! Provided backends:
//! - **InMemory**: connected pair over bounded queues, for in-process peers
//! - **TCP**: newline-delimited envelope frames over a TCP stream
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Channel (session)            │
//! └──────────────────┬──────────────────────┘
//!                    │ send / receive / close
//!          ┌────────┴────────┐
//!          ▼                 ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │ InMemoryTransport│ │  TcpTransport   │
//! └─────────────────┘ └─────────────────┘
//! ```
//!
//! # Closing
//!
//! [`Transport::close`] first publishes the closing event to every subscriber,
//! collects the futures they return and awaits all of them. Only then is the
//! transport torn down and the closed event fired.

mod listener;
mod memory;
#[cfg(test)]
pub(crate) mod mock;
mod tcp;

pub use listener::{TcpTransportListener, TransportListener};
pub use memory::InMemoryTransport;
pub use tcp::{parse_tcp_uri, TcpTransport, TcpTransportFactory, DEFAULT_TCP_PORT};

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use tokio_util::sync::CancellationToken;

use crate::error::{LimeError, Result};
use crate::protocol::{Envelope, SessionCompression, SessionEncryption};
use crate::sync::lock;

/// Handler awaited before the transport is torn down
pub type ClosingHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Handler notified after the transport is torn down
pub type ClosedHandler = Arc<dyn Fn() + Send + Sync>;

/// State shared by every transport implementation.
#[derive(Default)]
pub struct TransportBase {
    compression: Mutex<SessionCompression>,
    encryption: Mutex<SessionEncryption>,
    closing_handlers: Mutex<Vec<ClosingHandler>>,
    closed_handlers: Mutex<Vec<ClosedHandler>>,
}

impl TransportBase {
    /// Create with no compression and no encryption
    pub fn new() -> Self {
        Self::default()
    }

    /// Current compression
    pub fn compression(&self) -> SessionCompression {
        *lock(&self.compression)
    }

    /// Current encryption
    pub fn encryption(&self) -> SessionEncryption {
        *lock(&self.encryption)
    }

    fn set_compression(&self, compression: SessionCompression) {
        *lock(&self.compression) = compression;
    }

    fn set_encryption(&self, encryption: SessionEncryption) {
        *lock(&self.encryption) = encryption;
    }

    /// Subscribe to the closing event
    pub fn on_closing(&self, handler: ClosingHandler) {
        lock(&self.closing_handlers).push(handler);
    }

    /// Subscribe to the closed event
    pub fn on_closed(&self, handler: ClosedHandler) {
        lock(&self.closed_handlers).push(handler);
    }

    /// Publish the closing event and await every subscriber
    pub async fn raise_closing(&self) {
        let pending: Vec<_> = lock(&self.closing_handlers)
            .iter()
            .map(|handler| handler())
            .collect();
        join_all(pending).await;
    }

    /// Publish the closed event
    pub fn raise_closed(&self) {
        let handlers = lock(&self.closed_handlers).clone();
        for handler in handlers {
            handler();
        }
    }
}

/// Bidirectional envelope stream.
///
/// Implementations provide the I/O primitives; negotiation of compression and
/// encryption and the close sequence are provided on top of [`TransportBase`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send an envelope
    async fn send(&self, envelope: Envelope, cancel: &CancellationToken) -> Result<()>;

    /// Receive the next envelope
    async fn receive(&self, cancel: &CancellationToken) -> Result<Envelope>;

    /// Tear down the underlying connection
    async fn perform_close(&self, cancel: &CancellationToken) -> Result<()>;

    /// Check if the connection is still open
    fn is_connected(&self) -> bool;

    /// Shared transport state
    fn base(&self) -> &TransportBase;

    /// Transport name for logging
    fn name(&self) -> &'static str;

    /// Compression options this transport can apply
    fn supported_compression(&self) -> Vec<SessionCompression> {
        vec![SessionCompression::None]
    }

    /// Encryption options this transport can apply
    fn supported_encryption(&self) -> Vec<SessionEncryption> {
        vec![SessionEncryption::None]
    }

    /// Current compression
    fn compression(&self) -> SessionCompression {
        self.base().compression()
    }

    /// Current encryption
    fn encryption(&self) -> SessionEncryption {
        self.base().encryption()
    }

    /// Apply a negotiated compression
    async fn set_compression(
        &self,
        compression: SessionCompression,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.supported_compression().contains(&compression) {
            return Err(LimeError::NotSupported(format!(
                "Compression {compression:?} on the {} transport",
                self.name()
            )));
        }
        self.base().set_compression(compression);
        Ok(())
    }

    /// Apply a negotiated encryption
    async fn set_encryption(
        &self,
        encryption: SessionEncryption,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.supported_encryption().contains(&encryption) {
            return Err(LimeError::NotSupported(format!(
                "Encryption {encryption:?} on the {} transport",
                self.name()
            )));
        }
        self.base().set_encryption(encryption);
        Ok(())
    }

    /// Close the transport, awaiting closing subscribers first
    async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        self.base().raise_closing().await;
        let result = self.perform_close(cancel).await;
        self.base().raise_closed();
        tracing::debug!("{} transport closed", self.name());
        result
    }
}

/// Creates connected transports for channel builders.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create and connect a new transport
    async fn create(&self, cancel: &CancellationToken) -> Result<Arc<dyn Transport>>;
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_close_raises_closing_and_closed() {
        let transport = MockTransport::new();
        let closing = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));

        let flag = closing.clone();
        transport.base().on_closing(Arc::new(move || {
            let flag = flag.clone();
            async move { flag.store(true, Ordering::SeqCst) }.boxed()
        }));
        let flag = closed.clone();
        transport
            .base()
            .on_closed(Arc::new(move || flag.store(true, Ordering::SeqCst)));

        transport.close(&CancellationToken::new()).await.unwrap();

        assert!(closing.load(Ordering::SeqCst));
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(transport.close_calls(), 1);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_close_awaits_every_closing_subscriber() {
        let transport = MockTransport::new();
        let completed = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let completed = completed.clone();
            transport.base().on_closing(Arc::new(move || {
                let completed = completed.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            }));
        }

        transport.base().raise_closing().await;
        assert_eq!(completed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_default_supported_options() {
        let transport = MockTransport::new();
        assert_eq!(transport.supported_compression(), vec![SessionCompression::None]);
        assert_eq!(transport.supported_encryption(), vec![SessionEncryption::None]);
    }

    #[tokio::test]
    async fn test_set_none_options() {
        let transport = MockTransport::new();
        let cancel = CancellationToken::new();
        transport
            .set_compression(SessionCompression::None, &cancel)
            .await
            .unwrap();
        transport
            .set_encryption(SessionEncryption::None, &cancel)
            .await
            .unwrap();
        assert_eq!(transport.compression(), SessionCompression::None);
        assert_eq!(transport.encryption(), SessionEncryption::None);
    }

    #[tokio::test]
    async fn test_unsupported_options_fail() {
        let transport = MockTransport::new();
        let cancel = CancellationToken::new();
        let result = transport.set_compression(SessionCompression::GZip, &cancel).await;
        assert!(matches!(result, Err(LimeError::NotSupported(_))));
        let result = transport.set_encryption(SessionEncryption::Tls, &cancel).await;
        assert!(matches!(result, Err(LimeError::NotSupported(_))));
    }
}

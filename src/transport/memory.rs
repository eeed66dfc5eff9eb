//! In-process transport pair.
//!
//! Two [`InMemoryTransport`] ends are connected by bounded queues. Closing
//! either end disconnects both, but envelopes already queued for an end can
//! still be received by it.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Transport, TransportBase};
use crate::error::{LimeError, Result};
use crate::protocol::Envelope;
use crate::sync::lock;

/// One end of an in-process transport pair.
pub struct InMemoryTransport {
    outbound: Mutex<Option<mpsc::Sender<Envelope>>>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
    link: CancellationToken,
    base: TransportBase,
}

impl InMemoryTransport {
    /// Create a connected pair. Each direction buffers up to `capacity`
    /// envelopes before `send` waits.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let capacity = capacity.max(1);
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        let link = CancellationToken::new();

        let a = Self {
            outbound: Mutex::new(Some(a_tx)),
            inbound: tokio::sync::Mutex::new(a_rx),
            link: link.clone(),
            base: TransportBase::new(),
        };
        let b = Self {
            outbound: Mutex::new(Some(b_tx)),
            inbound: tokio::sync::Mutex::new(b_rx),
            link,
            base: TransportBase::new(),
        };
        (a, b)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, envelope: Envelope, cancel: &CancellationToken) -> Result<()> {
        let sender = lock(&self.outbound)
            .clone()
            .ok_or_else(|| LimeError::Transport("The transport is closed".to_string()))?;

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LimeError::Cancelled),
            () = self.link.cancelled() => {
                Err(LimeError::Transport("The transport is closed".to_string()))
            }
            result = sender.send(envelope) => result
                .map_err(|_| LimeError::Transport("The remote end is closed".to_string())),
        }
    }

    async fn receive(&self, cancel: &CancellationToken) -> Result<Envelope> {
        let mut inbound = tokio::select! {
            () = cancel.cancelled() => return Err(LimeError::Cancelled),
            guard = self.inbound.lock() => guard,
        };

        tokio::select! {
            biased;
            envelope = inbound.recv() => envelope
                .ok_or_else(|| LimeError::Transport("The remote end is closed".to_string())),
            () = cancel.cancelled() => Err(LimeError::Cancelled),
            () = self.link.cancelled() => {
                Err(LimeError::Transport("The transport is closed".to_string()))
            }
        }
    }

    async fn perform_close(&self, _cancel: &CancellationToken) -> Result<()> {
        lock(&self.outbound).take();
        self.link.cancel();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.link.is_cancelled()
    }

    fn base(&self) -> &TransportBase {
        &self.base
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

//! Recording transport for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Transport, TransportBase};
use crate::error::{LimeError, Result};
use crate::protocol::{Envelope, Session};
use crate::sync::lock;

/// Transport that records sent envelopes and replays queued inbound ones.
///
/// `receive` stays pending while nothing is queued, like an idle connection.
pub(crate) struct MockTransport {
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
    sent: Mutex<Vec<Envelope>>,
    close_calls: AtomicUsize,
    closed: CancellationToken,
    fail_sends: AtomicBool,
    send_delay: Mutex<Option<Duration>>,
    base: TransportBase,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            sent: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            closed: CancellationToken::new(),
            fail_sends: AtomicBool::new(false),
            send_delay: Mutex::new(None),
            base: TransportBase::new(),
        }
    }

    /// Queue an envelope for the next `receive`
    pub(crate) fn push_inbound(&self, envelope: impl Into<Envelope>) {
        let _ = self.inbound_tx.send(envelope.into());
    }

    /// Make every following `send` fail with a transport error
    pub(crate) fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Undo [`MockTransport::fail_sends`]
    pub(crate) fn resume_sends(&self) {
        self.fail_sends.store(false, Ordering::SeqCst);
    }

    /// Make every following `send` take `delay`
    pub(crate) fn delay_sends(&self, delay: Duration) {
        *lock(&self.send_delay) = Some(delay);
    }

    pub(crate) fn sent(&self) -> Vec<Envelope> {
        lock(&self.sent).clone()
    }

    pub(crate) fn sent_sessions(&self) -> Vec<Session> {
        self.sent()
            .into_iter()
            .filter_map(|envelope| match envelope {
                Envelope::Session(session) => Some(session),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, envelope: Envelope, _cancel: &CancellationToken) -> Result<()> {
        let delay = *lock(&self.send_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(LimeError::Transport("send failed".to_string()));
        }
        lock(&self.sent).push(envelope);
        Ok(())
    }

    async fn receive(&self, cancel: &CancellationToken) -> Result<Envelope> {
        let mut inbound = self.inbound_rx.lock().await;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LimeError::Cancelled),
            () = self.closed.cancelled() => Err(LimeError::Transport("closed".to_string())),
            envelope = inbound.recv() => {
                envelope.ok_or_else(|| LimeError::Transport("closed".to_string()))
            }
        }
    }

    async fn perform_close(&self, _cancel: &CancellationToken) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    fn base(&self) -> &TransportBase {
        &self.base
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

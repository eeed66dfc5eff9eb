//! Shared helpers for the end-to-end tests: an echo server session and a
//! transport factory that connects to it in memory.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lime::channel::{
    AuthenticationResult, ChannelSettings, EstablishedChannelBuilder, ReplyPingModule,
    ServerChannel,
};
use lime::protocol::{
    new_id, AuthenticationScheme, Identity, Message, Node, SessionCompression, SessionEncryption,
    SessionState,
};
use lime::transport::{InMemoryTransport, Transport, TransportFactory};
use lime::{LimeError, Result};
use tokio_util::sync::CancellationToken;

pub fn server_node() -> Node {
    Node::parse("server@limeprotocol.org/default").unwrap()
}

pub fn client_identity() -> Identity {
    Identity::parse("client@limeprotocol.org").unwrap()
}

/// Run the server side of one session: guest handshake, ping replies,
/// message echo and the finishing handshake.
pub async fn serve(transport: Arc<dyn Transport>, cancel: CancellationToken) -> Result<()> {
    let server = ServerChannel::new(new_id(), server_node(), transport, ChannelSettings::default());
    server
        .command_modules()
        .add(Arc::new(ReplyPingModule::new(server.downgrade())));

    server
        .establish_session(
            &[SessionCompression::None],
            &[SessionEncryption::None],
            &[AuthenticationScheme::Guest],
            |node, _authentication| async move { AuthenticationResult::Success(node) },
            &cancel,
        )
        .await?;

    loop {
        tokio::select! {
            message = server.receive_message(&cancel) => {
                let message = message?;
                let echo = Message {
                    to: message.from.clone(),
                    from: None,
                    ..message
                };
                server.send_message(echo, &cancel).await?;
            }
            session = server.receive_finishing_session(&cancel) => {
                if session?.state == SessionState::Finishing {
                    return server.send_finished_session(&cancel).await;
                }
            }
        }
    }
}

/// Factory handing out in-memory transports, each served by [`serve`].
///
/// The first `refusals` creations fail with a transport error.
pub struct EchoServerFactory {
    refusals: AtomicUsize,
    connections: AtomicUsize,
    server_sides: Mutex<Vec<Arc<dyn Transport>>>,
    cancel: CancellationToken,
}

impl EchoServerFactory {
    pub fn new() -> Arc<Self> {
        Self::refusing(0)
    }

    pub fn refusing(refusals: usize) -> Arc<Self> {
        Arc::new(Self {
            refusals: AtomicUsize::new(refusals),
            connections: AtomicUsize::new(0),
            server_sides: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Server side of the `index`-th connection
    pub fn server_side(&self, index: usize) -> Arc<dyn Transport> {
        self.server_sides.lock().unwrap()[index].clone()
    }

    pub fn builder(self: &Arc<Self>) -> EstablishedChannelBuilder {
        EstablishedChannelBuilder::new(self.clone(), client_identity())
    }
}

impl Drop for EchoServerFactory {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl TransportFactory for EchoServerFactory {
    async fn create(&self, _cancel: &CancellationToken) -> Result<Arc<dyn Transport>> {
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(LimeError::Transport("connection refused".to_string()));
        }

        let (client, server) = InMemoryTransport::pair(64);
        let server: Arc<dyn Transport> = Arc::new(server);
        self.server_sides.lock().unwrap().push(server.clone());
        self.connections.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve(server, self.cancel.clone()));
        Ok(Arc::new(client))
    }
}

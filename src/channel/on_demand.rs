//! Lazily established client channel with handler-gated recovery.
//!
//! An [`OnDemandChannel`] builds its [`ClientChannel`] on first use and
//! rebuilds it when it stops being established. When an operation fails with
//! a recoverable error, the operation-failed handlers decide whether the
//! channel is discarded and the operation retried on a new one.
//!
//! ```text
//! operation ──► get_channel ──► established? ──yes──► run ──ok──► return
//!                    │                                 │
//!                    no                          recoverable error
//!                    ▼                                 ▼
//!             build_and_establish            operation_failed handlers
//!                    │                          │             │
//!                 failure                     true          false
//!                    ▼                          ▼             ▼
//!         creation_failed handlers     discard, retry    return error
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::builder::EstablishedChannelBuilder;
use super::client::ClientChannel;
use super::handlers::{ChannelHandler, FailedChannelHandler, FailedChannelInformation, HandlerSet};
use crate::error::{LimeError, Result};
use crate::protocol::{Command, Message, Notification, SessionState};
use crate::sync::lock;

/// Client channel that establishes itself when needed.
#[async_trait]
pub trait OnDemandClientChannel: Send + Sync {
    /// Check if an underlying channel is currently established
    fn is_established(&self) -> bool;

    /// Establish now instead of on first use
    async fn establish(&self, cancel: &CancellationToken) -> Result<()>;

    /// Finish the session gracefully, if there is one
    async fn finish(&self, cancel: &CancellationToken) -> Result<()>;

    /// Send a message
    async fn send_message(&self, message: Message, cancel: &CancellationToken) -> Result<()>;

    /// Send a notification
    async fn send_notification(
        &self,
        notification: Notification,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Send a command
    async fn send_command(&self, command: Command, cancel: &CancellationToken) -> Result<()>;

    /// Receive the next message
    async fn receive_message(&self, cancel: &CancellationToken) -> Result<Message>;

    /// Receive the next notification
    async fn receive_notification(&self, cancel: &CancellationToken) -> Result<Notification>;

    /// Receive the next command request
    async fn receive_command(&self, cancel: &CancellationToken) -> Result<Command>;

    /// Send a request and wait for its response
    async fn process_command(&self, request: Command, cancel: &CancellationToken)
        -> Result<Command>;

    /// Handlers called after a channel is established
    fn channel_created_handlers(&self) -> &HandlerSet<ChannelHandler>;

    /// Handlers called after a channel is torn down
    fn channel_discarded_handlers(&self) -> &HandlerSet<ChannelHandler>;

    /// Handlers deciding whether a failed build is retried
    fn channel_creation_failed_handlers(&self) -> &HandlerSet<FailedChannelHandler>;

    /// Handlers deciding whether a failed operation is retried
    fn channel_operation_failed_handlers(&self) -> &HandlerSet<FailedChannelHandler>;
}

struct OnDemandInner {
    builder: EstablishedChannelBuilder,
    current: Mutex<Option<ClientChannel>>,
    build_lock: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
    created: HandlerSet<ChannelHandler>,
    discarded: HandlerSet<ChannelHandler>,
    creation_failed: HandlerSet<FailedChannelHandler>,
    operation_failed: HandlerSet<FailedChannelHandler>,
}

/// [`OnDemandClientChannel`] over a single [`ClientChannel`].
///
/// Cloning is cheap; clones share the underlying channel and handlers.
#[derive(Clone)]
pub struct OnDemandChannel {
    inner: Arc<OnDemandInner>,
}

impl std::fmt::Debug for OnDemandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnDemandChannel")
            .field("builder", &self.inner.builder)
            .field("current", &*lock(&self.inner.current))
            .finish()
    }
}

impl OnDemandChannel {
    /// Create without building anything yet
    pub fn new(builder: EstablishedChannelBuilder) -> Self {
        Self {
            inner: Arc::new(OnDemandInner {
                builder,
                current: Mutex::new(None),
                build_lock: tokio::sync::Mutex::new(()),
                disposed: AtomicBool::new(false),
                created: HandlerSet::new(),
                discarded: HandlerSet::new(),
                creation_failed: HandlerSet::new(),
                operation_failed: HandlerSet::new(),
            }),
        }
    }

    /// Builder used for every (re)build
    pub fn builder(&self) -> &EstablishedChannelBuilder {
        &self.inner.builder
    }

    /// The published channel, established or not
    pub fn current_channel(&self) -> Option<ClientChannel> {
        lock(&self.inner.current).clone()
    }

    /// Close the current channel's transport and refuse further operations.
    /// Safe to call more than once.
    ///
    /// The close runs on the current tokio runtime; without one the transport
    /// is only released when the last reference to it drops.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let current = lock(&self.inner.current).take();
        let Some(channel) = current else {
            return;
        };
        tracing::debug!(
            "Disposing channel {}",
            channel.session_id().as_deref().unwrap_or("-")
        );
        if !channel.transport().is_connected() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = channel.transport().close(&CancellationToken::new()).await {
                        tracing::debug!("Failed to close a disposed channel: {}", e);
                    }
                });
            },
            Err(_) => tracing::debug!("No runtime to close the disposed channel's transport"),
        }
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(LimeError::InvalidOperation(
                "The on-demand channel is disposed".to_string(),
            ));
        }
        Ok(())
    }

    fn established_channel(&self) -> Option<ClientChannel> {
        lock(&self.inner.current)
            .as_ref()
            .filter(|channel| channel.is_established())
            .cloned()
    }

    async fn get_channel(&self, cancel: &CancellationToken) -> Result<ClientChannel> {
        self.ensure_not_disposed()?;
        if let Some(channel) = self.established_channel() {
            return Ok(channel);
        }

        let _guard = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(LimeError::Cancelled),
            guard = self.inner.build_lock.lock() => guard,
        };
        self.ensure_not_disposed()?;
        if let Some(channel) = self.established_channel() {
            return Ok(channel);
        }

        let stale = lock(&self.inner.current).take();
        if let Some(stale) = stale {
            self.discard(stale).await;
        }

        loop {
            match self.inner.builder.build_and_establish(cancel).await {
                Ok(channel) => {
                    *lock(&self.inner.current) = Some(channel.clone());
                    self.inner.created.invoke(channel.information()).await;
                    return Ok(channel);
                },
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!("Failed to build a channel: {}", e);
                    let error = Arc::new(e);
                    let information = FailedChannelInformation::without_channel(
                        SessionState::Failed,
                        error.clone(),
                        "build_channel",
                    );
                    if !self.inner.creation_failed.invoke(information).await {
                        return Err(LimeError::from_shared(error));
                    }
                    if cancel.is_cancelled() {
                        return Err(LimeError::Cancelled);
                    }
                },
            }
        }
    }

    async fn discard(&self, channel: ClientChannel) {
        if channel.transport().is_connected() {
            if let Err(e) = channel.transport().close(&CancellationToken::new()).await {
                tracing::debug!("Failed to close a discarded channel: {}", e);
            }
        }
        self.inner.discarded.invoke(channel.information()).await;
    }

    /// Discard `channel` unless another operation already replaced it
    async fn discard_if_current(&self, channel: &ClientChannel) {
        let removed = {
            let mut current = lock(&self.inner.current);
            match current.as_ref() {
                Some(published) if published.ptr_eq(channel) => current.take(),
                _ => None,
            }
        };
        if let Some(channel) = removed {
            self.discard(channel).await;
        }
    }

    async fn execute<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        run: F,
    ) -> Result<T>
    where
        F: Fn(ClientChannel) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        loop {
            let channel = self.get_channel(cancel).await?;
            let error = match run(channel.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !error.is_recoverable() {
                return Err(error);
            }

            tracing::warn!("Channel operation '{}' failed: {}", operation, error);
            let error = Arc::new(error);
            let information = FailedChannelInformation::from_channel(&channel, error.clone(), operation);
            if !self.inner.operation_failed.invoke(information).await {
                return Err(LimeError::from_shared(error));
            }
            self.discard_if_current(&channel).await;
        }
    }
}

#[async_trait]
impl OnDemandClientChannel for OnDemandChannel {
    fn is_established(&self) -> bool {
        self.established_channel().is_some()
    }

    async fn establish(&self, cancel: &CancellationToken) -> Result<()> {
        self.get_channel(cancel).await.map(|_| ())
    }

    async fn finish(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(LimeError::Cancelled),
            guard = self.inner.build_lock.lock() => guard,
        };
        let current = lock(&self.inner.current).take();
        let Some(channel) = current else {
            return Ok(());
        };

        let result = if channel.is_established() {
            match channel.send_finishing_session(cancel).await {
                Ok(()) => channel.receive_finished_session(cancel).await.map(|_| ()),
                Err(e) => Err(e),
            }
        } else {
            Ok(())
        };
        self.discard(channel).await;
        result
    }

    async fn send_message(&self, message: Message, cancel: &CancellationToken) -> Result<()> {
        self.execute("send_message", cancel, |channel| {
            let message = message.clone();
            async move { channel.send_message(message, cancel).await }
        })
        .await
    }

    async fn send_notification(
        &self,
        notification: Notification,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.execute("send_notification", cancel, |channel| {
            let notification = notification.clone();
            async move { channel.send_notification(notification, cancel).await }
        })
        .await
    }

    async fn send_command(&self, command: Command, cancel: &CancellationToken) -> Result<()> {
        self.execute("send_command", cancel, |channel| {
            let command = command.clone();
            async move { channel.send_command(command, cancel).await }
        })
        .await
    }

    async fn receive_message(&self, cancel: &CancellationToken) -> Result<Message> {
        self.execute("receive_message", cancel, |channel| async move {
            channel.receive_message(cancel).await
        })
        .await
    }

    async fn receive_notification(&self, cancel: &CancellationToken) -> Result<Notification> {
        self.execute("receive_notification", cancel, |channel| async move {
            channel.receive_notification(cancel).await
        })
        .await
    }

    async fn receive_command(&self, cancel: &CancellationToken) -> Result<Command> {
        self.execute("receive_command", cancel, |channel| async move {
            channel.receive_command(cancel).await
        })
        .await
    }

    async fn process_command(
        &self,
        request: Command,
        cancel: &CancellationToken,
    ) -> Result<Command> {
        self.execute("process_command", cancel, |channel| {
            let request = request.clone();
            async move { channel.process_command(request, cancel).await }
        })
        .await
    }

    fn channel_created_handlers(&self) -> &HandlerSet<ChannelHandler> {
        &self.inner.created
    }

    fn channel_discarded_handlers(&self) -> &HandlerSet<ChannelHandler> {
        &self.inner.discarded
    }

    fn channel_creation_failed_handlers(&self) -> &HandlerSet<FailedChannelHandler> {
        &self.inner.creation_failed
    }

    fn channel_operation_failed_handlers(&self) -> &HandlerSet<FailedChannelHandler> {
        &self.inner.operation_failed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channel::core::ChannelInformation;
    use crate::protocol::{Envelope, Identity, Node, Session};
    use crate::transport::mock::MockTransport;
    use crate::transport::{Transport, TransportFactory};
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Factory whose transports answer the handshake with an established
    /// session right away. The first `refusals` creations fail.
    pub(crate) struct EstablishingFactory {
        refusals: AtomicUsize,
        created: Mutex<Vec<Arc<MockTransport>>>,
    }

    impl EstablishingFactory {
        pub(crate) fn new(refusals: usize) -> Arc<Self> {
            Arc::new(Self {
                refusals: AtomicUsize::new(refusals),
                created: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn created(&self) -> Vec<Arc<MockTransport>> {
            lock(&self.created).clone()
        }
    }

    #[async_trait]
    impl TransportFactory for EstablishingFactory {
        async fn create(&self, _cancel: &CancellationToken) -> Result<Arc<dyn Transport>> {
            let refused = self
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(LimeError::Transport("connection refused".to_string()));
            }

            let transport = Arc::new(MockTransport::new());
            let index = lock(&self.created).len();
            transport.push_inbound(Session {
                id: Some(format!("session-{index}")),
                from: Some(Node::parse("server@limeprotocol.org/default").unwrap()),
                to: Some(Node::parse("client@limeprotocol.org/home").unwrap()),
                ..Session::new(SessionState::Established)
            });
            lock(&self.created).push(transport.clone());
            Ok(transport)
        }
    }

    fn builder(factory: Arc<EstablishingFactory>) -> EstablishedChannelBuilder {
        EstablishedChannelBuilder::new(factory, Identity::new("client", "limeprotocol.org"))
    }

    fn counting(counter: &Arc<AtomicUsize>) -> ChannelHandler {
        let counter = counter.clone();
        Arc::new(move |_info: ChannelInformation| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    fn retrying(calls: &Arc<AtomicUsize>, retry: bool) -> FailedChannelHandler {
        let calls = calls.clone();
        Arc::new(move |_info: FailedChannelInformation| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                retry
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_builds_once_on_first_use() {
        let factory = EstablishingFactory::new(0);
        let channel = OnDemandChannel::new(builder(factory.clone()));
        let created = Arc::new(AtomicUsize::new(0));
        channel.channel_created_handlers().add(counting(&created));
        let cancel = CancellationToken::new();

        assert!(!channel.is_established());
        channel.send_message(Message::text("one"), &cancel).await.unwrap();
        channel.send_message(Message::text("two"), &cancel).await.unwrap();

        assert!(channel.is_established());
        assert_eq!(factory.created().len(), 1);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        let messages = factory.created()[0]
            .sent()
            .into_iter()
            .filter(|envelope| matches!(envelope, Envelope::Message(_)))
            .count();
        assert_eq!(messages, 2);
    }

    #[tokio::test]
    async fn test_creation_failure_without_handler_propagates() {
        let factory = EstablishingFactory::new(1);
        let channel = OnDemandChannel::new(builder(factory.clone()));

        let result = channel.establish(&CancellationToken::new()).await;
        assert!(matches!(result, Err(LimeError::Transport(_))));
        assert!(factory.created().is_empty());
    }

    #[tokio::test]
    async fn test_creation_failure_retried_when_handler_agrees() {
        let factory = EstablishingFactory::new(2);
        let channel = OnDemandChannel::new(builder(factory.clone()));
        let calls = Arc::new(AtomicUsize::new(0));
        channel
            .channel_creation_failed_handlers()
            .add(retrying(&calls, true));

        channel.establish(&CancellationToken::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(factory.created().len(), 1);
    }

    #[tokio::test]
    async fn test_operation_failure_rebuilds_channel() {
        let factory = EstablishingFactory::new(0);
        let channel = OnDemandChannel::new(builder(factory.clone()));
        let calls = Arc::new(AtomicUsize::new(0));
        let discarded = Arc::new(AtomicUsize::new(0));
        channel
            .channel_operation_failed_handlers()
            .add(retrying(&calls, true));
        channel.channel_discarded_handlers().add(counting(&discarded));
        let cancel = CancellationToken::new();

        channel.establish(&cancel).await.unwrap();
        factory.created()[0].fail_sends();

        channel.send_message(Message::text("hi"), &cancel).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(discarded.load(Ordering::SeqCst), 1);

        let transports = factory.created();
        assert_eq!(transports.len(), 2);
        assert_eq!(transports[0].close_calls(), 1);
        assert!(transports[1]
            .sent()
            .iter()
            .any(|envelope| matches!(envelope, Envelope::Message(_))));
    }

    #[tokio::test]
    async fn test_operation_failure_returned_when_handler_declines() {
        let factory = EstablishingFactory::new(0);
        let channel = OnDemandChannel::new(builder(factory.clone()));
        let calls = Arc::new(AtomicUsize::new(0));
        channel
            .channel_operation_failed_handlers()
            .add(retrying(&calls, false));
        let cancel = CancellationToken::new();

        channel.establish(&cancel).await.unwrap();
        factory.created()[0].fail_sends();

        let result = channel.send_message(Message::text("hi"), &cancel).await;
        assert!(matches!(result, Err(LimeError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(factory.created().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_arguments_skip_handlers() {
        let factory = EstablishingFactory::new(0);
        let channel = OnDemandChannel::new(builder(factory));
        let calls = Arc::new(AtomicUsize::new(0));
        channel
            .channel_operation_failed_handlers()
            .add(retrying(&calls, true));

        let mut response = Command::ping_request().success_response();
        response.id = Some("1".to_string());
        let result = channel
            .process_command(response, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(LimeError::InvalidArgument(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_finish_without_channel_is_noop() {
        let factory = EstablishingFactory::new(0);
        let channel = OnDemandChannel::new(builder(factory.clone()));

        channel.finish(&CancellationToken::new()).await.unwrap();
        assert!(factory.created().is_empty());
    }

    #[tokio::test]
    async fn test_finish_runs_finishing_handshake() {
        let factory = EstablishingFactory::new(0);
        let channel = OnDemandChannel::new(builder(factory.clone()));
        let discarded = Arc::new(AtomicUsize::new(0));
        channel.channel_discarded_handlers().add(counting(&discarded));
        let cancel = CancellationToken::new();

        channel.establish(&cancel).await.unwrap();
        let transport = factory.created()[0].clone();
        let server = {
            let transport = transport.clone();
            tokio::spawn(async move {
                while !transport
                    .sent_sessions()
                    .iter()
                    .any(|session| session.state == SessionState::Finishing)
                {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
                transport.push_inbound(Session {
                    id: Some("session-0".to_string()),
                    ..Session::new(SessionState::Finished)
                });
            })
        };

        channel.finish(&cancel).await.unwrap();
        server.await.unwrap();
        assert!(!channel.is_established());
        assert_eq!(discarded.load(Ordering::SeqCst), 1);
        let states: Vec<_> = transport
            .sent_sessions()
            .into_iter()
            .map(|session| session.state)
            .collect();
        assert_eq!(states, vec![SessionState::New, SessionState::Finishing]);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let factory = EstablishingFactory::new(0);
        let channel = OnDemandChannel::new(builder(factory));
        channel.establish(&CancellationToken::new()).await.unwrap();

        channel.dispose();
        channel.dispose();
        assert!(channel.current_channel().is_none());
        let result = channel.establish(&CancellationToken::new()).await;
        assert!(matches!(result, Err(LimeError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_dispose_closes_the_transport() {
        let factory = EstablishingFactory::new(0);
        let channel = OnDemandChannel::new(builder(factory.clone()));
        channel.establish(&CancellationToken::new()).await.unwrap();
        let transport = factory.created()[0].clone();
        assert!(transport.is_connected());

        channel.dispose();
        tokio::time::timeout(Duration::from_secs(1), async {
            while transport.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("the disposed channel's transport was never closed");
        assert_eq!(transport.close_calls(), 1);
        assert!(transport.sent_sessions().iter().all(|s| s.state != SessionState::Finished));
    }
}

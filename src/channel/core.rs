//! Channel core shared by the client and server roles.
//!
//! A [`Channel`] owns one transport and the session state. Until the session
//! is established, session envelopes are read straight from the transport by
//! the negotiation operations. Once established, a background consumer reads
//! the transport, runs the receiving modules and routes envelopes into bounded
//! per-kind queues; command responses resolve pending
//! [`Channel::process_command`] calls instead of reaching the queues.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::module::ModulePipeline;
use crate::error::{LimeError, Result};
use crate::protocol::{
    Command, Envelope, Message, Node, Notification, Reason, Session, SessionState,
};
use crate::sync::lock;
use crate::transport::Transport;

/// Default timeout of a single transport send
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default capacity of each inbound queue
pub const DEFAULT_ENVELOPE_BUFFER_SIZE: usize = 64;

/// Channel behaviour settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSettings {
    /// Timeout of a single transport send
    pub send_timeout: Duration,
    /// Capacity of each inbound queue
    pub envelope_buffer_size: usize,
    /// Interval of the idle check once established
    pub remote_ping_interval: Option<Duration>,
    /// Inactivity after which the channel finishes itself
    pub remote_idle_timeout: Option<Duration>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            send_timeout: DEFAULT_SEND_TIMEOUT,
            envelope_buffer_size: DEFAULT_ENVELOPE_BUFFER_SIZE,
            remote_ping_interval: None,
            remote_idle_timeout: None,
        }
    }
}

impl ChannelSettings {
    /// Set send timeout
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set inbound queue capacity
    pub fn with_envelope_buffer_size(mut self, size: usize) -> Self {
        self.envelope_buffer_size = size.max(1);
        self
    }

    /// Set the idle check interval
    pub fn with_remote_ping_interval(mut self, interval: Duration) -> Self {
        self.remote_ping_interval = Some(interval);
        self
    }

    /// Set the idle timeout
    pub fn with_remote_idle_timeout(mut self, timeout: Duration) -> Self {
        self.remote_idle_timeout = Some(timeout);
        self
    }
}

/// Immutable snapshot of a channel, handed to lifecycle handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInformation {
    /// Session ID
    pub session_id: Option<String>,
    /// Session state at snapshot time
    pub state: SessionState,
    /// Local node
    pub local_node: Option<Node>,
    /// Remote node
    pub remote_node: Option<Node>,
}

#[derive(Debug, Default)]
struct SessionIdentity {
    session_id: Option<String>,
    state: SessionState,
    local_node: Option<Node>,
    remote_node: Option<Node>,
}

struct InboundSenders {
    messages: mpsc::Sender<Message>,
    notifications: mpsc::Sender<Notification>,
    commands: mpsc::Sender<Command>,
    sessions: mpsc::Sender<Session>,
}

struct InboundQueues {
    messages: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    notifications: tokio::sync::Mutex<mpsc::Receiver<Notification>>,
    commands: tokio::sync::Mutex<mpsc::Receiver<Command>>,
    sessions: tokio::sync::Mutex<mpsc::Receiver<Session>>,
}

fn inbound_queues(capacity: usize) -> (InboundSenders, InboundQueues) {
    let capacity = capacity.max(1);
    let (messages_tx, messages_rx) = mpsc::channel(capacity);
    let (notifications_tx, notifications_rx) = mpsc::channel(capacity);
    let (commands_tx, commands_rx) = mpsc::channel(capacity);
    let (sessions_tx, sessions_rx) = mpsc::channel(capacity);

    (
        InboundSenders {
            messages: messages_tx,
            notifications: notifications_tx,
            commands: commands_tx,
            sessions: sessions_tx,
        },
        InboundQueues {
            messages: tokio::sync::Mutex::new(messages_rx),
            notifications: tokio::sync::Mutex::new(notifications_rx),
            commands: tokio::sync::Mutex::new(commands_rx),
            sessions: tokio::sync::Mutex::new(sessions_rx),
        },
    )
}

pub(crate) struct ChannelInner {
    transport: Arc<dyn Transport>,
    settings: ChannelSettings,
    identity: Mutex<SessionIdentity>,
    send_lock: tokio::sync::Mutex<()>,
    receive_lock: tokio::sync::Mutex<()>,
    message_modules: ModulePipeline<Message>,
    notification_modules: ModulePipeline<Notification>,
    command_modules: ModulePipeline<Command>,
    session_modules: ModulePipeline<Session>,
    inbound: InboundQueues,
    idle_senders: Mutex<Option<InboundSenders>>,
    pending_commands: Mutex<HashMap<String, oneshot::Sender<Command>>>,
    ping_probe: Mutex<Option<String>>,
    last_received: Mutex<Instant>,
    stop_reason: Mutex<Option<String>>,
    consumer_started: AtomicBool,
    shutdown: CancellationToken,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Session-bound conversation over one transport.
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

/// Non-owning channel reference, used by modules that send through the
/// channel they are attached to.
#[derive(Clone)]
pub struct WeakChannel {
    inner: Weak<ChannelInner>,
}

impl WeakChannel {
    /// Get the channel if it is still alive
    pub fn upgrade(&self) -> Option<Channel> {
        self.inner.upgrade().map(|inner| Channel { inner })
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let identity = lock(&self.inner.identity);
        f.debug_struct("Channel")
            .field("session_id", &identity.session_id)
            .field("state", &identity.state)
            .field("local_node", &identity.local_node)
            .field("remote_node", &identity.remote_node)
            .field("transport", &self.inner.transport.name())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        session_id: Option<String>,
        local_node: Option<Node>,
        settings: ChannelSettings,
    ) -> Self {
        let (senders, inbound) = inbound_queues(settings.envelope_buffer_size);
        Self {
            inner: Arc::new(ChannelInner {
                transport,
                settings,
                identity: Mutex::new(SessionIdentity {
                    session_id,
                    local_node,
                    ..SessionIdentity::default()
                }),
                send_lock: tokio::sync::Mutex::new(()),
                receive_lock: tokio::sync::Mutex::new(()),
                message_modules: ModulePipeline::new(),
                notification_modules: ModulePipeline::new(),
                command_modules: ModulePipeline::new(),
                session_modules: ModulePipeline::new(),
                inbound,
                idle_senders: Mutex::new(Some(senders)),
                pending_commands: Mutex::new(HashMap::new()),
                ping_probe: Mutex::new(None),
                last_received: Mutex::new(Instant::now()),
                stop_reason: Mutex::new(None),
                consumer_started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Non-owning reference to this channel
    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Check if both handles refer to the same channel
    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Session ID
    pub fn session_id(&self) -> Option<String> {
        lock(&self.inner.identity).session_id.clone()
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        lock(&self.inner.identity).state
    }

    /// Local node
    pub fn local_node(&self) -> Option<Node> {
        lock(&self.inner.identity).local_node.clone()
    }

    /// Remote node, bound once the session is established
    pub fn remote_node(&self) -> Option<Node> {
        lock(&self.inner.identity).remote_node.clone()
    }

    /// Underlying transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Channel settings
    pub fn settings(&self) -> &ChannelSettings {
        &self.inner.settings
    }

    /// Snapshot for lifecycle handlers
    pub fn information(&self) -> ChannelInformation {
        let identity = lock(&self.inner.identity);
        ChannelInformation {
            session_id: identity.session_id.clone(),
            state: identity.state,
            local_node: identity.local_node.clone(),
            remote_node: identity.remote_node.clone(),
        }
    }

    /// Check if the session is established and still able to carry envelopes
    pub fn is_established(&self) -> bool {
        self.state() == SessionState::Established
            && self.inner.transport.is_connected()
            && lock(&self.inner.stop_reason).is_none()
    }

    /// Modules applied to messages
    pub fn message_modules(&self) -> &ModulePipeline<Message> {
        &self.inner.message_modules
    }

    /// Modules applied to notifications
    pub fn notification_modules(&self) -> &ModulePipeline<Notification> {
        &self.inner.notification_modules
    }

    /// Modules applied to commands
    pub fn command_modules(&self) -> &ModulePipeline<Command> {
        &self.inner.command_modules
    }

    /// Modules applied to sessions
    pub fn session_modules(&self) -> &ModulePipeline<Session> {
        &self.inner.session_modules
    }

    pub(crate) fn set_session_id(&self, session_id: String) {
        lock(&self.inner.identity).session_id = Some(session_id);
    }

    pub(crate) fn set_local_node(&self, node: Option<Node>) {
        lock(&self.inner.identity).local_node = node;
    }

    pub(crate) fn set_remote_node(&self, node: Option<Node>) {
        lock(&self.inner.identity).remote_node = node;
    }

    /// Fail with a state mismatch unless the state is one of `allowed`.
    pub(crate) fn require_state(
        &self,
        operation: &'static str,
        allowed: &[SessionState],
    ) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(LimeError::state_mismatch(operation, state))
        }
    }

    /// Move the session forward. Only `Failed` may be entered from any state.
    pub(crate) fn set_state(&self, state: SessionState) -> Result<()> {
        let (previous, session_id) = {
            let mut identity = lock(&self.inner.identity);
            if identity.state == state {
                return Ok(());
            }
            if state < identity.state {
                return Err(LimeError::InvalidOperation(format!(
                    "Cannot change the session state from '{}' to '{}'",
                    identity.state, state
                )));
            }
            let previous = identity.state;
            identity.state = state;
            (previous, identity.session_id.clone())
        };

        tracing::debug!(
            "Session {} changed from {} to {}",
            session_id.as_deref().unwrap_or("-"),
            previous,
            state
        );

        self.inner.message_modules.on_state_changed(state);
        self.inner.notification_modules.on_state_changed(state);
        self.inner.command_modules.on_state_changed(state);
        self.inner.session_modules.on_state_changed(state);

        if state == SessionState::Established {
            self.start_consumer();
            self.start_idle_monitor();
        } else if state.is_terminal() {
            self.inner.shutdown.cancel();
        }
        Ok(())
    }

    /// Session envelope carrying the channel identity for `state`.
    pub(crate) fn session_envelope(&self, state: SessionState) -> Session {
        let identity = lock(&self.inner.identity);
        Session {
            id: identity.session_id.clone(),
            from: identity.local_node.clone(),
            ..Session::new(state)
        }
    }

    /// Send a message
    pub async fn send_message(&self, message: Message, cancel: &CancellationToken) -> Result<()> {
        self.require_state("send a message", &[SessionState::Established])?;
        if let Some(message) = self.inner.message_modules.on_sending(message, cancel).await? {
            self.send_envelope(message.into(), cancel).await?;
        }
        Ok(())
    }

    /// Send a notification
    pub async fn send_notification(
        &self,
        notification: Notification,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.require_state("send a notification", &[SessionState::Established])?;
        if let Some(notification) = self
            .inner
            .notification_modules
            .on_sending(notification, cancel)
            .await?
        {
            self.send_envelope(notification.into(), cancel).await?;
        }
        Ok(())
    }

    /// Send a command
    pub async fn send_command(&self, command: Command, cancel: &CancellationToken) -> Result<()> {
        self.require_state("send a command", &[SessionState::Established])?;
        if let Some(command) = self.inner.command_modules.on_sending(command, cancel).await? {
            self.send_envelope(command.into(), cancel).await?;
        }
        Ok(())
    }

    /// Receive the next message
    pub async fn receive_message(&self, cancel: &CancellationToken) -> Result<Message> {
        self.require_state("receive a message", &[SessionState::Established])?;
        self.receive_queued(&self.inner.inbound.messages, cancel).await
    }

    /// Receive the next notification
    pub async fn receive_notification(&self, cancel: &CancellationToken) -> Result<Notification> {
        self.require_state("receive a notification", &[SessionState::Established])?;
        self.receive_queued(&self.inner.inbound.notifications, cancel)
            .await
    }

    /// Receive the next command that is not a response to a pending request
    pub async fn receive_command(&self, cancel: &CancellationToken) -> Result<Command> {
        self.require_state("receive a command", &[SessionState::Established])?;
        self.receive_queued(&self.inner.inbound.commands, cancel).await
    }

    /// Send a request command and wait for the response with the same ID.
    pub async fn process_command(
        &self,
        request: Command,
        cancel: &CancellationToken,
    ) -> Result<Command> {
        if request.status.is_some() {
            return Err(LimeError::InvalidArgument(
                "The command must be a request without a status".to_string(),
            ));
        }
        let id = request
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| LimeError::InvalidArgument("The command must have an id".to_string()))?;
        self.require_state("process a command", &[SessionState::Established])?;

        let response = self.register_pending(&id)?;
        let result = async {
            self.send_command(request, cancel).await?;
            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(LimeError::Cancelled),
                response = response => response.map_err(|_| self.closed_error()),
            }
        }
        .await;

        lock(&self.inner.pending_commands).remove(&id);
        result
    }

    fn register_pending(&self, id: &str) -> Result<oneshot::Receiver<Command>> {
        let mut pending = lock(&self.inner.pending_commands);
        if pending.contains_key(id) {
            return Err(LimeError::InvalidArgument(format!(
                "A command with id '{id}' is already pending"
            )));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Run the sending modules and send a session envelope.
    pub(crate) async fn send_session(
        &self,
        session: Session,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Some(session) = self.inner.session_modules.on_sending(session, cancel).await? {
            self.send_envelope(session.into(), cancel).await?;
        }
        Ok(())
    }

    /// Read the next session envelope.
    ///
    /// Reads the transport directly until the consumer is started, then the
    /// session queue, so envelopes buffered before the call come out first.
    pub(crate) async fn receive_session(&self, cancel: &CancellationToken) -> Result<Session> {
        if self.inner.consumer_started.load(Ordering::SeqCst) {
            return self.receive_queued(&self.inner.inbound.sessions, cancel).await;
        }

        let _guard = tokio::select! {
            () = cancel.cancelled() => return Err(LimeError::Cancelled),
            guard = self.inner.receive_lock.lock() => guard,
        };
        loop {
            let envelope = self.inner.transport.receive(cancel).await?;
            self.touch();
            match envelope {
                Envelope::Session(session) => {
                    if let Some(session) = self
                        .inner
                        .session_modules
                        .on_receiving(session, cancel)
                        .await?
                    {
                        return Ok(session);
                    }
                },
                other => {
                    return Err(LimeError::Protocol(format!(
                        "Expected a session envelope but received a {:?} while in the '{}' state",
                        other.kind(),
                        self.state()
                    )))
                },
            }
        }
    }

    /// Set a terminal state, send the closing session if a remote node is
    /// bound and close the transport.
    pub(crate) async fn finish_session(
        &self,
        state: SessionState,
        reason: Option<Reason>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Err(e) = self.set_state(state) {
            tracing::debug!("Keeping the current session state: {}", e);
        }

        let sent = match self.remote_node() {
            Some(remote) => {
                let session = Session {
                    to: Some(remote),
                    reason,
                    ..self.session_envelope(state)
                };
                self.send_session(session, cancel).await
            },
            None => Ok(()),
        };

        let closed = self.inner.transport.close(cancel).await;
        sent.and(closed)
    }

    /// Finish a session whose remote side went quiet. The Finished session
    /// is sent even when no remote node is bound.
    async fn finish_idle_session(&self, cancel: &CancellationToken) -> Result<()> {
        if let Err(e) = self.set_state(SessionState::Finished) {
            tracing::debug!("Keeping the current session state: {}", e);
        }

        let session = Session {
            to: self.remote_node(),
            ..self.session_envelope(SessionState::Finished)
        };
        let sent = self.send_session(session, cancel).await;
        let closed = self.inner.transport.close(cancel).await;
        sent.and(closed)
    }

    async fn send_envelope(&self, envelope: Envelope, cancel: &CancellationToken) -> Result<()> {
        let _guard = tokio::select! {
            () = cancel.cancelled() => return Err(LimeError::Cancelled),
            guard = self.inner.send_lock.lock() => guard,
        };

        let timeout = self.inner.settings.send_timeout;
        match tokio::time::timeout(timeout, self.inner.transport.send(envelope, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(LimeError::Timeout(format!(
                "The send operation did not complete in {timeout:?}"
            ))),
        }
    }

    async fn receive_queued<T>(
        &self,
        queue: &tokio::sync::Mutex<mpsc::Receiver<T>>,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let mut receiver = tokio::select! {
            () = cancel.cancelled() => return Err(LimeError::Cancelled),
            receiver = queue.lock() => receiver,
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LimeError::Cancelled),
            item = receiver.recv() => item.ok_or_else(|| self.closed_error()),
        }
    }

    fn closed_error(&self) -> LimeError {
        match lock(&self.inner.stop_reason).as_deref() {
            Some(reason) => LimeError::Transport(format!("The channel is closed: {reason}")),
            None => LimeError::Transport("The channel is closed".to_string()),
        }
    }

    fn touch(&self) {
        *lock(&self.inner.last_received) = Instant::now();
    }

    fn idle_time(&self) -> Duration {
        lock(&self.inner.last_received).elapsed()
    }

    fn start_consumer(&self) {
        let Some(senders) = lock(&self.inner.idle_senders).take() else {
            return;
        };
        self.inner.consumer_started.store(true, Ordering::SeqCst);

        let weak = self.downgrade();
        let transport = self.inner.transport.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(consume(weak, transport, senders, shutdown));
    }

    fn start_idle_monitor(&self) {
        let Some(interval) = self.inner.settings.remote_ping_interval else {
            return;
        };
        let idle_timeout = self.inner.settings.remote_idle_timeout;
        let weak = self.downgrade();
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {},
                }
                let Some(channel) = weak.upgrade() else {
                    break;
                };
                if channel.state() != SessionState::Established {
                    break;
                }

                let idle = channel.idle_time();
                if idle_timeout.is_some_and(|timeout| idle >= timeout) {
                    tracing::warn!(
                        "Session {} idle for {:?}, finishing",
                        channel.session_id().as_deref().unwrap_or("-"),
                        idle
                    );
                    if let Err(e) = channel.finish_idle_session(&CancellationToken::new()).await {
                        tracing::warn!("Failed to finish the idle session: {}", e);
                    }
                    break;
                }
                if idle >= interval {
                    channel.send_ping_probe(&shutdown).await;
                }
            }
        });
    }

    async fn send_ping_probe(&self, cancel: &CancellationToken) {
        let ping = Command::ping_request();
        let Some(id) = ping.id.clone() else {
            return;
        };
        // Only the latest probe stays pending; an unanswered one is dropped.
        let previous = lock(&self.inner.ping_probe).replace(id.clone());
        if let Some(previous) = previous {
            lock(&self.inner.pending_commands).remove(&previous);
        }
        // The receiver is dropped so the reply is swallowed by the consumer.
        if self.register_pending(&id).is_err() {
            return;
        }
        if let Err(e) = self.send_command(ping, cancel).await {
            tracing::debug!("Ping probe failed: {}", e);
        }
    }

    async fn dispatch(
        &self,
        envelope: Envelope,
        senders: &InboundSenders,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        match envelope {
            Envelope::Message(message) => {
                if let Some(message) = self
                    .inner
                    .message_modules
                    .on_receiving(message, shutdown)
                    .await?
                {
                    enqueue(&senders.messages, message, shutdown).await?;
                }
            },
            Envelope::Notification(notification) => {
                if let Some(notification) = self
                    .inner
                    .notification_modules
                    .on_receiving(notification, shutdown)
                    .await?
                {
                    enqueue(&senders.notifications, notification, shutdown).await?;
                }
            },
            Envelope::Command(command) => {
                let Some(command) = self
                    .inner
                    .command_modules
                    .on_receiving(command, shutdown)
                    .await?
                else {
                    return Ok(());
                };
                if command.status.is_some() {
                    let waiter = command
                        .id
                        .as_deref()
                        .and_then(|id| lock(&self.inner.pending_commands).remove(id));
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(command);
                        return Ok(());
                    }
                }
                enqueue(&senders.commands, command, shutdown).await?;
            },
            Envelope::Session(session) => {
                let Some(session) = self
                    .inner
                    .session_modules
                    .on_receiving(session, shutdown)
                    .await?
                else {
                    return Ok(());
                };
                let state = session.state;
                enqueue(&senders.sessions, session, shutdown).await?;
                if state.is_terminal() && self.state() == SessionState::Established {
                    tracing::info!(
                        "Session {} was {} by the remote node",
                        self.session_id().as_deref().unwrap_or("-"),
                        state
                    );
                    self.set_state(state)?;
                }
            },
        }
        Ok(())
    }

    fn consumer_stopped(&self, error: &LimeError) {
        let reason = error.to_string();
        if !error.is_cancelled() {
            tracing::debug!(
                "Session {} stopped receiving: {}",
                self.session_id().as_deref().unwrap_or("-"),
                reason
            );
        }
        *lock(&self.inner.stop_reason) = Some(reason);
        lock(&self.inner.pending_commands).clear();
    }
}

async fn enqueue<T>(
    sender: &mpsc::Sender<T>,
    item: T,
    shutdown: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        () = shutdown.cancelled() => Err(LimeError::Cancelled),
        sent = sender.send(item) => sent
            .map_err(|_| LimeError::Transport("The inbound queue is closed".to_string())),
    }
}

async fn consume(
    weak: WeakChannel,
    transport: Arc<dyn Transport>,
    senders: InboundSenders,
    shutdown: CancellationToken,
) {
    let error = loop {
        let envelope = match transport.receive(&shutdown).await {
            Ok(envelope) => envelope,
            Err(e) => break e,
        };
        let Some(channel) = weak.upgrade() else {
            return;
        };
        channel.touch();
        if let Err(e) = channel.dispatch(envelope, &senders, &shutdown).await {
            break e;
        }
    };

    if let Some(channel) = weak.upgrade() {
        channel.consumer_stopped(&error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandStatus, Event};
    use crate::transport::mock::MockTransport;

    fn established(transport: &Arc<MockTransport>) -> Channel {
        let channel = Channel::new(
            transport.clone(),
            Some("session-1".to_string()),
            Some(Node::parse("server@limeprotocol.org/default").unwrap()),
            ChannelSettings::default(),
        );
        channel.set_remote_node(Some(Node::parse("client@limeprotocol.org/home").unwrap()));
        channel.set_state(SessionState::Established).unwrap();
        channel
    }

    #[tokio::test]
    async fn test_send_outside_established_fails_without_io() {
        let transport = Arc::new(MockTransport::new());
        let channel = Channel::new(transport.clone(), None, None, ChannelSettings::default());
        let cancel = CancellationToken::new();

        let result = channel.send_message(Message::text("hi"), &cancel).await;
        assert!(matches!(
            result,
            Err(LimeError::StateMismatch {
                state: SessionState::New,
                ..
            })
        ));
        let result = channel
            .send_notification(Notification::new("1", Event::Received), &cancel)
            .await;
        assert!(matches!(result, Err(LimeError::StateMismatch { .. })));
        let result = channel.receive_command(&cancel).await;
        assert!(matches!(result, Err(LimeError::StateMismatch { .. })));
        assert!(transport.sent().is_empty());
        assert_eq!(channel.state(), SessionState::New);
    }

    #[tokio::test]
    async fn test_state_never_regresses() {
        let transport = Arc::new(MockTransport::new());
        let channel = Channel::new(transport, None, None, ChannelSettings::default());
        channel.set_state(SessionState::Authenticating).unwrap();
        assert!(channel.set_state(SessionState::Negotiating).is_err());
        assert_eq!(channel.state(), SessionState::Authenticating);
        channel.set_state(SessionState::Failed).unwrap();
        assert_eq!(channel.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_inbound_routed_by_kind() {
        let transport = Arc::new(MockTransport::new());
        let channel = established(&transport);
        let cancel = CancellationToken::new();

        transport.push_inbound(Notification::new("m1", Event::Consumed));
        transport.push_inbound(Message::text("first"));
        transport.push_inbound(Message::text("second"));

        let first = channel.receive_message(&cancel).await.unwrap();
        let second = channel.receive_message(&cancel).await.unwrap();
        assert_eq!(first.content, "first");
        assert_eq!(second.content, "second");

        let notification = channel.receive_notification(&cancel).await.unwrap();
        assert_eq!(notification.event, Event::Consumed);
    }

    #[tokio::test]
    async fn test_process_command_resolves_by_id() {
        let transport = Arc::new(MockTransport::new());
        let channel = established(&transport);
        let cancel = CancellationToken::new();

        let request = Command::ping_request();
        let pending = {
            let channel = channel.clone();
            let request = request.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { channel.process_command(request, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut unrelated = Command::ping_request().success_response();
        unrelated.id = Some("other".to_string());
        transport.push_inbound(unrelated);
        transport.push_inbound(request.success_response());

        let response = pending.await.unwrap().unwrap();
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(response.id, request.id);
        assert_eq!(response.status, Some(CommandStatus::Success));

        // Responses nobody waits for reach the application queue.
        let queued = channel.receive_command(&cancel).await.unwrap();
        assert_eq!(queued.id.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_process_command_rejects_responses() {
        let transport = Arc::new(MockTransport::new());
        let channel = established(&transport);
        let cancel = CancellationToken::new();

        let response = Command::ping_request().success_response();
        let result = channel.process_command(response, &cancel).await;
        assert!(matches!(result, Err(LimeError::InvalidArgument(_))));

        let mut missing_id = Command::ping_request();
        missing_id.id = None;
        let result = channel.process_command(missing_id, &cancel).await;
        assert!(matches!(result, Err(LimeError::InvalidArgument(_))));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_process_command_cancelled() {
        let transport = Arc::new(MockTransport::new());
        let channel = established(&transport);
        let cancel = CancellationToken::new();

        let request = Command::ping_request();
        let pending = {
            let channel = channel.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { channel.process_command(request, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(LimeError::Cancelled)));
        assert!(lock(&channel.inner.pending_commands).is_empty());
    }

    #[tokio::test]
    async fn test_send_timeout() {
        struct StallingTransport(MockTransport);

        #[async_trait::async_trait]
        impl Transport for StallingTransport {
            async fn send(&self, _envelope: Envelope, _cancel: &CancellationToken) -> Result<()> {
                futures::future::pending::<()>().await;
                Ok(())
            }
            async fn receive(&self, cancel: &CancellationToken) -> Result<Envelope> {
                self.0.receive(cancel).await
            }
            async fn perform_close(&self, cancel: &CancellationToken) -> Result<()> {
                self.0.perform_close(cancel).await
            }
            fn is_connected(&self) -> bool {
                self.0.is_connected()
            }
            fn base(&self) -> &crate::transport::TransportBase {
                self.0.base()
            }
            fn name(&self) -> &'static str {
                "stalling"
            }
        }

        let channel = Channel::new(
            Arc::new(StallingTransport(MockTransport::new())),
            None,
            None,
            ChannelSettings::default().with_send_timeout(Duration::from_millis(50)),
        );
        channel.set_state(SessionState::Established).unwrap();

        let result = channel
            .send_message(Message::text("stuck"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(LimeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_idle_without_remote_node_still_sends_finished() {
        let transport = Arc::new(MockTransport::new());
        let settings = ChannelSettings::default()
            .with_remote_ping_interval(Duration::from_millis(500))
            .with_remote_idle_timeout(Duration::from_millis(150));
        let channel = Channel::new(
            transport.clone(),
            Some("session-1".to_string()),
            Some(Node::parse("server@limeprotocol.org/default").unwrap()),
            settings,
        );
        channel.set_state(SessionState::Established).unwrap();

        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert_eq!(transport.sent().len(), 1);
        let session = &transport.sent_sessions()[0];
        assert_eq!(session.state, SessionState::Finished);
        assert_eq!(session.id.as_deref(), Some("session-1"));
        assert_eq!(session.from, channel.local_node());
        assert_eq!(session.to, None);
        assert_eq!(transport.close_calls(), 1);
        assert_eq!(channel.state(), SessionState::Finished);
    }

    #[tokio::test]
    async fn test_unanswered_ping_probes_stay_bounded() {
        let transport = Arc::new(MockTransport::new());
        let settings =
            ChannelSettings::default().with_remote_ping_interval(Duration::from_millis(20));
        let channel = Channel::new(
            transport.clone(),
            Some("session-1".to_string()),
            Some(Node::parse("server@limeprotocol.org/default").unwrap()),
            settings,
        );
        channel.set_state(SessionState::Established).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;

        let pings = transport
            .sent()
            .into_iter()
            .filter(|envelope| matches!(envelope, Envelope::Command(c) if c.is_ping_request()))
            .count();
        assert!(pings >= 5, "only {pings} ping probes were sent");
        assert!(lock(&channel.inner.pending_commands).len() <= 1);
        assert_eq!(channel.state(), SessionState::Established);
    }

    #[tokio::test]
    async fn test_remote_finished_session_ends_channel() {
        let transport = Arc::new(MockTransport::new());
        let channel = established(&transport);

        let mut finished = Session::new(SessionState::Finished);
        finished.id = channel.session_id();
        transport.push_inbound(finished);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.state(), SessionState::Finished);
        assert!(!channel.is_established());
    }
}

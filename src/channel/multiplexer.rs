//! Multiplexed client channel over several on-demand channels.
//!
//! # Architecture
//!
//! ```text
//!                      ┌───────────────────────────┐
//!  send_* ────────────►│   bounded outbound queue  │
//!  process_command ───►│                           │
//!                      └─────┬─────────┬─────────┬─┘
//!                   consumer │         │         │   one per channel,
//!                            ▼         ▼         ▼   one item at a time
//!                      ┌─────────┐┌─────────┐┌─────────┐
//!                      │ channel ││ channel ││ channel │  OnDemandChannel
//!                      │    0    ││    1    ││    2    │
//!                      └────┬────┘└────┬────┘└────┬────┘
//!                  listener │          │          │   per channel and kind
//!                           ▼          ▼          ▼
//!                      ┌───────────────────────────┐
//!  receive_* ◄─────────│ merged per-kind inbound   │
//!                      └───────────────────────────┘
//! ```
//!
//! An idle consumer claims the next queued item, so a channel blocked on a
//! slow send does not hold up the others. A request and its response always
//! travel through the same underlying channel.

use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::builder::EstablishedChannelBuilder;
use super::handlers::{ChannelHandler, FailedChannelHandler, FailedChannelInformation, HandlerSet};
use super::on_demand::{OnDemandChannel, OnDemandClientChannel};
use crate::error::{LimeError, Result};
use crate::protocol::{Command, Message, Notification, SessionState};
use crate::sync::lock;

/// Default capacity of the merged inbound queues
pub const DEFAULT_INPUT_BUFFER_SIZE: usize = 1024;

/// Default capacity of the outbound queue
pub const DEFAULT_OUTPUT_BUFFER_SIZE: usize = 1024;

enum Outbound {
    Message(Message),
    Notification(Notification),
    Command(Command),
    Request {
        command: Command,
        cancel: CancellationToken,
        respond: oneshot::Sender<Result<Command>>,
    },
}

type SharedReceiver<T> = Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>;

struct Inbound {
    messages: SharedReceiver<Message>,
    notifications: SharedReceiver<Notification>,
    commands: SharedReceiver<Command>,
}

#[derive(Clone)]
struct InboundSenders {
    messages: mpsc::Sender<Message>,
    notifications: mpsc::Sender<Notification>,
    commands: mpsc::Sender<Command>,
}

#[derive(Default)]
struct Listeners {
    stop: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

struct MultiplexerInner {
    channels: Vec<OnDemandChannel>,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    inbound: Inbound,
    inbound_senders: InboundSenders,
    listeners: Mutex<Listeners>,
    lifecycle: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
    created: HandlerSet<ChannelHandler>,
    discarded: HandlerSet<ChannelHandler>,
    creation_failed: HandlerSet<FailedChannelHandler>,
    operation_failed: HandlerSet<FailedChannelHandler>,
}

impl MultiplexerInner {
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.outbound).take();
        for consumer in lock(&self.consumers).drain(..) {
            consumer.abort();
        }
        let listeners = mem::take(&mut *lock(&self.listeners));
        if let Some(stop) = listeners.stop {
            stop.cancel();
        }
        for listener in listeners.tasks {
            listener.abort();
        }
        for channel in &self.channels {
            channel.dispose();
        }
    }
}

impl Drop for MultiplexerInner {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// [`OnDemandClientChannel`] spreading traffic over N on-demand channels.
///
/// Cloning is cheap; clones share the channels and queues.
#[derive(Clone)]
pub struct MultiplexerChannel {
    inner: Arc<MultiplexerInner>,
}

impl std::fmt::Debug for MultiplexerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexerChannel")
            .field("channels", &self.inner.channels.len())
            .field("disposed", &self.inner.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

impl MultiplexerChannel {
    /// Create `count` channels from `builder`, each with its own instance
    /// suffix, and start the outbound consumers.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(
        builder: EstablishedChannelBuilder,
        count: usize,
        input_buffer_size: usize,
        output_buffer_size: usize,
    ) -> Result<Self> {
        if count == 0 {
            return Err(LimeError::InvalidArgument(
                "The channel count must be positive".to_string(),
            ));
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(output_buffer_size.max(1));
        let outbound_rx = Arc::new(tokio::sync::Mutex::new(outbound_rx));
        let (messages_tx, messages_rx) = mpsc::channel(input_buffer_size.max(1));
        let (notifications_tx, notifications_rx) = mpsc::channel(input_buffer_size.max(1));
        let (commands_tx, commands_rx) = mpsc::channel(input_buffer_size.max(1));

        let created = HandlerSet::new();
        let discarded = HandlerSet::new();
        let creation_failed = HandlerSet::new();
        let operation_failed = HandlerSet::new();

        let mut channels = Vec::with_capacity(count);
        let mut consumers = Vec::with_capacity(count);
        for index in 0..count {
            let instance = match builder.instance() {
                Some(instance) => format!("{instance}-{index}"),
                None => index.to_string(),
            };
            let channel = OnDemandChannel::new(builder.clone().with_instance(instance));
            created.link(channel.channel_created_handlers());
            discarded.link(channel.channel_discarded_handlers());
            creation_failed.link(channel.channel_creation_failed_handlers());
            operation_failed.link(channel.channel_operation_failed_handlers());

            consumers.push(tokio::spawn(consume_outbound(
                channel.clone(),
                outbound_rx.clone(),
                operation_failed.clone(),
            )));
            channels.push(channel);
        }
        tracing::debug!("Multiplexing over {} channels", count);

        Ok(Self {
            inner: Arc::new(MultiplexerInner {
                channels,
                outbound: Mutex::new(Some(outbound_tx)),
                consumers: Mutex::new(consumers),
                inbound: Inbound {
                    messages: Arc::new(tokio::sync::Mutex::new(messages_rx)),
                    notifications: Arc::new(tokio::sync::Mutex::new(notifications_rx)),
                    commands: Arc::new(tokio::sync::Mutex::new(commands_rx)),
                },
                inbound_senders: InboundSenders {
                    messages: messages_tx,
                    notifications: notifications_tx,
                    commands: commands_tx,
                },
                listeners: Mutex::new(Listeners::default()),
                lifecycle: tokio::sync::Mutex::new(()),
                disposed: AtomicBool::new(false),
                created,
                discarded,
                creation_failed,
                operation_failed,
            }),
        })
    }

    /// Create with the default queue capacities
    pub fn with_defaults(builder: EstablishedChannelBuilder, count: usize) -> Result<Self> {
        Self::new(
            builder,
            count,
            DEFAULT_INPUT_BUFFER_SIZE,
            DEFAULT_OUTPUT_BUFFER_SIZE,
        )
    }

    /// The underlying channels
    pub fn channels(&self) -> &[OnDemandChannel] {
        &self.inner.channels
    }

    /// Stop every task and drop the underlying channels. Safe to call more
    /// than once.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    async fn lock_lifecycle(
        &self,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LimeError::Cancelled),
            guard = self.inner.lifecycle.lock() => Ok(guard),
        }
    }

    async fn establish_if_required(&self, cancel: &CancellationToken) -> Result<()> {
        if self.is_established() {
            return Ok(());
        }
        self.establish(cancel).await
    }

    async fn enqueue(&self, item: Outbound, cancel: &CancellationToken) -> Result<()> {
        let sender = lock(&self.inner.outbound)
            .clone()
            .ok_or(LimeError::PipelineComplete)?;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LimeError::Cancelled),
            sent = sender.send(item) => sent.map_err(|_| LimeError::PipelineComplete),
        }
    }

    fn start_listeners(&self) {
        let mut listeners = lock(&self.inner.listeners);
        if listeners.stop.is_some() {
            return;
        }
        let stop = CancellationToken::new();
        let senders = &self.inner.inbound_senders;
        for channel in &self.inner.channels {
            listeners.tasks.push(spawn_listener(
                channel.clone(),
                senders.messages.clone(),
                stop.clone(),
                |channel, cancel| async move { channel.receive_message(&cancel).await },
            ));
            listeners.tasks.push(spawn_listener(
                channel.clone(),
                senders.notifications.clone(),
                stop.clone(),
                |channel, cancel| async move { channel.receive_notification(&cancel).await },
            ));
            listeners.tasks.push(spawn_listener(
                channel.clone(),
                senders.commands.clone(),
                stop.clone(),
                |channel, cancel| async move { channel.receive_command(&cancel).await },
            ));
        }
        listeners.stop = Some(stop);
    }

    async fn stop_listeners(&self) {
        let listeners = mem::take(&mut *lock(&self.inner.listeners));
        if let Some(stop) = listeners.stop {
            stop.cancel();
        }
        join_all(listeners.tasks).await;
    }

    async fn receive<T>(
        &self,
        queue: &SharedReceiver<T>,
        cancel: &CancellationToken,
    ) -> Result<T> {
        self.establish_if_required(cancel).await?;
        let mut queue = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(LimeError::Cancelled),
            queue = queue.lock() => queue,
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LimeError::Cancelled),
            item = queue.recv() => item.ok_or(LimeError::PipelineComplete),
        }
    }
}

/// Feed the merged inbound queue from one channel until stopped or failed.
fn spawn_listener<T, F, Fut>(
    channel: OnDemandChannel,
    sender: mpsc::Sender<T>,
    stop: CancellationToken,
    receive: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(OnDemandChannel, CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let item = match receive(channel.clone(), stop.clone()).await {
                Ok(item) => item,
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    tracing::warn!("Multiplexed receive stopped: {}", e);
                    break;
                },
            };
            tokio::select! {
                biased;
                () = stop.cancelled() => break,
                sent = sender.send(item) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Take outbound items one at a time and write them through `channel`.
async fn consume_outbound(
    channel: OnDemandChannel,
    queue: SharedReceiver<Outbound>,
    operation_failed: HandlerSet<FailedChannelHandler>,
) {
    loop {
        let item = queue.lock().await.recv().await;
        let Some(item) = item else {
            break;
        };
        if let Err(e) = write_outbound(&channel, item).await {
            tracing::warn!("Multiplexed send failed: {}", e);
            // Recoverable failures already reached the linked handlers.
            if e.is_recoverable() {
                continue;
            }
            let error = Arc::new(e);
            let information = match channel.current_channel() {
                Some(current) => FailedChannelInformation::from_channel(&current, error, "send"),
                None => FailedChannelInformation::without_channel(SessionState::New, error, "send"),
            };
            operation_failed.invoke(information).await;
        }
    }
}

async fn write_outbound(channel: &OnDemandChannel, item: Outbound) -> Result<()> {
    let cancel = CancellationToken::new();
    match item {
        Outbound::Message(message) => channel.send_message(message, &cancel).await,
        Outbound::Notification(notification) => {
            channel.send_notification(notification, &cancel).await
        },
        Outbound::Command(command) => channel.send_command(command, &cancel).await,
        Outbound::Request {
            command,
            cancel,
            respond,
        } => {
            if cancel.is_cancelled() || respond.is_closed() {
                return Ok(());
            }
            let response = channel.process_command(command, &cancel).await;
            if !cancel.is_cancelled() {
                let _ = respond.send(response);
            }
            Ok(())
        },
    }
}

fn first_error(results: Vec<Result<()>>) -> Result<()> {
    results.into_iter().collect()
}

#[async_trait]
impl OnDemandClientChannel for MultiplexerChannel {
    fn is_established(&self) -> bool {
        self.inner.channels.iter().any(|channel| channel.is_established())
    }

    /// Start the listeners and establish every channel concurrently.
    async fn establish(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.lock_lifecycle(cancel).await?;
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(LimeError::InvalidOperation(
                "The multiplexer is disposed".to_string(),
            ));
        }
        if lock(&self.inner.outbound).is_none() {
            return Err(LimeError::PipelineComplete);
        }
        self.start_listeners();
        first_error(
            join_all(self.inner.channels.iter().map(|channel| channel.establish(cancel))).await,
        )
    }

    /// Drain the outbound queue, stop the listeners and finish every channel.
    async fn finish(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.lock_lifecycle(cancel).await?;
        lock(&self.inner.outbound).take();
        let consumers = mem::take(&mut *lock(&self.inner.consumers));
        join_all(consumers).await;
        self.stop_listeners().await;
        first_error(
            join_all(self.inner.channels.iter().map(|channel| channel.finish(cancel))).await,
        )
    }

    async fn send_message(&self, message: Message, cancel: &CancellationToken) -> Result<()> {
        self.enqueue(Outbound::Message(message), cancel).await
    }

    async fn send_notification(
        &self,
        notification: Notification,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.enqueue(Outbound::Notification(notification), cancel).await
    }

    async fn send_command(&self, command: Command, cancel: &CancellationToken) -> Result<()> {
        self.enqueue(Outbound::Command(command), cancel).await
    }

    async fn receive_message(&self, cancel: &CancellationToken) -> Result<Message> {
        self.receive(&self.inner.inbound.messages, cancel).await
    }

    async fn receive_notification(&self, cancel: &CancellationToken) -> Result<Notification> {
        self.receive(&self.inner.inbound.notifications, cancel).await
    }

    async fn receive_command(&self, cancel: &CancellationToken) -> Result<Command> {
        self.receive(&self.inner.inbound.commands, cancel).await
    }

    async fn process_command(
        &self,
        request: Command,
        cancel: &CancellationToken,
    ) -> Result<Command> {
        self.establish_if_required(cancel).await?;
        let (respond, response) = oneshot::channel();
        self.enqueue(
            Outbound::Request {
                command: request,
                cancel: cancel.clone(),
                respond,
            },
            cancel,
        )
        .await?;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LimeError::Cancelled),
            response = response => response.map_err(|_| {
                LimeError::Transport("The request was dropped before a response".to_string())
            })?,
        }
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

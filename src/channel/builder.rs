//! Builds established client channels.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::client::{ClientChannel, ClientSessionOptions};
use super::core::ChannelSettings;
use super::reply_ping::ReplyPingModule;
use crate::error::Result;
use crate::protocol::{Authentication, Identity, SessionCompression, SessionEncryption};
use crate::transport::TransportFactory;

/// Per-channel setup run after a channel is created and before its session
/// is established, e.g. to add modules.
pub type BuiltHandler =
    Arc<dyn Fn(ClientChannel, CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Creates a transport, wraps it in a [`ClientChannel`] and establishes the
/// session. Called once per (re)build by the on-demand layers.
#[derive(Clone)]
pub struct EstablishedChannelBuilder {
    transport_factory: Arc<dyn TransportFactory>,
    session: ClientSessionOptions,
    settings: ChannelSettings,
    auto_reply_pings: bool,
    built_handlers: Vec<BuiltHandler>,
}

impl fmt::Debug for EstablishedChannelBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstablishedChannelBuilder")
            .field("session", &self.session)
            .field("settings", &self.settings)
            .field("auto_reply_pings", &self.auto_reply_pings)
            .field("built_handlers", &self.built_handlers.len())
            .finish()
    }
}

impl EstablishedChannelBuilder {
    /// Guest sessions for `identity` over transports from `transport_factory`
    pub fn new(transport_factory: Arc<dyn TransportFactory>, identity: Identity) -> Self {
        Self {
            transport_factory,
            session: ClientSessionOptions::new(identity),
            settings: ChannelSettings::default(),
            auto_reply_pings: true,
            built_handlers: Vec::new(),
        }
    }

    /// Session choices
    pub fn session_options(&self) -> &ClientSessionOptions {
        &self.session
    }

    /// Channel settings
    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    /// Instance of the local node
    pub fn instance(&self) -> Option<&str> {
        self.session.instance.as_deref()
    }

    /// Copy of this builder with another instance
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.session.instance = Some(instance.into());
        self
    }

    /// Set all session choices
    pub fn with_session_options(mut self, options: ClientSessionOptions) -> Self {
        self.session = options;
        self
    }

    /// Set preferred compression
    pub fn with_compression(mut self, compression: SessionCompression) -> Self {
        self.session.compression = compression;
        self
    }

    /// Set preferred encryption
    pub fn with_encryption(mut self, encryption: SessionEncryption) -> Self {
        self.session.encryption = encryption;
        self
    }

    /// Set credentials
    pub fn with_authentication(mut self, authentication: Authentication) -> Self {
        self.session.authentication = authentication;
        self
    }

    /// Set all channel settings
    pub fn with_settings(mut self, settings: ChannelSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set send timeout
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.settings.send_timeout = timeout;
        self
    }

    /// Set the idle check interval and timeout
    pub fn with_remote_idle(mut self, ping_interval: Duration, idle_timeout: Duration) -> Self {
        self.settings.remote_ping_interval = Some(ping_interval);
        self.settings.remote_idle_timeout = Some(idle_timeout);
        self
    }

    /// Enable or disable the [`ReplyPingModule`] on built channels
    pub fn with_auto_reply_pings(mut self, enabled: bool) -> Self {
        self.auto_reply_pings = enabled;
        self
    }

    /// Add per-channel setup
    pub fn add_built_handler(mut self, handler: BuiltHandler) -> Self {
        self.built_handlers.push(handler);
        self
    }

    /// Build a channel and establish its session.
    pub async fn build_and_establish(&self, cancel: &CancellationToken) -> Result<ClientChannel> {
        let transport = self.transport_factory.create(cancel).await?;
        let channel = ClientChannel::new(transport, self.settings.clone());

        if let Err(e) = self.establish(&channel, cancel).await {
            if !channel.state().is_terminal() {
                if let Err(close_error) = channel.transport().close(cancel).await {
                    tracing::debug!("Failed to close the transport: {}", close_error);
                }
            }
            return Err(e);
        }
        Ok(channel)
    }

    async fn establish(&self, channel: &ClientChannel, cancel: &CancellationToken) -> Result<()> {
        if self.auto_reply_pings {
            channel
                .command_modules()
                .add(Arc::new(ReplyPingModule::new(channel.downgrade())));
        }
        for handler in &self.built_handlers {
            handler(channel.clone(), cancel.clone()).await?;
        }
        channel.establish_session(&self.session, cancel).await
    }
}

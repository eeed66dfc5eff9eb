//! Automatic ping replies.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::core::WeakChannel;
use super::module::ChannelModule;
use crate::error::Result;
use crate::protocol::Command;

/// Answers ping requests addressed to the local node (or to no one) and keeps
/// them away from the application.
pub struct ReplyPingModule {
    channel: WeakChannel,
}

impl ReplyPingModule {
    /// Create for the channel the module will be attached to
    pub fn new(channel: WeakChannel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ChannelModule<Command> for ReplyPingModule {
    async fn on_receiving(
        &self,
        command: Command,
        cancel: &CancellationToken,
    ) -> Result<Option<Command>> {
        if !command.is_ping_request() {
            return Ok(Some(command));
        }
        let Some(channel) = self.channel.upgrade() else {
            return Ok(Some(command));
        };

        let addressed_to_us = match &command.to {
            None => true,
            Some(to) => channel
                .local_node()
                .is_some_and(|local| local.to_identity() == to.to_identity()),
        };
        if !addressed_to_us {
            return Ok(Some(command));
        }

        channel.send_command(command.ping_response(), cancel).await?;
        Ok(None)
    }
}

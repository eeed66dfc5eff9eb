//! Client role of the session handshake.

use std::ops::Deref;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::core::{Channel, ChannelSettings};
use crate::error::{LimeError, Result};
use crate::protocol::{
    Authentication, Identity, Session, SessionCompression, SessionEncryption, SessionState,
};
use crate::transport::Transport;

/// Authentication rounds accepted before the handshake is abandoned
pub const MAX_AUTHENTICATION_ROUNDS: usize = 8;

/// Choices the client makes while establishing a session.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSessionOptions {
    /// Identity to authenticate as
    pub identity: Identity,
    /// Instance name of the local node
    pub instance: Option<String>,
    /// Preferred compression, used when offered
    pub compression: SessionCompression,
    /// Preferred encryption, used when offered
    pub encryption: SessionEncryption,
    /// Credentials
    pub authentication: Authentication,
}

impl ClientSessionOptions {
    /// Guest authentication without compression or encryption
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            instance: None,
            compression: SessionCompression::None,
            encryption: SessionEncryption::None,
            authentication: Authentication::Guest,
        }
    }

    /// Set instance
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set preferred compression
    pub fn with_compression(mut self, compression: SessionCompression) -> Self {
        self.compression = compression;
        self
    }

    /// Set preferred encryption
    pub fn with_encryption(mut self, encryption: SessionEncryption) -> Self {
        self.encryption = encryption;
        self
    }

    /// Set credentials
    pub fn with_authentication(mut self, authentication: Authentication) -> Self {
        self.authentication = authentication;
        self
    }
}

/// Client side of a channel.
///
/// ```text
/// start_new_session ─► negotiate_session ─► receive_authenticating_session
///                                                   │
///                      established ◄─ authenticate_session (rounds)
/// ```
#[derive(Clone, Debug)]
pub struct ClientChannel {
    channel: Channel,
}

impl Deref for ClientChannel {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}

impl ClientChannel {
    /// Create a channel in the `New` state over a connected transport
    pub fn new(transport: Arc<dyn Transport>, settings: ChannelSettings) -> Self {
        Self {
            channel: Channel::new(transport, None, None, settings),
        }
    }

    /// Send a `New` session and wait for the server reply.
    pub async fn start_new_session(&self, cancel: &CancellationToken) -> Result<Session> {
        self.require_state("start a new session", &[SessionState::New])?;
        self.send_session(Session::new(SessionState::New), cancel)
            .await?;
        self.receive_and_adopt(cancel).await
    }

    /// Send the selected compression and encryption and wait for the server
    /// confirmation.
    pub async fn negotiate_session(
        &self,
        compression: SessionCompression,
        encryption: SessionEncryption,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        self.require_state("negotiate a session", &[SessionState::Negotiating])?;
        let session = Session {
            compression: Some(compression),
            encryption: Some(encryption),
            ..self.session_envelope(SessionState::Negotiating)
        };
        self.send_session(session, cancel).await?;
        self.receive_and_adopt(cancel).await
    }

    /// Wait for the server to offer authentication schemes.
    pub async fn receive_authenticating_session(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        self.require_state(
            "receive an authenticating session",
            &[SessionState::Negotiating],
        )?;
        self.receive_and_adopt(cancel).await
    }

    /// Send credentials and wait for the server verdict or its next
    /// authentication round.
    pub async fn authenticate_session(
        &self,
        identity: &Identity,
        authentication: Authentication,
        instance: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        if identity.domain.is_empty() {
            return Err(LimeError::InvalidArgument(
                "The identity must have a domain".to_string(),
            ));
        }
        self.require_state("authenticate a session", &[SessionState::Authenticating])?;

        let session = Session {
            from: Some(identity.to_node(instance.map(str::to_string))),
            authentication: Some(authentication),
            ..self.session_envelope(SessionState::Authenticating)
        };
        self.send_session(session, cancel).await?;
        self.receive_and_adopt(cancel).await
    }

    /// Ask the server to finish the session.
    pub async fn send_finishing_session(&self, cancel: &CancellationToken) -> Result<()> {
        self.require_state("finish a session", &[SessionState::Established])?;
        self.set_state(SessionState::Finishing)?;
        let session = Session {
            to: self.remote_node(),
            ..self.session_envelope(SessionState::Finishing)
        };
        self.send_session(session, cancel).await
    }

    /// Wait for the server to confirm the end of the session, then close the
    /// transport.
    pub async fn receive_finished_session(&self, cancel: &CancellationToken) -> Result<Session> {
        self.require_state("receive a finished session", &[SessionState::Finishing])?;
        loop {
            let session = self.receive_session(cancel).await?;
            if !session.state.is_terminal() {
                tracing::debug!("Ignoring a {} session while finishing", session.state);
                continue;
            }
            self.set_state(session.state)?;
            self.transport().close(cancel).await?;
            return Ok(session);
        }
    }

    /// Drive the whole handshake until the session is established.
    ///
    /// Fails with [`LimeError::SessionFailed`] if the server fails the
    /// session.
    pub async fn establish_session(
        &self,
        options: &ClientSessionOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut session = self.start_new_session(cancel).await?;

        if session.state == SessionState::Negotiating {
            let compression = select_option(
                session.compression_options.as_deref(),
                options.compression,
            );
            let encryption =
                select_option(session.encryption_options.as_deref(), options.encryption);

            session = self
                .negotiate_session(compression, encryption, cancel)
                .await?;
            if session.state == SessionState::Negotiating {
                if let Some(compression) = session.compression {
                    self.transport().set_compression(compression, cancel).await?;
                }
                if let Some(encryption) = session.encryption {
                    self.transport().set_encryption(encryption, cancel).await?;
                }
                session = self.receive_authenticating_session(cancel).await?;
            }
        }

        let mut rounds = 0;
        while session.state == SessionState::Authenticating {
            rounds += 1;
            if rounds > MAX_AUTHENTICATION_ROUNDS {
                return Err(LimeError::Protocol(
                    "Too many authentication rounds".to_string(),
                ));
            }
            session = self
                .authenticate_session(
                    &options.identity,
                    options.authentication.clone(),
                    options.instance.as_deref(),
                    cancel,
                )
                .await?;
        }

        match session.state {
            SessionState::Established => {
                tracing::info!(
                    "Session {} established as {}",
                    self.session_id().as_deref().unwrap_or("-"),
                    self.local_node()
                        .map(|node| node.to_string())
                        .unwrap_or_default()
                );
                Ok(())
            },
            SessionState::Failed => Err(LimeError::SessionFailed(
                session
                    .reason
                    .map(|reason| reason.to_string())
                    .unwrap_or_else(|| "The session failed".to_string()),
            )),
            state => Err(LimeError::Protocol(format!(
                "Unexpected '{state}' session while establishing"
            ))),
        }
    }

    async fn receive_and_adopt(&self, cancel: &CancellationToken) -> Result<Session> {
        let session = self.receive_session(cancel).await?;

        if let Some(id) = session.id.clone() {
            self.set_session_id(id);
        }
        if session.state == SessionState::Established {
            self.set_local_node(session.to.clone());
            self.set_remote_node(session.from.clone());
        }
        self.set_state(session.state).map_err(|e| {
            LimeError::Protocol(format!("The server sent an invalid session state: {e}"))
        })?;

        if session.state.is_terminal() {
            self.transport().close(cancel).await?;
        }
        Ok(session)
    }
}

/// Use the preferred option when offered, otherwise the first one offered.
fn select_option<T: Copy + PartialEq>(offered: Option<&[T]>, preferred: T) -> T {
    match offered {
        Some(options) if !options.contains(&preferred) => {
            options.first().copied().unwrap_or(preferred)
        },
        _ => preferred,
    }
}

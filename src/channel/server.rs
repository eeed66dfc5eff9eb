//! Server role of the session handshake.

use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::core::{Channel, ChannelSettings};
use crate::error::{LimeError, Result};
use crate::protocol::{
    reason_codes, Authentication, AuthenticationScheme, Node, Reason, Session,
    SessionCompression, SessionEncryption, SessionState,
};
use crate::transport::Transport;

/// Verdict of a server authenticator.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthenticationResult {
    /// Credentials accepted; the session is bound to this node
    Success(Node),
    /// Another round is needed; send this challenge to the client
    Roundtrip(Authentication),
    /// Credentials rejected
    Failure(Reason),
}

/// Server side of a channel.
#[derive(Clone, Debug)]
pub struct ServerChannel {
    channel: Channel,
}

impl Deref for ServerChannel {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}

impl ServerChannel {
    /// Create a channel in the `New` state for an accepted transport.
    pub fn new(
        session_id: impl Into<String>,
        server_node: Node,
        transport: Arc<dyn Transport>,
        settings: ChannelSettings,
    ) -> Self {
        Self {
            channel: Channel::new(
                transport,
                Some(session_id.into()),
                Some(server_node),
                settings,
            ),
        }
    }

    /// Read the client's `New` session.
    pub async fn receive_new_session(&self, cancel: &CancellationToken) -> Result<Session> {
        self.require_state("receive a new session", &[SessionState::New])?;
        self.receive_session(cancel).await
    }

    /// Offer compression and encryption options and wait for the client's
    /// choice.
    pub async fn negotiate_session(
        &self,
        compression_options: &[SessionCompression],
        encryption_options: &[SessionEncryption],
        cancel: &CancellationToken,
    ) -> Result<Session> {
        if compression_options.is_empty() {
            return Err(LimeError::InvalidArgument(
                "The compression options must not be empty".to_string(),
            ));
        }
        if encryption_options.is_empty() {
            return Err(LimeError::InvalidArgument(
                "The encryption options must not be empty".to_string(),
            ));
        }
        self.require_state("negotiate a session", &[SessionState::New])?;
        self.set_state(SessionState::Negotiating)?;

        let session = Session {
            compression_options: Some(compression_options.to_vec()),
            encryption_options: Some(encryption_options.to_vec()),
            ..self.session_envelope(SessionState::Negotiating)
        };
        self.send_session(session, cancel).await?;
        self.receive_session(cancel).await
    }

    /// Confirm the negotiated compression and encryption.
    pub async fn send_negotiating_session(
        &self,
        compression: SessionCompression,
        encryption: SessionEncryption,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.require_state(
            "send a negotiating session",
            &[SessionState::Negotiating],
        )?;
        let session = Session {
            compression: Some(compression),
            encryption: Some(encryption),
            ..self.session_envelope(SessionState::Negotiating)
        };
        self.send_session(session, cancel).await
    }

    /// Offer authentication schemes and wait for the client's credentials.
    pub async fn authenticate_session(
        &self,
        scheme_options: &[AuthenticationScheme],
        cancel: &CancellationToken,
    ) -> Result<Session> {
        if scheme_options.is_empty() {
            return Err(LimeError::InvalidArgument(
                "The scheme options must not be empty".to_string(),
            ));
        }
        self.require_state("authenticate a session", &[SessionState::Negotiating])?;
        self.set_state(SessionState::Authenticating)?;

        let session = Session {
            scheme_options: Some(scheme_options.to_vec()),
            ..self.session_envelope(SessionState::Authenticating)
        };
        self.send_session(session, cancel).await?;
        self.receive_session(cancel).await
    }

    /// Send an authentication challenge and wait for the client's answer.
    /// The state stays `Authenticating`.
    pub async fn authenticate_session_roundtrip(
        &self,
        authentication: Authentication,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        self.require_state(
            "send an authentication roundtrip",
            &[SessionState::Authenticating],
        )?;
        let session = Session {
            authentication: Some(authentication),
            ..self.session_envelope(SessionState::Authenticating)
        };
        self.send_session(session, cancel).await?;
        self.receive_session(cancel).await
    }

    /// Bind the remote node and confirm the session.
    pub async fn send_established_session(
        &self,
        node: &Node,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if node.domain.is_empty() {
            return Err(LimeError::InvalidArgument(
                "The node must have a domain".to_string(),
            ));
        }
        self.require_state(
            "establish a session",
            &[SessionState::New, SessionState::Authenticating],
        )?;
        self.set_remote_node(Some(node.clone()));
        self.set_state(SessionState::Established)?;

        let session = Session {
            to: Some(node.clone()),
            ..self.session_envelope(SessionState::Established)
        };
        self.send_session(session, cancel).await
    }

    /// Wait for the client to ask for the end of the session. Sessions
    /// received earlier are returned first.
    pub async fn receive_finishing_session(&self, cancel: &CancellationToken) -> Result<Session> {
        self.require_state(
            "receive a finishing session",
            &[SessionState::Established],
        )?;
        self.receive_session(cancel).await
    }

    /// End the session, then close the transport. Valid from any state; the
    /// session envelope is only sent when a remote node is bound.
    pub async fn send_finished_session(&self, cancel: &CancellationToken) -> Result<()> {
        self.finish_session(SessionState::Finished, None, cancel)
            .await
    }

    /// Fail the session, then close the transport.
    pub async fn send_failed_session(
        &self,
        reason: Reason,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.finish_session(SessionState::Failed, Some(reason), cancel)
            .await
    }

    /// Drive the whole handshake for an accepted transport.
    ///
    /// `authenticate` receives the client node and credentials of each round.
    /// Failures are reported to the client with a `Failed` session before
    /// returning [`LimeError::SessionFailed`].
    pub async fn establish_session<F, Fut>(
        &self,
        compression_options: &[SessionCompression],
        encryption_options: &[SessionEncryption],
        scheme_options: &[AuthenticationScheme],
        mut authenticate: F,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        F: FnMut(Node, Authentication) -> Fut + Send,
        Fut: Future<Output = AuthenticationResult> + Send,
    {
        let session = self.receive_new_session(cancel).await?;
        if session.state != SessionState::New {
            return self
                .fail(
                    reason_codes::SESSION_ERROR,
                    &format!("Invalid '{}' session state", session.state),
                    cancel,
                )
                .await;
        }

        let session = self
            .negotiate_session(compression_options, encryption_options, cancel)
            .await?;
        let compression = session
            .compression
            .filter(|c| session.state == SessionState::Negotiating && compression_options.contains(c));
        let encryption = session
            .encryption
            .filter(|e| encryption_options.contains(e));
        let (Some(compression), Some(encryption)) = (compression, encryption) else {
            return self
                .fail(
                    reason_codes::SESSION_NEGOTIATION_FAILED,
                    "An invalid negotiation option was selected",
                    cancel,
                )
                .await;
        };
        self.send_negotiating_session(compression, encryption, cancel)
            .await?;
        self.transport().set_compression(compression, cancel).await?;
        self.transport().set_encryption(encryption, cancel).await?;

        let mut session = self.authenticate_session(scheme_options, cancel).await?;
        loop {
            if session.state != SessionState::Authenticating {
                return self
                    .fail(
                        reason_codes::SESSION_AUTHENTICATION_FAILED,
                        &format!("Invalid '{}' session state", session.state),
                        cancel,
                    )
                    .await;
            }
            let (Some(from), Some(authentication)) = (session.from, session.authentication) else {
                return self
                    .fail(
                        reason_codes::SESSION_AUTHENTICATION_FAILED,
                        "The identity and the authentication are required",
                        cancel,
                    )
                    .await;
            };
            if !scheme_options.contains(&authentication.scheme()) {
                return self
                    .fail(
                        reason_codes::SESSION_AUTHENTICATION_FAILED,
                        "The authentication scheme is not supported",
                        cancel,
                    )
                    .await;
            }

            match authenticate(from, authentication).await {
                AuthenticationResult::Success(node) => {
                    self.send_established_session(&node, cancel).await?;
                    tracing::info!(
                        "Session {} established with {}",
                        self.session_id().as_deref().unwrap_or("-"),
                        node
                    );
                    return Ok(());
                },
                AuthenticationResult::Roundtrip(challenge) => {
                    session = self
                        .authenticate_session_roundtrip(challenge, cancel)
                        .await?;
                },
                AuthenticationResult::Failure(reason) => {
                    let description = reason.to_string();
                    self.send_failed_session(reason, cancel).await?;
                    return Err(LimeError::SessionFailed(description));
                },
            }
        }
    }

    async fn fail(&self, code: i32, description: &str, cancel: &CancellationToken) -> Result<()> {
        tracing::warn!(
            "Failing session {}: {}",
            self.session_id().as_deref().unwrap_or("-"),
            description
        );
        self.send_failed_session(Reason::new(code, description), cancel)
            .await?;
        Err(LimeError::SessionFailed(description.to_string()))
    }
}

//! # LIME Protocol - Session-Based Envelope Channels
//!
//! Client and server channels for the LIME protocol: a session handshake
//! followed by an exchange of messages, notifications and commands over a
//! pluggable transport.
//!
//! ## Features
//!
//! - **Session state machine**: client and server sides of the negotiation,
//!   authentication and finishing handshakes
//! - **Module pipelines**: per-kind interceptors on sent and received envelopes
//! - **Command correlation**: `process_command` pairs requests with responses by id
//! - **On-demand channels**: lazy establishment with handler-gated recovery
//! - **Multiplexing**: one logical channel spread over several connections
//! - **Transports**: newline-delimited JSON over TCP, plus an in-memory pair
//!
//! ## Protocol Overview
//!
//! ### Architecture
//!
//! ```text
//!  Application
//!      │
//!      ▼
//!  MultiplexerChannel ──► OnDemandChannel × N ──► ClientChannel ──► Transport
//!                                                      │
//!                                              ModulePipeline × 4
//! ```
//!
//! ### Session States
//!
//! ```text
//!     [New] ──► [Negotiating] ──► [Authenticating] ──► [Established]
//!       │             │                  │                   │
//!       │             │                  │                   ▼
//!       │             │                  │              [Finishing] ──► [Finished]
//!       ▼             ▼                  ▼                   │
//!    [Failed] ◄───────┴──────────────────┴───────────────────┘
//! ```
//!
//! States only move forward. Messages, notifications and commands can only be
//! exchanged while the session is established.
//!
//! ## Quick Start
//!
//! ### Client
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lime::channel::{EstablishedChannelBuilder, OnDemandChannel, OnDemandClientChannel};
//! use lime::protocol::{Identity, Message};
//! use lime::transport::TcpTransportFactory;
//! use tokio_util::sync::CancellationToken;
//!
//! let factory = Arc::new(TcpTransportFactory::new("net.tcp://localhost:55321"));
//! let builder = EstablishedChannelBuilder::new(factory, Identity::parse("bot@example.org")?);
//! let channel = OnDemandChannel::new(builder);
//!
//! let cancel = CancellationToken::new();
//! channel.send_message(Message::text("Hello"), &cancel).await?;
//! let reply = channel.receive_message(&cancel).await?;
//! channel.finish(&cancel).await?;
//! ```
//!
//! ### Server
//!
//! ```rust,ignore
//! use lime::channel::{AuthenticationResult, ChannelSettings, ServerChannel};
//! use lime::protocol::{AuthenticationScheme, Node, SessionCompression, SessionEncryption};
//! use lime::transport::{TcpTransportListener, TransportListener};
//!
//! let listener = TcpTransportListener::new();
//! listener.start("net.tcp://localhost:55321").await?;
//! let transport = listener.accept_transport(&cancel).await?;
//!
//! let server = ServerChannel::new(
//!     lime::protocol::new_id(),
//!     Node::parse("server@example.org/default")?,
//!     transport,
//!     ChannelSettings::default(),
//! );
//! server
//!     .establish_session(
//!         &[SessionCompression::None],
//!         &[SessionEncryption::None],
//!         &[AuthenticationScheme::Guest],
//!         |node, _auth| async move { AuthenticationResult::Success(node) },
//!         &cancel,
//!     )
//!     .await?;
//! ```
//!
//! ## Modules
//!
//! - [`channel`]: Channel core, client/server roles, on-demand and multiplexer
//! - [`protocol`]: Envelopes, nodes, URIs and session types
//! - [`transport`]: Transport abstraction with TCP and in-memory implementations
//! - [`serialization`]: Envelope wire format
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod channel;
pub mod config;
pub mod error;
pub mod protocol;
pub mod serialization;
pub mod transport;

mod sync;

// Re-exports for convenience
pub use channel::{
    Channel, ChannelSettings, ClientChannel, EstablishedChannelBuilder, MultiplexerChannel,
    OnDemandChannel, OnDemandClientChannel, ServerChannel,
};
pub use config::Config;
pub use error::{LimeError, Result};
pub use protocol::{
    Command, Envelope, Identity, Message, Node, Notification, Session, SessionState,
    PROTOCOL_VERSION,
};
pub use serialization::{EnvelopeSerializer, JsonEnvelopeSerializer};
pub use transport::{InMemoryTransport, TcpTransport, Transport, TransportFactory};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

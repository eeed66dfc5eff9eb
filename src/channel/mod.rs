//! LIME channels.
//!
//! A channel binds one transport to one session and drives the session state
//! machine on top of it:
//!
//! ```text
//!   New ──► Negotiating ──► Authenticating ──► Established ──► Finishing ──► Finished
//!    │           │                 │                │
//!    └───────────┴─────────────────┴────────────────┴──────────────────────► Failed
//! ```
//!
//! - [`ClientChannel`] and [`ServerChannel`] implement the two sides of the
//!   handshake over the shared [`Channel`] core.
//! - [`ChannelModule`] pipelines intercept envelopes in both directions;
//!   [`ReplyPingModule`] is the built-in one.
//! - [`OnDemandChannel`] builds and rebuilds an established client channel as
//!   needed, and [`MultiplexerChannel`] spreads traffic over several of them.

mod builder;
mod client;
mod core;
mod handlers;
mod module;
mod multiplexer;
mod on_demand;
mod reply_ping;
mod server;

pub use builder::{BuiltHandler, EstablishedChannelBuilder};
pub use client::{ClientChannel, ClientSessionOptions, MAX_AUTHENTICATION_ROUNDS};
pub use self::core::{
    Channel, ChannelInformation, ChannelSettings, WeakChannel, DEFAULT_ENVELOPE_BUFFER_SIZE,
    DEFAULT_SEND_TIMEOUT,
};
pub use handlers::{
    ChannelHandler, FailedChannelHandler, FailedChannelInformation, HandlerId, HandlerSet,
};
pub use module::{ChannelModule, ModulePipeline};
pub use multiplexer::{MultiplexerChannel, DEFAULT_INPUT_BUFFER_SIZE, DEFAULT_OUTPUT_BUFFER_SIZE};
pub use on_demand::{OnDemandChannel, OnDemandClientChannel};
pub use reply_ping::ReplyPingModule;
pub use server::{AuthenticationResult, ServerChannel};

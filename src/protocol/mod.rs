//! LIME protocol data model.
//!
//! Defines the envelopes exchanged over a channel and the addressing used
//! by them.
//!
//! # Envelopes
//!
//! | Kind           | Discriminating field | Purpose                              |
//! |----------------|----------------------|--------------------------------------|
//! | `Message`      | `content`            | Application content                  |
//! | `Notification` | `event`              | Delivery events for messages         |
//! | `Command`      | `method`             | Request/response over resources      |
//! | `Session`      | `state`              | Channel negotiation and termination  |
//!
//! ## Session Flow
//!
//! ```text
//! Client                                      Server
//!    |                                          |
//!    |-------- Session(new) ------------------->|
//!    |<------- Session(negotiating, options) ---|
//!    |-------- Session(negotiating, choice) --->|
//!    |<------- Session(negotiating, choice) ----|  transport options applied
//!    |<------- Session(authenticating, schemes)-|
//!    |-------- Session(authenticating, auth) -->|
//!    |<------- Session(established) ------------|
//!    |                                          |
//!    |======== Message / Notification / Command |
//!    |                                          |
//!    |-------- Session(finishing) ------------->|
//!    |<------- Session(finished) ---------------|
//! ```
//!
//! ## Addressing
//!
//! Peers are addressed by [`Node`] (`name@domain/instance`); the
//! `name@domain` part is the [`Identity`]. Command resources are addressed by
//! [`LimeUri`].

mod envelope;
mod node;
mod session;
mod uri;

pub use envelope::{
    new_id, Command, CommandMethod, CommandStatus, Envelope, EnvelopeKind, Event, Message,
    Notification, PING_MEDIA_TYPE, PING_URI,
};
pub use node::{Identity, Node};
pub use session::{
    reason_codes, Authentication, AuthenticationScheme, Reason, Session, SessionCompression,
    SessionEncryption, SessionState,
};
pub use uri::{LimeUri, LIME_URI_SCHEME};

/// Protocol version
pub const PROTOCOL_VERSION: &str = "1.0";

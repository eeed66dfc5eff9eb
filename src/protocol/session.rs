//! Session envelope and negotiation options.
//!
//! The session envelope drives the channel handshake. Each phase fills only
//! the fields relevant to it and leaves every other field empty.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::node::Node;

/// Session state machine
///
/// States only move forward, except for the jump to [`SessionState::Failed`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Session not started
    #[default]
    New,
    /// Transport options being negotiated
    Negotiating,
    /// Authentication rounds in progress
    Authenticating,
    /// Ready for envelope exchange
    Established,
    /// Graceful termination requested
    Finishing,
    /// Terminated gracefully
    Finished,
    /// Terminated by an error
    Failed,
}

impl SessionState {
    /// Check if no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Finished | SessionState::Failed)
    }

    /// Get the wire name
    pub fn name(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Negotiating => "negotiating",
            Self::Authenticating => "authenticating",
            Self::Established => "established",
            Self::Finishing => "finishing",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transport compression options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionCompression {
    /// No compression
    #[default]
    None,
    /// GZip stream compression
    GZip,
}

/// Transport encryption options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionEncryption {
    /// Plain transport
    #[default]
    None,
    /// TLS upgrade
    Tls,
}

/// Authentication schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticationScheme {
    /// Anonymous access
    Guest,
    /// Password
    Plain,
    /// Pre-shared key
    Key,
    /// Credentials from the transport (e.g. client certificate)
    Transport,
    /// Token issued by an external provider
    External,
}

/// Scheme-specific authentication payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum Authentication {
    /// Anonymous access
    #[default]
    Guest,
    /// Password authentication
    Plain {
        /// Password
        password: String,
    },
    /// Key authentication
    Key {
        /// Pre-shared key
        key: String,
    },
    /// Transport-level authentication
    Transport,
    /// External provider token
    External {
        /// Issued token
        token: String,
        /// Token issuer
        issuer: String,
    },
}

impl Authentication {
    /// Get the scheme of this payload
    pub fn scheme(&self) -> AuthenticationScheme {
        match self {
            Self::Guest => AuthenticationScheme::Guest,
            Self::Plain { .. } => AuthenticationScheme::Plain,
            Self::Key { .. } => AuthenticationScheme::Key,
            Self::Transport => AuthenticationScheme::Transport,
            Self::External { .. } => AuthenticationScheme::External,
        }
    }
}

/// Failure reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    /// Reason code
    pub code: i32,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Reason {
    /// Create a reason with description
    pub fn new(code: i32, description: &str) -> Self {
        Self {
            code,
            description: Some(description.to_string()),
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{} (code {})", description, self.code),
            None => write!(f, "code {}", self.code),
        }
    }
}

/// Well-known reason codes
pub mod reason_codes {
    /// General session error
    pub const SESSION_ERROR: i32 = 11;
    /// Negotiation failed
    pub const SESSION_NEGOTIATION_FAILED: i32 = 12;
    /// Authentication failed
    pub const SESSION_AUTHENTICATION_FAILED: i32 = 13;
    /// Remote peer considered idle
    pub const SESSION_IDLE: i32 = 16;
}

/// Session envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Sender
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Node>,
    /// Destination
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Node>,
    /// Custom metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    /// Session state described by this envelope
    pub state: SessionState,
    /// Encryption options offered by the server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_options: Option<Vec<SessionEncryption>>,
    /// Selected encryption
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<SessionEncryption>,
    /// Compression options offered by the server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_options: Option<Vec<SessionCompression>>,
    /// Selected compression
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<SessionCompression>,
    /// Authentication schemes offered by the server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme_options: Option<Vec<AuthenticationScheme>>,
    /// Authentication payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Authentication>,
    /// Failure reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

impl Session {
    /// Create an empty session envelope in `state`
    pub fn new(state: SessionState) -> Self {
        Self {
            state,
            ..Default::default()
        }
    }
}

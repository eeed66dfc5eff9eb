//! Protocol envelopes for LIME communication.
//!
//! Defines the four envelope kinds (Message, Notification, Command and
//! Session) and the sum type used to carry them over a transport.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::node::Node;
use super::session::{Reason, Session};
use super::uri::LimeUri;

/// Resource path answered by ping replies
pub const PING_URI: &str = "/ping";

/// Media type of the ping document
pub const PING_MEDIA_TYPE: &str = "application/vnd.lime.ping+json";

/// Envelope kind discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    /// Application content
    Message,
    /// Message delivery event
    Notification,
    /// Resource request or response
    Command,
    /// Session control
    Session,
}

/// Message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message ID (absent for fire-and-forget messages)
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
    /// Media type of the content
    #[serde(rename = "type")]
    pub content_type: String,
    /// Document content
    pub content: serde_json::Value,
}

/// Notification events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    /// Accepted by the server
    Accepted,
    /// Dispatched to the destination
    Dispatched,
    /// Received by the destination
    Received,
    /// Consumed by the destination
    Consumed,
    /// Delivery failed
    Failed,
}

/// Notification envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// ID of the related message
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
    /// Delivery event
    pub event: Event,
    /// Failure reason for failed events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

/// Command methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandMethod {
    /// Read a resource
    Get,
    /// Create or replace a resource
    Set,
    /// Remove a resource
    Delete,
    /// Resource change notification
    Observe,
    /// Subscribe to resource changes
    Subscribe,
    /// Partially update a resource
    Merge,
}

/// Command response status. Requests carry no status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    /// Request processed
    Success,
    /// Request failed
    Failure,
}

/// Command envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Command ID, correlates responses with requests
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
    /// Method applied to the resource
    pub method: CommandMethod,
    /// Resource URI
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<LimeUri>,
    /// Media type of the resource
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    /// Resource document
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<serde_json::Value>,
    /// Response status (absent for requests)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CommandStatus>,
    /// Failure reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

/// Protocol envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    /// Session envelope (has `state`)
    Session(Session),
    /// Command envelope (has `method`)
    Command(Command),
    /// Notification envelope (has `event`)
    Notification(Notification),
    /// Message envelope (has `type` and `content`)
    Message(Message),
}

impl Message {
    /// Create a message with content
    pub fn new(content_type: &str, content: serde_json::Value) -> Self {
        Self {
            id: None,
            from: None,
            to: None,
            metadata: None,
            content_type: content_type.to_string(),
            content,
        }
    }

    /// Create a plain text message
    pub fn text(text: &str) -> Self {
        Self::new("text/plain", serde_json::Value::String(text.to_string()))
    }

    /// Set a fresh ID
    pub fn with_new_id(mut self) -> Self {
        self.id = Some(new_id());
        self
    }

    /// Set destination
    pub fn to(mut self, node: Node) -> Self {
        self.to = Some(node);
        self
    }
}

impl Notification {
    /// Create a notification for message `id`
    pub fn new(id: &str, event: Event) -> Self {
        Self {
            id: Some(id.to_string()),
            from: None,
            to: None,
            metadata: None,
            event,
            reason: None,
        }
    }
}

impl Command {
    /// Create a request with a fresh ID
    pub fn request(method: CommandMethod, uri: LimeUri) -> Self {
        Self {
            id: Some(new_id()),
            from: None,
            to: None,
            metadata: None,
            method,
            uri: Some(uri),
            resource_type: None,
            resource: None,
            status: None,
            reason: None,
        }
    }

    /// Create a ping request with a fresh ID
    pub fn ping_request() -> Self {
        Self::request(CommandMethod::Get, LimeUri::relative(PING_URI))
    }

    /// Check if this is a pending ping request
    pub fn is_ping_request(&self) -> bool {
        self.method == CommandMethod::Get
            && self.status.is_none()
            && self
                .uri
                .as_ref()
                .is_some_and(|uri| uri.path().eq_ignore_ascii_case(PING_URI))
    }

    /// Check if this is a successful ping response
    pub fn is_ping_response(&self) -> bool {
        self.status == Some(CommandStatus::Success)
            && self.resource_type.as_deref() == Some(PING_MEDIA_TYPE)
    }

    /// Build the success response for this request
    pub fn success_response(&self) -> Self {
        Self {
            id: self.id.clone(),
            from: None,
            to: self.from.clone(),
            metadata: None,
            method: self.method,
            uri: None,
            resource_type: None,
            resource: None,
            status: Some(CommandStatus::Success),
            reason: None,
        }
    }

    /// Build the failure response for this request
    pub fn failure_response(&self, reason: Reason) -> Self {
        Self {
            status: Some(CommandStatus::Failure),
            reason: Some(reason),
            ..self.success_response()
        }
    }

    /// Build the ping reply for this request
    pub fn ping_response(&self) -> Self {
        Self {
            resource_type: Some(PING_MEDIA_TYPE.to_string()),
            resource: Some(serde_json::json!({})),
            ..self.success_response()
        }
    }
}

impl Envelope {
    /// Get the kind discriminant
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Message(_) => EnvelopeKind::Message,
            Envelope::Notification(_) => EnvelopeKind::Notification,
            Envelope::Command(_) => EnvelopeKind::Command,
            Envelope::Session(_) => EnvelopeKind::Session,
        }
    }

    /// Get the envelope ID
    pub fn id(&self) -> Option<&str> {
        match self {
            Envelope::Message(e) => e.id.as_deref(),
            Envelope::Notification(e) => e.id.as_deref(),
            Envelope::Command(e) => e.id.as_deref(),
            Envelope::Session(e) => e.id.as_deref(),
        }
    }

    /// Get the sender
    pub fn sender(&self) -> Option<&Node> {
        match self {
            Envelope::Message(e) => e.from.as_ref(),
            Envelope::Notification(e) => e.from.as_ref(),
            Envelope::Command(e) => e.from.as_ref(),
            Envelope::Session(e) => e.from.as_ref(),
        }
    }

    /// Get the destination
    pub fn to(&self) -> Option<&Node> {
        match self {
            Envelope::Message(e) => e.to.as_ref(),
            Envelope::Notification(e) => e.to.as_ref(),
            Envelope::Command(e) => e.to.as_ref(),
            Envelope::Session(e) => e.to.as_ref(),
        }
    }
}

impl From<Message> for Envelope {
    fn from(value: Message) -> Self {
        Envelope::Message(value)
    }
}

impl From<Notification> for Envelope {
    fn from(value: Notification) -> Self {
        Envelope::Notification(value)
    }
}

impl From<Command> for Envelope {
    fn from(value: Command) -> Self {
        Envelope::Command(value)
    }
}

impl From<Session> for Envelope {
    fn from(value: Session) -> Self {
        Envelope::Session(value)
    }
}

/// Generate a new envelope ID
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

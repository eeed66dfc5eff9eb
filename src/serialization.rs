//! Envelope serialization.
//!
//! Channels never look at the wire representation; transports that move
//! text frames use an [`EnvelopeSerializer`] to convert envelopes.

use crate::error::Result;
use crate::protocol::Envelope;

/// Converts envelopes to and from their wire representation
pub trait EnvelopeSerializer: Send + Sync {
    /// Serialize an envelope
    fn serialize(&self, envelope: &Envelope) -> Result<String>;

    /// Deserialize an envelope
    fn deserialize(&self, data: &str) -> Result<Envelope>;
}

/// Compact JSON serializer
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEnvelopeSerializer;

impl EnvelopeSerializer for JsonEnvelopeSerializer {
    fn serialize(&self, envelope: &Envelope) -> Result<String> {
        Ok(serde_json::to_string(envelope)?)
    }

    fn deserialize(&self, data: &str) -> Result<Envelope> {
        Ok(serde_json::from_str(data)?)
    }
}

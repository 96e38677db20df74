//! Wraps queue messages in CloudEvents envelopes.

use crate::config::RelayConfig;
use crate::queue::SourceMessage;

/// CloudEvents spec version emitted by the relay.
pub const SPEC_VERSION: &str = "1.0";

/// A message wrapped as a CloudEvent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredEvent {
    /// `id` attribute; the source message id, so redeliveries share it.
    pub id: String,
    /// `type` attribute.
    pub event_type: String,
    /// `source` attribute.
    pub source: String,
    /// Event data, copied verbatim from the message.
    pub data: Vec<u8>,
}

/// Builds [`StructuredEvent`]s from source messages.
///
/// Holds only static configuration, so the same message always produces the
/// same event no matter how often it has been backed out.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    event_type: String,
    source: String,
}

impl EnvelopeBuilder {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
        }
    }

    /// Type from the configured event type, source from the connection name.
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.event_type.clone(), config.connection_name.clone())
    }

    pub fn build(&self, message: &SourceMessage) -> StructuredEvent {
        StructuredEvent {
            id: message.message_id.clone(),
            event_type: self.event_type.clone(),
            source: self.source.clone(),
            data: message.payload.clone(),
        }
    }
}

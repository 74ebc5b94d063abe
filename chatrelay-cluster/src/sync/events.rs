use chatrelay_core::models::OutboundMessage;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Wire envelope published on the relay topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Publishing process, for tracing only; every process consumes every envelope
    pub node_id: String,
    pub message: OutboundMessage,
}

impl RelayEnvelope {
    #[must_use]
    pub const fn new(node_id: String, message: OutboundMessage) -> Self {
        Self { node_id, message }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::BrokerDecode(e.to_string()))
    }
}

//! ACK/RST handling
//!
//! An inbound acknowledgement or reset completes the outbound message with
//! the same id: the message leaves the pool and its ack handler is called.

use crate::ack::AckRegistry;
use crate::error::LayerError;
use crate::pipeline::{AddressCell, LayerResult, ReceiveLayer};
use crate::pool::MessagePool;
use coala_protocol::{Message, MessageCode, MessageType};
use std::sync::Arc;

/// Token shared by every answer to a broadcast discovery request
pub const BROADCAST_DISCOVERY_TOKEN: &str = "eb21926ad2e765a7";

pub struct ReliabilityLayer {
    pool: Arc<MessagePool>,
    acks: Arc<AckRegistry>,
}

impl ReliabilityLayer {
    pub fn new(pool: Arc<MessagePool>, acks: Arc<AckRegistry>) -> Self {
        ReliabilityLayer { pool, acks }
    }
}

/// Error text for a reset or a non-success answer
pub fn response_error(message: &Message) -> Option<String> {
    if message.msg_type == MessageType::Reset {
        return Some("Request has been reset!".to_string());
    }
    if message.code.is_success() || message.code == MessageCode::Empty {
        return None;
    }
    let mut error = message.code.to_string();
    if let Some(payload) = message.payload.as_ref().filter(|payload| !payload.is_empty()) {
        error.push_str(", ");
        error.push_str(&String::from_utf8_lossy(payload));
    }
    Some(error)
}

impl ReceiveLayer for ReliabilityLayer {
    fn name(&self) -> &'static str {
        "reliability"
    }

    fn on_receive(
        &self,
        message: &mut Message,
        _source: &mut AddressCell,
    ) -> Result<LayerResult, LayerError> {
        if message.is_request() || !message.msg_type.is_ack_or_reset() {
            return Ok(LayerResult::proceed());
        }

        self.pool.remove(message);

        if let Some(handler) = self.acks.get(message.id) {
            let error = response_error(message);
            handler.on_message(message, error.as_deref());
            if message.hex_token() != BROADCAST_DISCOVERY_TOKEN {
                self.acks.unregister(message.id);
            }
        }

        Ok(LayerResult::proceed())
    }
}

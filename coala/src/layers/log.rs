use crate::error::LayerError;
use crate::pipeline::{AddressCell, LayerResult, ReceiveLayer, SendLayer};
use coala_protocol::{Message, OptionNumber};

/// Traces every message passing through; never stops the pipeline
#[derive(Debug, Default, Clone, Copy)]
pub struct LogLayer;

impl LogLayer {
    pub fn new() -> Self {
        LogLayer
    }
}

impl SendLayer for LogLayer {
    fn name(&self) -> &'static str {
        "log"
    }

    fn on_send(
        &self,
        message: &mut Message,
        destination: &mut AddressCell,
    ) -> Result<LayerResult, LayerError> {
        match destination.get() {
            Some(address) => tracing::debug!("Send to {}: {}", address, message),
            None => tracing::debug!("Send: {}", message),
        }
        tracing::trace!(
            "Send {} options, {} payload bytes",
            message.options().len(),
            message.payload_len()
        );
        Ok(LayerResult::proceed())
    }
}

impl ReceiveLayer for LogLayer {
    fn name(&self) -> &'static str {
        "log"
    }

    fn on_receive(
        &self,
        message: &mut Message,
        source: &mut AddressCell,
    ) -> Result<LayerResult, LayerError> {
        match source.get() {
            Some(address) => tracing::debug!("Received from {}: {}", address, message),
            None => tracing::debug!("Received: {}", message),
        }
        if let Some(window) = message.uint_option(OptionNumber::SelectiveRepeatWindowSize) {
            tracing::trace!(
                "Block exchange on token {}, window {}",
                message.hex_token(),
                window
            );
        }
        Ok(LayerResult::proceed())
    }
}

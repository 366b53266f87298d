//! Layer pipeline
//!
//! Outbound messages pass through the send stages and inbound messages
//! through the receive stages, each list in order. A stage may rewrite the
//! message in place, swap it for a replacement, override the address cell,
//! or stop the pipeline. A stage error aborts processing of that one message.

use crate::error::LayerError;
use coala_protocol::Message;
use std::net::SocketAddr;
use std::sync::Arc;

/// Destination (send) or source (receive) address a stage may override
/// without touching the message's own address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressCell(Option<SocketAddr>);

impl AddressCell {
    pub fn new(address: Option<SocketAddr>) -> Self {
        AddressCell(address)
    }

    pub fn get(&self) -> Option<SocketAddr> {
        self.0
    }

    pub fn set(&mut self, address: SocketAddr) {
        self.0 = Some(address);
    }
}

/// Outcome of one stage
#[derive(Debug, Clone, PartialEq)]
pub struct LayerResult {
    pub proceed: bool,
    /// Message later stages see instead of the current one
    pub replacement: Option<Message>,
}

impl LayerResult {
    pub fn proceed() -> Self {
        LayerResult {
            proceed: true,
            replacement: None,
        }
    }

    pub fn stop() -> Self {
        LayerResult {
            proceed: false,
            replacement: None,
        }
    }

    pub fn replace(message: Message) -> Self {
        LayerResult {
            proceed: true,
            replacement: Some(message),
        }
    }

    pub fn from_flag(proceed: bool) -> Self {
        LayerResult {
            proceed,
            replacement: None,
        }
    }
}

/// Stage on the outbound path
pub trait SendLayer: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_send(
        &self,
        message: &mut Message,
        destination: &mut AddressCell,
    ) -> Result<LayerResult, LayerError>;
}

/// Stage on the inbound path
pub trait ReceiveLayer: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_receive(
        &self,
        message: &mut Message,
        source: &mut AddressCell,
    ) -> Result<LayerResult, LayerError>;
}

/// Message after a pipeline run
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// Every stage let the message through
    pub proceed: bool,
    pub message: Message,
}

/// Ordered send and receive stages
#[derive(Default, Clone)]
pub struct LayerStack {
    send: Vec<Arc<dyn SendLayer>>,
    receive: Vec<Arc<dyn ReceiveLayer>>,
}

impl LayerStack {
    pub fn new() -> Self {
        LayerStack::default()
    }

    pub fn with_send(mut self, layer: Arc<dyn SendLayer>) -> Self {
        self.send.push(layer);
        self
    }

    pub fn with_receive(mut self, layer: Arc<dyn ReceiveLayer>) -> Self {
        self.receive.push(layer);
        self
    }

    pub fn send_layers(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.send.iter().map(|layer| layer.name())
    }

    pub fn receive_layers(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.receive.iter().map(|layer| layer.name())
    }

    pub fn on_send(
        &self,
        mut message: Message,
        destination: &mut AddressCell,
    ) -> Result<Dispatch, LayerError> {
        for layer in &self.send {
            let result = layer.on_send(&mut message, destination)?;
            if let Some(replacement) = result.replacement {
                message = replacement;
            }
            if !result.proceed {
                tracing::trace!("Send stopped at {} for message {}", layer.name(), message.id);
                return Ok(Dispatch {
                    proceed: false,
                    message,
                });
            }
        }
        Ok(Dispatch {
            proceed: true,
            message,
        })
    }

    pub fn on_receive(
        &self,
        mut message: Message,
        source: &mut AddressCell,
    ) -> Result<Dispatch, LayerError> {
        for layer in &self.receive {
            let result = layer.on_receive(&mut message, source)?;
            if let Some(replacement) = result.replacement {
                message = replacement;
            }
            if !result.proceed {
                tracing::trace!(
                    "Receive stopped at {} for message {}",
                    layer.name(),
                    message.id
                );
                return Ok(Dispatch {
                    proceed: false,
                    message,
                });
            }
        }
        Ok(Dispatch {
            proceed: true,
            message,
        })
    }
}

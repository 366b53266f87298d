//! Error types for the Coala engine

use crate::pool::DeliveryInfo;
use coala_io::SocketError;
use coala_protocol::{BlockError, CodecError};
use thiserror::Error;

/// Why a message ended without an answer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    #[error("message expired")]
    Expired,

    #[error("message deleted by garbage")]
    Garbage,

    #[error("Request Canceled, too many attempts")]
    TooManyAttempts,

    #[error("message evicted from pool")]
    Evicted,

    #[error("Request has been reset!")]
    Reset,

    /// Non-success response code, with payload text if any
    #[error("{0}")]
    Response(String),

    #[error("ARQ: fail to transfer")]
    TransferFailed,

    #[error("{0}")]
    Stopped(String),
}

/// Terminal failure delivered to a response handler
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{reason}")]
pub struct Failure {
    pub reason: FailureReason,
    pub delivery: Option<DeliveryInfo>,
}

impl Failure {
    pub fn new(reason: FailureReason) -> Self {
        Failure {
            reason,
            delivery: None,
        }
    }

    pub fn with_delivery(reason: FailureReason, delivery: Option<DeliveryInfo>) -> Self {
        Failure { reason, delivery }
    }
}

/// Error raised by a pipeline stage; aborts processing of that message only
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("ARQ: block message without payload, token {0}")]
    MissingPayload(String),

    #[error("ARQ: non-confirmable block message, token {0}")]
    NonConfirmableBlock(String),

    #[error("Invalid block option: {0}")]
    Block(#[from] BlockError),

    #[error("Direct send failed: {0}")]
    Transmit(#[from] DriverError),
}

/// Worker loop errors; these end the loop and trigger a supervised restart
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Message {0} has no destination address")]
    NoDestination(u16),

    #[error("Inbound channel closed")]
    InboundClosed,
}

/// Endpoint lifecycle errors
#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Endpoint already started")]
    AlreadyStarted,

    #[error("Message {0} has no destination address")]
    NoDestination(u16),
}

//! Pipeline stages
//!
//! Send stack order: response correlation, ARQ, log.
//! Receive stack order: log, ARQ, reliability, response correlation.

pub mod arq;
pub mod log;
pub mod reliability;
pub mod response;

pub use arq::{ArqConfig, ArqLayer, DirectSend};
pub use log::LogLayer;
pub use reliability::ReliabilityLayer;
pub use response::ResponseLayer;

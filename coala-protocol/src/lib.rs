//! Coala Protocol Core
//!
//! Message model and CoAP wire codec, plus the building blocks of the
//! block-wise (ARQ) transfer protocol: block control values, the sliding
//! window and per-transfer send/receive state. Nothing here performs I/O.

pub mod block;
pub mod codec;
pub mod message;
pub mod transfer;
pub mod window;

pub use block::{Block, BlockError, BlockSize};
pub use codec::{decode, encode, CodecError};
pub use message::{
    next_message_id, Message, MessageCode, MessageId, MessageOption, MessageType, OptionNumber,
    OptionValue, Token,
};
pub use transfer::{ReceiveState, SendState, TransferReport, TransferStats};
pub use window::SlidingWindow;

//! Coala I/O and Platform Abstraction
//!
//! UDP socket wrapper used by the engine's worker loops, and the time
//! sources the engine's timeouts are measured against.

pub mod socket;
pub mod time;

pub use socket::{CoalaSocket, DatagramSocket, SocketError};
pub use time::{Clock, ManualClock, SystemClock, Timer, Timestamp};

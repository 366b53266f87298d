//! Coala - reliable CoAP transport engine
//!
//! Confirmable delivery with retransmission, ACK/response correlation and
//! block-wise (ARQ) transfer of large payloads over UDP.
//!
//! ```no_run
//! use coala::{Endpoint, EndpointConfig};
//! use coala_protocol::{Message, MessageCode};
//!
//! # fn main() -> Result<(), coala::EndpointError> {
//! let endpoint = Endpoint::bind(EndpointConfig::default())?;
//! endpoint.start()?;
//! let mut request = Message::request(MessageCode::Get, "192.168.1.10:5683".parse().unwrap());
//! request.set_path("/info");
//! let outcome = endpoint.request(request)?;
//! if let Ok(Ok(response)) = outcome.recv() {
//!     println!("{}", response);
//! }
//! endpoint.stop();
//! # Ok(())
//! # }
//! ```

pub mod ack;
pub mod cache;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod layers;
pub mod pipeline;
pub mod pool;

pub use coala_io as io;
pub use coala_protocol as protocol;

pub use ack::AckRegistry;
pub use cache::ExpiringCache;
pub use driver::{Supervisor, SupervisorConfig, Transmitter, Worker};
pub use endpoint::{Endpoint, EndpointConfig};
pub use error::{DriverError, EndpointError, Failure, FailureReason, LayerError};
pub use handler::{AckHandler, ChannelResponse, Hooks, OnceResponse, ResponseHandler};
pub use pipeline::{AddressCell, LayerResult, LayerStack};
pub use pool::{DeliveryInfo, MessagePool, PoolConfig};

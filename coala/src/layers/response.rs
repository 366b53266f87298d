//! Request/response correlation
//!
//! Matches inbound responses to outstanding requests by token. A separate
//! (CON) response is acknowledged with an empty ACK first. The matched
//! request leaves the pool and its handler receives exactly one outcome.

use super::arq::DirectSend;
use crate::cache::ExpiringCache;
use crate::error::{Failure, FailureReason, LayerError};
use crate::handler::ResponseHandler;
use crate::pipeline::{AddressCell, LayerResult, ReceiveLayer, SendLayer};
use crate::pool::MessagePool;
use coala_io::Clock;
use coala_protocol::{Message, MessageCode, MessageType};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Idle time after which an unanswered request is forgotten
pub const RESPONSE_IDLE_EXPIRY: Duration = Duration::from_secs(10 * 60);

pub struct ResponseLayer {
    expected: Mutex<ExpiringCache<String, Arc<dyn ResponseHandler>>>,
    pool: Arc<MessagePool>,
    outbound: Arc<dyn DirectSend>,
}

impl ResponseLayer {
    pub fn new(pool: Arc<MessagePool>, outbound: Arc<dyn DirectSend>, clock: Arc<dyn Clock>) -> Self {
        ResponseLayer {
            expected: Mutex::new(ExpiringCache::with_idle(RESPONSE_IDLE_EXPIRY, clock)),
            pool,
            outbound,
        }
    }

    /// Wait for the response carrying `token`
    pub fn expect(&self, token: &str, handler: Arc<dyn ResponseHandler>) {
        tracing::trace!("Expecting response for token {}", token);
        self.expected.lock().insert(token.to_string(), handler);
    }

    pub fn forget(&self, token: &str) -> Option<Arc<dyn ResponseHandler>> {
        self.expected.lock().remove(&token.to_string())
    }

    pub fn pending(&self) -> usize {
        self.expected.lock().len()
    }

    pub fn purge_idle(&self) -> usize {
        self.expected.lock().purge_expired().len()
    }
}

impl SendLayer for ResponseLayer {
    fn name(&self) -> &'static str {
        "response"
    }

    /// Each (re)transmission of a request keeps its expectation alive
    fn on_send(
        &self,
        message: &mut Message,
        _destination: &mut AddressCell,
    ) -> Result<LayerResult, LayerError> {
        if message.is_request() && message.token.is_some() {
            let token = message.hex_token();
            if self.expected.lock().get(&token).is_some() {
                tracing::trace!("Request {} awaits response on token {}", message.id, token);
            }
        }
        Ok(LayerResult::proceed())
    }
}

impl ReceiveLayer for ResponseLayer {
    fn name(&self) -> &'static str {
        "response"
    }

    fn on_receive(
        &self,
        message: &mut Message,
        source: &mut AddressCell,
    ) -> Result<LayerResult, LayerError> {
        if message.is_request() || message.token.is_none() {
            return Ok(LayerResult::proceed());
        }

        if message.msg_type == MessageType::Confirmable {
            let ack = Message::ack_to(message, source.get(), MessageCode::Empty);
            self.outbound.send_now(&ack)?;
        }

        if message.code == MessageCode::Empty {
            return Ok(LayerResult::stop());
        }

        let token = message.hex_token();
        let Some(handler) = self.forget(&token) else {
            return Ok(LayerResult::proceed());
        };
        self.pool.remove_by_token(&token);

        if message.msg_type == MessageType::Reset {
            handler.on_error(&Failure::with_delivery(
                FailureReason::Reset,
                self.pool.delivery_info(&token),
            ));
        } else if !message.code.is_success() {
            let reason = match message.payload.as_ref().filter(|payload| !payload.is_empty()) {
                Some(payload) => format!("{}, {}", message.code, String::from_utf8_lossy(payload)),
                None => message.code.to_string(),
            };
            handler.on_error(&Failure::with_delivery(
                FailureReason::Response(reason),
                self.pool.delivery_info(&token),
            ));
        } else {
            handler.on_response(message);
        }
        Ok(LayerResult::stop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::AckRegistry;
    use crate::error::DriverError;
    use crate::handler::{ChannelResponse, Hooks};
    use crate::pool::PoolConfig;
    use coala_io::ManualClock;
    use coala_protocol::Token;
    use crossbeam::channel::unbounded;

    #[derive(Default)]
    struct Wire(Mutex<Vec<Message>>);

    impl DirectSend for Wire {
        fn send_now(&self, message: &Message) -> Result<(), DriverError> {
            self.0.lock().push(message.clone());
            Ok(())
        }
    }

    fn setup() -> (Arc<MessagePool>, Arc<Wire>, ResponseLayer) {
        let clock = Arc::new(ManualClock::new());
        let acks = Arc::new(AckRegistry::new(clock.clone()));
        let pool = Arc::new(MessagePool::new(PoolConfig::default(), acks, clock.clone()));
        let wire = Arc::new(Wire::default());
        let layer = ResponseLayer::new(pool.clone(), wire.clone(), clock);
        (pool, wire, layer)
    }

    fn request() -> Message {
        let mut message = Message::request(MessageCode::Get, "127.0.0.1:5683".parse().unwrap());
        message.token = Some(Token::new(vec![0xca, 0xfe]));
        message
    }

    #[test]
    fn test_separate_response_acked_and_delivered() {
        let (pool, wire, layer) = setup();
        let (tx, rx) = unbounded();
        let request = request();
        pool.enqueue(request.clone(), Hooks::default());
        layer.expect("cafe", Arc::new(ChannelResponse::new(tx)));

        let mut response = Message::new(MessageType::Confirmable, MessageCode::Content);
        response.token = request.token.clone();
        response.set_payload(&b"22.5"[..]);
        let result = layer.on_receive(&mut response, &mut AddressCell::default()).unwrap();

        assert!(!result.proceed);
        assert!(!pool.contains(request.id));
        assert_eq!(layer.pending(), 0);
        let acks = wire.0.lock();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].msg_type, MessageType::Acknowledgement);
        assert_eq!(acks[0].id, response.id);
        assert_eq!(rx.try_recv().unwrap().unwrap().payload.as_deref(), Some(&b"22.5"[..]));
    }

    #[test]
    fn test_error_code_fails_request() {
        let (_pool, _wire, layer) = setup();
        let (tx, rx) = unbounded();
        layer.expect("cafe", Arc::new(ChannelResponse::new(tx)));

        let mut response = Message::ack_to(&request(), None, MessageCode::NotFound);
        layer.on_receive(&mut response, &mut AddressCell::default()).unwrap();

        let failure = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(failure.reason, FailureReason::Response("4.04 Not Found".to_string()));
    }

    #[test]
    fn test_empty_ack_stops_without_completing() {
        let (_pool, _wire, layer) = setup();
        let (tx, rx) = unbounded();
        layer.expect("cafe", Arc::new(ChannelResponse::new(tx)));

        let mut ack = Message::ack_to(&request(), None, MessageCode::Empty);
        let result = layer.on_receive(&mut ack, &mut AddressCell::default()).unwrap();

        assert!(!result.proceed);
        assert_eq!(layer.pending(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unexpected_response_passes() {
        let (_pool, wire, layer) = setup();
        let mut response = Message::new(MessageType::NonConfirmable, MessageCode::Content);
        response.token = Some(Token::new(vec![1]));

        let result = layer.on_receive(&mut response, &mut AddressCell::default()).unwrap();
        assert!(result.proceed);
        assert!(wire.0.lock().is_empty());
    }

    #[test]
    fn test_idle_expectations_purged() {
        let clock = Arc::new(ManualClock::new());
        let acks = Arc::new(AckRegistry::new(clock.clone()));
        let pool = Arc::new(MessagePool::new(PoolConfig::default(), acks, clock.clone()));
        let layer = ResponseLayer::new(pool, Arc::new(Wire::default()), clock.clone());
        let (tx, _rx) = unbounded();
        layer.expect("cafe", Arc::new(ChannelResponse::new(tx)));

        clock.advance(Duration::from_secs(9 * 60));
        let mut retransmission = request();
        layer.on_send(&mut retransmission, &mut AddressCell::default()).unwrap();
        clock.advance(Duration::from_secs(9 * 60));
        assert_eq!(layer.purge_idle(), 0);

        clock.advance(RESPONSE_IDLE_EXPIRY);
        assert_eq!(layer.purge_idle(), 1);
    }
}

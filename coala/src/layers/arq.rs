//! Block-wise transfer (ARQ) stage
//!
//! Outbound payloads larger than one block are split into fragments that
//! carry a Block1 (requests) or Block2 (responses) option and the window
//! size. The receiver acknowledges every fragment; each acknowledgement
//! slides the sender's window so more fragments can go out. Inbound
//! fragments are reassembled per token and handed on as one message once
//! every block has arrived.
//!
//! Send and receive state is keyed by hex token. The send loop only inserts
//! send state; the receive loop advances and retires both kinds.

use crate::ack::AckRegistry;
use crate::cache::ExpiringCache;
use crate::error::{DriverError, Failure, FailureReason, LayerError};
use crate::handler::{AckHandler, Hooks};
use crate::pipeline::{AddressCell, LayerResult, ReceiveLayer, SendLayer};
use crate::pool::MessagePool;
use coala_io::Clock;
use coala_protocol::{
    Block, BlockError, Message, MessageCode, MessageId, MessageOption, MessageType, OptionNumber,
    ReceiveState, SendState, TransferReport,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Blocks allowed in flight per transfer
pub const WINDOW_SIZE: usize = 70;

/// Largest payload sent as a single message
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Idle time after which a partial inbound transfer is dropped
pub const RECEIVE_STATE_IDLE: Duration = Duration::from_secs(10);

/// Transfer tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArqConfig {
    pub window_size: usize,
    pub max_payload_size: usize,
    pub receive_idle: Duration,
}

impl Default for ArqConfig {
    fn default() -> Self {
        ArqConfig {
            window_size: WINDOW_SIZE,
            max_payload_size: MAX_PAYLOAD_SIZE,
            receive_idle: RECEIVE_STATE_IDLE,
        }
    }
}

/// Sends a message straight to the socket, bypassing the pool
pub trait DirectSend: Send + Sync {
    fn send_now(&self, message: &Message) -> Result<(), DriverError>;
}

struct OutboundTransfer {
    state: SendState,
    hooks: Hooks,
    /// Fragments queued but not yet acknowledged
    in_flight: HashSet<MessageId>,
}

pub struct ArqLayer {
    me: Weak<ArqLayer>,
    pool: Arc<MessagePool>,
    acks: Arc<AckRegistry>,
    outbound: Arc<dyn DirectSend>,
    config: ArqConfig,
    send_states: Mutex<HashMap<String, OutboundTransfer>>,
    receive_states: Mutex<ExpiringCache<String, ReceiveState>>,
}

impl ArqLayer {
    pub fn new(
        config: ArqConfig,
        pool: Arc<MessagePool>,
        acks: Arc<AckRegistry>,
        outbound: Arc<dyn DirectSend>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| ArqLayer {
            me: me.clone(),
            pool,
            acks,
            outbound,
            receive_states: Mutex::new(ExpiringCache::with_idle(config.receive_idle, clock)),
            config,
            send_states: Mutex::new(HashMap::new()),
        })
    }

    /// Outbound transfers in progress
    pub fn active_sends(&self) -> usize {
        self.send_states.lock().len()
    }

    /// Inbound transfers in progress
    pub fn active_receives(&self) -> usize {
        self.receive_states.lock().len()
    }

    /// Statistics of the inbound transfer for `token`, if one is in progress
    pub fn receive_report(&self, token: &str) -> Option<TransferReport> {
        self.receive_states
            .lock()
            .peek(&token.to_string())
            .map(ReceiveState::report)
    }

    /// Drop inbound transfers that stalled
    pub fn purge_idle(&self) -> usize {
        let purged = self.receive_states.lock().purge_expired();
        for (token, _) in &purged {
            tracing::debug!("ARQ: receive state for token {} expired", token);
        }
        purged.len()
    }

    fn exceeds_single_block(&self, message: &Message) -> bool {
        message.payload_len() > self.config.max_payload_size
    }

    /// A response that acknowledges a Block1 upload and starts a Block2 download
    fn is_start_mixing_mode(&self, message: &Message) -> bool {
        !message.is_request()
            && message.has_option(OptionNumber::Block1)
            && !message.has_option(OptionNumber::Block2)
            && self.exceeds_single_block(message)
    }

    /// Pop every block the window allows and build its fragment
    fn drain_ready(&self, token: &str, transfer: &mut OutboundTransfer) -> Vec<(Message, Hooks)> {
        let mut fragments = Vec::new();
        while let Some(block) = transfer.state.pop_block() {
            tracing::trace!("ARQ: pop block {} for token {}", block.number(), token);
            let fragment = self.fragment(&block, &transfer.state);
            let counter = transfer.state.stats().resend_counter();
            let hooks = Hooks::default().with_resend(Arc::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }));
            transfer.state.stats_mut().on_message();
            transfer.in_flight.insert(fragment.id);
            fragments.push((fragment, hooks));
        }
        fragments
    }

    fn fragment(&self, block: &Block, state: &SendState) -> Message {
        let original = state.original();
        let mut fragment = Message::new(original.msg_type, original.code);
        fragment.set_options(original.options().to_vec());
        let block_option = if original.is_request() {
            OptionNumber::Block1
        } else {
            OptionNumber::Block2
        };
        fragment.add_option(MessageOption::uint(block_option, block.to_raw() as u64));
        fragment.add_option(MessageOption::uint(
            OptionNumber::SelectiveRepeatWindowSize,
            state.window_size() as u64,
        ));
        fragment.token = original.token.clone();
        fragment.address = original.address;
        fragment.proxy = original.proxy;
        fragment.set_payload(block.data().clone());
        fragment
    }

    fn dispatch(&self, token: &str, fragments: Vec<(Message, Hooks)>) {
        for (fragment, hooks) in fragments {
            let block = fragment
                .uint_option(OptionNumber::Block1)
                .or_else(|| fragment.uint_option(OptionNumber::Block2))
                .unwrap_or_default()
                >> 4;
            self.acks.register(
                fragment.id,
                Arc::new(FragmentHandler {
                    layer: self.me.clone(),
                    token: token.to_string(),
                    block,
                }),
            );
            self.pool.enqueue(fragment, hooks);
        }
    }

    /// Drop leftover fragments of a finished transfer from the pool and the registry
    fn release_fragments(&self, ids: HashSet<MessageId>) {
        for id in ids {
            self.acks.unregister(id);
            self.pool.take(id);
        }
    }

    fn did_transmit(&self, number: u32, acked: MessageId, token: &str) {
        tracing::trace!("ARQ: did transmit block {} for token {}", number, token);
        let fragments = {
            let mut states = self.send_states.lock();
            match states.get_mut(token) {
                Some(transfer) => {
                    transfer.in_flight.remove(&acked);
                    transfer.state.did_transmit(number);
                    self.drain_ready(token, transfer)
                }
                None => Vec::new(),
            }
        };
        self.dispatch(token, fragments);
    }

    /// Abort the transfer of `token`, reporting the failure to the original message
    pub fn fail(&self, token: &str) {
        tracing::debug!("ARQ: fail to transfer for token {}", token);
        let transfer = self.send_states.lock().remove(token);
        self.receive_states.lock().remove(&token.to_string());

        let Some(mut transfer) = transfer else {
            return;
        };
        self.release_fragments(std::mem::take(&mut transfer.in_flight));
        self.pool.record_transfer(token, transfer.state.report());
        let original = transfer.state.into_original();
        let reason = FailureReason::TransferFailed;
        self.acks.raise_failure(&original, &reason.to_string());
        if let Some(handler) = &transfer.hooks.response {
            handler.on_error(&Failure::with_delivery(
                reason,
                self.pool.delivery_info(token),
            ));
        }
    }

    fn send_reset(&self, message: &Message, source: &AddressCell) -> Result<(), LayerError> {
        let reset = Message::reset_to(message, source.get());
        self.outbound.send_now(&reset)?;
        Ok(())
    }

    fn on_acknowledged(
        &self,
        message: &mut Message,
        block: &Block,
        token: &str,
    ) -> Result<LayerResult, LayerError> {
        self.acks.unregister(message.id);
        self.pool.remove(message);
        self.did_transmit(block.number(), message.id, token);

        let completed = {
            let mut states = self.send_states.lock();
            if states
                .get(token)
                .map_or(false, |transfer| transfer.state.is_completed())
            {
                states.remove(token)
            } else {
                None
            }
        };
        let Some(mut transfer) = completed else {
            return Ok(LayerResult::stop());
        };

        self.release_fragments(std::mem::take(&mut transfer.in_flight));
        transfer.state.stats_mut().on_completed();
        self.pool.record_transfer(token, transfer.state.report());
        let original = transfer.state.into_original();
        tracing::debug!(
            "ARQ: sending completed for token {}, original message {}",
            token,
            original.id
        );

        let terminal_ack = message.msg_type == MessageType::Acknowledgement
            && matches!(message.code, MessageCode::Empty | MessageCode::Continue);
        if terminal_ack {
            self.pool.enqueue(original.clone(), transfer.hooks);
            self.pool.suppress_sending(&original);
            return Ok(LayerResult::stop());
        }

        // the last acknowledgement carries the answer to the original message
        let mut answer = original;
        answer.msg_type = message.msg_type;
        answer.code = message.code;
        answer.payload = message.payload.take();
        answer.address = message.address;
        Ok(LayerResult::replace(answer))
    }

    fn on_fragment(
        &self,
        message: &mut Message,
        block: Block,
        block_option: OptionNumber,
        window_size: u64,
        mut ack: Message,
        token: &str,
    ) -> Result<LayerResult, LayerError> {
        if message.payload.is_none() {
            tracing::error!("ARQ: payload expected for token {}", token);
            return Err(LayerError::MissingPayload(token.to_string()));
        }

        let completed = {
            let mut states = self.receive_states.lock();
            if states.get(&token.to_string()).is_none() {
                tracing::trace!("ARQ: creating receive state for token {}", token);
                states.insert(token.to_string(), ReceiveState::new(message.clone()));
            }
            match states.get_mut(&token.to_string()) {
                Some(state) => {
                    state.did_receive_block(&block, message.code);
                    if state.is_transfer_completed() {
                        let data = state.data().unwrap_or_default();
                        let report = state.report();
                        states.remove(&token.to_string());
                        Some((data, report))
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        ack.add_option(MessageOption::uint(block_option, block.to_raw() as u64));
        ack.add_option(MessageOption::uint(
            OptionNumber::SelectiveRepeatWindowSize,
            window_size,
        ));
        let original = self.pool.lookup_by_token(token);
        if let Some(original) = &original {
            attach_proxy(&mut ack, original);
        }

        match completed {
            Some((data, report)) => {
                tracing::debug!(
                    "ARQ: receive completed for token {}, {} bytes",
                    token,
                    data.len()
                );
                self.pool.record_transfer(token, report);
                if let Some(original) = &original {
                    message.id = original.id;
                }
                ack.code = MessageCode::Empty;
                self.outbound.send_now(&ack)?;

                message.payload = Some(data);
                message.code = MessageCode::Content;
                message.msg_type = MessageType::Acknowledgement;
                Ok(LayerResult::proceed())
            }
            None => {
                ack.code = MessageCode::Continue;
                self.outbound.send_now(&ack)?;
                message.remove_option(block_option);
                Ok(LayerResult::stop())
            }
        }
    }
}

/// Route an acknowledgement back through the proxy the original message used
fn attach_proxy(ack: &mut Message, original: &Message) {
    if let Some(proxy_uri) = original.option(OptionNumber::ProxyUri) {
        ack.add_option(proxy_uri.clone());
    }
    if let Some(proxy) = original.proxy {
        ack.proxy = Some(proxy);
        if let Some(security_id) = original.proxy_security_id() {
            ack.add_option(MessageOption::uint(OptionNumber::ProxySecurityId, security_id));
        }
    }
}

fn block_of(message: &Message, option: OptionNumber) -> Result<Block, BlockError> {
    let raw = message.uint_option(option).unwrap_or_default();
    let raw = u32::try_from(raw).map_err(|_| BlockError::OutOfRange(raw))?;
    Block::from_raw(raw, message.payload.clone().unwrap_or_default())
}

impl SendLayer for ArqLayer {
    fn name(&self) -> &'static str {
        "arq"
    }

    fn on_send(
        &self,
        message: &mut Message,
        destination: &mut AddressCell,
    ) -> Result<LayerResult, LayerError> {
        if message.has_option(OptionNumber::SelectiveRepeatWindowSize)
            && !self.is_start_mixing_mode(message)
        {
            return Ok(LayerResult::proceed());
        }
        if !self.exceeds_single_block(message) || message.token.is_none() {
            return Ok(LayerResult::proceed());
        }

        let token = message.hex_token();
        let payload = message.payload.clone().unwrap_or_default();
        tracing::trace!("ARQ: removing original message {} from pool", message.id);
        let hooks = self
            .pool
            .take(message.id)
            .map(|queued| queued.hooks)
            .unwrap_or_default();

        let mut starts_reverse_transfer = false;
        let original = match message.msg_type {
            MessageType::Acknowledgement | MessageType::Reset => {
                let mut original = message.clone();
                original.msg_type = MessageType::Confirmable;
                original.remove_option(OptionNumber::Block1);
                message.convert_to_empty_ack(destination.get());
                message.add_option(MessageOption::uint(
                    OptionNumber::SelectiveRepeatWindowSize,
                    self.config.window_size as u64,
                ));
                tracing::debug!("ARQ: sending empty ack {} before block transfer", message);
                starts_reverse_transfer = true;
                original
            }
            MessageType::NonConfirmable => {
                let mut original = message.clone();
                original.msg_type = MessageType::Confirmable;
                original.remove_option(OptionNumber::Block1);
                original
            }
            MessageType::Confirmable => message.clone(),
        };

        let state = SendState::new(
            payload,
            self.config.window_size,
            self.config.max_payload_size,
            original,
        );
        let mut transfer = OutboundTransfer {
            state,
            hooks,
            in_flight: HashSet::new(),
        };
        let fragments = self.drain_ready(&token, &mut transfer);
        tracing::debug!(
            "ARQ: split message {} into blocks, payload {} bytes, {} sent now",
            message.id,
            transfer.state.data_size(),
            fragments.len()
        );
        self.send_states.lock().insert(token.clone(), transfer);
        self.dispatch(&token, fragments);

        Ok(LayerResult::from_flag(starts_reverse_transfer))
    }
}

impl ReceiveLayer for ArqLayer {
    fn name(&self) -> &'static str {
        "arq"
    }

    fn on_receive(
        &self,
        message: &mut Message,
        source: &mut AddressCell,
    ) -> Result<LayerResult, LayerError> {
        let Some(window_size) = message.uint_option(OptionNumber::SelectiveRepeatWindowSize) else {
            return Ok(LayerResult::proceed());
        };

        if message.code == MessageCode::Empty
            && message.msg_type == MessageType::Acknowledgement
            && !message.has_option(OptionNumber::Block1)
            && !message.has_option(OptionNumber::Block2)
        {
            // peer finished our upload and now starts its own block transfer
            self.pool.suppress_sending(message);
            return Ok(LayerResult::stop());
        }

        let block_option = if message.has_option(OptionNumber::Block1) {
            OptionNumber::Block1
        } else if message.has_option(OptionNumber::Block2) {
            OptionNumber::Block2
        } else {
            return Ok(LayerResult::proceed());
        };

        if message.token.is_none() {
            tracing::warn!("ARQ: block message {} without token, resetting", message.id);
            self.send_reset(message, source)?;
            return Ok(LayerResult::stop());
        }

        let token = message.hex_token();
        let block = block_of(message, block_option)?;
        let ack = Message::ack_to(message, source.get(), MessageCode::Empty);

        match message.msg_type {
            MessageType::Acknowledgement | MessageType::Reset => {
                let result = self.on_acknowledged(message, &block, &token)?;
                if !result.proceed {
                    message.remove_option(block_option);
                }
                Ok(result)
            }
            MessageType::Confirmable => {
                self.on_fragment(message, block, block_option, window_size, ack, &token)
            }
            MessageType::NonConfirmable => {
                tracing::error!("ARQ: NON block message received for token {}", token);
                Err(LayerError::NonConfirmableBlock(token))
            }
        }
    }
}

/// Aborts the whole transfer when one fragment cannot be delivered
struct FragmentHandler {
    layer: Weak<ArqLayer>,
    token: String,
    block: u64,
}

impl FragmentHandler {
    fn fail(&self) {
        if let Some(layer) = self.layer.upgrade() {
            layer.fail(&self.token);
        }
    }
}

impl AckHandler for FragmentHandler {
    fn on_message(&self, _message: &Message, error: Option<&str>) {
        match error {
            Some(error) => {
                tracing::debug!("ARQ: block {} failed: {}", self.block, error);
                self.fail();
            }
            None => tracing::trace!("ARQ: block {} delivered", self.block),
        }
    }

    fn on_ack_error(&self, error: &str) {
        tracing::debug!("ARQ: block {} failed: {}", self.block, error);
        self.fail();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ResponseHandler;
    use crate::pool::PoolConfig;
    use bytes::Bytes;
    use coala_io::ManualClock;
    use coala_protocol::{BlockSize, Token};

    #[derive(Default)]
    struct Wire(Mutex<Vec<Message>>);

    impl DirectSend for Wire {
        fn send_now(&self, message: &Message) -> Result<(), DriverError> {
            self.0.lock().push(message.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct Outcome(Mutex<Vec<Result<Message, Failure>>>);

    impl ResponseHandler for Outcome {
        fn on_response(&self, response: &Message) {
            self.0.lock().push(Ok(response.clone()));
        }

        fn on_error(&self, failure: &Failure) {
            self.0.lock().push(Err(failure.clone()));
        }
    }

    struct Side {
        pool: Arc<MessagePool>,
        acks: Arc<AckRegistry>,
        wire: Arc<Wire>,
        arq: Arc<ArqLayer>,
    }

    fn side() -> Side {
        let clock: Arc<ManualClock> = Arc::new(ManualClock::new());
        let acks = Arc::new(AckRegistry::new(clock.clone()));
        let pool = Arc::new(MessagePool::new(PoolConfig::default(), acks.clone(), clock.clone()));
        let wire = Arc::new(Wire::default());
        let arq = ArqLayer::new(ArqConfig::default(), pool.clone(), acks.clone(), wire.clone(), clock);
        Side {
            pool,
            acks,
            wire,
            arq,
        }
    }

    fn upload(size: usize) -> Message {
        let mut message = Message::request(MessageCode::Post, "127.0.0.1:5683".parse().unwrap());
        message.token = Some(Token::new(vec![9, 8, 7, 6, 5, 4, 3, 2]));
        message.set_payload(Bytes::from((0..size).map(|i| i as u8).collect::<Vec<u8>>()));
        message
    }

    fn queued_fragments(side: &Side) -> Vec<Message> {
        let mut fragments = Vec::new();
        while let Some(message) = side.pool.next() {
            fragments.push(message);
        }
        fragments
    }

    #[test]
    fn test_small_payload_passes() {
        let side = side();
        let mut message = upload(1024);
        let result = side.arq.on_send(&mut message, &mut AddressCell::default()).unwrap();
        assert!(result.proceed);
        assert_eq!(side.arq.active_sends(), 0);
    }

    #[test]
    fn test_fragments_replace_original() {
        let side = side();
        let mut message = upload(1500);
        side.pool.enqueue(message.clone(), Hooks::default());

        let result = side.arq.on_send(&mut message, &mut AddressCell::default()).unwrap();
        assert!(!result.proceed);
        assert!(!side.pool.contains(message.id));

        let fragments = queued_fragments(&side);
        assert_eq!(fragments.len(), 2);
        let first = block_of(&fragments[0], OptionNumber::Block1).unwrap();
        let second = block_of(&fragments[1], OptionNumber::Block1).unwrap();
        assert_eq!((first.number(), first.is_more_coming(), first.size()), (0, true, BlockSize::S1024));
        assert_eq!((second.number(), second.is_more_coming(), second.size()), (1, false, BlockSize::S256));
        assert_eq!(
            fragments[0].uint_option(OptionNumber::SelectiveRepeatWindowSize),
            Some(2)
        );
        assert!(side.acks.get(fragments[0].id).is_some());
    }

    #[test]
    fn test_acknowledged_fragments_release_handlers() {
        let side = side();
        let mut message = upload(1500);
        side.pool.enqueue(message.clone(), Hooks::default());
        side.arq.on_send(&mut message, &mut AddressCell::default()).unwrap();
        let fragments = queued_fragments(&side);
        assert_eq!(side.acks.len(), 2);

        for (fragment, code) in fragments.iter().zip([MessageCode::Continue, MessageCode::Empty]) {
            let mut ack = Message::ack_to(fragment, None, code);
            let raw = fragment.uint_option(OptionNumber::Block1).unwrap();
            ack.add_option(MessageOption::uint(OptionNumber::Block1, raw));
            ack.add_option(MessageOption::uint(OptionNumber::SelectiveRepeatWindowSize, 2));
            let result = side.arq.on_receive(&mut ack, &mut AddressCell::default()).unwrap();
            assert!(!result.proceed);
            assert!(side.acks.get(fragment.id).is_none());
        }

        assert!(side.acks.is_empty());
        assert_eq!(side.arq.active_sends(), 0);
        // only the suppressed original waits for the separate response
        assert_eq!(side.pool.len(), 1);
        assert!(side.pool.contains(message.id));
    }

    #[test]
    fn test_non_block_message_rejected() {
        let side = side();
        let mut message = Message::new(MessageType::NonConfirmable, MessageCode::Content);
        message.token = Some(Token::new(vec![1]));
        message.add_option(MessageOption::uint(OptionNumber::Block2, 0));
        message.add_option(MessageOption::uint(OptionNumber::SelectiveRepeatWindowSize, 1));
        message.set_payload(&b"x"[..]);

        let result = side.arq.on_receive(&mut message, &mut AddressCell::default());
        assert!(matches!(result, Err(LayerError::NonConfirmableBlock(_))));
    }

    #[test]
    fn test_missing_payload_rejected() {
        let side = side();
        let mut message = Message::new(MessageType::Confirmable, MessageCode::Post);
        message.token = Some(Token::new(vec![1]));
        message.add_option(MessageOption::uint(OptionNumber::Block1, 0));
        message.add_option(MessageOption::uint(OptionNumber::SelectiveRepeatWindowSize, 1));

        let result = side.arq.on_receive(&mut message, &mut AddressCell::default());
        assert!(matches!(result, Err(LayerError::MissingPayload(_))));
    }

    #[test]
    fn test_fragment_failure_aborts_transfer() {
        let side = side();
        let outcome = Arc::new(Outcome::default());
        let mut message = upload(3000);
        side.pool.enqueue(
            message.clone(),
            Hooks::default().with_response(outcome.clone()),
        );
        side.arq.on_send(&mut message, &mut AddressCell::default()).unwrap();
        let fragments = queued_fragments(&side);

        side.acks.raise_failure(&fragments[1], "message deleted by garbage");

        assert_eq!(side.arq.active_sends(), 0);
        assert!(side.acks.is_empty());
        assert!(side.pool.is_empty());
        let outcomes = outcome.0.lock();
        assert_eq!(outcomes.len(), 1);
        let failure = outcomes[0].as_ref().unwrap_err();
        assert_eq!(failure.reason, FailureReason::TransferFailed);
        assert_eq!(
            failure.delivery.as_ref().and_then(|info| info.transfer.as_ref()).map(|report| report.messages),
            Some(3)
        );
    }

    #[test]
    fn test_turn_around_ack_suppresses_original() {
        let side = side();
        let request = upload(10);
        side.pool.enqueue(request.clone(), Hooks::default());

        let mut ack = Message::ack_to(&request, None, MessageCode::Empty);
        ack.add_option(MessageOption::uint(OptionNumber::SelectiveRepeatWindowSize, 70));
        let result = side.arq.on_receive(&mut ack, &mut AddressCell::default()).unwrap();

        assert!(!result.proceed);
        assert!(side.pool.next().is_none());
        assert!(side.pool.contains(request.id));
    }

    #[test]
    fn test_mixed_mode_converts_to_empty_ack() {
        let side = side();
        let request = upload(10);
        let mut response = Message::ack_to(&request, request.address, MessageCode::Content);
        response.add_option(MessageOption::uint(OptionNumber::Block1, 0x16));
        response.add_option(MessageOption::uint(OptionNumber::SelectiveRepeatWindowSize, 70));
        response.set_payload(Bytes::from(vec![1u8; 2048]));

        let mut destination = AddressCell::new(request.address);
        let result = side.arq.on_send(&mut response, &mut destination).unwrap();

        assert!(result.proceed);
        assert_eq!(response.code, MessageCode::Empty);
        assert!(response.payload.is_none());
        assert_eq!(
            response.uint_option(OptionNumber::SelectiveRepeatWindowSize),
            Some(WINDOW_SIZE as u64)
        );

        let fragments = queued_fragments(&side);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].msg_type, MessageType::Confirmable);
        assert!(fragments[0].has_option(OptionNumber::Block2));
        assert!(!fragments[0].has_option(OptionNumber::Block1));
        assert!(side.wire.0.lock().is_empty());
    }
}

//! Block-wise transfer state
//!
//! [`SendState`] slices an outbound payload into blocks and gates them
//! through a sliding window; [`ReceiveState`] accumulates inbound blocks in
//! any order until every block up to the last one has arrived. Both keep
//! [`TransferStats`] for delivery telemetry.

use crate::block::Block;
use crate::message::{Message, MessageCode};
use crate::window::SlidingWindow;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-transfer counters
#[derive(Debug, Clone)]
pub struct TransferStats {
    started: Instant,
    elapsed: Option<Duration>,
    messages: u32,
    resends: Arc<AtomicU32>,
    incoming: bool,
}

impl TransferStats {
    pub fn new(incoming: bool) -> Self {
        TransferStats {
            started: Instant::now(),
            elapsed: None,
            messages: 0,
            resends: Arc::new(AtomicU32::new(0)),
            incoming,
        }
    }

    /// Shared resend counter, bumped from resend hooks without locking the transfer
    pub fn resend_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.resends)
    }

    pub fn on_resend(&self) {
        self.resends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_message(&mut self) {
        self.messages += 1;
    }

    /// Freeze the elapsed time; later calls keep the first value
    pub fn on_completed(&mut self) {
        if self.elapsed.is_none() {
            self.elapsed = Some(self.started.elapsed());
        }
    }

    pub fn messages(&self) -> u32 {
        self.messages
    }

    pub fn resends(&self) -> u32 {
        self.resends.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    /// Snapshot for a transfer of `data_size` bytes
    pub fn report(&self, data_size: usize) -> TransferReport {
        let resends = self.resends();
        let speed = self.elapsed.map(|elapsed| {
            let secs = elapsed.as_secs_f64();
            if secs > 0.0 {
                (data_size as f64 / secs) as u64
            } else {
                data_size as u64
            }
        });
        let loss_percent = if self.messages == 0 {
            None
        } else {
            Some(resends as f64 * 100.0 / (resends + self.messages) as f64)
        };
        TransferReport {
            data_size,
            elapsed: self.elapsed,
            speed,
            loss_percent,
            messages: self.messages,
            resends,
            incoming: self.incoming,
        }
    }
}

/// Telemetry of one block-wise transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReport {
    pub data_size: usize,
    pub elapsed: Option<Duration>,
    /// Bytes per second, known once the transfer completed
    pub speed: Option<u64>,
    pub loss_percent: Option<f64>,
    pub messages: u32,
    pub resends: u32,
    pub incoming: bool,
}

/// Outbound block-wise transfer
#[derive(Debug)]
pub struct SendState {
    data: Bytes,
    block_size: usize,
    window: SlidingWindow<bool>,
    original: Message,
    stats: TransferStats,
}

impl SendState {
    /// Slice `data` into `block_size` blocks behind a window of at most `window_size`
    ///
    /// The window starts one full window before block 0 with every slot
    /// confirmed, so the first window-worth of blocks can be popped at once.
    pub fn new(data: Bytes, window_size: usize, block_size: usize, original: Message) -> Self {
        let total_blocks = (data.len() + block_size - 1) / block_size;
        let size = window_size.min(total_blocks);
        let mut window = SlidingWindow::new(size, -(size as i64));
        for number in -(size as i64)..0 {
            window.set(number, true);
        }
        SendState {
            data,
            block_size,
            window,
            original,
            stats: TransferStats::new(false),
        }
    }

    /// Next block the window allows, if any data remains
    pub fn pop_block(&mut self) -> Option<Block> {
        self.window.advance()?;
        let number = self.window.tail();
        let start = (number as usize).checked_mul(self.block_size)?;
        if start >= self.data.len() {
            return None;
        }
        let end = (start + self.block_size).min(self.data.len());
        Some(Block::new(
            number as u32,
            self.data.slice(start..end),
            end != self.data.len(),
        ))
    }

    /// Record the acknowledgement of block `number`
    pub fn did_transmit(&mut self, number: u32) {
        self.window.set(number as i64, true);
    }

    /// All bytes covered by contiguously confirmed blocks
    pub fn is_completed(&self) -> bool {
        let confirmed = self.window.offset() + self.window.leading_filled() as i64;
        confirmed.max(0) as usize * self.block_size >= self.data.len()
    }

    pub fn window_size(&self) -> usize {
        self.window.size()
    }

    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    pub fn original(&self) -> &Message {
        &self.original
    }

    pub fn into_original(self) -> Message {
        self.original
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut TransferStats {
        &mut self.stats
    }

    pub fn report(&self) -> TransferReport {
        self.stats.report(self.data.len())
    }
}

/// Inbound block-wise transfer
#[derive(Debug)]
pub struct ReceiveState {
    accumulator: HashMap<u32, Bytes>,
    last_block: Option<u32>,
    received: u32,
    duplicates: u32,
    initiating: Message,
    stats: TransferStats,
}

impl ReceiveState {
    pub fn new(initiating: Message) -> Self {
        ReceiveState {
            accumulator: HashMap::new(),
            last_block: None,
            received: 0,
            duplicates: 0,
            initiating,
            stats: TransferStats::new(true),
        }
    }

    /// Feed one block carried by a message with `code`
    pub fn did_receive_block(&mut self, block: &Block, code: MessageCode) {
        if code != MessageCode::Continue {
            self.initiating.code = code;
        }
        if self.accumulator.contains_key(&block.number()) {
            tracing::trace!("Already received block {}", block.number());
            self.duplicates += 1;
            self.stats.on_resend();
            return;
        }
        self.received += 1;
        self.stats.on_message();
        self.accumulator.insert(block.number(), block.data().clone());
        if !block.is_more_coming() {
            self.last_block = Some(block.number());
            tracing::trace!("Received last block {}", block.number());
        }
        if self.is_transfer_completed() {
            self.stats.on_completed();
        }
    }

    /// Every block from 0 through the last one has arrived
    pub fn is_transfer_completed(&self) -> bool {
        self.last_block
            .map_or(false, |last| self.received as u64 > last as u64)
    }

    /// Reassembled payload, available once the last block is known
    pub fn data(&self) -> Option<Bytes> {
        let last = self.last_block?;
        let mut data = BytesMut::with_capacity(self.data_size());
        for number in 0..=last {
            match self.accumulator.get(&number) {
                Some(bytes) => data.extend_from_slice(bytes),
                None => tracing::trace!("Block {} missing from accumulator", number),
            }
        }
        Some(data.freeze())
    }

    pub fn data_size(&self) -> usize {
        self.accumulator.values().map(Bytes::len).sum()
    }

    pub fn duplicates(&self) -> u32 {
        self.duplicates
    }

    pub fn initiating_message(&self) -> &Message {
        &self.initiating
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn report(&self) -> TransferReport {
        self.stats.report(self.data_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockSize;
    use crate::message::MessageType;

    fn original() -> Message {
        Message::with_id(1, MessageType::Confirmable, MessageCode::Post)
    }

    fn payload(size: usize) -> Bytes {
        Bytes::from((0..size).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    fn send_all(size: usize, block_size: usize, window_size: usize) {
        let data = payload(size);
        let mut state = SendState::new(data.clone(), window_size, block_size, original());
        let blocks_count = (size + block_size - 1) / block_size;
        let mut collected = BytesMut::new();

        for number in 0..blocks_count {
            let block = match state.pop_block() {
                Some(block) => block,
                None => {
                    // window exhausted, confirm everything sent so far
                    for confirmed in 0..number {
                        state.did_transmit(confirmed as u32);
                    }
                    state.pop_block().unwrap()
                }
            };
            assert_eq!(block.number() as usize, number);
            assert_eq!(block.is_more_coming(), number + 1 < blocks_count);
            collected.extend_from_slice(block.data());
        }
        assert!(state.pop_block().is_none() || blocks_count == 0);

        for number in 0..blocks_count {
            state.did_transmit(number as u32);
        }
        assert!(state.is_completed());
        assert_eq!(collected.freeze(), data);
    }

    #[test]
    fn test_send_state_sizes() {
        for size in [0, 1, 1025, 2046, 4096] {
            send_all(size, 512, 70);
        }
        send_all(10 * 1024 * 1024, 1024, 70);
    }

    #[test]
    fn test_send_state_window_gates_blocks() {
        let mut state = SendState::new(payload(10 * 512), 4, 512, original());
        assert_eq!(state.window_size(), 4);
        for number in 0..4 {
            assert_eq!(state.pop_block().unwrap().number(), number);
        }
        assert!(state.pop_block().is_none());
        assert!(!state.is_completed());

        state.did_transmit(1);
        assert!(state.pop_block().is_none());

        state.did_transmit(0);
        assert_eq!(state.pop_block().unwrap().number(), 4);
        assert_eq!(state.pop_block().unwrap().number(), 5);
        assert!(state.pop_block().is_none());
    }

    #[test]
    fn test_send_state_window_capped_by_blocks() {
        let state = SendState::new(payload(1500), 70, 1024, original());
        assert_eq!(state.window_size(), 2);
    }

    #[test]
    fn test_send_state_last_block_size() {
        let mut state = SendState::new(payload(1500), 70, 1024, original());
        let first = state.pop_block().unwrap();
        let second = state.pop_block().unwrap();
        assert_eq!(first.size(), BlockSize::S1024);
        assert!(first.is_more_coming());
        assert_eq!(second.data().len(), 476);
        assert_eq!(second.size(), BlockSize::S256);
        assert!(!second.is_more_coming());
    }

    #[test]
    fn test_receive_state_out_of_order() {
        let mut state = ReceiveState::new(original());
        let blocks = [
            Block::new(1, Bytes::from_static(b"bb"), true),
            Block::new(2, Bytes::from_static(b"cc"), true),
            Block::new(3, Bytes::from_static(b"dd"), true),
            Block::new(0, Bytes::from_static(b"aa"), true),
        ];
        for block in &blocks {
            state.did_receive_block(block, MessageCode::Continue);
            assert!(!state.is_transfer_completed());
        }
        assert!(state.data().is_none());

        state.did_receive_block(&Block::new(4, Bytes::from_static(b"e"), false), MessageCode::Content);
        assert!(state.is_transfer_completed());
        assert_eq!(state.data().unwrap(), Bytes::from_static(b"aabbccdde"));
        assert_eq!(state.initiating_message().code, MessageCode::Content);
        assert!(state.stats().elapsed().is_some());
    }

    #[test]
    fn test_receive_state_duplicate() {
        let mut state = ReceiveState::new(original());
        let first = Block::new(0, Bytes::from_static(b"ab"), true);
        state.did_receive_block(&first, MessageCode::Continue);
        state.did_receive_block(&first, MessageCode::Continue);
        state.did_receive_block(&Block::new(1, Bytes::from_static(b"c"), false), MessageCode::Continue);

        assert!(state.is_transfer_completed());
        assert_eq!(state.duplicates(), 1);
        assert_eq!(state.stats().resends(), 1);
        assert_eq!(state.data().unwrap(), Bytes::from_static(b"abc"));
        // Continue never overrides the initiating code
        assert_eq!(state.initiating_message().code, MessageCode::Post);
    }

    #[test]
    fn test_transfer_report() {
        let mut stats = TransferStats::new(false);
        assert_eq!(stats.report(10).loss_percent, None);
        stats.on_message();
        stats.on_message();
        stats.on_message();
        stats.resend_counter().fetch_add(1, Ordering::Relaxed);
        stats.on_completed();

        let report = stats.report(3000);
        assert_eq!(report.resends, 1);
        assert_eq!(report.loss_percent, Some(25.0));
        assert!(report.speed.is_some());
        assert!(!report.incoming);
    }
}

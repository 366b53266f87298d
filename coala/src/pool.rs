//! Outbound message pool
//!
//! Every outbound message waits here until it is acknowledged, answered or
//! given up on. [`MessagePool::next`] is the retry state machine: it expires
//! old entries, garbage-collects messages sent but never acknowledged, gives
//! up after too many attempts, and otherwise hands out the first message
//! that is due for (re)transmission.
//!
//! The pool lock is held for each whole operation. Resend hooks and failure
//! callbacks run after it is released, so they may call back into the pool.

use crate::ack::AckRegistry;
use crate::cache::ExpiringCache;
use crate::error::{Failure, FailureReason};
use crate::handler::Hooks;
use coala_io::{Clock, Timestamp};
use coala_protocol::{Message, MessageId, MessageType, TransferReport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Sends allowed before a message is given up
pub const MAX_ATTEMPTS: u32 = 6;

/// Wait for an ACK before resending
pub const RESEND_PERIOD: Duration = Duration::from_millis(750);

/// Resend wait for requests flagged as long-response
pub const RESEND_LONG_PERIOD: Duration = Duration::from_secs(30);

/// Lifetime of a pool entry, counted from enqueue
pub const EXPIRATION_PERIOD: Duration = Duration::from_secs(60);

/// Lifetime of a sent but unacknowledged message, counted from its last send
pub const GARBAGE_PERIOD: Duration = Duration::from_secs(25);

/// Garbage period multiplier for long-response requests
pub const LONG_GARBAGE_FACTOR: u32 = 5;

/// Default pool capacity
pub const POOL_CAPACITY: usize = 500;

/// How long per-token delivery telemetry is kept
pub const DELIVERY_INFO_TTL: Duration = Duration::from_secs(20 * 60);

/// Pool timing and capacity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_attempts: u32,
    pub resend_period: Duration,
    pub resend_long_period: Duration,
    pub expiration_period: Duration,
    pub garbage_period: Duration,
    pub capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_attempts: MAX_ATTEMPTS,
            resend_period: RESEND_PERIOD,
            resend_long_period: RESEND_LONG_PERIOD,
            expiration_period: EXPIRATION_PERIOD,
            garbage_period: GARBAGE_PERIOD,
            capacity: POOL_CAPACITY,
        }
    }
}

/// Per-token delivery telemetry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryInfo {
    /// Picks after the first one
    pub retransmits: u32,
    pub via_proxy_attempts: u32,
    pub direct_attempts: u32,
    /// Block-wise transfer statistics, if the exchange was fragmented
    pub transfer: Option<TransferReport>,
}

impl DeliveryInfo {
    /// Share of sends that were retransmissions
    pub fn retransmit_percent(&self) -> f64 {
        let attempts = self.via_proxy_attempts + self.direct_attempts;
        if attempts == 0 {
            0.0
        } else {
            self.retransmits as f64 * 100.0 / attempts as f64
        }
    }
}

/// Queued message with its scheduling state
#[derive(Debug)]
struct QueueEntry {
    message: Message,
    hooks: Hooks,
    send_attempts: u32,
    send_time: Option<Timestamp>,
    create_time: Timestamp,
    /// In flight, waiting for an ACK
    sent: bool,
    needs_send: bool,
}

/// Message taken out of the pool with its hooks
#[derive(Debug)]
pub struct Queued {
    pub message: Message,
    pub hooks: Hooks,
}

struct PoolInner {
    entries: ExpiringCache<MessageId, QueueEntry>,
    ids_by_token: HashMap<String, MessageId>,
    delivery: ExpiringCache<String, DeliveryInfo>,
}

impl PoolInner {
    fn take(&mut self, id: MessageId) -> Option<QueueEntry> {
        let entry = self.entries.remove(&id)?;
        let token = entry.message.hex_token();
        if self.ids_by_token.get(&token) == Some(&id) {
            self.ids_by_token.remove(&token);
        }
        Some(entry)
    }
}

/// Work collected under the lock, run after it is released
#[derive(Default)]
struct Deferred {
    resends: Vec<Hooks>,
    failures: Vec<(QueueEntry, FailureReason)>,
}

/// Central outbound queue
pub struct MessagePool {
    inner: Mutex<PoolInner>,
    acks: Arc<AckRegistry>,
    clock: Arc<dyn Clock>,
    config: PoolConfig,
}

impl MessagePool {
    pub fn new(config: PoolConfig, acks: Arc<AckRegistry>, clock: Arc<dyn Clock>) -> Self {
        MessagePool {
            inner: Mutex::new(PoolInner {
                entries: ExpiringCache::with_capacity(config.capacity, Arc::clone(&clock)),
                ids_by_token: HashMap::new(),
                delivery: ExpiringCache::with_idle(DELIVERY_INFO_TTL, Arc::clone(&clock)),
            }),
            acks,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Queue `message` for sending
    pub fn enqueue(&self, message: Message, hooks: Hooks) {
        let id = message.id;
        let token = message.hex_token();
        tracing::trace!("Add message {} with token {} to pool", id, token);

        let entry = QueueEntry {
            message,
            hooks,
            send_attempts: 0,
            send_time: None,
            create_time: self.clock.now(),
            sent: false,
            needs_send: true,
        };

        let evicted = {
            let mut inner = self.inner.lock();
            let evicted = inner.entries.insert(id, entry).map(|(evicted_id, evicted)| {
                let evicted_token = evicted.message.hex_token();
                if inner.ids_by_token.get(&evicted_token) == Some(&evicted_id) {
                    inner.ids_by_token.remove(&evicted_token);
                }
                evicted
            });
            inner.ids_by_token.entry(token).or_insert(id);
            evicted
        };

        if let Some(entry) = evicted {
            tracing::warn!("Pool full, evicted message {}", entry.message.id);
            self.deliver(Deferred {
                resends: Vec::new(),
                failures: vec![(entry, FailureReason::Evicted)],
            });
        }
    }

    /// Next message due for transmission
    ///
    /// Rules per entry, in order: expiry since creation, garbage collection
    /// since the last send, attempt limit, then hand out a copy or schedule a
    /// resend once the resend period has passed. Entries that no longer need
    /// sending are only subject to the first rule.
    pub fn next(&self) -> Option<Message> {
        let mut deferred = Deferred::default();
        let picked = self.scan(&mut deferred);
        self.deliver(deferred);
        picked
    }

    fn scan(&self, deferred: &mut Deferred) -> Option<Message> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        for id in inner.entries.keys() {
            let Some(entry) = inner.entries.peek_mut(&id) else {
                continue;
            };

            if now - entry.create_time >= self.config.expiration_period {
                tracing::debug!("Message {} expired", id);
                if let Some(entry) = inner.take(id) {
                    deferred.failures.push((entry, FailureReason::Expired));
                }
                continue;
            }

            let garbage_period = if entry.message.long_response {
                self.config.garbage_period * LONG_GARBAGE_FACTOR
            } else {
                self.config.garbage_period
            };
            if entry.needs_send
                && entry
                    .send_time
                    .map_or(false, |sent_at| now - sent_at >= garbage_period)
            {
                tracing::debug!("Message {} deleted by garbage", id);
                if let Some(entry) = inner.take(id) {
                    deferred.failures.push((entry, FailureReason::Garbage));
                }
                continue;
            }

            if !entry.needs_send {
                continue;
            }

            if !entry.sent {
                if entry.send_attempts >= self.config.max_attempts {
                    tracing::debug!("Message {} removed after too many attempts", id);
                    if let Some(entry) = inner.take(id) {
                        deferred.failures.push((entry, FailureReason::TooManyAttempts));
                    }
                    continue;
                }

                let retransmit = entry.send_attempts > 0;
                let via_proxy = entry.message.proxy.is_some();
                entry.sent = true;
                entry.send_time = Some(now);
                entry.send_attempts += 1;
                let message = entry.message.clone();

                let token = message.hex_token();
                let mut info = inner.delivery.get(&token).cloned().unwrap_or_default();
                if via_proxy {
                    info.via_proxy_attempts += 1;
                } else {
                    info.direct_attempts += 1;
                }
                if retransmit {
                    info.retransmits += 1;
                }
                inner.delivery.insert(token, info);

                return Some(message);
            }

            let resend_period = if entry.message.long_response {
                self.config.resend_long_period
            } else {
                self.config.resend_period
            };
            if entry
                .send_time
                .map_or(false, |sent_at| now - sent_at >= resend_period)
            {
                deferred.resends.push(entry.hooks.clone());
                entry.sent = false;
            }
        }

        None
    }

    fn deliver(&self, deferred: Deferred) {
        for hooks in deferred.resends {
            hooks.fire_resend();
        }
        for (entry, reason) in deferred.failures {
            self.acks.raise_failure(&entry.message, &reason.to_string());
            if let Some(handler) = &entry.hooks.response {
                let delivery = self.delivery_info(&entry.message.hex_token());
                handler.on_error(&Failure::with_delivery(reason, delivery));
            }
        }
    }

    /// Restart the exchange of an existing entry from scratch
    pub fn requeue(&self, id: MessageId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.send_attempts = 0;
            entry.sent = false;
            entry.needs_send = true;
        }
    }

    /// Remove by id, returning the message and its hooks
    pub fn take(&self, id: MessageId) -> Option<Queued> {
        let entry = self.inner.lock().take(id)?;
        tracing::trace!("Remove message {} from pool", id);
        Some(Queued {
            message: entry.message,
            hooks: entry.hooks,
        })
    }

    /// Remove `message`; returns whether it was queued
    pub fn remove(&self, message: &Message) -> bool {
        self.take(message.id).is_some()
    }

    /// Remove the message mapped to `token`
    pub fn remove_by_token(&self, token: &str) -> Option<Queued> {
        let id = *self.inner.lock().ids_by_token.get(token)?;
        self.take(id)
    }

    /// Copy of the message mapped to `token`
    pub fn lookup_by_token(&self, token: &str) -> Option<Message> {
        let inner = self.inner.lock();
        let id = inner.ids_by_token.get(token)?;
        inner.entries.peek(id).map(|entry| entry.message.clone())
    }

    /// Copy of the message with `id`
    pub fn get(&self, id: MessageId) -> Option<Message> {
        self.inner
            .lock()
            .entries
            .get(&id)
            .map(|entry| entry.message.clone())
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    /// Stop handing out the entry of `message`, found by token first, then id
    pub fn suppress_sending(&self, message: &Message) {
        let mut inner = self.inner.lock();
        let id = inner
            .ids_by_token
            .get(&message.hex_token())
            .copied()
            .unwrap_or(message.id);
        if let Some(entry) = inner.entries.peek_mut(&id) {
            tracing::trace!("Message {} no longer needs sending", id);
            entry.needs_send = false;
        }
    }

    /// Empty the pool, failing every response handler with `reason`
    pub fn drain_all(&self, reason: &str) {
        let drained = {
            let mut inner = self.inner.lock();
            inner.ids_by_token.clear();
            inner.entries.drain()
        };
        for (_, entry) in drained {
            if let Some(handler) = &entry.hooks.response {
                handler.on_error(&Failure::new(FailureReason::Stopped(reason.to_string())));
            }
        }
    }

    pub fn delivery_info(&self, token: &str) -> Option<DeliveryInfo> {
        self.inner.lock().delivery.get(&token.to_string()).cloned()
    }

    /// Attach a transfer report to the telemetry of `token`
    pub fn record_transfer(&self, token: &str, report: TransferReport) {
        let mut inner = self.inner.lock();
        let mut info = inner
            .delivery
            .get(&token.to_string())
            .cloned()
            .unwrap_or_default();
        info.transfer = Some(report);
        inner.delivery.insert(token.to_string(), info);
    }

    /// Drop delivery telemetry nobody has read within the retention period
    pub fn purge_idle(&self) -> usize {
        let purged = self.inner.lock().delivery.purge_expired();
        if !purged.is_empty() {
            tracing::debug!("Purged delivery info of {} tokens", purged.len());
        }
        purged.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Confirmable entries stay until acknowledged; everything else is done once sent
    pub fn release_if_unconfirmed(&self, message: &Message) {
        if message.msg_type != MessageType::Confirmable {
            self.remove(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{AckHandler, ResponseHandler};
    use coala_io::ManualClock;
    use coala_protocol::{MessageCode, Token};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixture {
        clock: Arc<ManualClock>,
        acks: Arc<AckRegistry>,
        pool: MessagePool,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let acks = Arc::new(AckRegistry::new(clock.clone()));
        let pool = MessagePool::new(PoolConfig::default(), acks.clone(), clock.clone());
        Fixture { clock, acks, pool }
    }

    fn request(id: MessageId) -> Message {
        let mut message = Message::with_id(id, MessageType::Confirmable, MessageCode::Get);
        message.token = Some(Token::new(id.to_be_bytes().to_vec()));
        message.address = Some("127.0.0.1:5683".parse().unwrap());
        message
    }

    #[derive(Default)]
    struct Errors(Mutex<Vec<String>>);

    impl AckHandler for Errors {
        fn on_message(&self, _message: &Message, _error: Option<&str>) {}

        fn on_ack_error(&self, error: &str) {
            self.0.lock().push(error.to_string());
        }
    }

    impl ResponseHandler for Errors {
        fn on_response(&self, _response: &Message) {}

        fn on_error(&self, failure: &Failure) {
            self.0.lock().push(failure.reason.to_string());
        }
    }

    #[test]
    fn test_next_returns_copy_and_marks_sent() {
        let f = fixture();
        f.pool.enqueue(request(1), Hooks::default());

        let mut copy = f.pool.next().unwrap();
        copy.payload = Some(bytes::Bytes::from_static(b"changed"));
        assert!(f.pool.get(1).unwrap().payload.is_none());

        // in flight until the resend period passes
        assert!(f.pool.next().is_none());
        f.clock.advance(RESEND_PERIOD);
        assert!(f.pool.next().is_none());
        assert_eq!(f.pool.next().unwrap().id, 1);
    }

    #[test]
    fn test_resend_hook_fires() {
        let f = fixture();
        let resends = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&resends);
        let hooks = Hooks::default().with_resend(Arc::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        }));
        f.pool.enqueue(request(1), hooks);

        f.pool.next();
        f.clock.advance(RESEND_PERIOD);
        f.pool.next();
        assert_eq!(resends.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_too_many_attempts() {
        let f = fixture();
        let errors = Arc::new(Errors::default());
        f.acks.register(1, errors.clone());
        f.pool.enqueue(request(1), Hooks::default());

        let mut sends = 0;
        for _ in 0..20 {
            if f.pool.next().is_some() {
                sends += 1;
            }
            f.clock.advance(RESEND_PERIOD);
        }

        assert_eq!(sends, MAX_ATTEMPTS);
        assert!(!f.pool.contains(1));
        assert_eq!(
            *errors.0.lock(),
            vec!["Request Canceled, too many attempts for id: 1"]
        );
    }

    #[test]
    fn test_garbage_before_attempts_exhausted() {
        let f = fixture();
        let errors = Arc::new(Errors::default());
        f.pool.enqueue(request(1), Hooks::default().with_response(errors.clone()));

        assert!(f.pool.next().is_some());
        f.clock.advance(GARBAGE_PERIOD);
        assert!(f.pool.next().is_none());

        assert!(!f.pool.contains(1));
        assert_eq!(*errors.0.lock(), vec!["message deleted by garbage"]);
    }

    #[test]
    fn test_expiry_applies_to_suppressed_entries() {
        let f = fixture();
        let errors = Arc::new(Errors::default());
        let message = request(1);
        f.acks.register(1, errors.clone());
        f.pool.enqueue(message.clone(), Hooks::default());
        f.pool.suppress_sending(&message);

        assert!(f.pool.next().is_none());
        f.clock.advance(GARBAGE_PERIOD);
        assert!(f.pool.next().is_none());
        assert!(f.pool.contains(1));

        f.clock.advance(EXPIRATION_PERIOD);
        assert!(f.pool.next().is_none());
        assert!(!f.pool.contains(1));
        assert_eq!(*errors.0.lock(), vec!["message expired for id: 1"]);
    }

    #[test]
    fn test_requeue_resets_attempts() {
        let f = fixture();
        let message = request(1);
        f.pool.enqueue(message.clone(), Hooks::default());
        f.pool.suppress_sending(&message);
        assert!(f.pool.next().is_none());

        f.pool.requeue(1);
        assert!(f.pool.next().is_some());
    }

    #[test]
    fn test_token_index_first_writer_wins() {
        let f = fixture();
        let first = request(1);
        let mut second = request(2);
        second.token = first.token.clone();
        f.pool.enqueue(first.clone(), Hooks::default());
        f.pool.enqueue(second, Hooks::default());

        let token = first.hex_token();
        assert_eq!(f.pool.lookup_by_token(&token).unwrap().id, 1);
        assert_eq!(f.pool.remove_by_token(&token).unwrap().message.id, 1);
        assert!(f.pool.lookup_by_token(&token).is_none());
        assert!(f.pool.contains(2));
    }

    #[test]
    fn test_eviction_raises_failure() {
        let clock = Arc::new(ManualClock::new());
        let acks = Arc::new(AckRegistry::new(clock.clone()));
        let config = PoolConfig {
            capacity: 2,
            ..PoolConfig::default()
        };
        let pool = MessagePool::new(config, acks.clone(), clock);
        let errors = Arc::new(Errors::default());
        acks.register(1, errors.clone());

        pool.enqueue(request(1), Hooks::default());
        pool.enqueue(request(2), Hooks::default());
        pool.enqueue(request(3), Hooks::default());

        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(1));
        assert_eq!(
            *errors.0.lock(),
            vec!["message evicted from pool for id: 1"]
        );
    }

    #[test]
    fn test_drain_all() {
        let f = fixture();
        let errors = Arc::new(Errors::default());
        f.pool.enqueue(request(1), Hooks::default().with_response(errors.clone()));
        f.pool.enqueue(request(2), Hooks::default());

        f.pool.drain_all("Coala stopped");
        assert!(f.pool.is_empty());
        assert_eq!(*errors.0.lock(), vec!["Coala stopped"]);
    }

    #[test]
    fn test_delivery_info() {
        let f = fixture();
        let mut message = request(1);
        message.proxy = Some("10.0.0.1:5683".parse().unwrap());
        let token = message.hex_token();
        f.pool.enqueue(message, Hooks::default());

        f.pool.next();
        f.clock.advance(RESEND_PERIOD);
        f.pool.next();
        f.pool.next();

        let info = f.pool.delivery_info(&token).unwrap();
        assert_eq!(info.via_proxy_attempts, 2);
        assert_eq!(info.direct_attempts, 0);
        assert_eq!(info.retransmits, 1);
        assert_eq!(info.retransmit_percent(), 50.0);
    }

    #[test]
    fn test_purge_idle_delivery_info() {
        let f = fixture();
        let (first, second) = (request(1), request(2));
        f.pool.enqueue(first.clone(), Hooks::default());
        f.pool.enqueue(second.clone(), Hooks::default());
        f.pool.next();
        f.pool.next();
        f.pool.remove(&first);
        f.pool.remove(&second);

        f.clock.advance(Duration::from_secs(10 * 60));
        assert!(f.pool.delivery_info(&second.hex_token()).is_some());
        f.clock.advance(Duration::from_secs(11 * 60));

        assert_eq!(f.pool.purge_idle(), 1);
        assert!(f.pool.delivery_info(&first.hex_token()).is_none());
        assert!(f.pool.delivery_info(&second.hex_token()).is_some());
        assert_eq!(f.pool.purge_idle(), 0);
    }

    #[test]
    fn test_release_if_unconfirmed() {
        let f = fixture();
        let mut ack = request(1);
        ack.msg_type = MessageType::Acknowledgement;
        f.pool.enqueue(ack.clone(), Hooks::default());
        f.pool.enqueue(request(2), Hooks::default());

        f.pool.release_if_unconfirmed(&ack);
        f.pool.release_if_unconfirmed(&request(2));
        assert!(!f.pool.contains(1));
        assert!(f.pool.contains(2));
    }
}

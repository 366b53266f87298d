//! Ack correlation registry
//!
//! Maps an outbound message id to the [`AckHandler`] waiting for its
//! ACK/RST. The registry is unbounded: a handler leaves only when it is
//! answered, failed, unregistered, or idle for five minutes, so every
//! pool failure can still reach it.

use crate::cache::ExpiringCache;
use crate::handler::AckHandler;
use coala_io::Clock;
use coala_protocol::{Message, MessageId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Idle time after which a handler is forgotten
pub const HANDLER_IDLE_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// Handlers keyed by message id
pub struct AckRegistry {
    handlers: Mutex<ExpiringCache<MessageId, Arc<dyn AckHandler>>>,
}

impl AckRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        AckRegistry {
            handlers: Mutex::new(ExpiringCache::with_idle(HANDLER_IDLE_EXPIRY, clock)),
        }
    }

    pub fn register(&self, id: MessageId, handler: Arc<dyn AckHandler>) {
        tracing::trace!("Register ack handler for id {}", id);
        self.handlers.lock().insert(id, handler);
    }

    pub fn get(&self, id: MessageId) -> Option<Arc<dyn AckHandler>> {
        self.handlers.lock().get(&id).cloned()
    }

    pub fn unregister(&self, id: MessageId) -> Option<Arc<dyn AckHandler>> {
        tracing::trace!("Unregister ack handler for id {}", id);
        self.handlers.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unregister the handler of `message` and report `reason` to it
    pub fn raise_failure(&self, message: &Message, reason: &str) {
        match self.unregister(message.id) {
            Some(handler) => handler.on_ack_error(&format!("{} for id: {}", reason, message.id)),
            None => tracing::debug!(
                "No ack handler for id {} to report '{}'",
                message.id,
                reason
            ),
        }
    }

    /// Fail and drop every registered handler
    pub fn fail_all(&self, reason: &str) {
        let drained = self.handlers.lock().drain();
        for (_, handler) in drained {
            handler.on_ack_error(reason);
        }
    }

    /// Drop handlers that have been idle too long
    pub fn purge_idle(&self) -> usize {
        let purged = self.handlers.lock().purge_expired();
        if !purged.is_empty() {
            tracing::debug!("Purged {} idle ack handlers", purged.len());
        }
        purged.len()
    }
}

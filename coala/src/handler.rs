//! Completion callbacks
//!
//! Two mechanisms report the end of an exchange: an [`AckHandler`] keyed by
//! message id in the ack registry, and a [`ResponseHandler`] that travels with
//! the message in its [`Hooks`]. Hooks are kept next to the queued message,
//! never inside it.

use crate::error::Failure;
use coala_protocol::Message;
use crossbeam::channel::Sender;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Receives the ACK/RST for one message id
pub trait AckHandler: Send + Sync {
    /// ACK or RST arrived; `error` is set for a reset or a non-success code
    fn on_message(&self, message: &Message, error: Option<&str>);

    /// The message was dropped without an answer
    fn on_ack_error(&self, error: &str);
}

/// Receives the response to a request
pub trait ResponseHandler: Send + Sync {
    fn on_response(&self, response: &Message);

    fn on_error(&self, failure: &Failure);
}

/// Called each time the pool schedules a resend
pub type ResendHook = Arc<dyn Fn() + Send + Sync>;

/// Capabilities passed into the pool alongside a message
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_resend: Option<ResendHook>,
    pub response: Option<Arc<dyn ResponseHandler>>,
}

impl Hooks {
    pub fn with_resend(mut self, hook: ResendHook) -> Self {
        self.on_resend = Some(hook);
        self
    }

    pub fn with_response(mut self, handler: Arc<dyn ResponseHandler>) -> Self {
        self.response = Some(handler);
        self
    }

    pub(crate) fn fire_resend(&self) {
        if let Some(hook) = &self.on_resend {
            hook();
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_resend", &self.on_resend.is_some())
            .field("response", &self.response.is_some())
            .finish()
    }
}

/// Forwards only the first terminal call to the wrapped handler
pub struct OnceResponse {
    inner: Arc<dyn ResponseHandler>,
    fired: AtomicBool,
}

impl OnceResponse {
    pub fn wrap(inner: Arc<dyn ResponseHandler>) -> Arc<Self> {
        Arc::new(OnceResponse {
            inner,
            fired: AtomicBool::new(false),
        })
    }

    fn claim(&self) -> bool {
        !self.fired.swap(true, Ordering::AcqRel)
    }
}

impl ResponseHandler for OnceResponse {
    fn on_response(&self, response: &Message) {
        if self.claim() {
            self.inner.on_response(response);
        }
    }

    fn on_error(&self, failure: &Failure) {
        if self.claim() {
            self.inner.on_error(failure);
        } else {
            tracing::trace!("Dropping late failure: {}", failure);
        }
    }
}

/// Response handler that forwards the outcome into a channel
pub struct ChannelResponse {
    tx: Sender<Result<Message, Failure>>,
}

impl ChannelResponse {
    pub fn new(tx: Sender<Result<Message, Failure>>) -> Self {
        ChannelResponse { tx }
    }
}

impl ResponseHandler for ChannelResponse {
    fn on_response(&self, response: &Message) {
        let _ = self.tx.send(Ok(response.clone()));
    }

    fn on_error(&self, failure: &Failure) {
        let _ = self.tx.send(Err(failure.clone()));
    }
}

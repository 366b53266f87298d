//! Worker loops and their supervisor
//!
//! The send loop drains the message pool through the send pipeline onto the
//! socket. The receive loop reads datagrams, decodes them and runs them
//! through the receive pipeline. Each loop runs on its own thread under a
//! [`Supervisor`] that restarts it with exponential backoff when it fails or
//! panics, and stops it when the shutdown channel is closed.

use crate::error::DriverError;
use crate::layers::DirectSend;
use crate::pipeline::{AddressCell, LayerStack};
use crate::pool::MessagePool;
use coala_io::{DatagramSocket, Timer};
use coala_protocol::{codec, Message};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Send loop sleep when nothing is due
pub const SEND_IDLE_INTERVAL: Duration = Duration::from_millis(50);

/// Interval of the idle-entry sweep run by the send loop
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Largest datagram the receive loop accepts
pub const RECEIVE_BUFFER_SIZE: usize = 4096;

/// Periodic cleanup run from the send loop
pub type Housekeeping = Arc<dyn Fn() + Send + Sync>;

/// Encodes messages and writes them to the socket
pub struct Transmitter {
    socket: Arc<dyn DatagramSocket>,
}

impl Transmitter {
    pub fn new(socket: Arc<dyn DatagramSocket>) -> Self {
        Transmitter { socket }
    }

    /// Encode `message` and send it to `target`
    pub fn transmit(&self, message: &Message, target: SocketAddr) -> Result<usize, DriverError> {
        let datagram = codec::encode(message)?;
        let sent = self.socket.send_to(&datagram, target)?;
        tracing::trace!("Sent {} bytes for message {} to {}", sent, message.id, target);
        Ok(sent)
    }
}

impl DirectSend for Transmitter {
    fn send_now(&self, message: &Message) -> Result<(), DriverError> {
        let target = message
            .proxy
            .or(message.address)
            .ok_or(DriverError::NoDestination(message.id))?;
        self.transmit(message, target)?;
        Ok(())
    }
}

/// Body of a supervised thread
pub trait Worker: Send + 'static {
    fn name(&self) -> &'static str;

    /// Run until `shutdown` fires or disconnects; an error triggers a restart
    fn run(&mut self, shutdown: &Receiver<()>) -> Result<(), DriverError>;
}

fn shutdown_requested(shutdown: &Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}

pub struct SendLoop {
    pool: Arc<MessagePool>,
    stack: Arc<LayerStack>,
    transmitter: Arc<Transmitter>,
    housekeeping: Housekeeping,
    idle_interval: Duration,
}

impl SendLoop {
    pub fn new(
        pool: Arc<MessagePool>,
        stack: Arc<LayerStack>,
        transmitter: Arc<Transmitter>,
        housekeeping: Housekeeping,
    ) -> Self {
        SendLoop {
            pool,
            stack,
            transmitter,
            housekeeping,
            idle_interval: SEND_IDLE_INTERVAL,
        }
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    /// Send the next due message; returns false when nothing was due
    pub fn poll_once(&self) -> bool {
        let Some(message) = self.pool.next() else {
            return false;
        };
        self.dispatch(message);
        true
    }

    fn dispatch(&self, message: Message) {
        let id = message.id;
        let mut destination = AddressCell::new(message.proxy.or(message.address));
        let dispatch = match self.stack.on_send(message, &mut destination) {
            Ok(dispatch) => dispatch,
            Err(e) => {
                tracing::warn!("Dropping outbound message {}: {}", id, e);
                return;
            }
        };
        if !dispatch.proceed {
            return;
        }

        match destination.get() {
            Some(target) => {
                if let Err(e) = self.transmitter.transmit(&dispatch.message, target) {
                    tracing::warn!("Failed to send message {}: {}", dispatch.message.id, e);
                }
            }
            None => tracing::warn!("{}", DriverError::NoDestination(dispatch.message.id)),
        }
        self.pool.release_if_unconfirmed(&dispatch.message);
    }
}

impl Worker for SendLoop {
    fn name(&self) -> &'static str {
        "sender"
    }

    fn run(&mut self, shutdown: &Receiver<()>) -> Result<(), DriverError> {
        let mut sweep = Timer::new(HOUSEKEEPING_INTERVAL);
        loop {
            if shutdown_requested(shutdown) {
                return Ok(());
            }
            if sweep.try_fire() {
                (self.housekeeping)();
            }
            if !self.poll_once() {
                match shutdown.recv_timeout(self.idle_interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => return Ok(()),
                }
            }
        }
    }
}

pub struct ReceiveLoop {
    socket: Arc<dyn DatagramSocket>,
    stack: Arc<LayerStack>,
    inbound: Sender<Message>,
}

impl ReceiveLoop {
    pub fn new(socket: Arc<dyn DatagramSocket>, stack: Arc<LayerStack>, inbound: Sender<Message>) -> Self {
        ReceiveLoop {
            socket,
            stack,
            inbound,
        }
    }

    /// Decode one datagram and run it through the receive pipeline
    pub fn process(&self, datagram: &[u8], source: SocketAddr) -> Result<(), DriverError> {
        let mut message = match codec::decode(datagram) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping {} byte datagram from {}: {}", datagram.len(), source, e);
                return Ok(());
            }
        };
        message.address = Some(source);

        let mut cell = AddressCell::new(Some(source));
        let id = message.id;
        match self.stack.on_receive(message, &mut cell) {
            Ok(dispatch) if dispatch.proceed => self
                .inbound
                .send(dispatch.message)
                .map_err(|_| DriverError::InboundClosed),
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!("Dropping inbound message {} from {}: {}", id, source, e);
                Ok(())
            }
        }
    }
}

impl Worker for ReceiveLoop {
    fn name(&self) -> &'static str {
        "receiver"
    }

    fn run(&mut self, shutdown: &Receiver<()>) -> Result<(), DriverError> {
        let mut buffer = vec![0u8; RECEIVE_BUFFER_SIZE];
        loop {
            if shutdown_requested(shutdown) {
                return Ok(());
            }
            let (len, source) = match self.socket.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(e.into()),
            };
            self.process(&buffer[..len], source)?;
        }
    }
}

/// Restart pacing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Doubling delay with an upper bound
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(config: &SupervisorConfig) -> Self {
        Backoff {
            initial: config.initial_backoff,
            max: config.max_backoff,
            current: config.initial_backoff,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Owns one worker thread
pub struct Supervisor {
    name: &'static str,
    restarts: Arc<AtomicU32>,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn spawn<W: Worker>(worker: W, config: SupervisorConfig) -> std::io::Result<Self> {
        let name = worker.name();
        let restarts = Arc::new(AtomicU32::new(0));
        let (shutdown_tx, shutdown_rx) = channel::bounded(1);

        let counter = Arc::clone(&restarts);
        let handle = thread::Builder::new()
            .name(format!("coala-{}", name))
            .spawn(move || supervise(worker, &shutdown_rx, &config, &counter))?;

        tracing::info!("Started {} loop", name);
        Ok(Supervisor {
            name,
            restarts,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Times the worker was restarted after a failure
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Signal shutdown and wait for the thread to end
    pub fn stop(&mut self) {
        drop(self.shutdown.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("{} thread ended with a panic", self.name);
            }
            tracing::info!("Stopped {} loop", self.name);
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn supervise<W: Worker>(
    mut worker: W,
    shutdown: &Receiver<()>,
    config: &SupervisorConfig,
    restarts: &AtomicU32,
) {
    let name = worker.name();
    let mut backoff = Backoff::new(config);
    loop {
        let started = Instant::now();
        match panic::catch_unwind(AssertUnwindSafe(|| worker.run(shutdown))) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => tracing::error!("{} loop failed: {}", name, e),
            Err(_) => tracing::error!("{} loop panicked", name),
        }

        if started.elapsed() >= config.max_backoff {
            backoff.reset();
        }
        restarts.fetch_add(1, Ordering::Relaxed);
        let delay = backoff.next_delay();
        tracing::warn!("Restarting {} loop in {:?}", name, delay);
        match shutdown.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => continue,
            _ => return,
        }
    }
}

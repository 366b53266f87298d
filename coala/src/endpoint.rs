//! Coala endpoint
//!
//! Binds a UDP socket and wires the message pool, ack registry, pipeline
//! stages and worker loops into one object applications talk to.

use crate::ack::AckRegistry;
use crate::driver::{Housekeeping, ReceiveLoop, SendLoop, Supervisor, SupervisorConfig, Transmitter};
use crate::error::{EndpointError, Failure};
use crate::handler::{AckHandler, ChannelResponse, Hooks, OnceResponse, ResponseHandler};
use crate::layers::{ArqConfig, ArqLayer, LogLayer, ReliabilityLayer, ResponseLayer};
use crate::pipeline::LayerStack;
use crate::pool::{DeliveryInfo, MessagePool, PoolConfig};
use bytes::Bytes;
use coala_io::{Clock, CoalaSocket, DatagramSocket, SystemClock};
use coala_protocol::{Message, MessageCode, MessageId, MessageType, Token};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Reason reported to every pending handler on shutdown
pub const STOPPED_REASON: &str = "Coala stopped";

/// Endpoint settings
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub bind_addr: SocketAddr,
    pub broadcast: bool,
    pub pool: PoolConfig,
    pub arq: ArqConfig,
    pub supervisor: SupervisorConfig,
    pub send_idle_interval: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            broadcast: false,
            pool: PoolConfig::default(),
            arq: ArqConfig::default(),
            supervisor: SupervisorConfig::default(),
            send_idle_interval: crate::driver::SEND_IDLE_INTERVAL,
        }
    }
}

pub struct Endpoint {
    config: EndpointConfig,
    socket: Arc<dyn DatagramSocket>,
    pool: Arc<MessagePool>,
    acks: Arc<AckRegistry>,
    arq: Arc<ArqLayer>,
    responses: Arc<ResponseLayer>,
    stack: Arc<LayerStack>,
    transmitter: Arc<Transmitter>,
    inbound_tx: Sender<Message>,
    inbound_rx: Receiver<Message>,
    workers: Mutex<Vec<Supervisor>>,
}

impl Endpoint {
    /// Bind a UDP socket on `config.bind_addr`
    pub fn bind(config: EndpointConfig) -> Result<Self, EndpointError> {
        let socket = CoalaSocket::bind(config.bind_addr)?;
        if config.broadcast {
            socket.set_broadcast(true)?;
        }
        Ok(Endpoint::with_socket(Arc::new(socket), config, Arc::new(SystemClock)))
    }

    /// Build an endpoint over an existing transport and clock
    pub fn with_socket(
        socket: Arc<dyn DatagramSocket>,
        config: EndpointConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let acks = Arc::new(AckRegistry::new(Arc::clone(&clock)));
        let pool = Arc::new(MessagePool::new(
            config.pool.clone(),
            Arc::clone(&acks),
            Arc::clone(&clock),
        ));
        let transmitter = Arc::new(Transmitter::new(Arc::clone(&socket)));
        let arq = ArqLayer::new(
            config.arq.clone(),
            Arc::clone(&pool),
            Arc::clone(&acks),
            transmitter.clone(),
            Arc::clone(&clock),
        );
        let responses = Arc::new(ResponseLayer::new(
            Arc::clone(&pool),
            transmitter.clone(),
            clock,
        ));
        let log = Arc::new(LogLayer::new());

        let stack = LayerStack::new()
            .with_send(responses.clone())
            .with_send(arq.clone())
            .with_send(log.clone())
            .with_receive(log)
            .with_receive(arq.clone())
            .with_receive(Arc::new(ReliabilityLayer::new(
                Arc::clone(&pool),
                Arc::clone(&acks),
            )))
            .with_receive(responses.clone());

        let (inbound_tx, inbound_rx) = channel::unbounded();
        Endpoint {
            config,
            socket,
            pool,
            acks,
            arq,
            responses,
            stack: Arc::new(stack),
            transmitter,
            inbound_tx,
            inbound_rx,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the send and receive loops
    pub fn start(&self) -> Result<(), EndpointError> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Err(EndpointError::AlreadyStarted);
        }

        let pool = Arc::clone(&self.pool);
        let acks = Arc::clone(&self.acks);
        let arq = Arc::clone(&self.arq);
        let responses = Arc::clone(&self.responses);
        let housekeeping: Housekeeping = Arc::new(move || {
            pool.purge_idle();
            acks.purge_idle();
            arq.purge_idle();
            responses.purge_idle();
        });

        let sender = SendLoop::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.stack),
            Arc::clone(&self.transmitter),
            housekeeping,
        )
        .with_idle_interval(self.config.send_idle_interval);
        let receiver = ReceiveLoop::new(
            Arc::clone(&self.socket),
            Arc::clone(&self.stack),
            self.inbound_tx.clone(),
        );

        workers.push(Supervisor::spawn(sender, self.config.supervisor.clone())?);
        workers.push(Supervisor::spawn(receiver, self.config.supervisor.clone())?);
        tracing::info!("Coala started on {:?}", self.socket.local_addr().ok());
        Ok(())
    }

    /// Fail everything pending and join the worker loops
    pub fn stop(&self) {
        let mut workers = std::mem::take(&mut *self.workers.lock());
        self.pool.drain_all(STOPPED_REASON);
        self.acks.fail_all(STOPPED_REASON);
        for worker in &mut workers {
            worker.stop();
        }
        if !workers.is_empty() {
            tracing::info!("Coala stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().iter().any(Supervisor::is_running)
    }

    fn enqueue(
        &self,
        message: Message,
        ack: Option<Arc<dyn AckHandler>>,
        hooks: Hooks,
    ) -> Result<MessageId, EndpointError> {
        if message.address.is_none() && message.proxy.is_none() {
            return Err(EndpointError::NoDestination(message.id));
        }
        let id = message.id;
        if let Some(handler) = ack {
            self.acks.register(id, handler);
        }
        self.pool.enqueue(message, hooks);
        Ok(id)
    }

    fn with_token(mut message: Message) -> Message {
        if message.token.is_none() {
            message.token = Some(Token::random());
        }
        message
    }

    /// Queue `message`, reporting its ACK/RST to `ack`
    pub fn send(
        &self,
        message: Message,
        ack: Option<Arc<dyn AckHandler>>,
    ) -> Result<MessageId, EndpointError> {
        self.enqueue(Endpoint::with_token(message), ack, Hooks::default())
    }

    /// Queue a request whose response (or failure) goes to `handler` exactly once
    pub fn send_request(
        &self,
        message: Message,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<MessageId, EndpointError> {
        let message = Endpoint::with_token(message);
        let token = message.hex_token();
        let handler = OnceResponse::wrap(handler);
        self.responses.expect(&token, handler.clone());
        let result = self.enqueue(message, None, Hooks::default().with_response(handler));
        if result.is_err() {
            self.responses.forget(&token);
        }
        result
    }

    /// Queue a request and return a channel that yields its outcome
    pub fn request(
        &self,
        message: Message,
    ) -> Result<Receiver<Result<Message, Failure>>, EndpointError> {
        let (tx, rx) = channel::bounded(1);
        self.send_request(message, Arc::new(ChannelResponse::new(tx)))?;
        Ok(rx)
    }

    /// Answer `request`: piggybacked on the ACK when it is confirmable,
    /// otherwise as a separate confirmable message with the same token
    pub fn respond(
        &self,
        request: &Message,
        code: MessageCode,
        payload: Option<Bytes>,
    ) -> Result<MessageId, EndpointError> {
        let mut response = if request.msg_type == MessageType::Confirmable {
            Message::ack_to(request, request.address, code)
        } else {
            let mut response = Message::new(MessageType::Confirmable, code);
            response.token = request.token.clone();
            response.address = request.address;
            response
        };
        response.proxy = request.proxy;
        if let Some(payload) = payload {
            response.set_payload(payload);
        }
        self.enqueue(response, None, Hooks::default())
    }

    /// Stop sending `message`; datagrams already written are not recalled
    pub fn cancel(&self, message: &Message) -> bool {
        self.acks.unregister(message.id);
        self.responses.forget(&message.hex_token());
        self.pool.remove(message)
    }

    /// Messages that passed the receive pipeline
    pub fn inbound(&self) -> Receiver<Message> {
        self.inbound_rx.clone()
    }

    /// Delivery telemetry for `token`, including an inbound transfer in progress
    pub fn delivery_info(&self, token: &Token) -> Option<DeliveryInfo> {
        let token = token.to_hex();
        let receiving = self.arq.receive_report(&token);
        match (self.pool.delivery_info(&token), receiving) {
            (Some(mut info), Some(report)) => {
                info.transfer = Some(report);
                Some(info)
            }
            (Some(info), None) => Some(info),
            (None, Some(report)) => Some(DeliveryInfo {
                transfer: Some(report),
                ..DeliveryInfo::default()
            }),
            (None, None) => None,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, EndpointError> {
        Ok(self.socket.local_addr()?)
    }

    /// Messages waiting in the pool
    pub fn pending(&self) -> usize {
        self.pool.len()
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

//! In-memory datagram network for driving endpoints in tests

#![allow(dead_code)]

use coala::{Endpoint, EndpointConfig, PoolConfig};
use coala_io::{DatagramSocket, SocketError, SystemClock};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Datagram = (Vec<u8>, SocketAddr);

/// Routes datagrams between [`MemorySocket`]s, optionally dropping some
#[derive(Default)]
pub struct MemoryNet {
    routes: Mutex<HashMap<SocketAddr, Sender<Datagram>>>,
    drop_every: AtomicUsize,
    sent: AtomicUsize,
    dropped: AtomicUsize,
}

impl MemoryNet {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryNet::default())
    }

    pub fn socket(self: &Arc<Self>, addr: SocketAddr) -> Arc<MemorySocket> {
        let (tx, rx) = channel::unbounded();
        self.routes.lock().insert(addr, tx);
        Arc::new(MemorySocket {
            net: Arc::clone(self),
            addr,
            rx,
        })
    }

    /// Lose every `n`th datagram; 0 disables loss
    pub fn drop_every(&self, n: usize) {
        self.drop_every.store(n, Ordering::Relaxed);
    }

    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    fn route(&self, datagram: &[u8], from: SocketAddr, to: SocketAddr) {
        let count = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        let n = self.drop_every.load(Ordering::Relaxed);
        if n > 0 && count % n == 0 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if let Some(tx) = self.routes.lock().get(&to) {
            let _ = tx.send((datagram.to_vec(), from));
        }
    }
}

pub struct MemorySocket {
    net: Arc<MemoryNet>,
    addr: SocketAddr,
    rx: Receiver<Datagram>,
}

impl DatagramSocket for MemorySocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        self.net.route(buf, self.addr, target);
        Ok(buf.len())
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        match self.rx.recv_timeout(Duration::from_millis(10)) {
            Ok((datagram, from)) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok((len, from))
            }
            Err(_) => Err(SocketError::Io(io::Error::from(io::ErrorKind::WouldBlock))),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.addr)
    }
}

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], port))
}

/// Engine settings with short timers so lossy exchanges settle quickly
pub fn fast_config() -> EndpointConfig {
    EndpointConfig {
        pool: PoolConfig {
            resend_period: Duration::from_millis(40),
            ..PoolConfig::default()
        },
        send_idle_interval: Duration::from_millis(2),
        ..EndpointConfig::default()
    }
}

/// Started endpoint attached to `net` at `addr`
pub fn endpoint(net: &Arc<MemoryNet>, addr: SocketAddr) -> Endpoint {
    let endpoint = Endpoint::with_socket(net.socket(addr), fast_config(), Arc::new(SystemClock));
    endpoint.start().expect("endpoint starts");
    endpoint
}

pub fn payload(size: usize) -> bytes::Bytes {
    bytes::Bytes::from((0..size).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}
